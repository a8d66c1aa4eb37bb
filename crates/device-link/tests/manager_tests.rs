//! Connection manager lifecycle against mock serial and HID endpoints.

use std::sync::Arc;
use std::time::{Duration, Instant};

use openracing_errors::LinkError;
use openracing_event_bus::EventBus;
use openracing_hid_common::HidDevice;
use openracing_hid_common::hid_traits::mock::{MockHidDevice, MockHidPort};
use parking_lot::Mutex;
use racing_wheel_device_link::mock::{MockEndpointProvider, MockSerialLink};
use racing_wheel_device_link::{
    BackoffPolicy, BusEvent, ConnectionManager, ConnectionState, HidSource, LinkBus, LinkConfig,
    Topic, is_hid_candidate,
};
use racing_wheel_hid_compat::ids::product_ids;
use racing_wheel_hid_compat::virtual_device::mock::RecordingFactory;
use racing_wheel_hid_compat::{CompatConfig, HidShimConfig, MOZA_VENDOR_ID};
use racing_wheel_moza_serial_protocol::{
    Command, DeviceKind, DeviceRole, IDENTIFY_ADDRESS, IDENTIFY_COMMAND, Identity, ParamValue,
    ResponseKind,
};
use tracing_test::traced_test;

const WAIT: Duration = Duration::from_secs(2);
const BASE: &str = "/dev/ttyACM0";
const PORT_A: &str = "/dev/ttyACM1";
const PORT_B: &str = "/dev/ttyACM2";

type Seen = Arc<Mutex<Vec<BusEvent>>>;

fn identity(kind: DeviceKind, token: u8) -> Identity {
    Identity {
        kind,
        token,
        model: None,
    }
}

fn wheelbase() -> MockSerialLink {
    MockSerialLink::moza(identity(DeviceKind::Wheelbase, 0xAA))
}

fn wheel(token: u8) -> MockSerialLink {
    MockSerialLink::moza(identity(DeviceKind::Wheel, token))
}

fn config() -> LinkConfig {
    LinkConfig {
        identify_timeout_ms: 50,
        discovery_interval_ms: 0,
        reconnect: BackoffPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 40,
        },
        ..LinkConfig::default()
    }
}

fn manager(provider: &Arc<MockEndpointProvider>, bus: &LinkBus) -> ConnectionManager {
    ConnectionManager::new(config(), bus.clone(), Arc::<MockEndpointProvider>::clone(provider))
}

fn collect(bus: &LinkBus, topic: Topic) -> Result<Seen, Box<dyn std::error::Error>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe(topic, move |event: &BusEvent| {
        sink.lock().push(event.clone());
        Ok(())
    })?;
    Ok(seen)
}

fn states_of(seen: &Seen, path: &str) -> Vec<ConnectionState> {
    seen.lock()
        .iter()
        .filter_map(|event| match event {
            BusEvent::StateChanged {
                endpoint, state, ..
            } if endpoint == path => Some(*state),
            _ => None,
        })
        .collect()
}

fn wait_until(what: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if what() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

#[test]
#[traced_test]
fn wheelbase_is_identified_and_routed() -> Result<(), Box<dyn std::error::Error>> {
    let provider = Arc::new(MockEndpointProvider::new());
    let link = wheelbase();
    provider.plug(BASE, link.clone());
    let bus = EventBus::new();
    let states = collect(&bus, Topic::ConnectionState)?;
    let identified = collect(&bus, Topic::DeviceIdentified)?;
    let manager = manager(&provider, &bus);

    let report = manager.tick();
    assert_eq!(report.discovered, vec![BASE.to_string()]);
    assert_eq!(report.connected, vec![(BASE.to_string(), DeviceRole::Wheelbase)]);
    assert_eq!(
        states_of(&states, BASE),
        vec![
            ConnectionState::Disconnected,
            ConnectionState::Identifying,
            ConnectionState::Connected
        ]
    );
    assert_eq!(
        identified.lock().first(),
        Some(&BusEvent::Identified {
            endpoint: BASE.to_string(),
            role: DeviceRole::Wheelbase,
            token: Some(0xAA),
        })
    );

    let query = link.frames_written().into_iter().next();
    assert!(query.is_some_and(|frame| {
        frame.address() == IDENTIFY_ADDRESS && frame.command_id() == IDENTIFY_COMMAND
    }));

    let response = manager.send(DeviceRole::Wheelbase, &Command::set_torque_limit(95))?;
    assert_eq!(response.kind(), &ResponseKind::Ack);
    assert_eq!(manager.current_state(DeviceRole::Wheelbase), ConnectionState::Connected);
    assert!(logs_contain("device connected"));
    Ok(())
}

#[test]
fn known_endpoints_are_not_reopened() {
    let provider = Arc::new(MockEndpointProvider::new());
    let link = wheelbase();
    provider.plug(BASE, link.clone());
    let bus = EventBus::new();
    let manager = manager(&provider, &bus);

    manager.tick();
    let again = manager.tick();
    assert!(again.discovered.is_empty());
    assert!(again.connected.is_empty());
    assert_eq!(link.open_count(), 1);
    assert_eq!(manager.handles().len(), 1);
}

#[test]
fn wheels_keep_their_slot_when_replugged() -> Result<(), Box<dyn std::error::Error>> {
    let provider = Arc::new(MockEndpointProvider::new());
    provider.plug(PORT_A, wheel(0xA1));
    provider.plug(PORT_B, wheel(0xB2));
    let bus = EventBus::new();
    let manager = manager(&provider, &bus);

    let report = manager.tick();
    assert_eq!(
        report.connected,
        vec![
            (PORT_A.to_string(), DeviceRole::Wheel(0)),
            (PORT_B.to_string(), DeviceRole::Wheel(1)),
        ]
    );

    let rpm = Command::write_setting(DeviceRole::Wheel(1), "rpm-brightness", ParamValue::U8(40))?;
    assert!(manager.send(DeviceRole::Wheel(1), &rpm).is_ok());

    provider.unplug(PORT_A);
    provider.unplug(PORT_B);
    let report = manager.tick();
    assert_eq!(report.lost.len(), 2);
    assert_eq!(manager.current_state(DeviceRole::Wheel(0)), ConnectionState::Disconnected);

    // B2 comes back first, on the other port.
    provider.plug(PORT_A, wheel(0xB2));
    let report = manager.tick();
    assert_eq!(report.connected, vec![(PORT_A.to_string(), DeviceRole::Wheel(1))]);

    provider.plug(PORT_B, wheel(0xA1));
    let report = manager.tick();
    assert_eq!(report.connected, vec![(PORT_B.to_string(), DeviceRole::Wheel(0))]);
    assert_eq!(manager.known_wheel_tokens().get(&0xA1), Some(&0));
    Ok(())
}

#[test]
fn duplicate_token_is_a_conflict() -> Result<(), Box<dyn std::error::Error>> {
    let provider = Arc::new(MockEndpointProvider::new());
    let second = wheel(0xA1);
    provider.plug(PORT_A, wheel(0xA1));
    provider.plug(PORT_B, second.clone());
    let bus = EventBus::new();
    let faults = collect(&bus, Topic::LinkFault)?;
    let manager = manager(&provider, &bus);

    let report = manager.tick();
    assert_eq!(report.connected, vec![(PORT_A.to_string(), DeviceRole::Wheel(0))]);
    assert_eq!(report.abandoned, vec![PORT_B.to_string()]);
    assert_eq!(
        faults.lock().first(),
        Some(&BusEvent::Fault {
            endpoint: PORT_B.to_string(),
            error: LinkError::IdentificationConflict {
                token: 0xA1,
                endpoints: vec![PORT_A.to_string(), PORT_B.to_string()],
            },
        })
    );
    assert_eq!(manager.state_of(PORT_B), None);

    manager.tick();
    assert_eq!(second.open_count(), 1, "abandoned endpoints are not queried again");
    Ok(())
}

#[test]
fn second_wheelbase_is_a_conflict() {
    let provider = Arc::new(MockEndpointProvider::new());
    provider.plug(PORT_A, wheelbase());
    provider.plug(PORT_B, MockSerialLink::moza(identity(DeviceKind::Wheelbase, 0xBB)));
    let bus = EventBus::new();
    let manager = manager(&provider, &bus);

    let report = manager.tick();
    assert_eq!(report.connected.len(), 1);
    assert!(report
        .errors
        .iter()
        .any(|e| matches!(e, LinkError::IdentificationConflict { token: 0xBB, .. })));
}

#[test]
fn unconnected_roles_are_unavailable() {
    let provider = Arc::new(MockEndpointProvider::new());
    let bus = EventBus::new();
    let manager = manager(&provider, &bus);
    manager.tick();

    let result = manager.route(DeviceRole::Wheelbase, &Command::set_torque_limit(95));
    assert!(matches!(
        result,
        Err(LinkError::DeviceUnavailable { ref role }) if role == "wheelbase"
    ));
    assert_eq!(manager.current_state(DeviceRole::Pedals), ConnectionState::Disconnected);
}

#[test]
fn pedals_route_through_the_wheelbase() -> Result<(), Box<dyn std::error::Error>> {
    let provider = Arc::new(MockEndpointProvider::new());
    let link = wheelbase();
    provider.plug(BASE, link.clone());
    let bus = EventBus::new();
    let manager = manager(&provider, &bus);
    manager.tick();

    let command = Command::write_setting(DeviceRole::Pedals, "throttle-reverse", ParamValue::U8(1))?;
    assert!(manager.send(DeviceRole::Pedals, &command).is_ok());
    let last = link.commands_written().pop();
    assert_eq!(last.map(|frame| frame.address()), Some(0x19));

    let wheel_cmd = Command::write_setting(DeviceRole::Wheel(0), "rpm-brightness", ParamValue::U8(1))?;
    assert!(matches!(
        manager.route(DeviceRole::Wheel(0), &wheel_cmd),
        Err(LinkError::DeviceUnavailable { .. })
    ));
    Ok(())
}

#[test]
fn lost_link_backs_off_and_reconnects() -> Result<(), Box<dyn std::error::Error>> {
    let provider = Arc::new(MockEndpointProvider::new());
    let link = wheelbase();
    provider.plug(BASE, link.clone());
    let bus = EventBus::new();
    let states = collect(&bus, Topic::ConnectionState)?;
    let faults = collect(&bus, Topic::LinkFault)?;
    let manager = manager(&provider, &bus);

    let t0 = Instant::now();
    manager.tick_at(t0);
    link.break_link();
    assert!(wait_until(|| !faults.lock().is_empty()));

    let report = manager.tick_at(t0 + Duration::from_millis(1));
    assert_eq!(report.errors.len(), 1);
    assert_eq!(manager.state_of(BASE), Some(ConnectionState::Erroring));
    assert!(matches!(
        manager.route(DeviceRole::Wheelbase, &Command::set_torque_limit(95)),
        Err(LinkError::DeviceUnavailable { .. })
    ));

    link.repair();
    manager.tick_at(t0 + Duration::from_millis(5));
    assert_eq!(manager.state_of(BASE), Some(ConnectionState::Erroring), "still backing off");

    let report = manager.tick_at(t0 + Duration::from_millis(50));
    assert_eq!(report.connected, vec![(BASE.to_string(), DeviceRole::Wheelbase)]);
    assert_eq!(link.open_count(), 2);
    assert_eq!(
        states_of(&states, BASE),
        vec![
            ConnectionState::Disconnected,
            ConnectionState::Identifying,
            ConnectionState::Connected,
            // The stopped transport reports first, then the manager.
            ConnectionState::Disconnected,
            ConnectionState::Erroring,
            ConnectionState::Identifying,
            ConnectionState::Connected
        ]
    );
    assert!(manager.send(DeviceRole::Wheelbase, &Command::set_torque_limit(95)).is_ok());
    Ok(())
}

#[test]
fn exhausted_retries_abandon_the_endpoint() -> Result<(), Box<dyn std::error::Error>> {
    let provider = Arc::new(MockEndpointProvider::new());
    let silent = MockSerialLink::new();
    provider.plug(PORT_A, silent.clone());
    let bus = EventBus::new();
    let states = collect(&bus, Topic::ConnectionState)?;
    let manager = manager(&provider, &bus);

    let t0 = Instant::now();
    for step in 0..3u64 {
        manager.tick_at(t0 + Duration::from_secs(step));
        assert_eq!(manager.state_of(PORT_A), Some(ConnectionState::Erroring));
    }
    let report = manager.tick_at(t0 + Duration::from_secs(3));
    assert_eq!(report.abandoned, vec![PORT_A.to_string()]);
    assert_eq!(manager.state_of(PORT_A), None);
    assert_eq!(states_of(&states, PORT_A).last(), Some(&ConnectionState::Disconnected));
    assert_eq!(silent.frames_written().len(), 4);

    manager.tick_at(t0 + Duration::from_secs(10));
    assert_eq!(silent.frames_written().len(), 4, "no query after giving up");

    // A re-plug counts as a new device.
    provider.unplug(PORT_A);
    manager.tick_at(t0 + Duration::from_secs(11));
    provider.plug(PORT_A, wheelbase());
    let report = manager.tick_at(t0 + Duration::from_secs(12));
    assert_eq!(report.connected, vec![(PORT_A.to_string(), DeviceRole::Wheelbase)]);
    Ok(())
}

#[test]
fn reply_handlers_may_query_the_manager_during_teardown() -> Result<(), Box<dyn std::error::Error>> {
    let provider = Arc::new(MockEndpointProvider::new());
    provider.plug(BASE, wheelbase());
    let bus = EventBus::new();
    let manager = Arc::new(manager(&provider, &bus));
    manager.tick();

    let observed = Arc::new(Mutex::new(Vec::new()));
    let torque = Command::set_torque_limit(95);
    {
        let manager = Arc::downgrade(&manager);
        let sink = Arc::clone(&observed);
        // Holds the reader inside the handler until the handle is gone.
        bus.subscribe(
            Topic::device(DeviceRole::Wheelbase, torque.command_id()),
            move |_event: &BusEvent| {
                let Some(manager) = manager.upgrade() else {
                    return Ok(());
                };
                let deadline = Instant::now() + WAIT;
                while manager.state_of(BASE).is_some() && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(2));
                }
                sink.lock().push(manager.current_state(DeviceRole::Wheelbase));
                Ok(())
            },
        )?;
    }
    let reply = manager.send(DeviceRole::Wheelbase, &torque)?;
    assert_eq!(reply.kind(), &ResponseKind::Ack);

    provider.unplug(BASE);
    let ticker = {
        let manager = Arc::clone(&manager);
        std::thread::spawn(move || manager.tick())
    };
    assert!(wait_until(|| ticker.is_finished()), "tick blocked on its own reader");
    let report = ticker
        .join()
        .map_err(|panic| format!("tick panicked: {panic:?}"))?;
    assert_eq!(report.lost, vec![BASE.to_string()]);
    assert_eq!(*observed.lock(), vec![ConnectionState::Disconnected]);
    Ok(())
}

#[test]
fn enumeration_failure_keeps_existing_links() {
    let provider = Arc::new(MockEndpointProvider::new());
    provider.plug(BASE, wheelbase());
    let bus = EventBus::new();
    let manager = manager(&provider, &bus);
    manager.tick();

    provider.set_listing_fails(true);
    let report = manager.tick();
    assert!(matches!(report.errors.first(), Some(LinkError::Stream { .. })));
    assert!(report.lost.is_empty());
    assert_eq!(manager.current_state(DeviceRole::Wheelbase), ConnectionState::Connected);
}

fn pedal_report(throttle: u16, brake: u16) -> Vec<u8> {
    let [t0, t1] = throttle.to_le_bytes();
    let [b0, b1] = brake.to_le_bytes();
    vec![0x00, t0, t1, b0, b1]
}

#[test]
fn hid_pedals_publish_input_events() -> Result<(), Box<dyn std::error::Error>> {
    let port = Arc::new(MockHidPort::new());
    let pedals = MockHidDevice::new(MOZA_VENDOR_ID, product_ids::SR_P_PEDALS, "/dev/hidraw3")
        .with_product_name("MOZA SR-P Pedals");
    pedals.queue_read(pedal_report(u16::MAX, 0));
    port.add_device(pedals);
    let factory = RecordingFactory::default();

    let provider = Arc::new(MockEndpointProvider::new());
    let bus = EventBus::new();
    let inputs = collect(&bus, Topic::Input(DeviceRole::GenericHid(0)))?;
    let faults = collect(&bus, Topic::LinkFault)?;
    let source = HidSource::new(Arc::<MockHidPort>::clone(&port))
        .with_factory(Arc::new(factory.clone()))
        .with_config(HidShimConfig {
            update_rate_hz: 0,
            ..HidShimConfig::default()
        });
    let manager = manager(&provider, &bus).with_hid(source);

    let report = manager.tick();
    assert_eq!(
        report.connected,
        vec![("/dev/hidraw3".to_string(), DeviceRole::GenericHid(0))]
    );
    assert!(wait_until(|| !inputs.lock().is_empty()));
    assert!(matches!(
        inputs.lock().first(),
        Some(BusEvent::Input { role: DeviceRole::GenericHid(0), .. })
    ));
    assert_eq!(factory.created().len(), 1);

    assert!(port.remove_device("/dev/hidraw3"));
    assert!(wait_until(|| !faults.lock().is_empty()));
    let report = manager.tick();
    assert_eq!(report.lost, vec!["/dev/hidraw3".to_string()]);
    assert_eq!(factory.live_devices(), 0);
    Ok(())
}

#[test]
fn hid_wheelbase_needs_paddle_sync() {
    let base = MockHidDevice::new(MOZA_VENDOR_ID, product_ids::R9_V1, "/dev/hidraw0")
        .with_product_name("Gudsen MOZA R9 Base");
    let pedals = MockHidDevice::new(MOZA_VENDOR_ID, product_ids::SR_P_PEDALS, "/dev/hidraw3");
    let synced = HidShimConfig {
        compat: CompatConfig {
            paddle_sync: true,
            ..CompatConfig::default()
        },
        ..HidShimConfig::default()
    };

    assert!(!is_hid_candidate(base.device_info(), &HidShimConfig::default()));
    assert!(is_hid_candidate(base.device_info(), &synced));
    assert!(is_hid_candidate(pedals.device_info(), &HidShimConfig::default()));
}

#[test]
fn shutdown_disconnects_everything() -> Result<(), Box<dyn std::error::Error>> {
    let provider = Arc::new(MockEndpointProvider::new());
    provider.plug(BASE, wheelbase());
    let bus = EventBus::new();
    let states = collect(&bus, Topic::ConnectionState)?;
    let manager = manager(&provider, &bus);
    manager.tick();

    manager.shutdown();
    assert!(manager.handles().is_empty());
    assert_eq!(states_of(&states, BASE).last(), Some(&ConnectionState::Disconnected));
    assert!(matches!(
        manager.route(DeviceRole::Wheelbase, &Command::set_torque_limit(95)),
        Err(LinkError::DeviceUnavailable { .. })
    ));
    assert_eq!(manager.tick(), Default::default());
    assert!(!bus.is_closed());
    Ok(())
}

#[test]
fn background_loop_connects_devices() -> Result<(), Box<dyn std::error::Error>> {
    let provider = Arc::new(MockEndpointProvider::new());
    provider.plug(BASE, wheelbase());
    let bus = EventBus::new();
    let manager = Arc::new(manager(&provider, &bus));

    let mut task = manager.spawn()?;
    assert!(wait_until(|| {
        manager.current_state(DeviceRole::Wheelbase) == ConnectionState::Connected
    }));
    task.stop();
    manager.shutdown();
    Ok(())
}
