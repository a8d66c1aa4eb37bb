//! Transport handler behaviour against a scripted mock device.

use std::sync::Arc;
use std::time::{Duration, Instant};

use openracing_errors::LinkError;
use openracing_event_bus::EventBus;
use parking_lot::Mutex;
use racing_wheel_device_link::mock::MockSerialLink;
use racing_wheel_device_link::{
    BusEvent, ConnectionState, LinkBus, LinkConfig, Topic, TransportHandler, TransportHealth,
};
use racing_wheel_moza_serial_protocol::{
    Command, DeviceKind, DeviceRole, Identity, ParamValue, ResponseKind,
};
use tracing_test::traced_test;

const WAIT: Duration = Duration::from_secs(2);
const TORQUE: u8 = 0x10;

/// A checksum-damaged torque frame: one mismatch, then the tail as noise.
const DAMAGED: [u8; 6] = [0x7E, 0x13, 0x10, 0x01, 0x5F, 0x00];

fn wheelbase() -> MockSerialLink {
    MockSerialLink::moza(Identity {
        kind: DeviceKind::Wheelbase,
        token: 0xAA,
        model: None,
    })
}

fn spawn(
    link: &MockSerialLink,
    config: &LinkConfig,
    bus: &LinkBus,
) -> Result<TransportHandler, LinkError> {
    TransportHandler::spawn(
        Box::new(link.clone()),
        DeviceRole::Wheelbase,
        "/dev/ttyACM0",
        config,
        bus.clone(),
    )
}

type Seen = Arc<Mutex<Vec<BusEvent>>>;

fn collect(bus: &LinkBus, topic: Topic) -> Result<Seen, Box<dyn std::error::Error>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe(topic, move |event: &BusEvent| {
        sink.lock().push(event.clone());
        Ok(())
    })?;
    Ok(seen)
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
fn commands_reach_the_wire_in_queue_order() -> Result<(), Box<dyn std::error::Error>> {
    let link = wheelbase();
    let bus = EventBus::new();
    let transport = spawn(&link, &LinkConfig::default(), &bus)?;
    assert!(logs_contain("transport started"));

    let first = transport.enqueue(&Command::set_torque_limit(60))?;
    let second = transport.enqueue(&Command::set_max_angle(900))?;
    let third = transport.enqueue(&Command::set_ffb_strength(80))?;
    for pending in [first, second, third] {
        assert_eq!(pending.wait()?.kind(), &ResponseKind::Ack);
    }

    let ids: Vec<u8> = link
        .commands_written()
        .iter()
        .map(|frame| frame.command_id())
        .collect();
    assert_eq!(ids, vec![0x10, 0x12, 0x14]);
    assert_eq!(transport.stats().frames_sent, 3);
    assert_eq!(transport.stats().frames_received, 3);
    Ok(())
}

#[test]
fn same_key_requests_resolve_in_order() -> Result<(), Box<dyn std::error::Error>> {
    let link = wheelbase();
    let bus = EventBus::new();
    let transport = spawn(&link, &LinkConfig::default(), &bus)?;

    let pending: Vec<_> = [60, 70, 80]
        .into_iter()
        .map(|percent| transport.enqueue(&Command::set_torque_limit(percent)))
        .collect::<Result<_, _>>()?;
    for request in pending {
        assert!(request.wait().is_ok());
    }
    let payloads: Vec<Vec<u8>> = link
        .commands_written()
        .iter()
        .map(|frame| frame.payload().to_vec())
        .collect();
    assert_eq!(payloads, vec![vec![60], vec![70], vec![80]]);
    Ok(())
}

#[test]
fn replies_are_published_under_role_and_command() -> Result<(), Box<dyn std::error::Error>> {
    let link = wheelbase();
    link.answer(0x1C, vec![0x00, 0x2A]);
    let bus = EventBus::new();
    let seen = collect(&bus, Topic::device(DeviceRole::Wheelbase, 0x1C))?;
    let transport = spawn(&link, &LinkConfig::default(), &bus)?;

    let command = Command::read_setting(DeviceRole::Wheelbase, "motor-temperature")?;
    let response = transport.send(&command)?;
    assert_eq!(response.value_bytes(), &[0x00, 0x2A]);

    assert!(wait_until(|| seen.lock().len() == 1));
    assert!(matches!(
        seen.lock().first(),
        Some(BusEvent::Response { role: DeviceRole::Wheelbase, response })
            if response.value_bytes() == [0x00, 0x2A]
    ));
    Ok(())
}

#[test]
fn silent_device_times_out() -> Result<(), Box<dyn std::error::Error>> {
    let link = wheelbase();
    link.silence(TORQUE);
    let bus = EventBus::new();
    let config = LinkConfig {
        request_timeout_ms: 40,
        ..LinkConfig::default()
    };
    let transport = spawn(&link, &config, &bus)?;

    let result = transport.send(&Command::set_torque_limit(95));
    assert!(matches!(result, Err(LinkError::Timeout { timeout_ms: 40, .. })));
    assert_eq!(transport.stats().timeouts, 1);
    assert!(transport.is_healthy(), "a timeout does not end the link");
    Ok(())
}

#[test]
fn non_zero_status_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let link = wheelbase();
    link.reject(TORQUE, 0x05);
    let bus = EventBus::new();
    let transport = spawn(&link, &LinkConfig::default(), &bus)?;

    let result = transport.send(&Command::set_torque_limit(95));
    assert_eq!(
        result,
        Err(LinkError::Rejected {
            command: TORQUE,
            status: 0x05
        })
    );
    assert_eq!(transport.stats().rejected, 1);
    Ok(())
}

#[test]
fn invalid_parameters_never_reach_the_wire() -> Result<(), Box<dyn std::error::Error>> {
    let link = wheelbase();
    let bus = EventBus::new();
    let transport = spawn(&link, &LinkConfig::default(), &bus)?;

    let result = transport.enqueue(&Command::set_torque_limit(10));
    assert!(matches!(result, Err(LinkError::Encoding(_))));
    let strength =
        Command::write_setting(DeviceRole::Wheelbase, "ffb-strength", ParamValue::U8(101))?;
    assert!(matches!(transport.enqueue(&strength), Err(LinkError::Encoding(_))));
    assert!(link.bytes_written().is_empty());
    Ok(())
}

#[test]
fn reader_resynchronises_after_garbage() -> Result<(), Box<dyn std::error::Error>> {
    let link = wheelbase();
    link.inject(&[0x00, 0xFF, 0x42]);
    link.inject(&DAMAGED);
    let bus = EventBus::new();
    let transport = spawn(&link, &LinkConfig::default(), &bus)?;

    let response = transport.send(&Command::set_torque_limit(95))?;
    assert_eq!(response.kind(), &ResponseKind::Ack);
    assert!(transport.stats().framing_errors >= 2);
    assert!(transport.is_healthy());
    Ok(())
}

#[test]
fn sustained_framing_errors_raise_a_fault() -> Result<(), Box<dyn std::error::Error>> {
    let link = wheelbase();
    let bus = EventBus::new();
    let faults = collect(&bus, Topic::LinkFault)?;
    let config = LinkConfig {
        framing_error_threshold: 3,
        ..LinkConfig::default()
    };
    let transport = spawn(&link, &config, &bus)?;

    for _ in 0..3 {
        link.inject(&DAMAGED);
    }
    assert!(wait_until(|| !faults.lock().is_empty()));
    assert!(matches!(
        faults.lock().first(),
        Some(BusEvent::Fault { error: LinkError::FramingRate { count, .. }, .. }) if *count > 3
    ));
    assert!(transport.is_healthy(), "framing faults are reported, not fatal");
    Ok(())
}

#[test]
fn stream_failure_fails_waiters_and_later_sends() -> Result<(), Box<dyn std::error::Error>> {
    let link = wheelbase();
    link.silence(TORQUE);
    let bus = EventBus::new();
    let faults = collect(&bus, Topic::LinkFault)?;
    let transport = spawn(&link, &LinkConfig::default(), &bus)?;

    let pending = transport.enqueue(&Command::set_torque_limit(95))?;
    link.break_link();
    assert!(matches!(pending.wait(), Err(LinkError::Stream { .. })));

    assert!(wait_until(|| !transport.is_healthy()));
    assert!(matches!(transport.health(), TransportHealth::Failed(LinkError::Stream { .. })));
    assert!(matches!(
        transport.enqueue(&Command::set_torque_limit(95)),
        Err(LinkError::Stream { .. })
    ));
    assert!(wait_until(|| !faults.lock().is_empty()));
    Ok(())
}

#[test]
fn shutdown_closes_pending_requests() -> Result<(), Box<dyn std::error::Error>> {
    let link = wheelbase();
    link.silence(TORQUE);
    link.set_write_delay(Some(Duration::from_millis(20)));
    let bus = EventBus::new();
    let states = collect(&bus, Topic::ConnectionState)?;
    let mut transport = spawn(&link, &LinkConfig::default(), &bus)?;

    let first = transport.enqueue(&Command::set_torque_limit(95))?;
    let queued: Vec<_> = (0..5)
        .map(|_| transport.enqueue(&Command::set_max_angle(900)))
        .collect::<Result<_, _>>()?;
    transport.shutdown();

    assert_eq!(first.wait(), Err(LinkError::Closed));
    for pending in queued {
        assert_eq!(pending.wait(), Err(LinkError::Closed));
    }
    assert_eq!(transport.health(), TransportHealth::Closed);
    assert!(link.commands_written().len() < 6, "queued writes are dropped");
    assert_eq!(
        transport.enqueue(&Command::set_torque_limit(95)).err(),
        Some(LinkError::Closed)
    );

    let disconnected = BusEvent::StateChanged {
        endpoint: "/dev/ttyACM0".to_string(),
        role: Some(DeviceRole::Wheelbase),
        state: ConnectionState::Disconnected,
    };
    assert_eq!(*states.lock(), vec![disconnected.clone()]);

    transport.shutdown();
    assert_eq!(transport.health(), TransportHealth::Closed);
    assert_eq!(*states.lock(), vec![disconnected], "published once");
    Ok(())
}
