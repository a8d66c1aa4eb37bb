//! Daemon lifecycle: builds the connection manager from configuration,
//! runs it until a shutdown signal, and reports what it saw on the bus.

use std::sync::Arc;

use anyhow::{Context, Result};
use openracing_errors::OpenRacingError;
use openracing_event_bus::{EventBus, Subscription};
use openracing_hid_common::HidApiPort;
use racing_wheel_device_link::{
    BusEvent, ConnectionManager, ConnectionState, EndpointProvider, HandleInfo, HidSource,
    LinkBus, SerialPortProvider, Topic,
};
use racing_wheel_hid_compat::platform_factory;
use tracing::{debug, error, info, warn};

use crate::config::ServiceConfig;

/// Owns the bus and the connection manager for one daemon run.
pub struct LinkDaemon {
    bus: LinkBus,
    manager: Arc<ConnectionManager>,
    _watchers: Vec<Subscription<Topic, BusEvent>>,
}

impl LinkDaemon {
    /// Builds a daemon on the OS serial ports and, when enabled and
    /// available, the OS HID stack.
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let serial: Arc<dyn EndpointProvider> =
            Arc::new(SerialPortProvider::new(config.link.vendor_filter));
        let hid = if config.hid_enabled {
            match HidApiPort::new() {
                Ok(port) => {
                    let mut source = HidSource::new(Arc::new(port)).with_config(config.hid.clone());
                    match platform_factory() {
                        Some(factory) => source = source.with_factory(Arc::from(factory)),
                        None => warn!("no virtual input backend; detection fix disabled"),
                    }
                    Some(source)
                }
                Err(e) => {
                    warn!(error = %e, "HID backend unavailable, serial devices only");
                    None
                }
            }
        } else {
            None
        };
        Self::with_providers(config, serial, hid)
    }

    /// Builds a daemon on the given endpoint sources.
    pub fn with_providers(
        config: &ServiceConfig,
        serial: Arc<dyn EndpointProvider>,
        hid: Option<HidSource>,
    ) -> Result<Self> {
        config.validate()?;
        let bus: LinkBus = EventBus::new();
        let watchers = watch(&bus).context("Failed to subscribe to link events")?;
        let mut manager = ConnectionManager::new(config.link.clone(), bus.clone(), serial);
        if let Some(hid) = hid {
            manager = manager.with_hid(hid);
        }
        Ok(Self {
            bus,
            manager: Arc::new(manager),
            _watchers: watchers,
        })
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn bus(&self) -> &LinkBus {
        &self.bus
    }

    /// Stops every link, then closes the bus. Idempotent.
    pub fn shutdown(&self) {
        self.manager.shutdown();
        self.bus.close();
    }

    /// One discovery and identification pass; returns what is connected.
    pub fn scan(&self) -> Vec<HandleInfo> {
        let report = self.manager.tick();
        for error in &report.errors {
            debug!(%error, "scan error");
        }
        self.manager.handles()
    }

    /// Runs the manager until ctrl-c (or SIGTERM on unix), then shuts every
    /// link down.
    pub async fn run(self) -> Result<()> {
        info!("starting device link daemon");
        let mut task = self
            .manager
            .spawn()
            .context("Failed to start connection manager")?;

        wait_for_shutdown().await;

        info!("shutting down");
        task.stop();
        self.shutdown();
        Ok(())
    }
}

/// Logs state changes, identifications and faults.
fn watch(bus: &LinkBus) -> Result<Vec<Subscription<Topic, BusEvent>>> {
    let states = bus.subscribe_scoped(Topic::ConnectionState, |event: &BusEvent| {
        if let BusEvent::StateChanged {
            endpoint,
            role,
            state,
        } = event
        {
            match state {
                ConnectionState::Erroring => warn!(%endpoint, ?role, "device erroring"),
                other => info!(%endpoint, ?role, state = %other, "device state"),
            }
        }
        Ok(())
    })?;
    let identified = bus.subscribe_scoped(Topic::DeviceIdentified, |event: &BusEvent| {
        if let BusEvent::Identified {
            endpoint,
            role,
            token,
        } = event
        {
            info!(%endpoint, %role, ?token, "device identified");
        }
        Ok(())
    })?;
    let faults = bus.subscribe_scoped(Topic::LinkFault, |event: &BusEvent| {
        if let BusEvent::Fault { endpoint, error } = event {
            let error = OpenRacingError::from(error.clone());
            let category = error.category();
            if error.is_recoverable() {
                warn!(%endpoint, %error, %category, "link fault");
            } else {
                error!(%endpoint, %error, %category, severity = %error.severity(), "link fault");
            }
        }
        Ok(())
    })?;
    Ok(vec![states, identified, faults])
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM"),
                    result = tokio::signal::ctrl_c() => log_ctrl_c(result),
                }
                return;
            }
            Err(e) => warn!(error = %e, "failed to register SIGTERM handler"),
        }
    }
    log_ctrl_c(tokio::signal::ctrl_c().await);
}

fn log_ctrl_c(result: std::io::Result<()>) {
    match result {
        Ok(()) => info!("received Ctrl+C"),
        Err(e) => error!(error = %e, "error waiting for Ctrl+C"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openracing_errors::LinkError;
    use racing_wheel_device_link::mock::{MockEndpointProvider, MockSerialLink};
    use racing_wheel_moza_serial_protocol::{DeviceKind, DeviceRole, Identity};
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn scan_lists_identified_devices() -> Result<()> {
        let provider = Arc::new(MockEndpointProvider::new());
        provider.plug(
            "/dev/ttyACM0",
            MockSerialLink::moza(Identity {
                kind: DeviceKind::Wheelbase,
                token: 7,
                model: None,
            }),
        );
        let daemon = LinkDaemon::with_providers(&ServiceConfig::default(), provider, None)?;

        let handles = daemon.scan();
        assert_eq!(handles.len(), 1);
        assert!(handles.first().is_some_and(|h| {
            h.role == Some(DeviceRole::Wheelbase) && h.state == ConnectionState::Connected
        }));
        assert!(logs_contain("device identified"));
        daemon.shutdown();
        Ok(())
    }

    #[test]
    fn shutdown_closes_the_bus() -> Result<()> {
        let provider = Arc::new(MockEndpointProvider::new());
        provider.plug(
            "/dev/ttyACM0",
            MockSerialLink::moza(Identity {
                kind: DeviceKind::Wheelbase,
                token: 7,
                model: None,
            }),
        );
        let daemon = LinkDaemon::with_providers(&ServiceConfig::default(), provider, None)?;
        daemon.scan();

        daemon.shutdown();
        assert!(daemon.manager().is_shut_down());
        assert!(daemon.manager().handles().is_empty());
        assert!(daemon.bus().is_closed());
        assert!(matches!(
            daemon.bus().subscribe(Topic::LinkFault, |_: &BusEvent| Ok(())),
            Err(_)
        ));

        daemon.shutdown();
        assert!(daemon.bus().is_closed());
        Ok(())
    }

    #[test]
    #[traced_test]
    fn faults_are_logged_with_their_category() -> Result<()> {
        let provider = Arc::new(MockEndpointProvider::new());
        let daemon = LinkDaemon::with_providers(&ServiceConfig::default(), provider, None)?;

        daemon.bus().publish(
            &Topic::LinkFault,
            &BusEvent::Fault {
                endpoint: "/dev/ttyACM0".to_string(),
                error: LinkError::device_unavailable("pedals"),
            },
        );
        assert!(logs_contain("category=Routing"));

        daemon.bus().publish(
            &Topic::LinkFault,
            &BusEvent::Fault {
                endpoint: "/dev/ttyACM0".to_string(),
                error: LinkError::stream("/dev/ttyACM0", "broken pipe"),
            },
        );
        assert!(logs_contain("category=Link"));
        assert!(logs_contain("severity=CRITICAL"));
        daemon.shutdown();
        Ok(())
    }

    #[test]
    fn invalid_config_is_refused() {
        let mut config = ServiceConfig::default();
        config.link.identify_timeout_ms = 0;
        let provider = Arc::new(MockEndpointProvider::new());
        assert!(LinkDaemon::with_providers(&config, provider, None).is_err());
    }
}
