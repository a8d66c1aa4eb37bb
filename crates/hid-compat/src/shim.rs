//! The per-peripheral report reader.
//!
//! One [`HidShim`] owns one HID handle and a reader thread. Every report is
//! decoded, forwarded to the virtual device (if one was created) and
//! published to the [`HidEventSink`]. Axis publication is throttled to the
//! configured update rate; button, hat and gear changes always go out
//! immediately.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use openracing_errors::DeviceError;
use openracing_hid_common::{HidDevice, ReportDescriptor, parse_report_descriptor};
use parking_lot::Mutex;
use racing_wheel_moza_serial_protocol::DeviceRole;
use tracing::{debug, info, warn};

use crate::blip::{BlipConfig, BlipState, BlipUpdate};
use crate::compat::{CompatConfig, CompatState};
use crate::config::HidShimConfig;
use crate::decode::{AxisSample, DeviceEvent, InputDecoder};
use crate::detection::needs_detection_fix;
use crate::device_error;
use crate::ids::{MozaModel, identify_model};
use crate::layout::{Axis, ReportLayout};
use crate::rate::UpdateRateLimiter;
use crate::virtual_device::{
    VirtualDevice, VirtualDeviceFactory, VirtualInputDescriptor, create_virtual_device,
};

#[derive(Debug, Clone, PartialEq)]
pub enum HidEvent {
    Input { role: DeviceRole, event: DeviceEvent },
    /// The reader stopped because the handle failed; the shim is dead.
    Lost { role: DeviceRole, reason: String },
}

/// Where a shim publishes. Closures work directly.
pub trait HidEventSink: Send + Sync {
    fn publish(&self, event: HidEvent);
}

impl<F> HidEventSink for F
where
    F: Fn(HidEvent) + Send + Sync,
{
    fn publish(&self, event: HidEvent) {
        self(event);
    }
}

#[derive(Debug)]
struct Shared {
    running: AtomicBool,
    blip_requested: AtomicBool,
    blip: Mutex<BlipConfig>,
    compat: Mutex<CompatConfig>,
    limiter: Mutex<UpdateRateLimiter>,
}

/// Picks the report layout for a device: the fixed model table when the
/// device is a known Moza peripheral, the descriptor-derived layout
/// otherwise.
pub fn resolve_layout(
    device: &dyn HidDevice,
) -> Result<(ReportLayout, Option<MozaModel>, Option<ReportDescriptor>), DeviceError> {
    let info = device.device_info();
    let name = info.display_name();
    let model = identify_model(info);
    let descriptor = match device.report_descriptor().and_then(|raw| parse_report_descriptor(&raw)) {
        Ok(desc) => Some(desc),
        Err(err) if model.is_some() => {
            debug!(device = %name, error = %err, "descriptor unavailable, using model table");
            None
        }
        Err(err) => return Err(device_error(&name, err)),
    };

    if let Some(layout) = model.and_then(ReportLayout::for_model) {
        return Ok((layout, model, descriptor));
    }
    let Some(desc) = descriptor.as_ref() else {
        return Err(DeviceError::UnsupportedLayout(name));
    };
    let layout = ReportLayout::from_descriptor(&name, desc)?;
    Ok((layout, model, descriptor))
}

pub struct HidShim {
    role: DeviceRole,
    name: String,
    layout_name: String,
    virtual_descriptor: Option<VirtualInputDescriptor>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for HidShim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HidShim")
            .field("role", &self.role)
            .field("name", &self.name)
            .field("layout", &self.layout_name)
            .field("virtual", &self.virtual_descriptor.is_some())
            .finish_non_exhaustive()
    }
}

impl HidShim {
    /// Takes ownership of `device` and starts its reader thread.
    ///
    /// A virtual device is created when `detection_fix` is on and the
    /// peripheral either is a model that always needs one or has a
    /// descriptor games misread. Failing to create it is logged and the
    /// shim runs without one.
    ///
    /// # Errors
    ///
    /// Invalid configuration, no usable report layout, or the thread could
    /// not be started.
    pub fn spawn(
        device: Box<dyn HidDevice>,
        role: DeviceRole,
        config: &HidShimConfig,
        factory: Option<&dyn VirtualDeviceFactory>,
        sink: Arc<dyn HidEventSink>,
    ) -> Result<Self, DeviceError> {
        let limiter = UpdateRateLimiter::new(config.update_rate_hz)?;
        let mut blip = BlipConfig {
            trigger_button: config.blip.trigger_button,
            ..BlipConfig::default()
        };
        blip.apply(BlipUpdate {
            enabled: Some(config.blip.enabled),
            level: Some(config.blip.level),
            duration_ms: Some(config.blip.duration_ms),
        })?;

        let info = device.device_info().clone();
        let name = info.display_name();
        let (layout, model, descriptor) = resolve_layout(device.as_ref())?;

        let wants_virtual = (config.detection_fix
            && (model.is_some_and(MozaModel::needs_virtual_device)
                || descriptor.as_ref().is_some_and(needs_detection_fix)))
            || (config.compat.paddle_sync && layout.clutch_paddles.is_some());
        let virtual_device = if wants_virtual {
            match factory {
                Some(factory) => {
                    let desc =
                        VirtualInputDescriptor::for_layout(&layout, info.vendor_id, info.product_id);
                    create_virtual_device(factory, desc)
                        .inspect_err(|err| {
                            warn!(device = %name, error = %err, "virtual device unavailable");
                        })
                        .ok()
                }
                None => {
                    warn!(device = %name, "no virtual input backend on this platform");
                    None
                }
            }
        } else {
            None
        };
        let virtual_descriptor = virtual_device.as_ref().map(|v| v.descriptor().clone());

        let trigger = blip.trigger_button.or(layout.downshift_button);
        let layout_name = layout.name.clone();
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            blip_requested: AtomicBool::new(false),
            blip: Mutex::new(blip),
            compat: Mutex::new(config.compat),
            limiter: Mutex::new(limiter),
        });

        let reader = Reader {
            device,
            role,
            name: name.clone(),
            decoder: InputDecoder::new(layout),
            virtual_device,
            sink,
            shared: Arc::clone(&shared),
            read_timeout_ms: i32::from(config.read_timeout_ms),
            pending_axes: BTreeMap::new(),
            throttle: 0.0,
            blip: BlipState::default(),
            blip_floor: 0.0,
            trigger,
            compat: CompatState::default(),
        };
        let worker = std::thread::Builder::new()
            .name(format!("hid-{role}"))
            .spawn(move || reader.run())
            .map_err(|e| DeviceError::HidError(format!("{name}: reader thread: {e}")))?;

        info!(
            device = %name,
            %role,
            layout = %layout_name,
            virtual_device = virtual_descriptor.is_some(),
            "hid shim started"
        );
        Ok(Self {
            role,
            name,
            layout_name,
            virtual_descriptor,
            shared,
            worker: Some(worker),
        })
    }

    pub fn role(&self) -> DeviceRole {
        self.role
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout_name(&self) -> &str {
        &self.layout_name
    }

    /// The layout exposed to games, if a virtual device exists.
    pub fn virtual_descriptor(&self) -> Option<&VirtualInputDescriptor> {
        self.virtual_descriptor.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    pub fn blip(&self) -> BlipConfig {
        *self.shared.blip.lock()
    }

    /// # Errors
    ///
    /// `InvalidSetting` for an out-of-range field; nothing is changed.
    pub fn update_blip(&self, update: BlipUpdate) -> Result<(), DeviceError> {
        self.shared.blip.lock().apply(update)
    }

    pub fn update_rate(&self) -> u16 {
        self.shared.limiter.lock().rate()
    }

    /// # Errors
    ///
    /// `InvalidSetting` above the maximum rate; the old rate stays.
    pub fn set_update_rate(&self, rate_hz: u16) -> Result<(), DeviceError> {
        self.shared.limiter.lock().set_rate(rate_hz)
    }

    pub fn compat(&self) -> CompatConfig {
        *self.shared.compat.lock()
    }

    /// Applies to reports read from now on.
    pub fn set_compat(&self, compat: CompatConfig) {
        *self.shared.compat.lock() = compat;
    }

    /// Starts a blip as if the trigger button had been pressed.
    pub fn trigger_blip(&self) {
        self.shared.blip_requested.store(true, Ordering::Release);
    }

    /// Stops the reader and releases the handle and the virtual device.
    /// Idempotent.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(device = %self.name, "hid reader thread panicked");
            }
            debug!(device = %self.name, "hid shim stopped");
        }
    }
}

impl Drop for HidShim {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Reader {
    device: Box<dyn HidDevice>,
    role: DeviceRole,
    name: String,
    decoder: InputDecoder,
    virtual_device: Option<VirtualDevice>,
    sink: Arc<dyn HidEventSink>,
    shared: Arc<Shared>,
    read_timeout_ms: i32,
    /// Latest value per axis not yet published.
    pending_axes: BTreeMap<Axis, f32>,
    throttle: f32,
    blip: BlipState,
    blip_floor: f32,
    trigger: Option<u16>,
    compat: CompatState,
}

impl Reader {
    fn run(mut self) {
        while self.shared.running.load(Ordering::Acquire) {
            match self.device.read_report(self.read_timeout_ms) {
                Ok(Some(report)) => self.handle_report(&report, Instant::now()),
                Ok(None) => self.publish(DeviceEvent::default(), Instant::now()),
                Err(err) => {
                    let err = device_error(&self.name, err);
                    warn!(device = %self.name, role = %self.role, error = %err, "hid read failed");
                    self.sink.publish(HidEvent::Lost {
                        role: self.role,
                        reason: err.to_string(),
                    });
                    break;
                }
            }
            let now = Instant::now();
            self.poll_blip(now);
            self.flush_scheduled(now);
        }
        if let Err(err) = self.device.close() {
            debug!(device = %self.name, error = %err, "close failed");
        }
    }

    fn handle_report(&mut self, report: &[u8], now: Instant) {
        let mut event = match self.decoder.parse_report(report) {
            Ok(event) => event,
            Err(err) => {
                debug!(device = %self.name, error = %err, "dropping report");
                return;
            }
        };
        let compat = *self.shared.compat.lock();
        self.compat.apply(&compat, self.decoder.layout(), &mut event, now);
        if event.is_empty() {
            return;
        }
        if let Some(throttle) = event.axis(Axis::Throttle) {
            self.throttle = throttle;
        }
        if let Some(trigger) = self.trigger
            && event.buttons.iter().any(|b| b.button == trigger && b.pressed)
        {
            self.start_blip(now);
        }
        if self.compat.is_downshift(&compat, self.decoder.layout(), &event) {
            self.start_blip(now);
        }

        if let Some(device) = self.virtual_device.as_mut() {
            let floor = self.blip.is_active(now).then_some(self.blip_floor);
            if let Err(err) = device.forward(&event, floor) {
                warn!(device = %self.name, error = %err, "virtual device write failed");
            }
        }

        let DeviceEvent {
            axes,
            buttons,
            hat,
            gear,
        } = event;
        for sample in axes {
            self.pending_axes.insert(sample.axis, sample.value);
        }
        self.publish(
            DeviceEvent {
                axes: Vec::new(),
                buttons,
                hat,
                gear,
            },
            now,
        );
    }

    /// Publishes `event`, attaching pending axes when the rate allows.
    fn publish(&mut self, mut event: DeviceEvent, now: Instant) {
        if !self.pending_axes.is_empty() && self.shared.limiter.lock().allow(now) {
            event.axes = std::mem::take(&mut self.pending_axes)
                .into_iter()
                .map(|(axis, value)| AxisSample { axis, value })
                .collect();
        }
        if !event.is_empty() {
            self.sink.publish(HidEvent::Input {
                role: self.role,
                event,
            });
        }
    }

    /// Sends synthesized button edges that have come due.
    fn flush_scheduled(&mut self, now: Instant) {
        let buttons = self.compat.due(now);
        if buttons.is_empty() {
            return;
        }
        let event = DeviceEvent {
            buttons,
            ..DeviceEvent::default()
        };
        if let Some(device) = self.virtual_device.as_mut() {
            let floor = self.blip.is_active(now).then_some(self.blip_floor);
            if let Err(err) = device.forward(&event, floor) {
                warn!(device = %self.name, error = %err, "virtual device write failed");
            }
        }
        self.publish(event, now);
    }

    fn start_blip(&mut self, now: Instant) {
        let config = *self.shared.blip.lock();
        if !self.blip.start(&config, now) {
            return;
        }
        self.blip_floor = config.level_fraction();
        debug!(device = %self.name, level = config.level, duration_ms = config.duration_ms, "blip");
        self.drive_throttle(self.throttle.max(self.blip_floor));
    }

    fn poll_blip(&mut self, now: Instant) {
        if self.shared.blip_requested.swap(false, Ordering::AcqRel) {
            self.start_blip(now);
        }
        if self.blip.expire(now) {
            self.drive_throttle(self.throttle);
        }
    }

    fn drive_throttle(&mut self, value: f32) {
        if let Some(device) = self.virtual_device.as_mut()
            && let Err(err) = device.set_throttle(value)
        {
            warn!(device = %self.name, error = %err, "virtual device write failed");
        }
    }
}
