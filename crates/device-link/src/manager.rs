//! Connection manager: discovery, identification, supervision and routing.
//!
//! The manager owns one [`DeviceHandle`] per discovered endpoint. Each
//! handle walks `Disconnected -> Identifying -> Connected`, drops to
//! `Erroring` when its link fails and comes back through `Identifying`
//! after an exponential backoff. A handle whose retries run out, or whose
//! identity conflicts with a device already connected, returns to
//! `Disconnected` and is left alone until its endpoint disappears.
//!
//! All work happens in [`ConnectionManager::tick`]. Identity queries and
//! enumeration run without holding the state lock so routing never waits on
//! I/O.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use openracing_errors::LinkError;
use openracing_event_bus::{BusError, HandlerResult, Observable, SubscriptionHandle};
use openracing_hid_common::{HidDevice, HidDeviceInfo, HidPort};
use parking_lot::Mutex;
use racing_wheel_hid_compat::{
    HidEvent, HidShim, HidShimConfig, MozaModel, VirtualDeviceFactory, identify_model,
};
use racing_wheel_moza_serial_protocol::{Command, DeviceKind, DeviceRole, Identity, Response};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::identify::{TokenRegistry, query_identity};
use crate::link::{Endpoint, EndpointProvider, SerialLink};
use crate::topics::{BusEvent, ConnectionState, LinkBus, Topic};
use crate::transport::{PendingResponse, TransportHandler, TransportHealth};

/// Period of the background supervision loop started by
/// [`ConnectionManager::spawn`]. Enumeration runs on its own, slower
/// interval.
pub const TICK_INTERVAL: Duration = Duration::from_millis(50);

const GENERIC_DESKTOP: u16 = 0x01;
const CONTROLLER_USAGES: [u16; 3] = [0x04, 0x05, 0x08];

/// Where a handle's bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointKind {
    Serial,
    Hid,
}

/// HID peripherals the manager should pick up alongside serial devices.
pub struct HidSource {
    pub port: Arc<dyn HidPort>,
    pub factory: Option<Arc<dyn VirtualDeviceFactory>>,
    pub config: HidShimConfig,
}

impl HidSource {
    pub fn new(port: Arc<dyn HidPort>) -> Self {
        Self {
            port,
            factory: None,
            config: HidShimConfig::default(),
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn VirtualDeviceFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_config(mut self, config: HidShimConfig) -> Self {
        self.config = config;
        self
    }
}

/// Whether a HID device should get a shim. Moza wheelbases are reached over
/// serial and only get one for paddle sync; other Moza peripherals and
/// generic game controllers qualify.
pub fn is_hid_candidate(info: &HidDeviceInfo, config: &HidShimConfig) -> bool {
    match identify_model(info) {
        Some(MozaModel::Wheelbase) => config.compat.paddle_sync,
        Some(_) => true,
        None => {
            info.usage_page == Some(GENERIC_DESKTOP)
                && info.usage.is_some_and(|usage| CONTROLLER_USAGES.contains(&usage))
        }
    }
}

/// Snapshot of one managed endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandleInfo {
    pub endpoint: String,
    pub kind: EndpointKind,
    pub role: Option<DeviceRole>,
    pub token: Option<u8>,
    pub state: ConnectionState,
    pub attempts: u32,
}

/// What one [`ConnectionManager::tick`] did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub discovered: Vec<String>,
    pub connected: Vec<(String, DeviceRole)>,
    pub lost: Vec<String>,
    /// Endpoints given up on after exhausting retries or on a conflict.
    pub abandoned: Vec<String>,
    pub errors: Vec<LinkError>,
}

enum Backend {
    Serial(TransportHandler),
    Hid(HidShim),
}

impl Backend {
    /// The failure that ended this backend, if it has ended.
    fn failure(&self, endpoint: &str) -> Option<LinkError> {
        match self {
            Self::Serial(transport) => match transport.health() {
                TransportHealth::Running => None,
                TransportHealth::Failed(error) => Some(error),
                TransportHealth::Closed => Some(LinkError::Closed),
            },
            Self::Hid(shim) => {
                (!shim.is_running()).then(|| LinkError::stream(endpoint, "hid reader stopped"))
            }
        }
    }

    fn stop(&mut self) {
        match self {
            Self::Serial(transport) => transport.shutdown(),
            Self::Hid(shim) => shim.stop(),
        }
    }
}

#[derive(Clone)]
enum Target {
    Serial(Endpoint),
    Hid(HidDeviceInfo),
}

struct DeviceHandle {
    endpoint: String,
    target: Target,
    role: Option<DeviceRole>,
    token: Option<u8>,
    state: Observable<ConnectionState>,
    attempts: u32,
    retry_at: Option<Instant>,
    backend: Option<Backend>,
}

impl DeviceHandle {
    fn new(endpoint: String, target: Target) -> Self {
        Self {
            endpoint,
            target,
            role: None,
            token: None,
            state: Observable::new(ConnectionState::Disconnected),
            attempts: 0,
            retry_at: None,
            backend: None,
        }
    }

    fn kind(&self) -> EndpointKind {
        match self.target {
            Target::Serial(_) => EndpointKind::Serial,
            Target::Hid(_) => EndpointKind::Hid,
        }
    }

    fn is_live(&self) -> bool {
        self.backend.is_some() && self.state.get() == ConnectionState::Connected
    }

    fn info(&self) -> HandleInfo {
        HandleInfo {
            endpoint: self.endpoint.clone(),
            kind: self.kind(),
            role: self.role,
            token: self.token,
            state: self.state.get(),
            attempts: self.attempts,
        }
    }
}

#[derive(Default)]
struct Inner {
    handles: BTreeMap<String, DeviceHandle>,
    registry: TokenRegistry,
    abandoned: BTreeSet<String>,
    next_discovery: Option<Instant>,
    shut_down: bool,
}

impl Inner {
    fn transport_for(&self, role: DeviceRole) -> Option<&TransportHandler> {
        self.handles
            .values()
            .filter(|handle| handle.role == Some(role) && handle.is_live())
            .find_map(|handle| match &handle.backend {
                Some(Backend::Serial(transport)) => Some(transport),
                _ => None,
            })
    }

    fn free_hid_slot(&self) -> u8 {
        let used: BTreeSet<u8> = self
            .handles
            .values()
            .filter_map(|handle| match handle.role {
                Some(DeviceRole::GenericHid(slot)) => Some(slot),
                _ => None,
            })
            .collect();
        (0..=u8::MAX).find(|slot| !used.contains(slot)).unwrap_or(u8::MAX)
    }
}

struct Listing {
    serial: Option<Vec<Endpoint>>,
    hid: Option<Vec<HidDeviceInfo>>,
}

struct Candidate {
    endpoint: String,
    target: Target,
}

enum Opened {
    Serial {
        link: Box<dyn SerialLink>,
        identity: Identity,
    },
    Hid(Box<dyn HidDevice>),
}

/// Discovers endpoints, identifies them and keeps them connected.
pub struct ConnectionManager {
    config: LinkConfig,
    bus: LinkBus,
    serial: Arc<dyn EndpointProvider>,
    hid: Option<HidSource>,
    inner: Mutex<Inner>,
    /// Events raised under the state lock, published once it is released.
    outbox: Mutex<Vec<(Topic, BusEvent)>>,
    /// Backends detached under the state lock, stopped once it is released.
    retired: Mutex<Vec<Backend>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("handles", &self.inner.lock().handles.len())
            .field("hid", &self.hid.is_some())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(config: LinkConfig, bus: LinkBus, serial: Arc<dyn EndpointProvider>) -> Self {
        let inner = Inner {
            registry: TokenRegistry::seeded(&config.known_wheel_tokens),
            ..Inner::default()
        };
        Self {
            config,
            bus,
            serial,
            hid: None,
            inner: Mutex::new(inner),
            outbox: Mutex::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
        }
    }

    pub fn with_hid(mut self, source: HidSource) -> Self {
        self.hid = Some(source);
        self
    }

    pub fn bus(&self) -> &LinkBus {
        &self.bus
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn tick(&self) -> TickReport {
        self.tick_at(Instant::now())
    }

    /// One supervision pass: reap failed links, enumerate when due, then
    /// identify new and retry-ready endpoints one at a time.
    pub fn tick_at(&self, now: Instant) -> TickReport {
        let mut report = TickReport::default();

        let discover = {
            let mut inner = self.inner.lock();
            if inner.shut_down {
                return report;
            }
            self.reap(&mut inner, now, &mut report);
            let due = inner.next_discovery.is_none_or(|at| now >= at);
            if due {
                inner.next_discovery = Some(now + self.config.discovery_interval());
            }
            due
        };
        self.flush();

        let listing = discover.then(|| self.enumerate(&mut report));

        let candidates = {
            let mut inner = self.inner.lock();
            if inner.shut_down {
                return report;
            }
            if let Some(listing) = listing {
                self.reconcile(&mut inner, listing, &mut report);
            }
            self.ready_for_identification(&inner, now)
        };
        self.flush();

        let outcomes: Vec<_> = candidates
            .into_iter()
            .map(|candidate| {
                let outcome = self.open(&candidate);
                (candidate, outcome)
            })
            .collect();

        let mut inner = self.inner.lock();
        for (candidate, outcome) in outcomes {
            if inner.shut_down {
                break;
            }
            match outcome {
                Ok(opened) => self.attach(&mut inner, &candidate.endpoint, opened, now, &mut report),
                Err(error) => {
                    if error.is_retryable() {
                        debug!(endpoint = %candidate.endpoint, %error, "identification failed");
                    } else {
                        warn!(endpoint = %candidate.endpoint, %error, "identification failed");
                    }
                    self.fail(&mut inner, &candidate.endpoint, error, now, &mut report);
                }
            }
        }
        drop(inner);
        self.flush();
        report
    }

    /// Queues `command` on the transport serving `role`.
    ///
    /// Pedals and shifters plugged into a wheelbase have no port of their
    /// own; when no direct link exists their commands go through the
    /// wheelbase, which forwards by address.
    ///
    /// # Errors
    ///
    /// `DeviceUnavailable` when no connected transport serves `role`, or any
    /// error of [`TransportHandler::enqueue`].
    pub fn route(&self, role: DeviceRole, command: &Command) -> Result<PendingResponse, LinkError> {
        let inner = self.inner.lock();
        if inner.shut_down {
            return Err(LinkError::device_unavailable(role));
        }
        if let Some(transport) = inner.transport_for(role) {
            return transport.enqueue(command);
        }
        if matches!(role, DeviceRole::Pedals | DeviceRole::Shifter)
            && let Some(transport) = inner.transport_for(DeviceRole::Wheelbase)
        {
            debug!(%role, "routing through wheelbase");
            return transport.enqueue(command);
        }
        Err(LinkError::device_unavailable(role))
    }

    /// Routes `command` and waits for the reply.
    ///
    /// # Errors
    ///
    /// Any error of [`ConnectionManager::route`] or [`PendingResponse::wait`].
    pub fn send(&self, role: DeviceRole, command: &Command) -> Result<Response, LinkError> {
        self.route(role, command)?.wait()
    }

    /// State of the handle holding `role`; `Disconnected` when none does.
    pub fn current_state(&self, role: DeviceRole) -> ConnectionState {
        self.inner
            .lock()
            .handles
            .values()
            .find(|handle| handle.role == Some(role))
            .map_or(ConnectionState::Disconnected, |handle| handle.state.get())
    }

    pub fn state_of(&self, endpoint: &str) -> Option<ConnectionState> {
        self.inner
            .lock()
            .handles
            .get(endpoint)
            .map(|handle| handle.state.get())
    }

    pub fn handles(&self) -> Vec<HandleInfo> {
        self.inner.lock().handles.values().map(DeviceHandle::info).collect()
    }

    /// Wheel tokens and the slots they were given, for persisting across
    /// restarts.
    pub fn known_wheel_tokens(&self) -> BTreeMap<u8, u8> {
        self.inner.lock().registry.known().clone()
    }

    /// Applies a new shim configuration to every running HID peripheral.
    ///
    /// # Errors
    ///
    /// The first rejected setting; shims before it keep the new values.
    pub fn update_hid(&self, config: &HidShimConfig) -> Result<(), openracing_errors::DeviceError> {
        let inner = self.inner.lock();
        for handle in inner.handles.values() {
            if let Some(Backend::Hid(shim)) = &handle.backend {
                shim.set_update_rate(config.update_rate_hz)?;
                shim.set_compat(config.compat);
                shim.update_blip(racing_wheel_hid_compat::BlipUpdate {
                    enabled: Some(config.blip.enabled),
                    level: Some(config.blip.level),
                    duration_ms: Some(config.blip.duration_ms),
                })?;
            }
        }
        Ok(())
    }

    /// # Errors
    ///
    /// `Closed` once the bus has been closed.
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Result<SubscriptionHandle<Topic>, BusError>
    where
        F: Fn(&BusEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.bus.subscribe(topic, handler)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle<Topic>) -> bool {
        self.bus.unsubscribe(handle)
    }

    /// Stops every link and marks all handles `Disconnected`. Later ticks
    /// and routes do nothing. The bus stays open.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        if inner.shut_down {
            return;
        }
        inner.shut_down = true;
        let handles = std::mem::take(&mut inner.handles);
        drop(inner);
        for (_, mut handle) in handles {
            self.retire(&mut handle);
            self.set_state(&handle, ConnectionState::Disconnected);
        }
        self.flush();
        info!("connection manager stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().shut_down
    }

    /// Runs [`ConnectionManager::tick`] on a background thread every
    /// [`TICK_INTERVAL`] until the returned task is stopped.
    ///
    /// # Errors
    ///
    /// `Stream` if the thread cannot be started.
    pub fn spawn(self: &Arc<Self>) -> Result<ManagerTask, LinkError> {
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let manager = Arc::clone(self);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("link-manager".into())
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) && !manager.is_shut_down() {
                        let report = manager.tick();
                        for error in &report.errors {
                            debug!(%error, "tick error");
                        }
                        std::thread::sleep(TICK_INTERVAL);
                    }
                })
                .map_err(|e| LinkError::stream("link-manager", e))?
        };
        Ok(ManagerTask {
            stop,
            worker: Some(worker),
        })
    }

    fn enumerate(&self, report: &mut TickReport) -> Listing {
        let serial = match self.serial.list() {
            Ok(endpoints) => Some(endpoints),
            Err(error) => {
                warn!(%error, "serial enumeration failed");
                report.errors.push(error);
                None
            }
        };
        let hid = self.hid.as_ref().and_then(|source| match source.port.list_devices() {
            Ok(devices) => Some(
                devices
                    .into_iter()
                    .filter(|info| is_hid_candidate(info, &source.config))
                    .collect(),
            ),
            Err(error) => {
                warn!(%error, "hid enumeration failed");
                report.errors.push(LinkError::stream("hid enumeration", error));
                None
            }
        });
        Listing { serial, hid }
    }

    /// Adds new endpoints and drops vanished ones. A failed enumeration
    /// leaves its kind untouched.
    fn reconcile(&self, inner: &mut Inner, listing: Listing, report: &mut TickReport) {
        let mut present: Vec<(String, Target)> = Vec::new();
        let mut listed_kinds = Vec::new();
        if let Some(endpoints) = listing.serial {
            listed_kinds.push(EndpointKind::Serial);
            present.extend(
                endpoints
                    .into_iter()
                    .map(|endpoint| (endpoint.path.clone(), Target::Serial(endpoint))),
            );
        }
        if let Some(devices) = listing.hid {
            listed_kinds.push(EndpointKind::Hid);
            present.extend(
                devices
                    .into_iter()
                    .map(|info| (info.path.clone(), Target::Hid(info))),
            );
        }
        let paths: BTreeSet<&str> = present.iter().map(|(path, _)| path.as_str()).collect();

        let vanished: Vec<String> = inner
            .handles
            .values()
            .filter(|handle| listed_kinds.contains(&handle.kind()))
            .filter(|handle| !paths.contains(handle.endpoint.as_str()))
            .map(|handle| handle.endpoint.clone())
            .collect();
        for endpoint in vanished {
            if let Some(mut handle) = inner.handles.remove(&endpoint) {
                info!(%endpoint, role = ?handle.role, "endpoint removed");
                self.retire(&mut handle);
                self.set_state(&handle, ConnectionState::Disconnected);
                report.lost.push(endpoint);
            }
        }
        inner.abandoned.retain(|endpoint| paths.contains(endpoint.as_str()));

        for (endpoint, target) in present {
            if inner.handles.contains_key(&endpoint) || inner.abandoned.contains(&endpoint) {
                continue;
            }
            debug!(%endpoint, "endpoint discovered");
            let handle = DeviceHandle::new(endpoint.clone(), target);
            self.publish_state(&handle, ConnectionState::Disconnected);
            inner.handles.insert(endpoint.clone(), handle);
            report.discovered.push(endpoint);
        }
    }

    fn ready_for_identification(&self, inner: &Inner, now: Instant) -> Vec<Candidate> {
        let mut ready = Vec::new();
        for handle in inner.handles.values() {
            if handle.backend.is_some() {
                continue;
            }
            let due = match handle.state.get() {
                ConnectionState::Disconnected => true,
                ConnectionState::Erroring => handle.retry_at.is_none_or(|at| now >= at),
                ConnectionState::Identifying | ConnectionState::Connected => false,
            };
            if due {
                self.set_state(handle, ConnectionState::Identifying);
                ready.push(Candidate {
                    endpoint: handle.endpoint.clone(),
                    target: handle.target.clone(),
                });
            }
        }
        ready
    }

    fn open(&self, candidate: &Candidate) -> Result<Opened, LinkError> {
        match &candidate.target {
            Target::Serial(endpoint) => {
                let mut link = self.serial.open(endpoint, &self.config)?;
                let identity = query_identity(
                    link.as_mut(),
                    &candidate.endpoint,
                    self.config.identify_timeout(),
                )?;
                debug!(endpoint = %candidate.endpoint, ?identity, "identified");
                Ok(Opened::Serial { link, identity })
            }
            Target::Hid(info) => {
                let source = self
                    .hid
                    .as_ref()
                    .ok_or_else(|| LinkError::stream(&candidate.endpoint, "hid disabled"))?;
                let device = source
                    .port
                    .open_device(&info.path)
                    .map_err(|e| LinkError::stream(&candidate.endpoint, e))?;
                Ok(Opened::Hid(device))
            }
        }
    }

    fn attach(
        &self,
        inner: &mut Inner,
        endpoint: &str,
        opened: Opened,
        now: Instant,
        report: &mut TickReport,
    ) {
        if !inner.handles.contains_key(endpoint) {
            return;
        }
        let attached = match opened {
            Opened::Serial { link, identity } => match self.resolve_role(inner, endpoint, &identity) {
                Ok(role) => TransportHandler::spawn(link, role, endpoint, &self.config, self.bus.clone())
                    .map(|transport| (role, Some(identity.token), Backend::Serial(transport))),
                Err(conflict @ LinkError::IdentificationConflict { .. }) => {
                    warn!(%endpoint, error = %conflict, "identification conflict");
                    self.post(
                        Topic::LinkFault,
                        BusEvent::Fault {
                            endpoint: endpoint.to_owned(),
                            error: conflict.clone(),
                        },
                    );
                    report.errors.push(conflict);
                    self.abandon(inner, endpoint, report);
                    return;
                }
                Err(error) => Err(error),
            },
            Opened::Hid(device) => {
                let role = inner
                    .handles
                    .get(endpoint)
                    .and_then(|handle| handle.role)
                    .unwrap_or_else(|| DeviceRole::GenericHid(inner.free_hid_slot()));
                self.spawn_shim(endpoint, device, role)
                    .map(|shim| (role, None, Backend::Hid(shim)))
            }
        };

        let (role, token, backend) = match attached {
            Ok(attached) => attached,
            Err(error) => {
                self.fail(inner, endpoint, error, now, report);
                return;
            }
        };
        let Some(handle) = inner.handles.get_mut(endpoint) else {
            return;
        };
        handle.role = Some(role);
        handle.token = token;
        handle.backend = Some(backend);
        handle.attempts = 0;
        handle.retry_at = None;
        self.set_state(handle, ConnectionState::Connected);
        self.post(
            Topic::DeviceIdentified,
            BusEvent::Identified {
                endpoint: endpoint.to_owned(),
                role,
                token,
            },
        );
        info!(%endpoint, %role, "device connected");
        report.connected.push((endpoint.to_owned(), role));
    }

    /// Maps an identity onto a role, keeping the role a handle already had.
    fn resolve_role(
        &self,
        inner: &mut Inner,
        endpoint: &str,
        identity: &Identity,
    ) -> Result<DeviceRole, LinkError> {
        let previous = inner.handles.get(endpoint).and_then(|handle| handle.role);
        if let Some(previous) = previous
            && previous.kind() != identity.kind
        {
            return Err(LinkError::stream(
                endpoint,
                format!("identified as {} but was {previous}", identity.kind),
            ));
        }

        let others = || {
            inner
                .handles
                .values()
                .filter(move |handle| handle.endpoint != endpoint && handle.is_live())
        };
        let conflict = |with: Vec<String>| {
            let mut endpoints = with;
            endpoints.push(endpoint.to_owned());
            LinkError::IdentificationConflict {
                token: identity.token,
                endpoints,
            }
        };

        match identity.kind {
            DeviceKind::Wheel => {
                let same_token: Vec<String> = others()
                    .filter(|handle| {
                        handle.token == Some(identity.token)
                            && handle.role.is_some_and(|role| role.kind() == DeviceKind::Wheel)
                    })
                    .map(|handle| handle.endpoint.clone())
                    .collect();
                if !same_token.is_empty() {
                    return Err(conflict(same_token));
                }
                let occupied: BTreeSet<u8> = others()
                    .filter_map(|handle| match handle.role {
                        Some(DeviceRole::Wheel(slot)) => Some(slot),
                        _ => None,
                    })
                    .collect();
                let wheels: Vec<String> = others()
                    .filter(|handle| handle.role.is_some_and(|role| role.kind() == DeviceKind::Wheel))
                    .map(|handle| handle.endpoint.clone())
                    .collect();
                if let Some(DeviceRole::Wheel(slot)) = previous
                    && !occupied.contains(&slot)
                {
                    return Ok(DeviceRole::Wheel(slot));
                }
                inner
                    .registry
                    .assign(identity.token, &occupied)
                    .map(DeviceRole::Wheel)
                    .ok_or_else(|| conflict(wheels))
            }
            DeviceKind::Wheelbase | DeviceKind::Pedals | DeviceKind::Shifter => {
                let role = match identity.kind {
                    DeviceKind::Wheelbase => DeviceRole::Wheelbase,
                    DeviceKind::Pedals => DeviceRole::Pedals,
                    _ => DeviceRole::Shifter,
                };
                let holders: Vec<String> = others()
                    .filter(|handle| handle.role == Some(role))
                    .map(|handle| handle.endpoint.clone())
                    .collect();
                if holders.is_empty() {
                    Ok(role)
                } else {
                    Err(conflict(holders))
                }
            }
            DeviceKind::GenericHid => Err(LinkError::stream(
                endpoint,
                "serial endpoint identified as a hid peripheral",
            )),
        }
    }

    fn spawn_shim(
        &self,
        endpoint: &str,
        device: Box<dyn HidDevice>,
        role: DeviceRole,
    ) -> Result<HidShim, LinkError> {
        let source = self
            .hid
            .as_ref()
            .ok_or_else(|| LinkError::stream(endpoint, "hid disabled"))?;
        let bus = self.bus.clone();
        let path = endpoint.to_owned();
        let sink = Arc::new(move |event: HidEvent| match event {
            HidEvent::Input { role, event } => {
                bus.publish(&Topic::Input(role), &BusEvent::Input { role, event });
            }
            HidEvent::Lost { reason, .. } => {
                bus.publish(
                    &Topic::LinkFault,
                    &BusEvent::Fault {
                        endpoint: path.clone(),
                        error: LinkError::stream(&path, reason),
                    },
                );
            }
        });
        HidShim::spawn(device, role, &source.config, source.factory.as_deref(), sink)
            .map_err(|e| LinkError::stream(endpoint, e))
    }

    /// Moves handles whose link died to `Erroring`.
    fn reap(&self, inner: &mut Inner, now: Instant, report: &mut TickReport) {
        let failed: Vec<(String, LinkError)> = inner
            .handles
            .values()
            .filter_map(|handle| {
                let backend = handle.backend.as_ref()?;
                backend
                    .failure(&handle.endpoint)
                    .map(|error| (handle.endpoint.clone(), error))
            })
            .collect();
        for (endpoint, error) in failed {
            if error.is_device_fatal() {
                warn!(%endpoint, %error, "link lost");
            } else {
                info!(%endpoint, %error, "link stopped");
            }
            self.fail(inner, &endpoint, error, now, report);
        }
    }

    /// Tears the handle's link down and schedules a retry, or abandons the
    /// endpoint once the retry budget is spent.
    fn fail(
        &self,
        inner: &mut Inner,
        endpoint: &str,
        error: LinkError,
        now: Instant,
        report: &mut TickReport,
    ) {
        let Some(handle) = inner.handles.get_mut(endpoint) else {
            return;
        };
        self.retire(handle);
        handle.attempts = handle.attempts.saturating_add(1);
        report.errors.push(error);

        let policy = &self.config.reconnect;
        if policy.exhausted(handle.attempts) {
            warn!(%endpoint, attempts = handle.attempts, "giving up on endpoint");
            self.abandon(inner, endpoint, report);
            return;
        }
        let delay = policy.delay_for(handle.attempts);
        handle.retry_at = Some(now + delay);
        self.set_state(handle, ConnectionState::Erroring);
        debug!(
            %endpoint,
            attempt = handle.attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "retry scheduled"
        );
    }

    fn abandon(&self, inner: &mut Inner, endpoint: &str, report: &mut TickReport) {
        if let Some(mut handle) = inner.handles.remove(endpoint) {
            self.retire(&mut handle);
            self.set_state(&handle, ConnectionState::Disconnected);
            inner.abandoned.insert(endpoint.to_owned());
            report.abandoned.push(endpoint.to_owned());
        }
    }

    fn set_state(&self, handle: &DeviceHandle, state: ConnectionState) {
        if handle.state.set(state) {
            self.publish_state(handle, state);
        }
    }

    fn publish_state(&self, handle: &DeviceHandle, state: ConnectionState) {
        debug!(endpoint = %handle.endpoint, role = ?handle.role, %state, "state changed");
        self.post(
            Topic::ConnectionState,
            BusEvent::StateChanged {
                endpoint: handle.endpoint.clone(),
                role: handle.role,
                state,
            },
        );
    }

    fn post(&self, topic: Topic, event: BusEvent) {
        self.outbox.lock().push((topic, event));
    }

    /// Detaches the handle's backend. Stopping joins reader threads that
    /// may be inside a bus handler, so it waits for [`Self::flush`].
    fn retire(&self, handle: &mut DeviceHandle) {
        if let Some(backend) = handle.backend.take() {
            self.retired.lock().push(backend);
        }
    }

    /// Stops retired backends, then publishes queued events. Must not be
    /// called with the state lock held, since handlers may call back into
    /// the manager.
    fn flush(&self) {
        let retired = std::mem::take(&mut *self.retired.lock());
        for mut backend in retired {
            backend.stop();
        }
        let events = std::mem::take(&mut *self.outbox.lock());
        for (topic, event) in events {
            self.bus.publish(&topic, &event);
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to the background loop started by [`ConnectionManager::spawn`].
#[derive(Debug)]
pub struct ManagerTask {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ManagerTask {
    /// Stops the loop and waits for the current tick to finish.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!("connection manager thread panicked");
        }
    }
}

impl Drop for ManagerTask {
    fn drop(&mut self) {
        self.stop();
    }
}
