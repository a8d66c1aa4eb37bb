//! Per-endpoint transport handler.
//!
//! Each handler owns one serial stream and two threads: a writer draining a
//! FIFO queue of encoded frames, and a reader feeding a [`StreamDecoder`].
//! Requests wait on a [`BlockingValue`] keyed by the reply's correlation
//! key; several requests with the same key are answered in the order they
//! were queued. Every reply is also published on the bus under
//! `(role, command id)`.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use openracing_errors::{FramingError, LinkError};
use openracing_event_bus::BlockingValue;
use parking_lot::Mutex;
use racing_wheel_moza_serial_protocol::{
    Command, CorrelationKey, DeviceRole, Frame, FrameCodec, Response, ResponseKind, StreamDecoder,
    is_reply,
};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::config::LinkConfig;
use crate::link::{SerialLink, is_idle};
use crate::topics::{BusEvent, ConnectionState, LinkBus, Topic};

const READ_CHUNK: usize = 256;
const WRITER_POLL: Duration = Duration::from_millis(10);

type Slot = Arc<BlockingValue<Result<Response, LinkError>>>;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportHealth {
    Running,
    /// The stream failed; the handler is dead and the manager should
    /// reconnect.
    Failed(LinkError),
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub framing_errors: u64,
    pub timeouts: u64,
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    framing_errors: AtomicU64,
    timeouts: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TransportStats {
        TransportStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Sliding window of framing failures.
#[derive(Debug)]
struct FramingWindow {
    hits: VecDeque<Instant>,
    window: Duration,
    threshold: usize,
}

impl FramingWindow {
    /// Records one failure; returns the count when it crosses the threshold.
    fn record(&mut self, now: Instant) -> Option<usize> {
        while let Some(first) = self.hits.front() {
            if now.saturating_duration_since(*first) > self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        self.hits.push_back(now);
        if self.hits.len() > self.threshold {
            let count = self.hits.len();
            self.hits.clear();
            return Some(count);
        }
        None
    }
}

struct Shared {
    endpoint: String,
    role: DeviceRole,
    bus: LinkBus,
    running: AtomicBool,
    health: Mutex<TransportHealth>,
    pending: Mutex<HashMap<CorrelationKey, VecDeque<(u64, Slot)>>>,
    next_seq: AtomicU64,
    counters: Counters,
    framing: Mutex<FramingWindow>,
}

impl Shared {
    /// Marks the handler failed, once, and fails every waiter with `error`.
    fn fail(&self, error: LinkError) {
        {
            let mut health = self.health.lock();
            if *health != TransportHealth::Running {
                return;
            }
            *health = TransportHealth::Failed(error.clone());
        }
        self.running.store(false, Ordering::Release);
        warn!(endpoint = %self.endpoint, role = %self.role, %error, "transport failed");
        self.resolve_all(&error);
        self.bus.publish(
            &Topic::LinkFault,
            &BusEvent::Fault {
                endpoint: self.endpoint.clone(),
                error,
            },
        );
    }

    fn resolve_all(&self, error: &LinkError) {
        let drained: Vec<Slot> = self
            .pending
            .lock()
            .drain()
            .flat_map(|(_, waiters)| waiters.into_iter().map(|(_, slot)| slot))
            .collect();
        for slot in drained {
            slot.set(Err(error.clone()));
        }
    }

    fn remove_pending(&self, key: CorrelationKey, seq: u64) {
        let mut pending = self.pending.lock();
        if let Some(waiters) = pending.get_mut(&key) {
            waiters.retain(|(s, _)| *s != seq);
            if waiters.is_empty() {
                pending.remove(&key);
            }
        }
    }

    fn dispatch(&self, frame: &Frame) {
        if !is_reply(frame) {
            trace!(endpoint = %self.endpoint, ?frame, "ignoring host-bound frame");
            return;
        }
        Counters::bump(&self.counters.frames_received);
        let response = Response::from_frame(frame);
        let key = response.key();

        let waiter = {
            let mut pending = self.pending.lock();
            let waiter = pending.get_mut(&key).and_then(VecDeque::pop_front);
            if pending.get(&key).is_some_and(VecDeque::is_empty) {
                pending.remove(&key);
            }
            waiter
        };
        if let Some((_, slot)) = waiter {
            slot.set(Ok(response.clone()));
        } else {
            trace!(endpoint = %self.endpoint, ?key, "unsolicited reply");
        }

        let role = response.role().unwrap_or(self.role);
        self.bus.publish(
            &Topic::device(role, key.command_id),
            &BusEvent::Response { role, response },
        );
    }

    fn framing_error(&self, error: &FramingError) {
        Counters::bump(&self.counters.framing_errors);
        trace!(endpoint = %self.endpoint, %error, "resync");
        let crossed = self.framing.lock().record(Instant::now());
        if let Some(count) = crossed {
            let window_ms = u64::try_from(self.framing.lock().window.as_millis()).unwrap_or(u64::MAX);
            let fault = LinkError::FramingRate {
                endpoint: self.endpoint.clone(),
                count,
                window_ms,
            };
            warn!(endpoint = %self.endpoint, count, window_ms, "framing error rate exceeded");
            self.bus.publish(
                &Topic::LinkFault,
                &BusEvent::Fault {
                    endpoint: self.endpoint.clone(),
                    error: fault,
                },
            );
        }
    }
}

/// A request waiting for its reply.
///
/// Dropping it without waiting forgets the request; a late reply still
/// reaches the bus.
pub struct PendingResponse {
    key: CorrelationKey,
    seq: u64,
    slot: Slot,
    shared: Arc<Shared>,
    timeout: Duration,
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("key", &self.key)
            .field("seq", &self.seq)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl PendingResponse {
    /// Waits up to the configured request timeout.
    ///
    /// # Errors
    ///
    /// `Timeout` when no reply arrived, `Rejected` for a non-zero device
    /// status, or the stream/close error that ended the handler.
    pub fn wait(self) -> Result<Response, LinkError> {
        let timeout = self.timeout;
        self.wait_timeout(timeout)
    }

    /// # Errors
    ///
    /// As [`PendingResponse::wait`].
    pub fn wait_timeout(self, timeout: Duration) -> Result<Response, LinkError> {
        let Some(result) = self.slot.wait(timeout) else {
            Counters::bump(&self.shared.counters.timeouts);
            debug!(endpoint = %self.shared.endpoint, key = ?self.key, "request timed out");
            return Err(LinkError::timeout(
                self.shared.role.to_string(),
                u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            ));
        };
        let response = result?;
        if let ResponseKind::Error(status) = response.kind() {
            Counters::bump(&self.shared.counters.rejected);
            return Err(LinkError::Rejected {
                command: self.key.command_id,
                status: *status,
            });
        }
        Ok(response)
    }

    /// Stops waiting; the reply, if any, only goes to the bus.
    pub fn detach(self) {}
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.shared.remove_pending(self.key, self.seq);
    }
}

pub struct TransportHandler {
    shared: Arc<Shared>,
    codec: FrameCodec,
    queue: Sender<Vec<u8>>,
    request_timeout: Duration,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    stopped: bool,
}

impl std::fmt::Debug for TransportHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandler")
            .field("endpoint", &self.shared.endpoint)
            .field("role", &self.shared.role)
            .field("health", &*self.shared.health.lock())
            .finish_non_exhaustive()
    }
}

impl TransportHandler {
    /// Takes ownership of `link` and starts the reader and writer threads.
    ///
    /// # Errors
    ///
    /// `Stream` if the link cannot be split or a thread cannot be started.
    pub fn spawn(
        link: Box<dyn SerialLink>,
        role: DeviceRole,
        endpoint: impl Into<String>,
        config: &LinkConfig,
        bus: LinkBus,
    ) -> Result<Self, LinkError> {
        let endpoint = endpoint.into();
        let write_link = link
            .try_clone_link()
            .map_err(|e| LinkError::stream(&endpoint, e))?;

        let shared = Arc::new(Shared {
            endpoint: endpoint.clone(),
            role,
            bus,
            running: AtomicBool::new(true),
            health: Mutex::new(TransportHealth::Running),
            pending: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            counters: Counters::default(),
            framing: Mutex::new(FramingWindow {
                hits: VecDeque::new(),
                window: config.framing_window(),
                threshold: config.framing_error_threshold,
            }),
        });
        let (queue, outbound) = channel::unbounded();

        let writer = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("link-tx-{role}"))
                .spawn(move || write_loop(write_link, outbound, &shared))
                .map_err(|e| LinkError::stream(&endpoint, e))?
        };
        let reader = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("link-rx-{role}"))
                .spawn(move || read_loop(link, &shared))
        };
        let reader = match reader {
            Ok(reader) => reader,
            Err(e) => {
                shared.running.store(false, Ordering::Release);
                if writer.join().is_err() {
                    warn!(%endpoint, "writer thread panicked");
                }
                return Err(LinkError::stream(&endpoint, e));
            }
        };

        info!(%endpoint, %role, "transport started");
        Ok(Self {
            shared,
            codec: FrameCodec::moza(),
            queue,
            request_timeout: config.request_timeout(),
            reader: Some(reader),
            writer: Some(writer),
            stopped: false,
        })
    }

    pub fn role(&self) -> DeviceRole {
        self.shared.role
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    pub fn health(&self) -> TransportHealth {
        self.shared.health.lock().clone()
    }

    pub fn is_healthy(&self) -> bool {
        matches!(*self.shared.health.lock(), TransportHealth::Running)
    }

    pub fn stats(&self) -> TransportStats {
        self.shared.counters.snapshot()
    }

    /// Encodes `command` and queues it behind every earlier write.
    ///
    /// # Errors
    ///
    /// `Encoding` for an invalid parameter (nothing is written), the
    /// failure that ended the handler, or `Closed` after shutdown.
    pub fn enqueue(&self, command: &Command) -> Result<PendingResponse, LinkError> {
        let frame = self.codec.encode(command)?;
        self.enqueue_frame(&frame)
    }

    /// Queues an already framed request.
    ///
    /// # Errors
    ///
    /// As [`TransportHandler::enqueue`], minus encoding.
    pub fn enqueue_frame(&self, frame: &Frame) -> Result<PendingResponse, LinkError> {
        match &*self.shared.health.lock() {
            TransportHealth::Running => {}
            TransportHealth::Failed(error) => return Err(error.clone()),
            TransportHealth::Closed => return Err(LinkError::Closed),
        }

        let key = CorrelationKey::of_request(frame);
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        let slot: Slot = Arc::new(BlockingValue::new());
        self.shared
            .pending
            .lock()
            .entry(key)
            .or_default()
            .push_back((seq, Arc::clone(&slot)));

        let pending = PendingResponse {
            key,
            seq,
            slot,
            shared: Arc::clone(&self.shared),
            timeout: self.request_timeout,
        };
        self.queue
            .send(frame.to_bytes())
            .map_err(|_closed| LinkError::Closed)?;
        trace!(endpoint = %self.shared.endpoint, ?key, seq, "queued");
        Ok(pending)
    }

    /// Queues `command` and waits for its reply.
    ///
    /// # Errors
    ///
    /// Any error of [`TransportHandler::enqueue`] or [`PendingResponse::wait`].
    pub fn send(&self, command: &Command) -> Result<Response, LinkError> {
        self.enqueue(command)?.wait()
    }

    /// Stops both threads. A write already on the wire completes; queued
    /// writes are dropped and every waiter gets `Closed`. The first call
    /// publishes `Disconnected` for this endpoint; later calls do nothing.
    pub fn shutdown(&mut self) {
        if std::mem::replace(&mut self.stopped, true) {
            return;
        }
        self.shared.running.store(false, Ordering::Release);
        for (name, worker) in [("writer", self.writer.take()), ("reader", self.reader.take())] {
            if let Some(worker) = worker
                && worker.join().is_err()
            {
                warn!(endpoint = %self.shared.endpoint, name, "transport thread panicked");
            }
        }
        {
            let mut health = self.shared.health.lock();
            if *health == TransportHealth::Running {
                *health = TransportHealth::Closed;
            }
        }
        self.shared.resolve_all(&LinkError::Closed);
        debug!(endpoint = %self.shared.endpoint, "transport stopped");
        self.shared.bus.publish(
            &Topic::ConnectionState,
            &BusEvent::StateChanged {
                endpoint: self.shared.endpoint.clone(),
                role: Some(self.shared.role),
                state: ConnectionState::Disconnected,
            },
        );
    }
}

impl Drop for TransportHandler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn write_loop(mut link: Box<dyn SerialLink>, outbound: Receiver<Vec<u8>>, shared: &Shared) {
    loop {
        let bytes = match outbound.recv_timeout(WRITER_POLL) {
            Ok(bytes) => bytes,
            Err(RecvTimeoutError::Timeout) => {
                if shared.running.load(Ordering::Acquire) {
                    continue;
                }
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if !shared.running.load(Ordering::Acquire) {
            break;
        }
        if let Err(e) = link.write_all(&bytes).and_then(|()| link.flush()) {
            shared.fail(LinkError::stream(&shared.endpoint, e));
            break;
        }
        Counters::bump(&shared.counters.frames_sent);
    }
    let dropped = outbound.try_iter().count();
    if dropped > 0 {
        debug!(endpoint = %shared.endpoint, dropped, "discarded queued writes");
    }
}

fn read_loop(mut link: Box<dyn SerialLink>, shared: &Shared) {
    let mut decoder = StreamDecoder::new(FrameCodec::moza());
    let mut buf = [0u8; READ_CHUNK];
    while shared.running.load(Ordering::Acquire) {
        match link.read(&mut buf) {
            Ok(n) => decoder.extend(buf.get(..n).unwrap_or_default()),
            Err(e) if is_idle(&e) => continue,
            Err(e) => {
                shared.fail(LinkError::stream(&shared.endpoint, e));
                break;
            }
        }
        while let Some(event) = decoder.next_event() {
            match event {
                Ok(frame) => shared.dispatch(&frame),
                Err(error) => shared.framing_error(&error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_window_reports_once_per_burst() {
        let mut window = FramingWindow {
            hits: VecDeque::new(),
            window: Duration::from_millis(100),
            threshold: 3,
        };
        let t0 = Instant::now();
        assert_eq!(window.record(t0), None);
        assert_eq!(window.record(t0), None);
        assert_eq!(window.record(t0), None);
        assert_eq!(window.record(t0), Some(4));
        assert_eq!(window.record(t0), None);
    }

    #[test]
    fn old_failures_age_out() {
        let mut window = FramingWindow {
            hits: VecDeque::new(),
            window: Duration::from_millis(100),
            threshold: 2,
        };
        let t0 = Instant::now();
        window.record(t0);
        window.record(t0);
        let later = t0 + Duration::from_millis(500);
        assert_eq!(window.record(later), None);
    }
}
