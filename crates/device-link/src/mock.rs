//! In-memory serial devices for tests and dry runs.
//!
//! [`MockSerialLink`] plays a Moza device: it decodes what the host writes
//! and answers identification queries and commands from a script.
//! Clones share the same device, so a test keeps one clone to inspect
//! traffic and inject faults while the transport owns another.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use openracing_errors::LinkError;
use parking_lot::{Condvar, Mutex};
use racing_wheel_moza_serial_protocol::{
    Frame, FrameCodec, IDENTIFY_ADDRESS, IDENTIFY_COMMAND, Identity, STATUS_OK, StreamDecoder,
};
use tracing::trace;

use crate::config::LinkConfig;
use crate::link::{Endpoint, EndpointProvider, SerialLink};

/// How long an empty read waits before reporting a timeout.
const READ_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
struct Script {
    identity: Option<Identity>,
    values: BTreeMap<u8, Vec<u8>>,
    rejects: BTreeMap<u8, u8>,
    silent: BTreeSet<u8>,
}

#[derive(Debug, Default)]
struct State {
    to_host: VecDeque<u8>,
    written: Vec<u8>,
    frames: Vec<Frame>,
    decoder: StreamDecoder,
    script: Script,
    broken: bool,
    write_delay: Option<Duration>,
    opens: usize,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    readable: Condvar,
}

#[derive(Debug, Clone, Default)]
pub struct MockSerialLink {
    shared: Arc<Shared>,
}

impl MockSerialLink {
    /// A device that never answers.
    pub fn new() -> Self {
        Self::default()
    }

    /// A device that answers identification with `identity` and
    /// acknowledges every other command.
    pub fn moza(identity: Identity) -> Self {
        let link = Self::new();
        link.shared.state.lock().script.identity = Some(identity);
        link
    }

    /// Reply to `command_id` with `value` instead of a bare acknowledgement.
    pub fn answer(&self, command_id: u8, value: impl Into<Vec<u8>>) {
        self.shared
            .state
            .lock()
            .script
            .values
            .insert(command_id, value.into());
    }

    /// Reply to `command_id` with a non-zero status.
    pub fn reject(&self, command_id: u8, status: u8) {
        self.shared.state.lock().script.rejects.insert(command_id, status);
    }

    /// Never reply to `command_id`.
    pub fn silence(&self, command_id: u8) {
        self.shared.state.lock().script.silent.insert(command_id);
    }

    /// Change the identification answer, as when another device appears on
    /// the same port.
    pub fn set_identity(&self, identity: Option<Identity>) {
        self.shared.state.lock().script.identity = identity;
    }

    /// Slow every write down, to keep frames queued behind it.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.shared.state.lock().write_delay = delay;
    }

    /// Push raw bytes towards the host.
    pub fn inject(&self, bytes: &[u8]) {
        self.shared.state.lock().to_host.extend(bytes);
        self.shared.readable.notify_all();
    }

    /// Fail every later read and write, like an unplugged cable.
    pub fn break_link(&self) {
        self.shared.state.lock().broken = true;
        self.shared.readable.notify_all();
    }

    pub fn repair(&self) {
        let mut state = self.shared.state.lock();
        state.broken = false;
        state.to_host.clear();
    }

    /// Frames the host wrote, in order.
    pub fn frames_written(&self) -> Vec<Frame> {
        self.shared.state.lock().frames.clone()
    }

    /// Frames the host wrote, excluding identification queries.
    pub fn commands_written(&self) -> Vec<Frame> {
        self.frames_written()
            .into_iter()
            .filter(|f| !is_identify(f))
            .collect()
    }

    pub fn bytes_written(&self) -> Vec<u8> {
        self.shared.state.lock().written.clone()
    }

    pub fn open_count(&self) -> usize {
        self.shared.state.lock().opens
    }

    fn broken_pipe() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "mock link broken")
    }
}

fn is_identify(frame: &Frame) -> bool {
    frame.address() == IDENTIFY_ADDRESS && frame.command_id() == IDENTIFY_COMMAND
}

impl Script {
    fn respond(&self, codec: &FrameCodec, request: &Frame) -> Option<Frame> {
        let reply = if is_identify(request) {
            let identity = self.identity?;
            codec.reply(request, STATUS_OK, &identity.to_value())
        } else if self.silent.contains(&request.command_id()) {
            return None;
        } else if let Some(status) = self.rejects.get(&request.command_id()) {
            codec.reply(request, *status, &[])
        } else {
            let value = self
                .values
                .get(&request.command_id())
                .map(Vec::as_slice)
                .unwrap_or_default();
            codec.reply(request, STATUS_OK, value)
        };
        reply.ok()
    }
}

impl Read for MockSerialLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.shared.state.lock();
        if state.broken {
            return Err(Self::broken_pipe());
        }
        if state.to_host.is_empty() {
            self.shared.readable.wait_for(&mut state, READ_POLL);
            if state.broken {
                return Err(Self::broken_pipe());
            }
            if state.to_host.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
        }
        let n = buf.len().min(state.to_host.len());
        for (slot, byte) in buf.iter_mut().zip(state.to_host.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockSerialLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let delay = self.shared.state.lock().write_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let mut state = self.shared.state.lock();
        if state.broken {
            return Err(Self::broken_pipe());
        }
        state.written.extend_from_slice(buf);
        state.decoder.extend(buf);

        let codec = FrameCodec::moza();
        let mut replied = false;
        while let Some(event) = state.decoder.next_event() {
            let Ok(frame) = event else {
                continue;
            };
            trace!(?frame, "mock device received");
            if let Some(reply) = state.script.respond(&codec, &frame) {
                state.to_host.extend(reply.to_bytes());
                replied = true;
            }
            state.frames.push(frame);
        }
        drop(state);
        if replied {
            self.shared.readable.notify_all();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialLink for MockSerialLink {
    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>> {
        Ok(Box::new(self.clone()))
    }
}

/// A fixed set of mock endpoints that tests can plug and unplug.
#[derive(Debug, Default)]
pub struct MockEndpointProvider {
    endpoints: Mutex<BTreeMap<String, MockSerialLink>>,
    fail_listing: Mutex<bool>,
}

impl MockEndpointProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plug(&self, path: impl Into<String>, link: MockSerialLink) {
        self.endpoints.lock().insert(path.into(), link);
    }

    /// Removes the endpoint and breaks its link. Returns the link, if any.
    pub fn unplug(&self, path: &str) -> Option<MockSerialLink> {
        let link = self.endpoints.lock().remove(path)?;
        link.break_link();
        Some(link)
    }

    pub fn link(&self, path: &str) -> Option<MockSerialLink> {
        self.endpoints.lock().get(path).cloned()
    }

    pub fn set_listing_fails(&self, fails: bool) {
        *self.fail_listing.lock() = fails;
    }
}

impl EndpointProvider for MockEndpointProvider {
    fn list(&self) -> Result<Vec<Endpoint>, LinkError> {
        if *self.fail_listing.lock() {
            return Err(LinkError::stream("mock enumeration", "listing refused"));
        }
        Ok(self.endpoints.lock().keys().map(Endpoint::new).collect())
    }

    fn open(
        &self,
        endpoint: &Endpoint,
        _config: &LinkConfig,
    ) -> Result<Box<dyn SerialLink>, LinkError> {
        let link = self
            .endpoints
            .lock()
            .get(&endpoint.path)
            .cloned()
            .ok_or_else(|| LinkError::stream(&endpoint.path, "no such port"))?;
        let mut state = link.shared.state.lock();
        if state.broken {
            return Err(LinkError::stream(&endpoint.path, "port unavailable"));
        }
        state.opens += 1;
        state.decoder = StreamDecoder::default();
        drop(state);
        Ok(Box::new(link))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use racing_wheel_moza_serial_protocol::{Command, DeviceKind, Response, ResponseKind};

    fn wheelbase() -> Identity {
        Identity {
            kind: DeviceKind::Wheelbase,
            token: 0xAA,
            model: None,
        }
    }

    fn read_reply(link: &mut MockSerialLink) -> Option<Frame> {
        let mut decoder = StreamDecoder::new(FrameCodec::moza());
        let mut buf = [0u8; 64];
        for _ in 0..20 {
            match link.read(&mut buf) {
                Ok(n) => decoder.extend(buf.get(..n).unwrap_or_default()),
                Err(_) => continue,
            }
            if let Some(Ok(frame)) = decoder.next_event() {
                return Some(frame);
            }
        }
        None
    }

    #[test]
    fn answers_identification() -> Result<(), Box<dyn std::error::Error>> {
        let mut link = MockSerialLink::moza(wheelbase());
        let codec = FrameCodec::moza();
        let query = codec.frame(IDENTIFY_ADDRESS, IDENTIFY_COMMAND, Vec::new())?;
        link.write_all(&query.to_bytes())?;

        let reply = read_reply(&mut link).ok_or("no reply")?;
        let response = Response::from_frame(&reply);
        assert_eq!(Identity::from_value(response.value_bytes()), Some(wheelbase()));
        Ok(())
    }

    #[test]
    fn rejects_and_silences_by_command() -> Result<(), Box<dyn std::error::Error>> {
        let mut link = MockSerialLink::moza(wheelbase());
        let codec = FrameCodec::moza();
        let torque = codec.encode(&Command::set_torque_limit(95))?;
        link.reject(torque.command_id(), 0x05);
        link.write_all(&torque.to_bytes())?;
        let reply = read_reply(&mut link).ok_or("no reply")?;
        assert_eq!(Response::from_frame(&reply).kind(), &ResponseKind::Error(0x05));

        link.silence(torque.command_id());
        link.write_all(&torque.to_bytes())?;
        assert!(read_reply(&mut link).is_none());
        assert_eq!(link.commands_written().len(), 2);
        Ok(())
    }

    #[test]
    fn broken_link_fails_io() {
        let mut link = MockSerialLink::new();
        link.break_link();
        let mut buf = [0u8; 4];
        assert!(link.read(&mut buf).is_err());
        assert!(link.write(&[1, 2]).is_err());
    }

    #[test]
    fn unplug_breaks_open_handles() -> Result<(), LinkError> {
        let provider = MockEndpointProvider::new();
        provider.plug("/dev/ttyACM0", MockSerialLink::moza(wheelbase()));
        let endpoints = provider.list()?;
        assert_eq!(endpoints, vec![Endpoint::new("/dev/ttyACM0")]);

        let endpoint = endpoints
            .first()
            .ok_or_else(|| LinkError::stream("/dev/ttyACM0", "not listed"))?;
        let mut opened = provider.open(endpoint, &LinkConfig::default())?;
        assert!(provider.unplug("/dev/ttyACM0").is_some());
        assert!(opened.write(&[0x7E]).is_err());
        assert!(provider.list()?.is_empty());
        Ok(())
    }
}
