//! Role identification and multi-wheel disambiguation.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use openracing_errors::LinkError;
use racing_wheel_moza_serial_protocol::{
    CorrelationKey, FrameCodec, IDENTIFY_ADDRESS, IDENTIFY_COMMAND, Identity, MAX_WHEEL_SLOTS,
    Response, ResponseKind, StreamDecoder, is_reply,
};
use tracing::{debug, trace};

use crate::link::{SerialLink, is_idle};

/// Sends the role query on `link` and waits for the matching reply.
/// Other traffic is skipped. The link is left ready for a transport.
///
/// # Errors
///
/// `Timeout` without a reply, `Rejected` for a non-zero status, `Stream`
/// for an I/O failure or an unreadable identity.
pub fn query_identity(
    link: &mut dyn SerialLink,
    endpoint: &str,
    timeout: Duration,
) -> Result<Identity, LinkError> {
    let codec = FrameCodec::moza();
    let query = codec.frame(IDENTIFY_ADDRESS, IDENTIFY_COMMAND, Vec::new())?;
    let key = CorrelationKey::of_request(&query);
    link.write_all(&query.to_bytes())
        .and_then(|()| link.flush())
        .map_err(|e| LinkError::stream(endpoint, e))?;

    let deadline = Instant::now() + timeout;
    let mut decoder = StreamDecoder::new(codec);
    let mut buf = [0u8; 128];
    while Instant::now() < deadline {
        match link.read(&mut buf) {
            Ok(n) => decoder.extend(buf.get(..n).unwrap_or_default()),
            Err(e) if is_idle(&e) => continue,
            Err(e) => return Err(LinkError::stream(endpoint, e)),
        }
        while let Some(event) = decoder.next_event() {
            let Ok(frame) = event else {
                continue;
            };
            if !is_reply(&frame) || CorrelationKey::of_reply(&frame) != key {
                trace!(endpoint, ?frame, "skipping traffic during identification");
                continue;
            }
            let response = Response::from_frame(&frame);
            if let ResponseKind::Error(status) = response.kind() {
                return Err(LinkError::Rejected {
                    command: IDENTIFY_COMMAND,
                    status: *status,
                });
            }
            let identity = Identity::from_value(response.value_bytes()).ok_or_else(|| {
                LinkError::stream(endpoint, "unreadable identification reply")
            })?;
            debug!(endpoint, kind = %identity.kind, token = identity.token, "identified");
            return Ok(identity);
        }
    }
    Err(LinkError::timeout(
        endpoint,
        u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
    ))
}

/// Remembers which wheel slot each identification token was given, so a
/// wheel keeps its role across disconnects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenRegistry {
    slots: BTreeMap<u8, u8>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from a persisted token-to-slot map. Out-of-range slots are
    /// ignored.
    pub fn seeded(known: &BTreeMap<u8, u8>) -> Self {
        Self {
            slots: known
                .iter()
                .filter(|(_, slot)| **slot < MAX_WHEEL_SLOTS)
                .map(|(token, slot)| (*token, *slot))
                .collect(),
        }
    }

    pub fn lookup(&self, token: u8) -> Option<u8> {
        self.slots.get(&token).copied()
    }

    /// Slot for `token`, given the slots live wheels already hold.
    ///
    /// A remembered slot wins when it is free. Otherwise the lowest free
    /// slot not remembered for another token is taken, then any free slot.
    /// `None` when every slot is held.
    pub fn assign(&mut self, token: u8, occupied: &BTreeSet<u8>) -> Option<u8> {
        if let Some(slot) = self.lookup(token)
            && !occupied.contains(&slot)
        {
            return Some(slot);
        }
        let reserved: BTreeSet<u8> = self
            .slots
            .iter()
            .filter(|(t, _)| **t != token)
            .map(|(_, slot)| *slot)
            .collect();
        let free = move || (0..MAX_WHEEL_SLOTS).filter(move |s| !occupied.contains(s));
        let slot = free()
            .find(|s| !reserved.contains(s))
            .or_else(|| free().next())?;
        self.slots.insert(token, slot);
        Some(slot)
    }

    pub fn forget(&mut self, token: u8) -> Option<u8> {
        self.slots.remove(&token)
    }

    /// The current map, for persisting.
    pub fn known(&self) -> &BTreeMap<u8, u8> {
        &self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSerialLink;
    use racing_wheel_moza_serial_protocol::DeviceKind;

    #[test]
    fn identity_is_read() -> Result<(), LinkError> {
        let identity = Identity {
            kind: DeviceKind::Wheel,
            token: 0x42,
            model: Some(7),
        };
        let mut link = MockSerialLink::moza(identity);
        let got = query_identity(&mut link, "/dev/ttyACM1", Duration::from_millis(200))?;
        assert_eq!(got, identity);
        Ok(())
    }

    #[test]
    fn noise_before_reply_is_skipped() -> Result<(), LinkError> {
        let identity = Identity {
            kind: DeviceKind::Pedals,
            token: 1,
            model: None,
        };
        let mut link = MockSerialLink::moza(identity);
        link.inject(&[0x00, 0x13, 0x55]);
        assert_eq!(query_identity(&mut link, "p", Duration::from_millis(200))?, identity);
        Ok(())
    }

    #[test]
    fn silent_device_times_out() {
        let mut link = MockSerialLink::new();
        let result = query_identity(&mut link, "/dev/ttyUSB0", Duration::from_millis(30));
        assert!(matches!(result, Err(LinkError::Timeout { .. })));
    }

    #[test]
    fn broken_link_is_a_stream_error() {
        let mut link = MockSerialLink::new();
        link.break_link();
        let result = query_identity(&mut link, "/dev/ttyUSB0", Duration::from_millis(30));
        assert!(matches!(result, Err(LinkError::Stream { .. })));
    }

    #[test]
    fn remembered_slot_is_reused() {
        let mut registry = TokenRegistry::new();
        let none = BTreeSet::new();
        assert_eq!(registry.assign(0xA1, &none), Some(0));
        assert_eq!(registry.assign(0xB2, &BTreeSet::from([0])), Some(1));

        // Both unplugged, B2 comes back first: it keeps slot 1.
        assert_eq!(registry.assign(0xB2, &none), Some(1));
        assert_eq!(registry.assign(0xA1, &BTreeSet::from([1])), Some(0));
    }

    #[test]
    fn new_token_avoids_reserved_slots() {
        let mut registry = TokenRegistry::seeded(&BTreeMap::from([(0x10, 0), (0x20, 9)]));
        assert_eq!(registry.lookup(0x20), None, "slot 9 does not exist");
        assert_eq!(registry.assign(0x30, &BTreeSet::new()), Some(1));
        assert_eq!(registry.assign(0x40, &BTreeSet::from([0, 1])), None);
        assert_eq!(registry.forget(0x30), Some(1));
        assert_eq!(registry.known().len(), 1);
    }
}
