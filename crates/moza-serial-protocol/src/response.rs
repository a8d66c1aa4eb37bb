//! Device replies and request/reply correlation.
//!
//! A device answers a request from the nibble-swapped request address, with
//! bit 7 of the command id toggled. The reply payload starts with a status
//! byte: zero for success, anything else is a device error code. A successful
//! reply with no value bytes is a plain acknowledgement.

use openracing_errors::EncodingError;

use crate::bitwise::{swap_nibbles, test_bit, toggle_bit};
use crate::checksum::Checksum;
use crate::command::{ParamSpec, ParamValue};
use crate::frame::{Frame, FrameCodec};
use crate::role::DeviceRole;

/// Status byte of a successful reply.
pub const STATUS_OK: u8 = 0x00;

const REPLY_BIT: u8 = 7;

/// Key shared by a request frame and the reply answering it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationKey {
    pub address: u8,
    pub command_id: u8,
}

impl CorrelationKey {
    pub fn of_request(frame: &Frame) -> Self {
        Self {
            address: frame.address(),
            command_id: frame.command_id(),
        }
    }

    /// The request key a reply frame answers.
    pub fn of_reply(frame: &Frame) -> Self {
        Self {
            address: swap_nibbles(frame.address()),
            command_id: toggle_bit(frame.command_id(), REPLY_BIT),
        }
    }
}

/// Whether `frame` travels device-to-host.
pub fn is_reply(frame: &Frame) -> bool {
    test_bit(frame.command_id(), REPLY_BIT)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    Ack,
    Value(Vec<u8>),
    Error(u8),
}

/// A decoded reply, keyed by the command id of the request it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    key: CorrelationKey,
    kind: ResponseKind,
}

impl Response {
    pub fn from_frame(frame: &Frame) -> Self {
        let kind = match frame.payload().split_first() {
            None => ResponseKind::Ack,
            Some((&STATUS_OK, [])) => ResponseKind::Ack,
            Some((&STATUS_OK, value)) => ResponseKind::Value(value.to_vec()),
            Some((&code, _)) => ResponseKind::Error(code),
        };
        Self {
            key: CorrelationKey::of_reply(frame),
            kind,
        }
    }

    pub fn key(&self) -> CorrelationKey {
        self.key
    }

    /// Command id of the request this answers.
    pub fn command_id(&self) -> u8 {
        self.key.command_id
    }

    /// Role the reply came from, when the address belongs to one.
    pub fn role(&self) -> Option<DeviceRole> {
        DeviceRole::from_address(self.key.address)
    }

    pub fn kind(&self) -> &ResponseKind {
        &self.kind
    }

    pub fn is_ok(&self) -> bool {
        !matches!(self.kind, ResponseKind::Error(_))
    }

    /// Value bytes, empty for acknowledgements and errors.
    pub fn value_bytes(&self) -> &[u8] {
        match &self.kind {
            ResponseKind::Value(v) => v,
            ResponseKind::Ack | ResponseKind::Error(_) => &[],
        }
    }

    /// Typed value, if the reply carries one of the right width.
    pub fn value(&self, spec: &ParamSpec) -> Option<ParamValue> {
        ParamValue::read_be(spec.kind, self.value_bytes())
    }
}

impl<C: Checksum> FrameCodec<C> {
    /// Build the reply a device sends for `request`.
    pub fn reply(&self, request: &Frame, status: u8, value: &[u8]) -> Result<Frame, EncodingError> {
        let mut payload = Vec::with_capacity(value.len() + 1);
        payload.push(status);
        payload.extend_from_slice(value);
        self.frame(
            swap_nibbles(request.address()),
            toggle_bit(request.command_id(), REPLY_BIT),
            payload,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Command;
    use crate::catalog::MAX_ANGLE;

    #[test]
    fn test_reply_correlates_with_request() -> Result<(), Box<dyn std::error::Error>> {
        let codec = FrameCodec::moza();
        let request = codec.encode(&Command::set_torque_limit(95))?;
        let reply = codec.reply(&request, STATUS_OK, &[])?;

        assert_eq!(reply.address(), 0x31);
        assert_eq!(reply.command_id(), 0x91);
        assert!(is_reply(&reply));
        assert!(!is_reply(&request));
        assert_eq!(CorrelationKey::of_reply(&reply), CorrelationKey::of_request(&request));

        let response = Response::from_frame(&reply);
        assert_eq!(response.kind(), &ResponseKind::Ack);
        assert_eq!(response.role(), Some(DeviceRole::Wheelbase));
        assert_eq!(response.command_id(), 0x11);
        Ok(())
    }

    #[test]
    fn test_value_reply() -> Result<(), Box<dyn std::error::Error>> {
        let codec = FrameCodec::moza();
        let request = codec.encode(&Command::read_setting(DeviceRole::Wheelbase, "max-angle")?)?;
        let reply = codec.reply(&request, STATUS_OK, &900u16.to_be_bytes())?;
        let response = Response::from_frame(&reply);
        assert_eq!(response.value(&MAX_ANGLE.param), Some(ParamValue::U16(900)));
        Ok(())
    }

    #[test]
    fn test_error_status() -> Result<(), Box<dyn std::error::Error>> {
        let codec = FrameCodec::moza();
        let request = codec.encode(&Command::set_max_angle(900))?;
        let response = Response::from_frame(&codec.reply(&request, 0x03, &[])?);
        assert_eq!(response.kind(), &ResponseKind::Error(0x03));
        assert!(!response.is_ok());
        assert_eq!(response.value(&MAX_ANGLE.param), None);
        Ok(())
    }
}
