//! Moza serial control protocol: frame codec, command catalog and
//! bit-field helpers.
//!
//! This crate is I/O-free. Encoding validates every parameter before any byte
//! reaches a transport; decoding is a pure function over a receive buffer that
//! reports how many bytes to consume or discard, so it can be driven from a
//! streaming reader and fuzzed without hardware.
//!
//! ```
//! use racing_wheel_moza_serial_protocol::{Command, DecodeOutcome, FrameCodec};
//!
//! let codec = FrameCodec::moza();
//! let frame = codec.encode(&Command::set_torque_limit(95))?;
//! let bytes = frame.to_bytes();
//! assert_eq!(
//!     codec.decode(&bytes),
//!     DecodeOutcome::Frame { frame, consumed: bytes.len() }
//! );
//! # Ok::<(), openracing_errors::EncodingError>(())
//! ```

#![deny(static_mut_refs)]

pub mod bitwise;
pub mod catalog;
pub mod checksum;
pub mod command;
pub mod frame;
pub mod response;
pub mod role;

pub use catalog::{SETTINGS, Setting};
pub use checksum::{AdditiveChecksum, Checksum, MOZA_CHECKSUM_SEED, XorChecksum, checksum};
pub use command::{Command, ParamKind, ParamSpec, ParamValue};
pub use frame::{
    DecodeOutcome, Frame, FrameCodec, HEADER_LEN, MAX_FRAME_LEN, MAX_PAYLOAD_LEN, START_MARKER,
    StreamDecoder,
};
pub use response::{CorrelationKey, Response, ResponseKind, STATUS_OK, is_reply};
pub use role::{
    DeviceKind, DeviceRole, IDENTIFY_ADDRESS, IDENTIFY_COMMAND, Identity, MAX_WHEEL_SLOTS,
};

/// Serial line rate of Moza devices.
pub const BAUD_RATE: u32 = 115_200;
