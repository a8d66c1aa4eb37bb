//! Centralized error types for the device communication layer.
//!
//! The error system is organized into several modules:
//!
//! - [`common`]: Top-level error type and classification
//! - [`link`]: Codec, framing and serial-link errors raised by the protocol
//!   codec, the transport handler and the connection manager
//! - [`device`]: HID peripheral and virtual input device errors
//!
//! # Propagation
//!
//! Framing errors are handled where they occur (the decoder resynchronizes)
//! and are only counted upward. Every other error reaches the caller.
//!
//! # Example
//!
//! ```
//! use openracing_errors::prelude::*;
//!
//! fn check_torque(percent: u8) -> Result<u8> {
//!     if !(50..=100).contains(&percent) {
//!         return Err(EncodingError::out_of_range("torque-limit", percent, 50, 100).into());
//!     }
//!     Ok(percent)
//! }
//!
//! assert!(check_torque(95).is_ok());
//! assert!(check_torque(20).is_err());
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod common;
pub mod device;
pub mod link;
pub mod prelude;

pub use common::{ErrorCategory, ErrorSeverity, OpenRacingError};
pub use device::DeviceError;
pub use link::{EncodingError, FramingError, LinkError};

/// A specialized `Result` type for OpenRacing operations.
pub type Result<T> = std::result::Result<T, OpenRacingError>;

/// A specialized `Result` type for serial link operations.
pub type LinkResult<T> = std::result::Result<T, LinkError>;
