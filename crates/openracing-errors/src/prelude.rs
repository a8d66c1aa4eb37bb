//! Prelude module for convenient error handling imports.
//!
//! # Example
//!
//! ```
//! use openracing_errors::prelude::*;
//!
//! fn route(connected: bool) -> LinkResult<()> {
//!     if !connected {
//!         return Err(LinkError::device_unavailable("wheelbase"));
//!     }
//!     Ok(())
//! }
//!
//! assert!(route(false).is_err());
//! ```

pub use crate::{
    LinkResult, Result,
    common::{ErrorCategory, ErrorSeverity, OpenRacingError},
    device::DeviceError,
    link::{EncodingError, FramingError, LinkError},
};
