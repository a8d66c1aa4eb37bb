//! Device link daemon (`wheeld`).
//!
//! Loads a [`ServiceConfig`], builds a connection manager over the OS serial
//! ports and HID stack, and keeps devices connected until shut down.

pub mod config;
pub mod daemon;

pub use config::{DEFAULT_LOG_FILTER, ServiceConfig};
pub use daemon::LinkDaemon;
