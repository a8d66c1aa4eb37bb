//! Device link layer for Moza serial devices and HID peripherals.
//!
//! A [`ConnectionManager`] enumerates serial ports (and optionally HID
//! devices), identifies what answers on each, and keeps one
//! [`TransportHandler`] or [`HidShim`](racing_wheel_hid_compat::HidShim)
//! running per endpoint. Replies, decoded inputs, state changes and faults
//! are all published on a shared [`LinkBus`].
//!
//! Everything below the manager is trait-driven: [`EndpointProvider`] and
//! [`SerialLink`] for serial ports, `HidPort` for HID. The [`mock`] module
//! implements the serial side in memory.

pub mod config;
pub mod identify;
pub mod link;
pub mod manager;
pub mod mock;
pub mod topics;
pub mod transport;

pub use config::{BackoffPolicy, LinkConfig};
pub use identify::{TokenRegistry, query_identity};
pub use link::{Endpoint, EndpointProvider, SerialLink, SerialPortProvider};
pub use manager::{
    ConnectionManager, EndpointKind, HandleInfo, HidSource, ManagerTask, TICK_INTERVAL,
    TickReport, is_hid_candidate,
};
pub use topics::{BusEvent, ConnectionState, LinkBus, Topic};
pub use transport::{PendingResponse, TransportHandler, TransportHealth, TransportStats};
