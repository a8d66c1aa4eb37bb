//! Topic-keyed publish/subscribe bus.
//!
//! The bus decouples producers (transport handlers, HID shims, the connection
//! manager) from consumers (settings UI, preset engine, telemetry, plugins).
//! It is constructed explicitly and passed to every collaborator; there is no
//! global instance.
//!
//! - [`EventBus`]: registration-ordered, snapshot-on-publish dispatch with
//!   per-subscriber failure isolation
//! - [`BlockingValue`]: timed blocking slot for request/response correlation
//! - [`Observable`]: value holder that dispatches only on change
//!
//! ```
//! use openracing_event_bus::EventBus;
//!
//! let bus: EventBus<&'static str, u32> = EventBus::new();
//! let handle = bus.subscribe("torque-limit", |v| {
//!     assert_eq!(*v, 95);
//!     Ok(())
//! })?;
//! assert_eq!(bus.publish(&"torque-limit", &95).delivered, 1);
//! assert!(bus.unsubscribe(&handle));
//! assert!(!bus.unsubscribe(&handle));
//! # Ok::<(), openracing_event_bus::BusError>(())
//! ```

pub mod blocking;
pub mod bus;
pub mod error;
pub mod observable;

pub use blocking::BlockingValue;
pub use bus::{EventBus, PublishReport, Subscription, SubscriptionHandle, SubscriptionId, Topic};
pub use error::{BusError, HandlerError, HandlerResult};
pub use observable::Observable;
