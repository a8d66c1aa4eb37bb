//! Error types for the event bus.

use thiserror::Error;

/// Errors returned by bus operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The bus was torn down with [`EventBus::close`](crate::EventBus::close).
    #[error("event bus is closed")]
    Closed,
}

/// Failure reported by a subscriber.
///
/// Subscriber failures are isolated: the bus logs and counts them and keeps
/// dispatching to the remaining subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Result returned by subscriber callbacks.
pub type HandlerResult = Result<(), HandlerError>;
