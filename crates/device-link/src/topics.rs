//! Bus topics and payloads shared by the transport handlers, the HID shims
//! and the connection manager.

use std::fmt;

use openracing_errors::LinkError;
use openracing_event_bus::EventBus;
use racing_wheel_hid_compat::DeviceEvent;
use racing_wheel_moza_serial_protocol::{DeviceRole, Response};
use serde::{Deserialize, Serialize};

/// Lifecycle of a device handle.
///
/// `Disconnected -> Identifying -> Connected`, with `Erroring` reachable
/// from `Identifying` and `Connected`. A handle that keeps failing ends in
/// `Disconnected` and is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Identifying,
    Connected,
    Erroring,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Identifying => "identifying",
            Self::Connected => "connected",
            Self::Erroring => "erroring",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Replies to `command` (the request's command id) from `role`.
    Device { role: DeviceRole, command: u8 },
    /// Decoded HID input from `role`.
    Input(DeviceRole),
    /// Every handle state transition.
    ConnectionState,
    /// A handle was bound to a role.
    DeviceIdentified,
    /// Link faults: framing-rate breaches, stream loss, conflicts.
    LinkFault,
}

impl Topic {
    pub const CONNECTION_STATE: &'static str = "connection.state";
    pub const DEVICE_IDENTIFIED: &'static str = "device.identified";
    pub const LINK_FAULT: &'static str = "link.fault";

    pub fn device(role: DeviceRole, command: u8) -> Self {
        Self::Device { role, command }
    }

    /// Resolves the reserved topic names.
    pub fn reserved(name: &str) -> Option<Self> {
        match name {
            Self::CONNECTION_STATE => Some(Self::ConnectionState),
            Self::DEVICE_IDENTIFIED => Some(Self::DeviceIdentified),
            Self::LINK_FAULT => Some(Self::LinkFault),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device { role, command } => write!(f, "{role}/{command:#04x}"),
            Self::Input(role) => write!(f, "{role}/input"),
            Self::ConnectionState => f.write_str(Self::CONNECTION_STATE),
            Self::DeviceIdentified => f.write_str(Self::DEVICE_IDENTIFIED),
            Self::LinkFault => f.write_str(Self::LINK_FAULT),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    Response {
        role: DeviceRole,
        response: Response,
    },
    Input {
        role: DeviceRole,
        event: DeviceEvent,
    },
    StateChanged {
        endpoint: String,
        /// `None` until identification resolved a role.
        role: Option<DeviceRole>,
        state: ConnectionState,
    },
    Identified {
        endpoint: String,
        role: DeviceRole,
        token: Option<u8>,
    },
    Fault {
        endpoint: String,
        error: LinkError,
    },
}

/// The process-wide bus every component of the link layer publishes to.
pub type LinkBus = EventBus<Topic, BusEvent>;
