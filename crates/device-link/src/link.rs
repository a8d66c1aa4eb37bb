//! Serial endpoints and the byte streams behind them.

use std::fmt;
use std::io::{self, Read, Write};

use openracing_errors::LinkError;
use serde::{Deserialize, Serialize};
use serialport::{SerialPort, SerialPortType};
use tracing::debug;

use crate::config::LinkConfig;

/// A bidirectional byte stream to one device.
///
/// Reads block for at most the configured read timeout and then fail with
/// [`io::ErrorKind::TimedOut`]; that is "no bytes yet", not an error.
pub trait SerialLink: Read + Write + Send {
    /// A second handle on the same stream, so one thread can read while
    /// another writes.
    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>>;
}

/// Whether a read error only means no data arrived in time.
pub(crate) fn is_idle(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// A serial port as listed by the OS.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub path: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub product: Option<String>,
}

impl Endpoint {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            vendor_id: None,
            product_id: None,
            product: None,
        }
    }

    pub fn with_usb(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.vendor_id = Some(vendor_id);
        self.product_id = Some(product_id);
        self
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// Lists and opens serial endpoints.
pub trait EndpointProvider: Send + Sync {
    fn list(&self) -> Result<Vec<Endpoint>, LinkError>;

    fn open(&self, endpoint: &Endpoint, config: &LinkConfig)
    -> Result<Box<dyn SerialLink>, LinkError>;
}

struct PortLink {
    port: Box<dyn SerialPort>,
}

impl Read for PortLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for PortLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl SerialLink for PortLink {
    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>> {
        let port = self.port.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(PortLink { port }))
    }
}

/// OS serial ports through the `serialport` crate.
#[derive(Debug, Clone, Default)]
pub struct SerialPortProvider {
    vendor_filter: Option<u16>,
}

impl SerialPortProvider {
    pub fn new(vendor_filter: Option<u16>) -> Self {
        Self { vendor_filter }
    }
}

impl EndpointProvider for SerialPortProvider {
    fn list(&self) -> Result<Vec<Endpoint>, LinkError> {
        let ports =
            serialport::available_ports().map_err(|e| LinkError::stream("serial enumeration", e))?;
        let endpoints: Vec<Endpoint> = ports
            .into_iter()
            .filter_map(|port| {
                let mut endpoint = Endpoint::new(port.port_name);
                if let SerialPortType::UsbPort(usb) = port.port_type {
                    endpoint = endpoint.with_usb(usb.vid, usb.pid);
                    endpoint.product = usb.product;
                }
                match self.vendor_filter {
                    Some(vid) if endpoint.vendor_id != Some(vid) => None,
                    _ => Some(endpoint),
                }
            })
            .collect();
        debug!(count = endpoints.len(), "listed serial endpoints");
        Ok(endpoints)
    }

    fn open(
        &self,
        endpoint: &Endpoint,
        config: &LinkConfig,
    ) -> Result<Box<dyn SerialLink>, LinkError> {
        let port = serialport::new(&endpoint.path, config.baud_rate)
            .timeout(config.read_timeout())
            .open()
            .map_err(|e| LinkError::stream(&endpoint.path, e))?;
        Ok(Box::new(PortLink { port }))
    }
}
