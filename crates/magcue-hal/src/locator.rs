//! Device Locator – picks the serial port the sensor board is attached to.
//!
//! Ports are matched on their USB manufacturer string against a fixed set of
//! case-sensitive signatures: the common USB-serial bridge chips and the
//! microcontroller vendor itself.  The lookup is a pure query; opening the
//! port is the [`DeviceSession`][crate::session::DeviceSession]'s job.

use magcue_types::RelayError;
use serialport::{SerialPortInfo, SerialPortType};
use tracing::debug;

/// Manufacturer substrings that identify a supported board.
pub const DEFAULT_SIGNATURES: &[&str] = &["Arduino", "CH340", "FTDI"];

/// Default signatures as owned strings, ready for a config struct.
pub fn default_signatures() -> Vec<String> {
    DEFAULT_SIGNATURES.iter().map(|s| s.to_string()).collect()
}

/// One serial port exposed by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    /// OS path, e.g. `/dev/ttyACM0` or `COM3`.
    pub path: String,
    /// USB manufacturer string, when the port is a USB device that reports one.
    pub manufacturer: Option<String>,
    /// USB product string, for diagnostics only.
    pub product: Option<String>,
}

impl PortDescriptor {
    /// A descriptor for an explicitly configured path with no vendor data.
    pub fn from_path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            manufacturer: None,
            product: None,
        }
    }

    /// `true` when the manufacturer string contains any of `signatures`.
    ///
    /// Ports without a manufacturer string never match.
    pub fn matches(&self, signatures: &[String]) -> bool {
        self.manufacturer
            .as_deref()
            .is_some_and(|vendor| signatures.iter().any(|sig| vendor.contains(sig.as_str())))
    }
}

impl From<SerialPortInfo> for PortDescriptor {
    fn from(info: SerialPortInfo) -> Self {
        let (manufacturer, product) = match info.port_type {
            SerialPortType::UsbPort(usb) => (usb.manufacturer, usb.product),
            _ => (None, None),
        };
        Self {
            path: info.port_name,
            manufacturer,
            product,
        }
    }
}

/// Source of the host's serial port list.
///
/// The production implementation is [`SystemPorts`]; tests and the
/// simulator substitute their own.
pub trait PortEnumerator: Send + Sync {
    /// List every serial port currently visible.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Enumeration`] when the OS query fails.
    fn list_ports(&self) -> Result<Vec<PortDescriptor>, RelayError>;
}

/// Enumerates real ports through the `serialport` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

impl PortEnumerator for SystemPorts {
    fn list_ports(&self) -> Result<Vec<PortDescriptor>, RelayError> {
        let ports = serialport::available_ports()
            .map_err(|e| RelayError::Enumeration(e.to_string()))?;
        Ok(ports.into_iter().map(PortDescriptor::from).collect())
    }
}

/// Return the first port in `ports` that matches one of `signatures`.
pub fn select_port<'a>(ports: &'a [PortDescriptor], signatures: &[String]) -> Option<&'a PortDescriptor> {
    ports.iter().find(|port| port.matches(signatures))
}

/// Enumerate ports and select the sensor board.
///
/// Returns `Ok(None)` when no port matches.  Enumeration failures are
/// surfaced rather than swallowed so the caller decides whether to retry.
pub fn locate(
    ports: &dyn PortEnumerator,
    signatures: &[String],
) -> Result<Option<PortDescriptor>, RelayError> {
    let available = ports.list_ports()?;
    debug!(
        count = available.len(),
        ports = ?available.iter().map(|p| (&p.path, &p.manufacturer)).collect::<Vec<_>>(),
        "enumerated serial ports"
    );
    Ok(select_port(&available, signatures).cloned())
}
