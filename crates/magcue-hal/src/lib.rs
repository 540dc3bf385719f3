//! `magcue-hal` – the sensor board side of the relay.
//!
//! Everything that knows about serial ports lives here.  The layers above
//! only see [`DeviceLink`] and [`SessionEvent`].
//!
//! # Modules
//!
//! - [`locator`] – enumerate serial ports and pick the first one whose
//!   manufacturer matches a known vendor signature.
//! - [`protocol`] – classify device text lines (verbose, compact, info,
//!   unrecognized).
//! - [`framing`] – CRLF line framing with an upper bound on line length.
//! - [`transport`] – the [`SerialConnector`] seam and its `tokio-serial`
//!   implementation.
//! - [`session`] – [`DeviceSession`], the state machine that owns the port.
//! - [`link`] – the [`DeviceLink`] trait the relay hub drives.
//! - [`sim`] – a scripted sensor board and a recording link for running
//!   without hardware.

pub mod framing;
pub mod link;
pub mod locator;
pub mod protocol;
pub mod session;
pub mod sim;
pub mod transport;

pub use link::DeviceLink;
pub use locator::{PortDescriptor, PortEnumerator, SystemPorts, locate};
pub use protocol::{ParsedLine, parse};
pub use session::{
    DEFAULT_BAUD_RATE, DeviceSession, SessionConfig, SessionEvent, SessionSnapshot, SessionState,
};
pub use sim::{RecordingLink, SimulatedConnector, SimulatedPorts};
pub use transport::{BoxedSerial, SerialConnector, TokioSerialConnector};
