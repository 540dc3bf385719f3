//! Serial transport seam.
//!
//! [`SerialConnector`] opens a byte stream to a port path.  The session only
//! sees `AsyncRead + AsyncWrite`, so tests hand it one end of a
//! [`tokio::io::duplex`] pipe and the simulator hands it a scripted device.

use async_trait::async_trait;
use magcue_types::RelayError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialPortBuilderExt;

/// Any full-duplex byte stream the session can own.
pub trait SerialIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> SerialIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// An opened serial stream.
pub type BoxedSerial = Box<dyn SerialIo>;

/// Opens serial streams by path.
#[async_trait]
pub trait SerialConnector: Send + Sync {
    /// Open `path` at `baud_rate`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Open`] when the OS refuses the port (missing,
    /// permission denied, already in use).
    async fn open(&self, path: &str, baud_rate: u32) -> Result<BoxedSerial, RelayError>;
}

/// Opens real ports with `tokio-serial`, 8N1 without flow control.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSerialConnector;

#[async_trait]
impl SerialConnector for TokioSerialConnector {
    async fn open(&self, path: &str, baud_rate: u32) -> Result<BoxedSerial, RelayError> {
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| RelayError::Open {
                port: path.to_string(),
                details: e.to_string(),
            })?;
        Ok(Box::new(port))
    }
}
