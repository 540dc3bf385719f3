//! The `DeviceLink` seam between the hardware layer and the relay.
//!
//! The broadcast hub never talks to a serial port directly.  It owns one
//! `DeviceLink` – in production a [`DeviceSession`][crate::session::DeviceSession],
//! in tests a [`RecordingLink`][crate::sim::RecordingLink] – and routes
//! client commands through it.

use std::time::Duration;

use async_trait::async_trait;
use magcue_types::{ActuatorCommand, RelayError};

use crate::session::SessionSnapshot;

/// Owner of the physical device connection.
///
/// # Contract
///
/// * `connect` – locate and open the device.  Status changes are reported on
///   the session's event channel, not through the return value alone.
/// * `send_command` – fire-and-forget.  When the link is not open the command
///   is dropped with a warning; callers cannot tell "ignored" from "sent".
/// * `shutdown` – write a final zero command, waiting at most `wait`, then
///   release the port.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Locate and open the device.
    async fn connect(&self) -> Result<(), RelayError>;

    /// Queue `command` for the device.  Never blocks, never fails.
    fn send_command(&self, command: ActuatorCommand);

    /// De-energise the actuator and close the port.
    async fn shutdown(&self, wait: Duration);

    /// Point-in-time view of the link for diagnostics.
    fn snapshot(&self) -> SessionSnapshot;
}
