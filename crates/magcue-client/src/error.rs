use std::time::Duration;

use thiserror::Error;

/// Failures the facade reports to its caller.
///
/// Only the relay channel can fail here.  Device problems reach consumers
/// as a `false` status, never as an error.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to connect to relay at {url}: {details}")]
    Connect { url: String, details: String },

    #[error("Timed out after {0:?} connecting to relay")]
    Timeout(Duration),
}
