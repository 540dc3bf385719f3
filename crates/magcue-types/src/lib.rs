use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lowest valid distance percentage.
pub const MIN_PERCENT: f64 = 0.0;
/// Highest valid distance percentage.
pub const MAX_PERCENT: f64 = 100.0;

/// One normalized distance sample derived from device telemetry.
///
/// Constructed only through [`DistanceReading::new`], so every instance
/// satisfies `0 <= percent <= 100`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DistanceReading {
    percent: f64,
    observed_at: DateTime<Utc>,
}

impl DistanceReading {
    /// Validate `percent` and wrap it into a reading.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::RangeRejected`] for values outside `[0, 100]`
    /// (including `NaN`).
    pub fn new(percent: f64, observed_at: DateTime<Utc>) -> Result<Self, RelayError> {
        if !(MIN_PERCENT..=MAX_PERCENT).contains(&percent) {
            return Err(RelayError::RangeRejected {
                quantity: "distance percent",
                value: percent,
                min: MIN_PERCENT,
                max: MAX_PERCENT,
            });
        }
        Ok(Self {
            percent,
            observed_at,
        })
    }

    pub fn percent(&self) -> f64 {
        self.percent
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }
}

/// A discrete electromagnet level, `0` (off) to [`ActuatorCommand::MAX_LEVEL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ActuatorCommand {
    level: u8,
}

impl ActuatorCommand {
    /// Highest accepted actuator level.
    pub const MAX_LEVEL: u8 = 5;

    /// De-energise the actuator.
    pub const OFF: ActuatorCommand = ActuatorCommand { level: 0 };

    /// Validate `level` and build a command.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::RangeRejected`] when `level` is outside `[0, 5]`.
    pub fn new(level: i64) -> Result<Self, RelayError> {
        match u8::try_from(level) {
            Ok(level) if level <= Self::MAX_LEVEL => Ok(Self { level }),
            _ => Err(RelayError::RangeRejected {
                quantity: "actuator level",
                value: level as f64,
                min: 0.0,
                max: f64::from(Self::MAX_LEVEL),
            }),
        }
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    /// The exact bytes written to the device: the decimal level and `\n`.
    pub fn wire_line(&self) -> String {
        format!("{}\n", self.level)
    }
}

impl fmt::Display for ActuatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "level {}", self.level)
    }
}

// ---------------------------------------------------------------------------
// Relay <-> client wire messages
// ---------------------------------------------------------------------------

/// Events pushed from the relay to every subscribed client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum RelayEvent {
    /// The device connection came up or went down.
    ConnectionStatus { connected: bool },
    /// A validated distance sample.
    DistanceReading { percent: f64 },
}

impl From<DistanceReading> for RelayEvent {
    fn from(reading: DistanceReading) -> Self {
        RelayEvent::DistanceReading {
            percent: reading.percent(),
        }
    }
}

/// Requests a client may send to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum ClientRequest {
    /// Fire-and-forget actuator command. Validated by the relay.
    SetActuatorLevel { level: i64 },
    /// Ask the relay to re-send the cached connection status.
    SyncStatus,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub connected: bool,
    pub timestamp: DateTime<Utc>,
}

/// Body of `POST /actuator`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorRequest {
    pub level: i64,
}

/// Successful response to `POST /actuator`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorResponse {
    pub level: u8,
}

/// Error body used by every non-2xx HTTP response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Error type spanning port discovery, serial I/O, validation, and transport.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Serial port enumeration failed: {0}")]
    Enumeration(String),

    #[error("No serial port matched a known device signature")]
    DeviceNotFound,

    #[error("Failed to open {port}: {details}")]
    Open { port: String, details: String },

    #[error("Unrecognized device line: {0:?}")]
    ParseRejected(String),

    #[error("{quantity} {value} is outside [{min}, {max}]")]
    RangeRejected {
        quantity: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Serial I/O fault: {0}")]
    Io(String),

    #[error("Channel closed: {0}")]
    Channel(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_reading_accepts_bounds() {
        let now = Utc::now();
        assert_eq!(DistanceReading::new(0.0, now).unwrap().percent(), 0.0);
        assert_eq!(DistanceReading::new(100.0, now).unwrap().percent(), 100.0);
    }

    #[test]
    fn distance_reading_rejects_out_of_range_and_nan() {
        let now = Utc::now();
        assert!(matches!(
            DistanceReading::new(-0.01, now),
            Err(RelayError::RangeRejected { .. })
        ));
        assert!(DistanceReading::new(100.5, now).is_err());
        assert!(DistanceReading::new(f64::NAN, now).is_err());
    }

    #[test]
    fn actuator_command_validates_level() {
        for level in 0..=5 {
            assert_eq!(ActuatorCommand::new(level).unwrap().level() as i64, level);
        }
        assert!(ActuatorCommand::new(-1).is_err());
        assert!(ActuatorCommand::new(6).is_err());
        assert!(ActuatorCommand::new(7).is_err());
        assert!(ActuatorCommand::new(i64::MAX).is_err());
    }

    #[test]
    fn actuator_command_wire_line() {
        assert_eq!(ActuatorCommand::new(3).unwrap().wire_line(), "3\n");
        assert_eq!(ActuatorCommand::OFF.wire_line(), "0\n");
    }

    #[test]
    fn relay_event_wire_shape() {
        let json = serde_json::to_string(&RelayEvent::ConnectionStatus { connected: true }).unwrap();
        assert_eq!(json, r#"{"event":"connectionStatus","connected":true}"#);

        let json = serde_json::to_string(&RelayEvent::DistanceReading { percent: 42.5 }).unwrap();
        assert_eq!(json, r#"{"event":"distanceReading","percent":42.5}"#);
    }

    #[test]
    fn client_request_parses_commands() {
        let req: ClientRequest =
            serde_json::from_str(r#"{"command":"setActuatorLevel","level":4}"#).unwrap();
        assert_eq!(req, ClientRequest::SetActuatorLevel { level: 4 });

        let req: ClientRequest = serde_json::from_str(r#"{"command":"syncStatus"}"#).unwrap();
        assert_eq!(req, ClientRequest::SyncStatus);
    }

    #[test]
    fn relay_error_display() {
        let err = RelayError::Open {
            port: "/dev/ttyUSB0".to_string(),
            details: "permission denied".to_string(),
        };
        assert!(err.to_string().contains("/dev/ttyUSB0"));

        let err = ActuatorCommand::new(9).unwrap_err();
        assert!(err.to_string().contains("actuator level"));
    }
}
