//! Hardware stand-ins for running the relay without a sensor board.
//!
//! * [`SimulatedPorts`] + [`SimulatedConnector`] – a scripted device behind a
//!   duplex pipe.  It prints a boot banner, streams verbose distance lines on
//!   a fixed tick, and records every level it is sent.  Backs `magcue serve
//!   --simulate`.
//! * [`RecordingLink`] – a [`DeviceLink`] that never touches I/O and just
//!   records the commands it receives.  Used by the hub, server and client
//!   tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use magcue_types::{ActuatorCommand, RelayError};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tracing::{debug, info, warn};

use crate::link::DeviceLink;
use crate::locator::{PortDescriptor, PortEnumerator};
use crate::session::{SessionSnapshot, SessionState};
use crate::transport::{BoxedSerial, SerialConnector};

/// Path reported by [`SimulatedPorts`].
pub const SIMULATED_PORT_PATH: &str = "sim://magcue";

/// Raw ADC count the simulated sensor reports at 0 %.
const SIM_RAW_NEAR: u32 = 358;
/// Raw ADC count the simulated sensor reports at 100 %.
const SIM_RAW_FAR: u32 = 1023;

// ────────────────────────────────────────────────────────────────────────────
// Scripted device
// ────────────────────────────────────────────────────────────────────────────

/// Enumerator that always reports exactly one Arduino-looking port.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedPorts;

impl PortEnumerator for SimulatedPorts {
    fn list_ports(&self) -> Result<Vec<PortDescriptor>, RelayError> {
        Ok(vec![PortDescriptor {
            path: SIMULATED_PORT_PATH.to_string(),
            manufacturer: Some("Arduino (simulated)".to_string()),
            product: Some("MagCue simulator".to_string()),
        }])
    }
}

/// Connector that spawns a scripted sensor board for every `open`.
pub struct SimulatedConnector {
    tick: Duration,
    received: Arc<Mutex<Vec<u8>>>,
}

impl SimulatedConnector {
    /// A simulator emitting one distance line every `tick`.
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every level the simulated board has received, oldest first.
    pub fn received_levels(&self) -> Vec<u8> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl SerialConnector for SimulatedConnector {
    async fn open(&self, path: &str, baud_rate: u32) -> Result<BoxedSerial, RelayError> {
        let (host, device) = tokio::io::duplex(4096);
        tokio::spawn(run_board(device, self.tick, Arc::clone(&self.received)));
        info!(path, baud_rate, "simulated sensor board attached");
        Ok(Box::new(host))
    }
}

/// Triangle wave over 0..=100 in steps of 5.
fn sweep_percent(step: u64) -> f64 {
    let phase = step % 40;
    let rising = if phase <= 20 { phase } else { 40 - phase };
    (rising * 5) as f64
}

fn raw_for(percent: f64) -> u32 {
    let span = f64::from(SIM_RAW_FAR - SIM_RAW_NEAR);
    SIM_RAW_NEAR + (span * percent / 100.0).round() as u32
}

async fn run_board(device: DuplexStream, tick: Duration, received: Arc<Mutex<Vec<u8>>>) {
    let (read_half, mut write_half) = tokio::io::split(device);
    let mut commands = BufReader::new(read_half).lines();
    let mut ticker = tokio::time::interval(tick);
    let mut step: u64 = 0;

    if write_half
        .write_all(b"MagCue simulator booting...\r\n")
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let percent = sweep_percent(step);
                step += 1;
                let line = format!("Raw: {}  Distance: {:.2} %\r\n", raw_for(percent), percent);
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    debug!("simulated board: host closed the pipe");
                    return;
                }
            }
            line = commands.next_line() => match line {
                Ok(Some(line)) => match line.trim().parse::<u8>() {
                    Ok(level) => {
                        debug!(level, "simulated board: magnet level set");
                        received.lock().push(level);
                    }
                    Err(_) => warn!(line = %line, "simulated board: ignoring malformed command"),
                },
                Ok(None) | Err(_) => {
                    debug!("simulated board: command stream closed");
                    return;
                }
            },
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Recording link
// ────────────────────────────────────────────────────────────────────────────

/// A [`DeviceLink`] that records commands instead of writing them.
pub struct RecordingLink {
    device_present: bool,
    open: AtomicBool,
    connects: AtomicUsize,
    shutdowns: AtomicUsize,
    commands: Mutex<Vec<ActuatorCommand>>,
}

impl RecordingLink {
    /// A link whose `connect` always succeeds.
    pub fn new() -> Self {
        Self::with_device(true)
    }

    /// A link whose `connect` always fails with [`RelayError::DeviceNotFound`].
    pub fn without_device() -> Self {
        Self::with_device(false)
    }

    fn with_device(device_present: bool) -> Self {
        Self {
            device_present,
            open: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Commands received so far, oldest first.
    pub fn commands(&self) -> Vec<ActuatorCommand> {
        self.commands.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl Default for RecordingLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceLink for RecordingLink {
    async fn connect(&self) -> Result<(), RelayError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.device_present {
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(RelayError::DeviceNotFound)
        }
    }

    fn send_command(&self, command: ActuatorCommand) {
        self.commands.lock().push(command);
    }

    async fn shutdown(&self, _wait: Duration) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.open.swap(false, Ordering::SeqCst) {
            self.commands.lock().push(ActuatorCommand::OFF);
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        let open = self.open.load(Ordering::SeqCst);
        SessionSnapshot {
            state: if open { SessionState::Open } else { SessionState::Idle },
            port: open.then(|| "recording".to_string()),
            last_commanded_level: self.commands.lock().last().map_or(0, |c| c.level()),
            last_line_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{DeviceSession, SessionConfig, SessionEvent};
    use tokio::time::timeout;

    #[test]
    fn sweep_covers_full_range() {
        assert_eq!(sweep_percent(0), 0.0);
        assert_eq!(sweep_percent(20), 100.0);
        assert_eq!(sweep_percent(30), 50.0);
        assert_eq!(sweep_percent(40), 0.0);
        assert_eq!(raw_for(0.0), SIM_RAW_NEAR);
        assert_eq!(raw_for(100.0), SIM_RAW_FAR);
    }

    #[tokio::test]
    async fn simulated_session_streams_readings() {
        let (session, mut events) = DeviceSession::with_backends(
            SessionConfig::default(),
            Arc::new(SimulatedPorts),
            Arc::new(SimulatedConnector::new(Duration::from_millis(10))),
        );
        session.connect().await.unwrap();
        assert_eq!(session.snapshot().port.as_deref(), Some(SIMULATED_PORT_PATH));

        let mut readings = 0;
        while readings < 3 {
            let event = timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("simulator went quiet")
                .expect("event channel closed");
            if let SessionEvent::Reading(reading) = event {
                assert!((0.0..=100.0).contains(&reading.percent()));
                readings += 1;
            }
        }
    }

    #[tokio::test]
    async fn simulated_board_records_levels_and_final_zero() {
        let connector = Arc::new(SimulatedConnector::new(Duration::from_millis(50)));
        let (session, _events) = DeviceSession::with_backends(
            SessionConfig::default(),
            Arc::new(SimulatedPorts),
            connector.clone(),
        );
        session.connect().await.unwrap();
        session.send_command(ActuatorCommand::new(4).unwrap());
        session.shutdown(Duration::from_secs(1)).await;

        timeout(Duration::from_secs(2), async {
            while connector.received_levels() != vec![4, 0] {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("simulated board should see level 4 then 0");
    }

    #[tokio::test]
    async fn recording_link_tracks_calls() {
        let link = RecordingLink::new();
        link.connect().await.unwrap();
        assert!(link.snapshot().is_open());

        link.send_command(ActuatorCommand::new(2).unwrap());
        assert_eq!(link.snapshot().last_commanded_level, 2);

        link.shutdown(Duration::ZERO).await;
        assert_eq!(link.commands(), vec![ActuatorCommand::new(2).unwrap(), ActuatorCommand::OFF]);
        assert_eq!(link.connect_count(), 1);
        assert_eq!(link.shutdown_count(), 1);
        assert!(!link.snapshot().is_open());
    }

    #[tokio::test]
    async fn recording_link_without_device_fails_to_connect() {
        let link = RecordingLink::without_device();
        assert!(matches!(link.connect().await, Err(RelayError::DeviceNotFound)));
        assert!(!link.snapshot().is_open());
    }
}
