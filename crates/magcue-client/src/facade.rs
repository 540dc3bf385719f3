//! [`RelayClient`] – the handle UI code uses to talk to the relay.
//!
//! One client owns one WebSocket channel.  Clones share it, so every view in
//! a process can hold its own `RelayClient` while the relay sees a single
//! subscriber.  [`RelayClient::disconnect`] does nothing; the channel
//! lives as long as the process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use magcue_types::{ActuatorCommand, ClientRequest, RelayEvent};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::listeners::{Listeners, Unsubscribe};

/// Where the relay listens by default.
pub const DEFAULT_RELAY_URL: &str = "ws://localhost:3001";

/// Upper bound on one connection attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Channel {
    generation: u64,
    requests: Option<mpsc::UnboundedSender<ClientRequest>>,
}

struct Inner {
    url: String,
    channel: Mutex<Channel>,
    connected: AtomicBool,
    connecting: tokio::sync::Mutex<()>,
    status: Listeners<bool>,
    distance: Listeners<f64>,
}

impl Inner {
    fn send(&self, request: ClientRequest) -> bool {
        let channel = self.channel.lock();
        match &channel.requests {
            Some(requests) => requests.send(request).is_ok(),
            None => false,
        }
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<RelayEvent>(text) {
            Ok(RelayEvent::ConnectionStatus { connected }) => {
                debug!(connected, "device status from relay");
                self.status.notify(connected);
            }
            Ok(RelayEvent::DistanceReading { percent }) => self.distance.notify(percent),
            Err(e) => debug!(error = %e, "ignoring unrecognised relay frame"),
        }
    }

    /// Forget the channel of `generation` if it is still current.
    fn channel_lost(&self, generation: u64) {
        {
            let mut channel = self.channel.lock();
            if channel.generation != generation {
                return;
            }
            channel.requests = None;
            self.connected.store(false, Ordering::SeqCst);
        }
        info!(url = %self.url, "relay channel lost");
        self.status.notify(false);
    }
}

/// Shared handle to the relay.  Cheap to clone.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<Inner>,
}

impl RelayClient {
    /// A client for the relay at `url` (`ws://host:port`).  Nothing is
    /// opened until [`RelayClient::connect`].
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                channel: Mutex::new(Channel {
                    generation: 0,
                    requests: None,
                }),
                connected: AtomicBool::new(false),
                connecting: tokio::sync::Mutex::new(()),
                status: Listeners::new("status"),
                distance: Listeners::new("distance"),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Open the channel and request the current device status.
    ///
    /// Resolves once the channel is up and the status request is queued.
    /// Already connected → `Ok(())` without touching the channel.
    ///
    /// # Errors
    ///
    /// [`ClientError::Connect`] when the relay refuses the connection,
    /// [`ClientError::Timeout`] after [`CONNECT_TIMEOUT`].  Status
    /// listeners are told `false` in both cases.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let _connecting = self.inner.connecting.lock().await;
        if self.is_connected() {
            debug!("already connected to relay");
            return Ok(());
        }

        let url = self.inner.url.clone();
        let socket = match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
            Ok(Ok((socket, _response))) => socket,
            Ok(Err(e)) => {
                warn!(%url, error = %e, "relay connection failed");
                self.inner.status.notify(false);
                return Err(ClientError::Connect {
                    url,
                    details: e.to_string(),
                });
            }
            Err(_) => {
                warn!(%url, "relay connection timed out");
                self.inner.status.notify(false);
                return Err(ClientError::Timeout(CONNECT_TIMEOUT));
            }
        };

        let (requests, outbound) = mpsc::unbounded_channel();
        let generation = {
            let mut channel = self.inner.channel.lock();
            channel.generation += 1;
            channel.requests = Some(requests);
            self.inner.connected.store(true, Ordering::SeqCst);
            channel.generation
        };
        info!(%url, "connected to relay");

        tokio::spawn(pump(Arc::clone(&self.inner), generation, socket, outbound));
        self.inner.send(ClientRequest::SyncStatus);
        Ok(())
    }

    /// Connect only if not already connected.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        if self.is_connected() {
            debug!("already connected; reconnect skipped");
            return Ok(());
        }
        self.connect().await
    }

    /// Kept for API symmetry.  The channel is process-scoped and stays open.
    pub fn disconnect(&self) {
        debug!("disconnect ignored; relay channel is shared");
    }

    /// Whether the channel to the relay is up.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Ask the relay to send the device status again.
    pub fn sync_status(&self) {
        if !self.inner.send(ClientRequest::SyncStatus) {
            warn!("cannot sync status; not connected to relay");
        }
    }

    /// Send an actuator level.  Levels outside `[0, 5]` are dropped here,
    /// without any network traffic.
    pub fn set_actuator_level(&self, level: i64) {
        let command = match ActuatorCommand::new(level) {
            Ok(command) => command,
            Err(e) => {
                warn!(level, error = %e, "invalid actuator level; not sent");
                return;
            }
        };
        let request = ClientRequest::SetActuatorLevel {
            level: i64::from(command.level()),
        };
        if !self.inner.send(request) {
            warn!(level, "not connected to relay; actuator level not sent");
        }
    }

    /// Register a device-status listener.
    pub fn on_status<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.inner.status.add(callback)
    }

    /// Register a distance listener (percent, `0..=100`).
    pub fn on_distance<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        self.inner.distance.add(callback)
    }
}

impl Default for RelayClient {
    fn default() -> Self {
        Self::new(DEFAULT_RELAY_URL)
    }
}

async fn pump(
    inner: Arc<Inner>,
    generation: u64,
    socket: RelaySocket,
    mut outbound: mpsc::UnboundedReceiver<ClientRequest>,
) {
    let (mut sink, mut frames) = socket.split();
    loop {
        tokio::select! {
            request = outbound.recv() => match request {
                Some(request) => match serde_json::to_string(&request) {
                    Ok(json) => {
                        if let Err(e) = sink.send(Message::Text(json.into())).await {
                            warn!(error = %e, "relay write failed");
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "request serialization error"),
                },
                // Replaced by a newer channel.
                None => break,
            },
            frame = frames.next() => match frame {
                Some(Ok(Message::Text(text))) => inner.dispatch(text.as_str()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(error = %e, "relay read failed");
                    break;
                }
                _ => {}
            },
        }
    }
    inner.channel_lost(generation);
}
