//! [`RelayServer`] – HTTP + WebSocket front door of the relay.
//!
//! Listens on `0.0.0.0:3001` (configurable via [`RelayServer::with_port`]).
//! Routing lives in [`crate::router`]; this module owns the listener and the
//! per-socket bridge between one hub subscription and one WebSocket.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use magcue_hub::{BroadcastHub, SubscriptionId, SubscriptionReceiver};
use magcue_types::{ClientRequest, RelayError};
use tokio::net::TcpListener;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::router::create_router;

/// Default TCP port for the relay.
pub const DEFAULT_PORT: u16 = 3001;

/// HTTP + WebSocket server bridging clients to a [`BroadcastHub`].
pub struct RelayServer {
    hub: Arc<BroadcastHub>,
    port: u16,
}

impl RelayServer {
    /// Create a server backed by `hub` on the [`DEFAULT_PORT`].
    pub fn new(hub: Arc<BroadcastHub>) -> Self {
        Self {
            hub,
            port: DEFAULT_PORT,
        }
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serve until the process exits.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] if the TCP listener cannot bind.
    pub async fn run(self) -> Result<(), RelayError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then stop accepting connections.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] if the TCP listener cannot bind.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::Transport(format!("bind error on {addr}: {e}")))?;
        info!(port = self.port, "relay listening on http://localhost:{}", self.port);
        serve(listener, self.hub, shutdown).await
    }
}

/// Serve the relay on an already-bound `listener` until `shutdown`
/// resolves.  Open WebSocket bridges are not awaited.
pub async fn serve<F>(listener: TcpListener, hub: Arc<BroadcastHub>, shutdown: F) -> Result<(), RelayError>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, create_router(hub))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| RelayError::Transport(format!("server error: {e}")))?;
    info!("relay server stopped accepting connections");
    Ok(())
}

// ---------------------------------------------------------------------------
// WebSocket: one subscription per socket
// ---------------------------------------------------------------------------

pub(crate) async fn handle_socket(socket: WebSocket, hub: Arc<BroadcastHub>) {
    let subscription = hub.subscribe();
    let span = info_span!("ws_client", subscription = %subscription.id());
    bridge(socket, hub, subscription).instrument(span).await;
}

async fn bridge(socket: WebSocket, hub: Arc<BroadcastHub>, mut subscription: SubscriptionReceiver) {
    let id = subscription.id();
    let (mut ws_tx, mut ws_rx) = socket.split();
    info!("websocket client connected");

    loop {
        tokio::select! {
            // Downstream: hub → client
            event = subscription.recv() => match event {
                Some(event) => match serde_json::to_string(&event) {
                    Ok(json) => {
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "event serialization error"),
                },
                None => break,
            },
            // Upstream: client → hub
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_client_frame(text.as_str(), &hub, id),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(error = %e, "websocket read error");
                    break;
                }
                _ => {}
            },
        }
    }

    hub.on_client_disconnect(id);
    info!("websocket client disconnected");
}

/// Apply one client frame to the hub.
///
/// | Frame | Effect |
/// |---|---|
/// | `{"command":"setActuatorLevel","level":n}` | [`BroadcastHub::request_command`] |
/// | `{"command":"syncStatus"}` | [`BroadcastHub::sync_status`] for this socket |
///
/// Anything else is ignored.
pub(crate) fn handle_client_frame(text: &str, hub: &BroadcastHub, id: SubscriptionId) {
    match serde_json::from_str::<ClientRequest>(text) {
        Ok(ClientRequest::SetActuatorLevel { level }) => {
            // Rejections are logged by the hub.
            let _ = hub.request_command(level);
        }
        Ok(ClientRequest::SyncStatus) => {
            hub.sync_status(id);
        }
        Err(e) => debug!(subscription = %id, error = %e, "ignoring unrecognised client frame"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
