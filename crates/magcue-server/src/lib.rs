//! `magcue-server` – the relay's network surface.
//!
//! Boots a lightweight HTTP + WebSocket server (default port `3001`) that:
//!
//! 1. **Streams** hub events to every WebSocket client as JSON frames:
//!    `{"event":"connectionStatus","connected":true}` and
//!    `{"event":"distanceReading","percent":42.5}`.
//!
//! 2. **Accepts** client frames over the same socket:
//!    `{"command":"setActuatorLevel","level":3}` and
//!    `{"command":"syncStatus"}`.
//!
//! 3. **Answers** plain HTTP: `GET /status`, `POST /actuator`,
//!    `POST /connect` (see [`router`]).
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use magcue_hal::{DeviceSession, SessionConfig};
//! use magcue_hub::BroadcastHub;
//! use magcue_server::RelayServer;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (session, events) = DeviceSession::new(SessionConfig::default());
//!     let hub = Arc::new(BroadcastHub::new(Arc::new(session)));
//!     hub.spawn_pump(events);
//!     hub.connect_device().await;
//!     RelayServer::new(hub).run().await.expect("relay server failed");
//! }
//! ```

pub mod router;
pub mod server;

pub use router::{ApiError, INVALID_LEVEL, create_router};
pub use server::{DEFAULT_PORT, RelayServer, serve};
