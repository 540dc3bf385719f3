//! `magcue-client` – the consumer side of the relay.
//!
//! # Modules
//!
//! - [`facade`] – [`RelayClient`]: one shared WebSocket channel to the
//!   relay, status and distance listeners, actuator commands.
//! - [`mapping`] – distance → resistance / opacity helpers for UIs.
//!
//! # Usage
//!
//! ```rust,no_run
//! use magcue_client::RelayClient;
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = RelayClient::default();
//!     let _status = client.on_status(|connected| println!("device connected: {connected}"));
//!     let _distance = client.on_distance(|percent| println!("distance {percent:.1} %"));
//!     client.connect().await.expect("relay unreachable");
//!     client.set_actuator_level(3);
//! }
//! ```

pub mod error;
pub mod facade;
mod listeners;
pub mod mapping;

pub use error::ClientError;
pub use facade::{CONNECT_TIMEOUT, DEFAULT_RELAY_URL, RelayClient};
pub use listeners::Unsubscribe;
pub use mapping::{distance_to_opacity, distance_to_resistance};
