//! `magcue-hub` – fan-out between one device session and many clients.
//!
//! # Modules
//!
//! - [`hub`] – [`BroadcastHub`]: the subscription registry, the cached
//!   connection status, and the single inbound path for actuator commands.

pub mod hub;

pub use hub::{
    BroadcastHub, ClientSubscription, DEFAULT_SUBSCRIBER_CAPACITY, SubscriptionId,
    SubscriptionReceiver,
};
