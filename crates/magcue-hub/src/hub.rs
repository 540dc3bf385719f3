//! The Broadcast Hub: one device session, many client subscriptions.
//!
//! ```text
//!                       ┌──────────────── BroadcastHub ───────────────┐
//!  SessionEvent ──run──▶│ publish_status ─┐                           │
//!                       │ publish_reading ┴─▶ per-subscription queues ├──▶ clients
//!  clients ────────────▶│ request_command ──▶ DeviceLink::send_command│
//!                       └─────────────────────────────────────────────┘
//! ```
//!
//! Each subscription owns a bounded [`mpsc`] queue.  Delivery uses
//! `try_send`, so a slow client loses readings instead of stalling the device
//! read path or its peers.  Order within one queue is the publish order.
//!
//! Status events are never lost.  When the queue is full the newest status
//! parks in a one-slot side cell that the receiver drains before its queue;
//! any older status still queued behind it is skipped.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use magcue_hal::{DeviceLink, SessionEvent, SessionSnapshot};
use magcue_types::{ActuatorCommand, DistanceReading, RelayError, RelayEvent};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Events buffered per subscription before new ones are dropped.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// Unique key of one client subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What one client asked to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSubscription {
    pub id: SubscriptionId,
    pub wants_status: bool,
    pub wants_distance: bool,
}

impl ClientSubscription {
    fn wants(&self, event: &RelayEvent) -> bool {
        match event {
            RelayEvent::ConnectionStatus { .. } => self.wants_status,
            RelayEvent::DistanceReading { .. } => self.wants_distance,
        }
    }
}

/// The receiving end of a subscription.
///
/// Dropping it is enough to be pruned on the next publish, but
/// [`BroadcastHub::on_client_disconnect`] removes the entry immediately.
#[derive(Debug)]
pub struct SubscriptionReceiver {
    subscription: ClientSubscription,
    events: mpsc::Receiver<Queued>,
    pending_status: PendingStatus,
    last_status_seq: u64,
}

impl SubscriptionReceiver {
    pub fn id(&self) -> SubscriptionId {
        self.subscription.id
    }

    pub fn subscription(&self) -> ClientSubscription {
        self.subscription
    }

    /// Wait for the next event.  `None` once the hub dropped this entry.
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        loop {
            if let Some(event) = self.take_pending_status() {
                return Some(event);
            }
            let queued = self.events.recv().await?;
            if let Some(event) = self.accept(queued) {
                return Some(event);
            }
        }
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<RelayEvent> {
        loop {
            if let Some(event) = self.take_pending_status() {
                return Some(event);
            }
            let queued = self.events.try_recv().ok()?;
            if let Some(event) = self.accept(queued) {
                return Some(event);
            }
        }
    }

    fn take_pending_status(&mut self) -> Option<RelayEvent> {
        let (seq, connected) = self.pending_status.lock().take()?;
        self.status_event(seq, connected)
    }

    fn accept(&mut self, queued: Queued) -> Option<RelayEvent> {
        match queued {
            Queued::Event(event) => Some(event),
            Queued::Status { seq, connected } => self.status_event(seq, connected),
        }
    }

    fn status_event(&mut self, seq: u64, connected: bool) -> Option<RelayEvent> {
        // Superseded by a status already handed out.
        if seq <= self.last_status_seq {
            return None;
        }
        self.last_status_seq = seq;
        Some(RelayEvent::ConnectionStatus { connected })
    }
}

/// Latest status that did not fit the queue, with its per-slot sequence.
type PendingStatus = Arc<Mutex<Option<(u64, bool)>>>;

#[derive(Debug)]
enum Queued {
    Event(RelayEvent),
    Status { seq: u64, connected: bool },
}

struct Slot {
    subscription: ClientSubscription,
    sender: mpsc::Sender<Queued>,
    pending_status: PendingStatus,
    status_seq: u64,
}

enum Delivery {
    Sent,
    Dropped,
    Gone,
}

impl Slot {
    fn deliver(&mut self, event: &RelayEvent) -> Delivery {
        match *event {
            RelayEvent::ConnectionStatus { connected } => self.deliver_status(connected),
            RelayEvent::DistanceReading { .. } => match self.sender.try_send(Queued::Event(event.clone())) {
                Ok(()) => Delivery::Sent,
                Err(TrySendError::Full(_)) => {
                    warn!(subscription = %self.subscription.id, "subscriber queue full; dropping reading");
                    Delivery::Dropped
                }
                Err(TrySendError::Closed(_)) => Delivery::Gone,
            },
        }
    }

    fn deliver_status(&mut self, connected: bool) -> Delivery {
        self.status_seq += 1;
        let seq = self.status_seq;
        match self.sender.try_send(Queued::Status { seq, connected }) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => {
                debug!(subscription = %self.subscription.id, connected, "subscriber queue full; status parked");
                *self.pending_status.lock() = Some((seq, connected));
                Delivery::Sent
            }
            Err(TrySendError::Closed(_)) => Delivery::Gone,
        }
    }
}

struct Registry {
    connected: bool,
    slots: HashMap<SubscriptionId, Slot>,
}

/// Fan-out point between one [`DeviceLink`] and many clients.
///
/// Share it behind an [`Arc`]; every method takes `&self`.
pub struct BroadcastHub {
    link: Arc<dyn DeviceLink>,
    capacity: usize,
    registry: Mutex<Registry>,
}

impl BroadcastHub {
    /// A hub driving `link`, with [`DEFAULT_SUBSCRIBER_CAPACITY`] queues.
    pub fn new(link: Arc<dyn DeviceLink>) -> Self {
        Self::with_capacity(link, DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// A hub whose subscription queues hold `capacity` events (minimum 1).
    pub fn with_capacity(link: Arc<dyn DeviceLink>, capacity: usize) -> Self {
        Self {
            link,
            capacity: capacity.max(1),
            registry: Mutex::new(Registry {
                connected: false,
                slots: HashMap::new(),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Register a client.  The cached connection status is queued for this
    /// subscription alone before the call returns.
    pub fn on_client_connect(&self, wants_status: bool, wants_distance: bool) -> SubscriptionReceiver {
        let subscription = ClientSubscription {
            id: SubscriptionId::new(),
            wants_status,
            wants_distance,
        };
        let (sender, events) = mpsc::channel(self.capacity);
        let pending_status = PendingStatus::default();
        let mut slot = Slot {
            subscription,
            sender,
            pending_status: Arc::clone(&pending_status),
            status_seq: 0,
        };

        let mut registry = self.registry.lock();
        if wants_status {
            slot.deliver(&RelayEvent::ConnectionStatus {
                connected: registry.connected,
            });
        }
        registry.slots.insert(subscription.id, slot);
        info!(
            subscription = %subscription.id,
            subscribers = registry.slots.len(),
            "client subscribed"
        );

        SubscriptionReceiver {
            subscription,
            events,
            pending_status,
            last_status_seq: 0,
        }
    }

    /// Register a client that wants both status and distance events.
    pub fn subscribe(&self) -> SubscriptionReceiver {
        self.on_client_connect(true, true)
    }

    /// Remove a subscription.  The device session is not touched.
    ///
    /// Returns `false` when `id` was not registered.
    pub fn on_client_disconnect(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.lock();
        let removed = registry.slots.remove(&id).is_some();
        if removed {
            info!(subscription = %id, subscribers = registry.slots.len(), "client unsubscribed");
        }
        removed
    }

    /// Re-queue the cached status for one subscription.
    ///
    /// Returns `false` when `id` is unknown or its queue is unavailable.
    pub fn sync_status(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.lock();
        let event = RelayEvent::ConnectionStatus {
            connected: registry.connected,
        };
        match registry.slots.get_mut(&id) {
            Some(slot) => matches!(slot.deliver(&event), Delivery::Sent),
            None => {
                debug!(subscription = %id, "status sync for unknown subscription");
                false
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().slots.len()
    }

    // -----------------------------------------------------------------------
    // Fan-out
    // -----------------------------------------------------------------------

    /// Deliver `reading` to every subscription that wants distance events.
    ///
    /// Returns how many subscriptions it was queued for.
    pub fn publish_reading(&self, reading: DistanceReading) -> usize {
        fan_out(&mut self.registry.lock(), &RelayEvent::from(reading))
    }

    /// Update the cached status and deliver it to every subscription that
    /// wants status events.
    pub fn publish_status(&self, connected: bool) -> usize {
        let mut registry = self.registry.lock();
        if registry.connected != connected {
            info!(connected, "device connection status changed");
        }
        registry.connected = connected;
        fan_out(&mut registry, &RelayEvent::ConnectionStatus { connected })
    }

    /// The last status published.
    pub fn connected(&self) -> bool {
        self.registry.lock().connected
    }

    // -----------------------------------------------------------------------
    // Device side
    // -----------------------------------------------------------------------

    /// Validate `level` and forward it to the device.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::RangeRejected`] (already logged) for levels
    /// outside `[0, 5]`; nothing reaches the device in that case.
    #[instrument(skip(self))]
    pub fn request_command(&self, level: i64) -> Result<ActuatorCommand, RelayError> {
        match ActuatorCommand::new(level) {
            Ok(command) => {
                debug!("forwarding actuator command");
                self.link.send_command(command);
                Ok(command)
            }
            Err(err) => {
                warn!(error = %err, "rejected actuator command");
                Err(err)
            }
        }
    }

    /// Ask the link to connect.  Returns whether it is open afterwards.
    pub async fn connect_device(&self) -> bool {
        if let Err(err) = self.link.connect().await {
            warn!(error = %err, "device connect failed");
        }
        self.link.snapshot().is_open()
    }

    /// Flush a zero command to the device and release it, waiting at most
    /// `wait`.
    pub async fn shutdown(&self, wait: Duration) {
        info!(subscribers = self.subscriber_count(), "relay hub shutting down");
        self.link.shutdown(wait).await;
    }

    pub fn device_snapshot(&self) -> SessionSnapshot {
        self.link.snapshot()
    }

    /// Pump session events into the fan-out until the session goes away.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Status(connected) => {
                    self.publish_status(connected);
                }
                SessionEvent::Reading(reading) => {
                    self.publish_reading(reading);
                }
            }
        }
        debug!("session event stream ended");
    }

    /// Spawn [`BroadcastHub::run`] on the current runtime.
    pub fn spawn_pump(self: &Arc<Self>, events: mpsc::UnboundedReceiver<SessionEvent>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move { hub.run(events).await })
    }
}

fn fan_out(registry: &mut Registry, event: &RelayEvent) -> usize {
    let mut delivered = 0;
    let mut gone = Vec::new();

    for (id, slot) in registry.slots.iter_mut() {
        if !slot.subscription.wants(event) {
            continue;
        }
        match slot.deliver(event) {
            Delivery::Sent => delivered += 1,
            Delivery::Dropped => {}
            Delivery::Gone => gone.push(*id),
        }
    }

    for id in gone {
        registry.slots.remove(&id);
        debug!(subscription = %id, "pruned closed subscription");
    }
    delivered
}
