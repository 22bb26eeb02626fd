// =============================================================================
// Telemetry bus — process-wide pub/sub with snapshots and bounded fan-out
// =============================================================================
//
// Contracts:
//   - Fan-out is best-effort: each subscriber owns a bounded queue; when it
//     is full the oldest message for that subscriber is dropped and a
//     warning logged. The publisher never blocks.
//   - Snapshots keep the latest event per (channel, id); positions are
//     removed from the snapshot on close. Risk alerts keep a ring of the
//     last 50 in insertion order.
//   - Replay delivers snapshot events (marked `replay=true`) into the
//     subscriber's queue ahead of any live event published afterwards.
//   - A heartbeat is enqueued for every connection every 15 seconds.
//
// Ordering: per-channel FIFO per publisher (single queue per subscriber);
// no cross-channel guarantee.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, Result};

use super::events::{TelemetryChannel, TelemetryEvent};

/// Per-subscriber queue capacity.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;
/// Risk-alert snapshot ring size.
const RISK_ALERT_RING: usize = 50;
/// Heartbeat cadence in seconds.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 15;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// What a subscriber drains from its queue.
#[derive(Debug, Clone)]
pub enum BusMessage {
    Event {
        channel: TelemetryChannel,
        replay: bool,
        event: TelemetryEvent,
    },
    Heartbeat {
        timestamp: i64,
    },
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// One connection's view of the bus. The WS handler drains `next_message`;
/// the bus enqueues from publisher context without ever blocking.
pub struct Subscriber {
    id: u64,
    label: String,
    connected_at: i64,
    channels: RwLock<HashSet<TelemetryChannel>>,
    queue: Mutex<VecDeque<BusMessage>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
    close_reason: Mutex<Option<String>>,
    capacity: usize,
}

impl Subscriber {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Replace / extend the channel set. Visible to the next dispatch.
    pub fn subscribe(&self, channels: &[TelemetryChannel]) {
        let mut set = self.channels.write();
        for channel in channels {
            set.insert(*channel);
        }
    }

    pub fn unsubscribe(&self, channels: &[TelemetryChannel]) {
        let mut set = self.channels.write();
        for channel in channels {
            set.remove(channel);
        }
    }

    pub fn channels(&self) -> Vec<TelemetryChannel> {
        let set = self.channels.read();
        TelemetryChannel::ALL
            .into_iter()
            .filter(|c| set.contains(c))
            .collect()
    }

    pub fn is_subscribed(&self, channel: TelemetryChannel) -> bool {
        self.channels.read().contains(&channel)
    }

    /// Enqueue without blocking; drops the oldest message when full.
    fn enqueue(&self, message: BusMessage) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    subscriber = self.id,
                    dropped, "telemetry queue full — dropped oldest event"
                );
            }
            queue.push_back(message);
        }
        self.notify.notify_one();
    }

    /// Await the next message. Returns `None` once the subscriber is closed.
    pub async fn next_message(&self) -> Option<BusMessage> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(message) = self.queue.lock().pop_front() {
                return Some(message);
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking drain used by tests and the writer's batch path.
    pub fn try_next(&self) -> Option<BusMessage> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.queue.lock().pop_front()
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn close(&self, reason: impl Into<String>) {
        *self.close_reason.lock() = Some(reason.into());
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }
}

/// Admin view of one connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: u64,
    pub label: String,
    pub channels: Vec<String>,
    pub connected_at: i64,
    pub queued: usize,
    pub dropped: u64,
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

pub struct TelemetryBus {
    subscribers: RwLock<HashMap<u64, Arc<Subscriber>>>,
    status_snapshots: RwLock<HashMap<String, TelemetryEvent>>,
    position_snapshots: RwLock<HashMap<String, TelemetryEvent>>,
    market_snapshots: RwLock<HashMap<String, TelemetryEvent>>,
    risk_ring: Mutex<VecDeque<TelemetryEvent>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl TelemetryBus {
    pub fn new() -> Self {
        Self::with_capacity(SUBSCRIBER_QUEUE_CAPACITY)
    }

    /// Capacity override for tests exercising the drop-oldest path.
    pub fn with_capacity(queue_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            status_snapshots: RwLock::new(HashMap::new()),
            position_snapshots: RwLock::new(HashMap::new()),
            market_snapshots: RwLock::new(HashMap::new()),
            risk_ring: Mutex::new(VecDeque::with_capacity(RISK_ALERT_RING)),
            next_id: AtomicU64::new(1),
            queue_capacity,
        }
    }

    // -------------------------------------------------------------------------
    // Publishing
    // -------------------------------------------------------------------------

    /// Publish an event: update the channel snapshot, then fan out to every
    /// subscriber of the channel. Never blocks.
    pub fn publish(&self, event: TelemetryEvent) {
        let channel = event.channel();
        self.apply_snapshot(&event);

        let subscribers = self.subscribers.read();
        let mut delivered = 0usize;
        for subscriber in subscribers.values() {
            if subscriber.is_subscribed(channel) {
                subscriber.enqueue(BusMessage::Event {
                    channel,
                    replay: false,
                    event: event.clone(),
                });
                delivered += 1;
            }
        }
        debug!(channel = %channel, delivered, "telemetry event published");
    }

    fn apply_snapshot(&self, event: &TelemetryEvent) {
        let id = event.snapshot_id();
        match event.channel() {
            TelemetryChannel::TraderStatus => {
                self.status_snapshots.write().insert(id, event.clone());
            }
            TelemetryChannel::Positions => {
                if event.clears_snapshot() {
                    self.position_snapshots.write().remove(&id);
                } else {
                    self.position_snapshots.write().insert(id, event.clone());
                }
            }
            TelemetryChannel::MarketData => {
                self.market_snapshots.write().insert(id, event.clone());
            }
            TelemetryChannel::RiskAlerts => {
                let mut ring = self.risk_ring.lock();
                if ring.len() >= RISK_ALERT_RING {
                    ring.pop_front();
                }
                ring.push_back(event.clone());
            }
        }
    }

    /// Current snapshot events for a channel, oldest timestamp first.
    pub fn snapshot(&self, channel: TelemetryChannel) -> Vec<TelemetryEvent> {
        match channel {
            TelemetryChannel::TraderStatus => Self::sorted(&self.status_snapshots),
            TelemetryChannel::Positions => Self::sorted(&self.position_snapshots),
            TelemetryChannel::MarketData => Self::sorted(&self.market_snapshots),
            TelemetryChannel::RiskAlerts => self.risk_ring.lock().iter().cloned().collect(),
        }
    }

    fn sorted(map: &RwLock<HashMap<String, TelemetryEvent>>) -> Vec<TelemetryEvent> {
        let mut events: Vec<TelemetryEvent> = map.read().values().cloned().collect();
        events.sort_by_key(TelemetryEvent::timestamp);
        events
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Register a new connection. Channels start empty; the caller applies
    /// the initial subscribe action.
    pub fn register(&self, label: impl Into<String>) -> Arc<Subscriber> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let subscriber = Arc::new(Subscriber {
            id,
            label: label.into(),
            connected_at: Utc::now().timestamp_millis(),
            channels: RwLock::new(HashSet::new()),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            capacity: self.queue_capacity,
        });
        self.subscribers.write().insert(id, subscriber.clone());
        info!(subscriber = id, "telemetry subscriber registered");
        subscriber
    }

    pub fn unregister(&self, id: u64) {
        if self.subscribers.write().remove(&id).is_some() {
            info!(subscriber = id, "telemetry subscriber unregistered");
        }
    }

    /// Enqueue snapshot events for `channels` into the subscriber's queue,
    /// marked `replay=true`. Because the queue is FIFO, any live event
    /// published after this call is delivered after the replay batch.
    pub fn replay(&self, subscriber: &Subscriber, channels: &[TelemetryChannel]) {
        let mut replayed = 0usize;
        for channel in channels {
            for event in self.snapshot(*channel) {
                subscriber.enqueue(BusMessage::Event {
                    channel: *channel,
                    replay: true,
                    event,
                });
                replayed += 1;
            }
        }
        debug!(subscriber = subscriber.id, replayed, "snapshot replay queued");
    }

    // -------------------------------------------------------------------------
    // Heartbeats
    // -------------------------------------------------------------------------

    /// Enqueue a heartbeat to every registered subscriber.
    pub fn heartbeat_all(&self) {
        let timestamp = Utc::now().timestamp_millis();
        for subscriber in self.subscribers.read().values() {
            subscriber.enqueue(BusMessage::Heartbeat { timestamp });
        }
    }

    /// Spawn the 15 s heartbeat loop. Runs until the process exits.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                HEARTBEAT_INTERVAL_SECS,
            ));
            ticker.tick().await; // immediate first tick is not a heartbeat
            loop {
                ticker.tick().await;
                bus.heartbeat_all();
            }
        })
    }

    // -------------------------------------------------------------------------
    // Admin
    // -------------------------------------------------------------------------

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .subscribers
            .read()
            .values()
            .map(|s| ConnectionInfo {
                id: s.id,
                label: s.label.clone(),
                channels: s.channels().iter().map(|c| c.to_string()).collect(),
                connected_at: s.connected_at,
                queued: s.queued(),
                dropped: s.dropped.load(Ordering::Relaxed),
            })
            .collect();
        infos.sort_by_key(|i| i.id);
        infos
    }

    /// Close a connection by id with a reason. The WS handler observes the
    /// closed flag and terminates the socket.
    pub fn disconnect(&self, id: u64, reason: impl Into<String>) -> Result<()> {
        let subscribers = self.subscribers.read();
        let subscriber = subscribers
            .get(&id)
            .ok_or_else(|| ErrorKind::NotFound(format!("connection {id}")))?;
        subscriber.close(reason);
        Ok(())
    }
}

impl Default for TelemetryBus {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RiskViolation, RiskViolationType};
    use crate::types::{Exchange, TraderState};

    fn status_event(trader_id: &str, ts: i64) -> TelemetryEvent {
        TelemetryEvent::TraderStatus {
            trader_id: trader_id.into(),
            name: trader_id.to_uppercase(),
            state: TraderState::Running,
            reason: super::super::events::StatusReason::StateChange,
            timestamp: ts,
        }
    }

    fn market_event(symbol: &str, price: f64, ts: i64) -> TelemetryEvent {
        TelemetryEvent::MarketData {
            exchange: Exchange::Binance,
            symbol: symbol.into(),
            price,
            timestamp: ts,
        }
    }

    fn risk_event(alert_id: &str, ts: i64) -> TelemetryEvent {
        TelemetryEvent::RiskAlert {
            alert_id: alert_id.into(),
            trader_id: None,
            violation: RiskViolation::new(RiskViolationType::Budget, "over"),
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn fan_out_delivers_to_every_subscriber() {
        let bus = TelemetryBus::new();
        let a = bus.register("a");
        let b = bus.register("b");
        a.subscribe(&[TelemetryChannel::TraderStatus]);
        b.subscribe(&[TelemetryChannel::TraderStatus]);

        bus.publish(status_event("t1", 1));

        assert!(matches!(
            a.try_next(),
            Some(BusMessage::Event { replay: false, .. })
        ));
        assert!(matches!(b.try_next(), Some(BusMessage::Event { .. })));
        assert!(a.try_next().is_none(), "exactly one event per subscriber");
    }

    #[tokio::test]
    async fn unsubscribed_channels_are_not_delivered() {
        let bus = TelemetryBus::new();
        let sub = bus.register("a");
        sub.subscribe(&[TelemetryChannel::Positions]);

        bus.publish(status_event("t1", 1));
        assert!(sub.try_next().is_none());

        // Mutation is visible to the next dispatch.
        sub.subscribe(&[TelemetryChannel::TraderStatus]);
        bus.publish(status_event("t1", 2));
        assert!(sub.try_next().is_some());

        sub.unsubscribe(&[TelemetryChannel::TraderStatus]);
        bus.publish(status_event("t1", 3));
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn full_queue_drops_oldest() {
        let bus = TelemetryBus::with_capacity(2);
        let sub = bus.register("slow");
        sub.subscribe(&[TelemetryChannel::MarketData]);

        bus.publish(market_event("BTCUSDT", 1.0, 1));
        bus.publish(market_event("BTCUSDT", 2.0, 2));
        bus.publish(market_event("BTCUSDT", 3.0, 3));

        assert_eq!(sub.queued(), 2);
        match sub.try_next() {
            Some(BusMessage::Event { event, .. }) => assert_eq!(event.timestamp(), 2),
            other => panic!("unexpected message: {other:?}"),
        }
        match sub.try_next() {
            Some(BusMessage::Event { event, .. }) => assert_eq!(event.timestamp(), 3),
            other => panic!("unexpected message: {other:?}"),
        }
        assert_eq!(sub.dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn snapshot_keeps_latest_per_id_and_clears_on_close() {
        let bus = TelemetryBus::new();

        bus.publish(status_event("t1", 1));
        bus.publish(status_event("t1", 5));
        bus.publish(status_event("t2", 3));
        let snap = bus.snapshot(TelemetryChannel::TraderStatus);
        assert_eq!(snap.len(), 2);
        assert!(snap.iter().any(|e| e.timestamp() == 5));

        // Positions snapshot removal on close.
        bus.publish(TelemetryEvent::PositionClose {
            position_id: "p1".into(),
            trader_id: "t1".into(),
            symbol: "BTCUSDT".into(),
            pnl: 0.0,
            pnl_percent: 0.0,
            reason: "SIGNAL".into(),
            timestamp: 9,
        });
        assert!(bus.snapshot(TelemetryChannel::Positions).is_empty());
    }

    #[tokio::test]
    async fn risk_ring_keeps_last_50_in_order() {
        let bus = TelemetryBus::new();
        for i in 0..60 {
            bus.publish(risk_event(&format!("a{i}"), i));
        }
        let snap = bus.snapshot(TelemetryChannel::RiskAlerts);
        assert_eq!(snap.len(), 50);
        assert_eq!(snap.first().unwrap().timestamp(), 10);
        assert_eq!(snap.last().unwrap().timestamp(), 59);
    }

    #[tokio::test]
    async fn replay_precedes_live_events() {
        let bus = TelemetryBus::new();
        bus.publish(status_event("t1", 1));

        let sub = bus.register("late");
        sub.subscribe(&[TelemetryChannel::TraderStatus]);
        bus.replay(&sub, &[TelemetryChannel::TraderStatus]);
        bus.publish(status_event("t2", 2));

        match sub.try_next() {
            Some(BusMessage::Event { replay, event, .. }) => {
                assert!(replay);
                assert_eq!(event.snapshot_id(), "t1");
            }
            other => panic!("expected replay first, got {other:?}"),
        }
        match sub.try_next() {
            Some(BusMessage::Event { replay, event, .. }) => {
                assert!(!replay);
                assert_eq!(event.snapshot_id(), "t2");
            }
            other => panic!("expected live second, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn heartbeat_reaches_all_subscribers() {
        let bus = TelemetryBus::new();
        let a = bus.register("a");
        let b = bus.register("b");
        bus.heartbeat_all();
        assert!(matches!(a.try_next(), Some(BusMessage::Heartbeat { .. })));
        assert!(matches!(b.try_next(), Some(BusMessage::Heartbeat { .. })));
    }

    #[tokio::test]
    async fn admin_list_and_disconnect() {
        let bus = TelemetryBus::new();
        let sub = bus.register("dashboard");
        sub.subscribe(&[TelemetryChannel::TraderStatus]);

        let connections = bus.connections();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].label, "dashboard");
        assert_eq!(connections[0].channels, vec!["trader-status".to_string()]);

        bus.disconnect(sub.id(), "admin request").unwrap();
        assert!(sub.is_closed());
        assert_eq!(sub.close_reason().as_deref(), Some("admin request"));
        assert!(sub.next_message().await.is_none());

        let err = bus.disconnect(999, "nope").unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn next_message_wakes_on_publish() {
        let bus = Arc::new(TelemetryBus::new());
        let sub = bus.register("waiter");
        sub.subscribe(&[TelemetryChannel::TraderStatus]);

        let bus_clone = bus.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            bus_clone.publish(status_event("t1", 1));
        });

        let message = sub.next_message().await;
        assert!(matches!(message, Some(BusMessage::Event { .. })));
        handle.await.unwrap();
    }
}
