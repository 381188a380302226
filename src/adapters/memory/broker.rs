//! In-memory broker simulating several processes on one pub/sub server.
//!
//! Each [`InMemoryBusConnection`] plays the part of one server process's
//! broker connection. Publishing fans out to every live subscription on
//! the channel, across all connections, exactly like Redis pub/sub.
//!
//! # Security Note
//!
//! This adapter is for **testing only** and should not be used in production.
//! It uses `.expect()` on lock operations which will panic if locks are poisoned.
//! Production code should use the Redis adapter.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::adapters::delivery::run_delivery_loop;
use crate::domain::room::{ChannelKey, Envelope};
use crate::ports::{
    BusConnectionFactory, ConnectionEvent, ConnectionState, EnvelopeHandler, PublishError,
    Publisher, SubscribeError, Subscriber, Subscription,
};

const CONNECTION_EVENT_CAPACITY: usize = 16;

struct Registration {
    id: u64,
    connection: u64,
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

#[derive(Default)]
struct BrokerState {
    channels: Mutex<HashMap<ChannelKey, Vec<Registration>>>,
    published: Mutex<Vec<(ChannelKey, Envelope)>>,
    failing: Mutex<HashSet<ChannelKey>>,
    next_id: AtomicU64,
}

impl BrokerState {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn remove_registration(&self, key: &ChannelKey, id: u64) {
        let mut channels = self
            .channels
            .lock()
            .expect("InMemoryBroker: channels lock poisoned");
        if let Some(registrations) = channels.get_mut(key) {
            registrations.retain(|r| r.id != id);
            if registrations.is_empty() {
                channels.remove(key);
            }
        }
    }

    fn remove_connection(&self, connection: u64) {
        let mut channels = self
            .channels
            .lock()
            .expect("InMemoryBroker: channels lock poisoned");
        for registrations in channels.values_mut() {
            registrations.retain(|r| r.connection != connection);
        }
        channels.retain(|_, registrations| !registrations.is_empty());
    }
}

/// Shared in-memory broker.
///
/// # Panics
///
/// Methods may panic if internal locks are poisoned. This is acceptable
/// for test code but this adapter should NOT be used in production.
///
/// # Example
///
/// ```ignore
/// let broker = InMemoryBroker::new();
/// let process_a = broker.connect();
/// let process_b = broker.connect();
///
/// let subscription = process_b.subscribe(&key, handler).await?;
/// process_a.publish(&key, &envelope).await?;
///
/// assert_eq!(broker.published_count(&key), 1);
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a connection standing in for one server process.
    pub fn connect(&self) -> InMemoryBusConnection {
        let (events, _) = broadcast::channel(CONNECTION_EVENT_CAPACITY);
        InMemoryBusConnection {
            shared: Arc::new(ConnectionShared {
                broker: self.state.clone(),
                id: self.state.next_id(),
                state: Mutex::new(ConnectionState::Connected),
                events,
            }),
        }
    }

    // === Test Helpers ===

    /// Makes every publish to `key` fail with `PublishError::Unavailable`.
    pub fn fail_publishes_to(&self, key: &ChannelKey) {
        self.state
            .failing
            .lock()
            .expect("InMemoryBroker: failing lock poisoned")
            .insert(key.clone());
    }

    /// Undoes [`fail_publishes_to`](Self::fail_publishes_to).
    pub fn restore_publishes_to(&self, key: &ChannelKey) {
        self.state
            .failing
            .lock()
            .expect("InMemoryBroker: failing lock poisoned")
            .remove(key);
    }

    /// Number of live subscriptions on `key`, across all connections.
    pub fn subscriber_count(&self, key: &ChannelKey) -> usize {
        self.state
            .channels
            .lock()
            .expect("InMemoryBroker: channels lock poisoned")
            .get(key)
            .map_or(0, Vec::len)
    }

    /// Envelopes successfully published to `key`.
    pub fn published_on(&self, key: &ChannelKey) -> Vec<Envelope> {
        self.state
            .published
            .lock()
            .expect("InMemoryBroker: published lock poisoned")
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, envelope)| envelope.clone())
            .collect()
    }

    /// Number of envelopes successfully published to `key`.
    pub fn published_count(&self, key: &ChannelKey) -> usize {
        self.published_on(key).len()
    }
}

struct ConnectionShared {
    broker: Arc<BrokerState>,
    id: u64,
    state: Mutex<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
}

/// One simulated process's connection to an [`InMemoryBroker`].
///
/// Implements [`Publisher`], [`Subscriber`] and [`BusConnectionFactory`].
/// Publishes while the connection is down fail immediately rather than
/// waiting for recovery.
#[derive(Clone)]
pub struct InMemoryBusConnection {
    shared: Arc<ConnectionShared>,
}

impl InMemoryBusConnection {
    fn current_state(&self) -> ConnectionState {
        *self
            .shared
            .state
            .lock()
            .expect("InMemoryBusConnection: state lock poisoned")
    }

    fn set_state(&self, state: ConnectionState) {
        *self
            .shared
            .state
            .lock()
            .expect("InMemoryBusConnection: state lock poisoned") = state;
    }

    // === Test Helpers ===

    /// Simulates losing the broker connection.
    ///
    /// Every subscription opened through this connection stops receiving,
    /// then `ConnectionEvent::Lost` is emitted.
    pub fn drop_connection(&self) {
        self.set_state(ConnectionState::Reconnecting { attempt: 1 });
        self.shared.broker.remove_connection(self.shared.id);
        let _ = self.shared.events.send(ConnectionEvent::Lost);
    }

    /// Simulates a successful reconnect and emits `ConnectionEvent::Reconnected`.
    pub fn restore_connection(&self) {
        self.set_state(ConnectionState::Connected);
        let _ = self.shared.events.send(ConnectionEvent::Reconnected);
    }

    /// Simulates reconnection giving up and emits `ConnectionEvent::Failed`.
    pub fn fail_connection(&self) {
        self.set_state(ConnectionState::Failed);
        self.shared.broker.remove_connection(self.shared.id);
        let _ = self.shared.events.send(ConnectionEvent::Failed);
    }
}

#[async_trait]
impl Publisher for InMemoryBusConnection {
    async fn publish(&self, key: &ChannelKey, envelope: &Envelope) -> Result<(), PublishError> {
        match self.current_state() {
            ConnectionState::Connected => {}
            state if state.is_fatal() => return Err(PublishError::ConnectionLost),
            state => return Err(PublishError::Unavailable(format!("connection {}", state))),
        }

        let broker = &self.shared.broker;
        if broker
            .failing
            .lock()
            .expect("InMemoryBroker: failing lock poisoned")
            .contains(key)
        {
            return Err(PublishError::Unavailable(format!("injected failure on {}", key)));
        }

        let bytes = envelope
            .to_bytes()
            .map_err(|e| PublishError::Encode(e.to_string()))?;

        broker
            .published
            .lock()
            .expect("InMemoryBroker: published lock poisoned")
            .push((key.clone(), envelope.clone()));

        let mut channels = broker
            .channels
            .lock()
            .expect("InMemoryBroker: channels lock poisoned");
        if let Some(registrations) = channels.get_mut(key) {
            registrations.retain(|r| r.sender.send(bytes.clone()).is_ok());
        }

        Ok(())
    }
}

#[async_trait]
impl Subscriber for InMemoryBusConnection {
    async fn subscribe(
        &self,
        key: &ChannelKey,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<Subscription, SubscribeError> {
        match self.current_state() {
            ConnectionState::Connected => {}
            state if state.is_fatal() => return Err(SubscribeError::ConnectionLost),
            state => return Err(SubscribeError::Unavailable(format!("connection {}", state))),
        }

        let broker = self.shared.broker.clone();
        let id = broker.next_id();
        let (sender, receiver) = mpsc::unbounded_channel();

        broker
            .channels
            .lock()
            .expect("InMemoryBroker: channels lock poisoned")
            .entry(key.clone())
            .or_default()
            .push(Registration {
                id,
                connection: self.shared.id,
                sender,
            });

        let messages = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|bytes| (bytes, receiver))
        });

        let cancel = CancellationToken::new();
        let task = {
            let key = key.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_delivery_loop(key.clone(), messages, handler, cancel).await;
                broker.remove_registration(&key, id);
            })
        };

        Ok(Subscription::new(key.clone(), cancel, task))
    }
}

#[async_trait]
impl BusConnectionFactory for InMemoryBusConnection {
    async fn publisher(&self) -> Result<Arc<dyn Publisher>, PublishError> {
        Ok(Arc::new(self.clone()))
    }

    async fn subscriber(&self) -> Result<Arc<dyn Subscriber>, SubscribeError> {
        Ok(Arc::new(self.clone()))
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    fn state(&self) -> ConnectionState {
        self.current_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::foundation::{DomainError, RoomId};
    use crate::domain::room::{encode, RoomEvent};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingHandler {
        count: AtomicUsize,
    }

    impl CountingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                count: AtomicUsize::new(0),
            })
        }

        fn invocations(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EnvelopeHandler for CountingHandler {
        async fn handle(&self, _key: &ChannelKey, _envelope: Envelope) -> Result<(), DomainError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "CountingHandler"
        }
    }

    fn broadcast_envelope(room_id: RoomId) -> Envelope {
        let event = RoomEvent::new(room_id, "chat.message", json!({"body": "hi"})).unwrap();
        Envelope::BroadcastToRoom(encode(&event).unwrap())
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn publish_reaches_subscribers_on_other_connections() {
        let broker = InMemoryBroker::new();
        let producer = broker.connect();
        let consumer = broker.connect();
        let room_id = RoomId::new();
        let key = ChannelKey::room(&room_id);
        let handler = CountingHandler::new();

        let _subscription = consumer.subscribe(&key, handler.clone()).await.unwrap();
        producer.publish(&key, &broadcast_envelope(room_id)).await.unwrap();
        settle().await;

        assert_eq!(handler.invocations(), 1);
        assert_eq!(broker.published_count(&key), 1);
    }

    #[tokio::test]
    async fn other_channels_are_not_delivered() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect();
        let handler = CountingHandler::new();
        let watched = RoomId::new();
        let other = RoomId::new();

        let _subscription = connection
            .subscribe(&ChannelKey::room(&watched), handler.clone())
            .await
            .unwrap();
        connection
            .publish(&ChannelKey::room(&other), &broadcast_envelope(other))
            .await
            .unwrap();
        settle().await;

        assert_eq!(handler.invocations(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_registration() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect();
        let key = ChannelKey::stateful();

        let subscription = connection.subscribe(&key, CountingHandler::new()).await.unwrap();
        assert_eq!(broker.subscriber_count(&key), 1);

        subscription.unsubscribe().await;
        assert_eq!(broker.subscriber_count(&key), 0);
    }

    #[tokio::test]
    async fn injected_failure_rejects_publish() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect();
        let room_id = RoomId::new();
        let key = ChannelKey::room(&room_id);

        broker.fail_publishes_to(&key);
        let result = connection.publish(&key, &broadcast_envelope(room_id)).await;
        assert!(matches!(result, Err(PublishError::Unavailable(_))));
        assert_eq!(broker.published_count(&key), 0);

        broker.restore_publishes_to(&key);
        assert!(connection.publish(&key, &broadcast_envelope(room_id)).await.is_ok());
    }

    #[tokio::test]
    async fn dropped_connection_ends_its_subscriptions() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect();
        let mut events = connection.connection_events();
        let key = ChannelKey::stateful();

        let subscription = connection.subscribe(&key, CountingHandler::new()).await.unwrap();
        connection.drop_connection();
        settle().await;

        assert!(!subscription.is_active());
        assert_eq!(broker.subscriber_count(&key), 0);
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Lost);
        assert!(matches!(
            connection.subscribe(&key, CountingHandler::new()).await,
            Err(SubscribeError::Unavailable(_))
        ));

        connection.restore_connection();
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Reconnected);
        assert!(connection.state().is_connected());
    }

    #[tokio::test]
    async fn failed_connection_reports_connection_lost() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect();
        let room_id = RoomId::new();

        connection.fail_connection();

        let result = connection
            .publish(&ChannelKey::room(&room_id), &broadcast_envelope(room_id))
            .await;
        assert_eq!(result, Err(PublishError::ConnectionLost));
    }
}
