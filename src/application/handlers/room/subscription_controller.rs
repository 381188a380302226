//! ActiveRoomSubscriptionController - Subscribe to exactly the rooms this process needs.
//!
//! A room's broker channel is subscribed while the room has at least one
//! local client and released when the last one leaves. The stateful
//! channel is subscribed once for the lifetime of the controller.
//!
//! ```text
//! ActiveRoomSet ──changes──▶ run loop ──claim/release──▶ rooms: RoomId → RoomSlot
//! BusConnectionFactory ──Reconnected──▶ run loop ──resubscribe_all──▶ rooms + stateful
//! ```
//!
//! Each room owns at most one slot in the room map. A slot is claimed
//! under the map lock before subscribing, and the subscribe itself runs
//! with the lock released, so a slow or retrying subscribe never blocks
//! queries or teardown of other rooms.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::BackoffConfig;
use crate::domain::foundation::RoomId;
use crate::domain::room::{ChannelKey, RoomSubscriptionState};
use crate::ports::{
    ActiveRoomSet, BusConnectionFactory, ConnectionEvent, EnvelopeHandler, LocalConnections,
    RoomActivityChange, StatefulEventHandler, SubscribeError, Subscription,
};

use super::broadcast_forwarder::RoomBroadcastForwarder;
use super::stateful_consumer::StatefulEventConsumer;

/// A room's entry in the room map.
enum RoomSlot {
    /// A subscribe is in flight; only the activation holding `id` may fill the slot.
    Subscribing { id: u64, cancel: CancellationToken },
    Subscribed(Subscription),
}

impl RoomSlot {
    fn state(&self) -> RoomSubscriptionState {
        match self {
            RoomSlot::Subscribing { .. } => RoomSubscriptionState::Inactive,
            RoomSlot::Subscribed(_) => RoomSubscriptionState::Subscribed,
        }
    }

    async fn release(self) {
        match self {
            RoomSlot::Subscribing { cancel, .. } => cancel.cancel(),
            RoomSlot::Subscribed(subscription) => subscription.unsubscribe().await,
        }
    }
}

/// Claim on a room slot held by one activation.
struct Reservation {
    id: u64,
    cancel: CancellationToken,
}

/// Keeps this process's broker subscriptions in line with local room activity.
///
/// # Example
///
/// ```ignore
/// let controller = Arc::new(ActiveRoomSubscriptionController::new(
///     connections.clone(),
///     registry.clone(),
///     Arc::new(IdempotentStatefulHandler::new(writer, store)),
///     config.bus.reconnect.clone(),
/// ));
///
/// let shutdown = CancellationToken::new();
/// tokio::spawn(controller.clone().run(registry.clone(), shutdown.clone()));
/// ```
pub struct ActiveRoomSubscriptionController {
    connections: Arc<dyn BusConnectionFactory>,
    room_handler: Arc<dyn EnvelopeHandler>,
    stateful_handler: Arc<dyn EnvelopeHandler>,
    backoff: BackoffConfig,
    rooms: Mutex<HashMap<RoomId, RoomSlot>>,
    next_reservation: AtomicU64,
    stateful: Mutex<Option<Subscription>>,
    shutdown: CancellationToken,
}

impl ActiveRoomSubscriptionController {
    pub fn new(
        connections: Arc<dyn BusConnectionFactory>,
        local: Arc<dyn LocalConnections>,
        stateful: Arc<dyn StatefulEventHandler>,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            connections,
            room_handler: Arc::new(RoomBroadcastForwarder::new(local)),
            stateful_handler: Arc::new(StatefulEventConsumer::new(stateful)),
            backoff,
            rooms: Mutex::new(HashMap::new()),
            next_reservation: AtomicU64::new(0),
            stateful: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Subscribes the stateful channel and every currently active room.
    pub async fn start(&self, active_rooms: &dyn ActiveRoomSet) -> Result<(), SubscribeError> {
        self.subscribe_stateful().await?;
        self.reconcile(active_rooms.active_rooms().await).await
    }

    /// Subscribes `room_id` unless it already has a live or in-flight subscription.
    ///
    /// Returns `Ok` without subscribing if the room is deactivated before
    /// the subscribe completes.
    pub async fn activate_room(&self, room_id: RoomId) -> Result<(), SubscribeError> {
        match self.reserve(room_id).await {
            Some(reservation) => self.complete(room_id, reservation).await,
            None => Ok(()),
        }
    }

    /// Releases the subscription for `room_id`, if any.
    ///
    /// When this returns no further envelopes for the room are forwarded
    /// by a stored subscription. A subscribe still in flight is abandoned
    /// and released as soon as it completes.
    pub async fn deactivate_room(&self, room_id: RoomId) {
        let slot = self.rooms.lock().await.remove(&room_id);
        if let Some(slot) = slot {
            slot.release().await;
            tracing::info!(
                room_id = %room_id,
                state = %RoomSubscriptionState::Inactive,
                "Room unsubscribed"
            );
        }
    }

    /// Brings the room map in line with a snapshot of active rooms.
    ///
    /// Rooms that fail to subscribe after retrying are logged and left
    /// inactive; only fatal errors are returned.
    pub async fn reconcile(&self, active: Vec<RoomId>) -> Result<(), SubscribeError> {
        let active: HashSet<RoomId> = active.into_iter().collect();
        self.release_inactive(&active).await;

        let mut fatal = None;
        for room_id in active {
            if let Some(reservation) = self.reserve(room_id).await {
                let result = self.complete(room_id, reservation).await;
                record_failure(&mut fatal, room_id, result);
            }
        }

        fatal.map_or(Ok(()), Err)
    }

    /// Replaces every subscription after the broker connection came back.
    ///
    /// Each room keeps exactly one map entry: the old subscription is
    /// released before its replacement is stored.
    pub async fn resubscribe_all(&self) -> Result<(), SubscribeError> {
        self.subscribe_stateful().await?;

        let reservations = self.take_subscribed().await;
        let count = reservations.len();

        let mut fatal = None;
        for (room_id, reservation) in reservations {
            let result = self.complete(room_id, reservation).await;
            record_failure(&mut fatal, room_id, result);
        }

        tracing::info!(rooms = count, "Resubscribed after reconnect");
        fatal.map_or(Ok(()), Err)
    }

    /// Current subscription state of a room on this process.
    pub async fn room_state(&self, room_id: &RoomId) -> RoomSubscriptionState {
        self.rooms
            .lock()
            .await
            .get(room_id)
            .map_or(RoomSubscriptionState::Inactive, RoomSlot::state)
    }

    /// Rooms with a stored subscription.
    pub async fn subscribed_rooms(&self) -> Vec<RoomId> {
        self.rooms
            .lock()
            .await
            .iter()
            .filter(|(_, slot)| matches!(slot, RoomSlot::Subscribed(_)))
            .map(|(room_id, _)| *room_id)
            .collect()
    }

    pub async fn is_stateful_subscribed(&self) -> bool {
        self.stateful
            .lock()
            .await
            .as_ref()
            .is_some_and(Subscription::is_active)
    }

    /// Drives the controller until `shutdown` fires or the connection fails.
    ///
    /// Applies activity changes as they arrive, resynchronises from a
    /// snapshot when the change stream lags, and resubscribes everything
    /// on `ConnectionEvent::Reconnected`. Subscribes run in the background
    /// so a retrying room never delays teardown of another. Releases every
    /// subscription before returning.
    pub async fn run(
        self: Arc<Self>,
        active_rooms: Arc<dyn ActiveRoomSet>,
        shutdown: CancellationToken,
    ) -> Result<(), SubscribeError> {
        let link = {
            let internal = self.shutdown.clone();
            let external = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = external.cancelled() => internal.cancel(),
                    _ = internal.cancelled() => {}
                }
            })
        };

        // Listen before taking the snapshot so no change falls in between.
        let mut changes = active_rooms.changes();
        let mut connection_events = self.connections.connection_events();

        let result = match self.start(active_rooms.as_ref()).await {
            Ok(()) => {
                self.event_loop(active_rooms.as_ref(), &mut changes, &mut connection_events)
                    .await
            }
            Err(e) => Err(e),
        };

        self.shutdown().await;
        link.abort();

        match result {
            Err(SubscribeError::Cancelled) => Ok(()),
            other => other,
        }
    }

    async fn event_loop(
        self: &Arc<Self>,
        active_rooms: &dyn ActiveRoomSet,
        changes: &mut tokio::sync::broadcast::Receiver<RoomActivityChange>,
        connection_events: &mut tokio::sync::broadcast::Receiver<ConnectionEvent>,
    ) -> Result<(), SubscribeError> {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                event = connection_events.recv() => match event {
                    Ok(ConnectionEvent::Reconnected) => {
                        self.resync(active_rooms.active_rooms().await, true).await;
                    }
                    Ok(ConnectionEvent::Lost) => {
                        tracing::warn!("Broker connection lost; waiting for reconnect");
                    }
                    Ok(ConnectionEvent::Failed) => {
                        tracing::error!("Broker reconnection exhausted; stopping subscriptions");
                        return Err(SubscribeError::ConnectionLost);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Missed connection events; resubscribing");
                        if self.connections.state().is_connected() {
                            self.resync(active_rooms.active_rooms().await, true).await;
                        }
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
                change = changes.recv() => match change {
                    Ok(change) if change.became_active => {
                        if let Some(reservation) = self.reserve(change.room_id).await {
                            self.complete_in_background(change.room_id, reservation);
                        }
                    }
                    Ok(change) => self.deactivate_room(change.room_id).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Room activity changes lagged; reconciling");
                        self.resync(active_rooms.active_rooms().await, false).await;
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    /// Reconciles against `active` without waiting for subscribes.
    ///
    /// With `replace_subscribed`, stored subscriptions and the stateful
    /// channel are replaced as well.
    async fn resync(self: &Arc<Self>, active: Vec<RoomId>, replace_subscribed: bool) {
        let active: HashSet<RoomId> = active.into_iter().collect();
        self.release_inactive(&active).await;

        if replace_subscribed {
            let controller = Arc::clone(self);
            tokio::spawn(async move {
                match controller.subscribe_stateful().await {
                    Ok(()) | Err(SubscribeError::Cancelled) => {}
                    Err(e) => tracing::error!(error = %e, "Failed to resubscribe stateful channel"),
                }
            });

            for (room_id, reservation) in self.take_subscribed().await {
                self.complete_in_background(room_id, reservation);
            }
        }

        for room_id in active {
            if let Some(reservation) = self.reserve(room_id).await {
                self.complete_in_background(room_id, reservation);
            }
        }
    }

    fn complete_in_background(self: &Arc<Self>, room_id: RoomId, reservation: Reservation) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            match controller.complete(room_id, reservation).await {
                Ok(()) | Err(SubscribeError::Cancelled) => {}
                Err(e) => {
                    tracing::error!(room_id = %room_id, error = %e, "Failed to subscribe room");
                }
            }
        });
    }

    /// Releases every subscription and stops pending retries. Idempotent.
    pub async fn shutdown(&self) {
        // Cancel first: in-flight subscribes that finish after the drain
        // find their slot gone and release themselves.
        self.shutdown.cancel();

        let released: Vec<RoomSlot> = self.rooms.lock().await.drain().map(|(_, s)| s).collect();
        let count = released.len();
        for slot in released {
            slot.release().await;
        }

        if let Some(stateful) = self.stateful.lock().await.take() {
            stateful.unsubscribe().await;
        }

        if count > 0 {
            tracing::info!(rooms = count, "Room subscriptions released");
        }
    }

    /// Claims the slot for `room_id`.
    ///
    /// Returns `None` if the room already has a live or in-flight
    /// subscription. A stored subscription whose connection dropped is
    /// discarded and the slot claimed anew.
    async fn reserve(&self, room_id: RoomId) -> Option<Reservation> {
        if self.shutdown.is_cancelled() {
            return None;
        }

        let mut rooms = self.rooms.lock().await;
        match rooms.get(&room_id) {
            Some(RoomSlot::Subscribed(subscription)) if !subscription.is_active() => {}
            Some(_) => return None,
            None => {}
        }

        let reservation = self.new_reservation();
        rooms.insert(room_id, self.slot_for(&reservation));
        Some(reservation)
    }

    /// Swaps every stored subscription for a fresh reservation.
    async fn take_subscribed(&self) -> Vec<(RoomId, Reservation)> {
        let mut previous = Vec::new();
        let mut reservations = Vec::new();
        {
            let mut rooms = self.rooms.lock().await;
            for (room_id, slot) in rooms.iter_mut() {
                if let RoomSlot::Subscribed(_) = slot {
                    let reservation = self.new_reservation();
                    previous.push(std::mem::replace(slot, self.slot_for(&reservation)));
                    reservations.push((*room_id, reservation));
                }
            }
        }

        for slot in previous {
            slot.release().await;
        }
        reservations
    }

    async fn release_inactive(&self, active: &HashSet<RoomId>) {
        let stale: Vec<(RoomId, RoomSlot)> = {
            let mut rooms = self.rooms.lock().await;
            let stale_ids: Vec<RoomId> = rooms
                .keys()
                .filter(|room_id| !active.contains(*room_id))
                .copied()
                .collect();
            stale_ids
                .into_iter()
                .filter_map(|room_id| rooms.remove(&room_id).map(|slot| (room_id, slot)))
                .collect()
        };

        for (room_id, slot) in stale {
            slot.release().await;
            tracing::info!(room_id = %room_id, "Released subscription for inactive room");
        }
    }

    /// Subscribes for a reserved slot and stores the result if the slot is still ours.
    async fn complete(
        &self,
        room_id: RoomId,
        reservation: Reservation,
    ) -> Result<(), SubscribeError> {
        let result = self
            .subscribe_with_retry(
                &ChannelKey::room(&room_id),
                self.room_handler.clone(),
                &reservation.cancel,
            )
            .await;

        let mut rooms = self.rooms.lock().await;
        let owned = matches!(
            rooms.get(&room_id),
            Some(RoomSlot::Subscribing { id, .. }) if *id == reservation.id
        );

        match result {
            Ok(subscription) if owned => {
                rooms.insert(room_id, RoomSlot::Subscribed(subscription));
                tracing::info!(
                    room_id = %room_id,
                    state = %RoomSubscriptionState::Subscribed,
                    "Room subscribed"
                );
                Ok(())
            }
            Ok(subscription) => {
                drop(rooms);
                subscription.unsubscribe().await;
                tracing::debug!(room_id = %room_id, "Room released while subscribing");
                Ok(())
            }
            Err(e) => {
                if owned {
                    rooms.remove(&room_id);
                    Err(e)
                } else if self.shutdown.is_cancelled() {
                    Err(SubscribeError::Cancelled)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn new_reservation(&self) -> Reservation {
        Reservation {
            id: self.next_reservation.fetch_add(1, Ordering::Relaxed),
            cancel: self.shutdown.child_token(),
        }
    }

    fn slot_for(&self, reservation: &Reservation) -> RoomSlot {
        RoomSlot::Subscribing {
            id: reservation.id,
            cancel: reservation.cancel.clone(),
        }
    }

    async fn subscribe_stateful(&self) -> Result<(), SubscribeError> {
        let previous = self.stateful.lock().await.take();
        if let Some(previous) = previous {
            previous.unsubscribe().await;
        }

        let subscription = self
            .subscribe_with_retry(
                &ChannelKey::stateful(),
                self.stateful_handler.clone(),
                &self.shutdown,
            )
            .await?;

        let mut stateful = self.stateful.lock().await;
        if self.shutdown.is_cancelled() {
            drop(stateful);
            subscription.unsubscribe().await;
            return Err(SubscribeError::Cancelled);
        }
        if let Some(replaced) = stateful.replace(subscription) {
            replaced.unsubscribe().await;
        }
        Ok(())
    }

    /// Subscribes with capped exponential backoff.
    ///
    /// Gives up on fatal errors, when `cancel` fires, or once the
    /// configured attempt limit is reached.
    async fn subscribe_with_retry(
        &self,
        key: &ChannelKey,
        handler: Arc<dyn EnvelopeHandler>,
        cancel: &CancellationToken,
    ) -> Result<Subscription, SubscribeError> {
        let mut attempt = 1;

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(SubscribeError::Cancelled),
                result = self.subscribe_once(key, handler.clone()) => result,
            };

            let error = match result {
                Ok(subscription) => return Ok(subscription),
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => e,
            };

            if !self.backoff.allows_attempt(attempt + 1) {
                return Err(error);
            }

            let delay = self.backoff.delay_for(attempt);
            tracing::warn!(
                channel = %key,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "Subscribe failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SubscribeError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn subscribe_once(
        &self,
        key: &ChannelKey,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<Subscription, SubscribeError> {
        let subscriber = self.connections.subscriber().await?;
        subscriber.subscribe(key, handler).await
    }
}

/// Logs a failed room subscribe and keeps the first fatal error.
fn record_failure(
    fatal: &mut Option<SubscribeError>,
    room_id: RoomId,
    result: Result<(), SubscribeError>,
) {
    match result {
        Ok(()) => {}
        Err(e) if is_fatal(&e) => {
            fatal.get_or_insert(e);
        }
        Err(e) => tracing::error!(room_id = %room_id, error = %e, "Failed to subscribe room"),
    }
}

fn is_fatal(error: &SubscribeError) -> bool {
    matches!(
        error,
        SubscribeError::ConnectionLost | SubscribeError::Cancelled
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryBroker, LocalRoomRegistry};
    use crate::domain::foundation::DomainError;
    use crate::domain::room::RoomEvent;
    use async_trait::async_trait;

    struct NoopStatefulHandler;

    #[async_trait]
    impl StatefulEventHandler for NoopStatefulHandler {
        async fn apply_stateful_event(&self, _: RoomEvent) -> Result<(), DomainError> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "NoopStatefulHandler"
        }
    }

    fn fast_backoff(max_attempts: Option<u32>) -> BackoffConfig {
        BackoffConfig {
            initial_delay_ms: 5,
            max_delay_ms: 20,
            max_attempts,
        }
    }

    fn controller(broker: &InMemoryBroker) -> ActiveRoomSubscriptionController {
        ActiveRoomSubscriptionController::new(
            Arc::new(broker.connect()),
            Arc::new(LocalRoomRegistry::new(16, 16)),
            Arc::new(NoopStatefulHandler),
            fast_backoff(None),
        )
    }

    #[tokio::test]
    async fn activate_twice_keeps_one_subscription() {
        let broker = InMemoryBroker::new();
        let controller = controller(&broker);
        let room_id = RoomId::new();

        controller.activate_room(room_id).await.unwrap();
        controller.activate_room(room_id).await.unwrap();

        assert_eq!(broker.subscriber_count(&ChannelKey::room(&room_id)), 1);
        assert_eq!(controller.room_state(&room_id).await, RoomSubscriptionState::Subscribed);
    }

    #[tokio::test]
    async fn deactivate_releases_broker_subscription() {
        let broker = InMemoryBroker::new();
        let controller = controller(&broker);
        let room_id = RoomId::new();

        controller.activate_room(room_id).await.unwrap();
        controller.deactivate_room(room_id).await;
        controller.deactivate_room(room_id).await;

        assert_eq!(broker.subscriber_count(&ChannelKey::room(&room_id)), 0);
        assert_eq!(controller.room_state(&room_id).await, RoomSubscriptionState::Inactive);
    }

    #[tokio::test]
    async fn reconcile_matches_snapshot() {
        let broker = InMemoryBroker::new();
        let controller = controller(&broker);
        let (kept, dropped, added) = (RoomId::new(), RoomId::new(), RoomId::new());

        controller.activate_room(kept).await.unwrap();
        controller.activate_room(dropped).await.unwrap();
        controller.reconcile(vec![kept, added]).await.unwrap();

        let mut subscribed = controller.subscribed_rooms().await;
        subscribed.sort_by_key(|id| id.to_string());
        let mut expected = vec![kept, added];
        expected.sort_by_key(|id| id.to_string());
        assert_eq!(subscribed, expected);
        assert_eq!(broker.subscriber_count(&ChannelKey::room(&dropped)), 0);
    }

    #[tokio::test]
    async fn subscribe_retries_until_connection_returns() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect();
        let controller = Arc::new(ActiveRoomSubscriptionController::new(
            Arc::new(connection.clone()),
            Arc::new(LocalRoomRegistry::new(16, 16)),
            Arc::new(NoopStatefulHandler),
            fast_backoff(None),
        ));
        let room_id = RoomId::new();

        connection.drop_connection();
        let activation = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.activate_room(room_id).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        connection.restore_connection();

        activation.await.unwrap().unwrap();
        assert_eq!(broker.subscriber_count(&ChannelKey::room(&room_id)), 1);
    }

    #[tokio::test]
    async fn bounded_retries_give_up() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect();
        let controller = ActiveRoomSubscriptionController::new(
            Arc::new(connection.clone()),
            Arc::new(LocalRoomRegistry::new(16, 16)),
            Arc::new(NoopStatefulHandler),
            fast_backoff(Some(3)),
        );

        connection.drop_connection();
        let result = controller.activate_room(RoomId::new()).await;

        assert!(matches!(result, Err(SubscribeError::Unavailable(_))));
        assert!(controller.subscribed_rooms().await.is_empty());
    }

    #[tokio::test]
    async fn shutdown_interrupts_retry_backoff() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect();
        let controller = Arc::new(ActiveRoomSubscriptionController::new(
            Arc::new(connection.clone()),
            Arc::new(LocalRoomRegistry::new(16, 16)),
            Arc::new(NoopStatefulHandler),
            BackoffConfig {
                initial_delay_ms: 60_000,
                max_delay_ms: 60_000,
                max_attempts: None,
            },
        ));

        connection.drop_connection();
        let activation = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.activate_room(RoomId::new()).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        controller.shutdown().await;

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), activation)
            .await
            .expect("activation should stop promptly")
            .unwrap();
        assert_eq!(result, Err(SubscribeError::Cancelled));
    }

    #[tokio::test]
    async fn retrying_room_does_not_block_other_rooms() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect();
        let controller = Arc::new(ActiveRoomSubscriptionController::new(
            Arc::new(connection.clone()),
            Arc::new(LocalRoomRegistry::new(16, 16)),
            Arc::new(NoopStatefulHandler),
            fast_backoff(None),
        ));
        let (subscribed, retrying) = (RoomId::new(), RoomId::new());
        let limit = std::time::Duration::from_secs(1);

        controller.activate_room(subscribed).await.unwrap();
        connection.drop_connection();
        let activation = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.activate_room(retrying).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let state = tokio::time::timeout(limit, controller.room_state(&subscribed))
            .await
            .expect("room_state blocked by a retrying subscribe");
        assert_eq!(state, RoomSubscriptionState::Subscribed);
        tokio::time::timeout(limit, controller.deactivate_room(subscribed))
            .await
            .expect("deactivate_room blocked by a retrying subscribe");
        assert_eq!(controller.room_state(&subscribed).await, RoomSubscriptionState::Inactive);

        // Deactivating the retrying room abandons its subscribe.
        controller.deactivate_room(retrying).await;
        let result = tokio::time::timeout(limit, activation)
            .await
            .expect("abandoned activation should stop")
            .unwrap();
        assert_eq!(result, Ok(()));

        connection.restore_connection();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(controller.subscribed_rooms().await.is_empty());
        assert_eq!(broker.subscriber_count(&ChannelKey::room(&retrying)), 0);
    }

    #[tokio::test]
    async fn room_released_mid_subscribe_is_not_stored() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect();
        let controller = Arc::new(ActiveRoomSubscriptionController::new(
            Arc::new(connection.clone()),
            Arc::new(LocalRoomRegistry::new(16, 16)),
            Arc::new(NoopStatefulHandler),
            fast_backoff(None),
        ));
        let (kept, released) = (RoomId::new(), RoomId::new());

        connection.drop_connection();
        let activations = {
            let controller = controller.clone();
            tokio::spawn(async move {
                let (a, b) = tokio::join!(
                    controller.activate_room(kept),
                    controller.activate_room(released)
                );
                (a, b)
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        controller.reconcile(vec![kept]).await.unwrap();
        connection.restore_connection();

        let (kept_result, released_result) = activations.await.unwrap();
        assert_eq!(kept_result, Ok(()));
        assert_eq!(released_result, Ok(()));
        assert_eq!(controller.subscribed_rooms().await, vec![kept]);
        assert_eq!(broker.subscriber_count(&ChannelKey::room(&released)), 0);
    }

    #[tokio::test]
    async fn resubscribe_during_outage_keeps_queries_responsive() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect();
        let controller = Arc::new(ActiveRoomSubscriptionController::new(
            Arc::new(connection.clone()),
            Arc::new(LocalRoomRegistry::new(16, 16)),
            Arc::new(NoopStatefulHandler),
            fast_backoff(None),
        ));
        let room_id = RoomId::new();
        let limit = std::time::Duration::from_secs(1);

        controller.start(&LocalRoomRegistry::new(16, 16)).await.unwrap();
        controller.activate_room(room_id).await.unwrap();
        connection.drop_connection();

        let resubscribe = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.resubscribe_all().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        tokio::time::timeout(limit, controller.is_stateful_subscribed())
            .await
            .expect("stateful query blocked by a retrying subscribe");
        tokio::time::timeout(limit, controller.subscribed_rooms())
            .await
            .expect("room query blocked by a retrying subscribe");

        connection.restore_connection();
        resubscribe.await.unwrap().unwrap();
        assert!(controller.is_stateful_subscribed().await);
        assert_eq!(controller.subscribed_rooms().await, vec![room_id]);
        assert_eq!(broker.subscriber_count(&ChannelKey::room(&room_id)), 1);
    }

    #[tokio::test]
    async fn shutdown_releases_everything() {
        let broker = InMemoryBroker::new();
        let controller = controller(&broker);
        let registry = LocalRoomRegistry::new(16, 16);
        let room_id = RoomId::new();

        controller.start(&registry).await.unwrap();
        controller.activate_room(room_id).await.unwrap();
        assert!(controller.is_stateful_subscribed().await);

        controller.shutdown().await;

        assert!(!controller.is_stateful_subscribed().await);
        assert_eq!(broker.subscriber_count(&ChannelKey::stateful()), 0);
        assert_eq!(broker.subscriber_count(&ChannelKey::room(&room_id)), 0);
    }
}
