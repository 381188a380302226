//! Redis connection lifecycle.
//!
//! One `RedisConnectionManager` per process owns:
//! - a multiplexed connection shared by every publish and store command
//! - one pub/sub session shared by every subscription, opened on first use
//! - the reconnect loop and the connection state it drives
//!
//! When any command or subscription observes a dropped connection it calls
//! [`RedisConnectionManager::report_connection_lost`]. Only the first report
//! for a given outage starts the reconnect loop; the rest are ignored.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::{BusConfig, RedisConfig};
use crate::domain::foundation::StateMachine;
use crate::ports::{
    BusConnectionFactory, ConnectionEvent, ConnectionState, PublishError, Publisher,
    SubscribeError, Subscriber,
};

use super::error::{is_connection_error, subscribe_error, ConnectError};
use super::publisher::RedisPublisher;
use super::pubsub::{PubSubSession, SessionEnd};
use super::subscriber::RedisSubscriber;

const CONNECTION_EVENT_CAPACITY: usize = 16;

struct Shared {
    client: redis::Client,
    connect_timeout: Duration,
    bus: BusConfig,
    connection: RwLock<Option<MultiplexedConnection>>,
    pubsub: Mutex<Option<Arc<PubSubSession>>>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    shutdown: CancellationToken,
}

/// Owns the process's Redis connections.
///
/// Cheap to clone; clones share the same connections and state.
///
/// # Example
///
/// ```ignore
/// let config = AppConfig::load()?;
/// let connections = RedisConnectionManager::connect(&config.redis, config.bus.clone()).await?;
///
/// let dispatcher = RoomEventDispatcher::new(Arc::new(connections.clone()));
/// ```
#[derive(Clone)]
pub struct RedisConnectionManager {
    shared: Arc<Shared>,
}

impl RedisConnectionManager {
    /// Connects to Redis and verifies the connection with `PING`.
    pub async fn connect(redis: &RedisConfig, bus: BusConfig) -> Result<Self, ConnectError> {
        let info = redis.connection_info().map_err(ConnectError::InvalidConfig)?;
        let client = redis::Client::open(info).map_err(ConnectError::InvalidConfig)?;
        let connect_timeout = redis.connect_timeout();

        let connection = open_command_connection(&client, connect_timeout).await?;

        let (state, _) = watch::channel(ConnectionState::Connected);
        let (events, _) = broadcast::channel(CONNECTION_EVENT_CAPACITY);

        tracing::info!(
            channel_prefix = bus.channel_prefix().unwrap_or(""),
            "Connected to Redis"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                client,
                connect_timeout,
                bus,
                connection: RwLock::new(Some(connection)),
                pubsub: Mutex::new(None),
                state,
                events,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn channel_prefix(&self) -> Option<&str> {
        self.shared.bus.channel_prefix()
    }

    pub fn publish_timeout(&self) -> Duration {
        self.shared.bus.publish_timeout()
    }

    pub fn subscribe_timeout(&self) -> Duration {
        self.shared.bus.subscribe_timeout()
    }

    pub fn processed_event_ttl(&self) -> Duration {
        self.shared.bus.processed_event_ttl()
    }

    /// Shared command connection.
    ///
    /// While reconnecting, waits up to the publish timeout for the
    /// connection to come back. Fails with `ConnectionLost` once
    /// reconnection has given up or the manager was shut down.
    pub async fn connection(&self) -> Result<MultiplexedConnection, PublishError> {
        let timeout = self.publish_timeout();
        let mut state = self.shared.state.subscribe();

        let settled = tokio::time::timeout(
            timeout,
            state.wait_for(|s| s.is_connected() || s.is_fatal()),
        )
        .await
        .map_err(|_| PublishError::Timeout(timeout))?
        .map(|s| *s)
        .map_err(|_| PublishError::ConnectionLost)?;

        if settled.is_fatal() {
            return Err(PublishError::ConnectionLost);
        }

        self.shared
            .connection
            .read()
            .await
            .clone()
            .ok_or(PublishError::ConnectionLost)
    }

    /// The shared pub/sub session, opened if there is none or the last one closed.
    pub(crate) async fn pubsub(&self) -> Result<Arc<PubSubSession>, SubscribeError> {
        let state = *self.shared.state.borrow();
        if state.is_fatal() {
            return Err(SubscribeError::ConnectionLost);
        }
        if !state.is_connected() {
            return Err(SubscribeError::Unavailable(format!("connection {}", state)));
        }

        let mut current = self.shared.pubsub.lock().await;
        if let Some(session) = current.as_ref().filter(|session| session.is_open()) {
            return Ok(session.clone());
        }

        let timeout = self.shared.connect_timeout;
        let info = self.shared.client.get_connection_info();
        let (session, frames) = tokio::time::timeout(timeout, PubSubSession::open(info))
            .await
            .map_err(|_| SubscribeError::Timeout(timeout))?
            .map_err(|e| {
                if is_connection_error(&e) {
                    self.report_connection_lost(&e.to_string());
                }
                subscribe_error(&e, timeout)
            })?;

        let manager = self.clone();
        let reader = session.clone();
        tokio::spawn(async move {
            if reader.run(frames).await == SessionEnd::StreamClosed {
                manager.report_connection_lost("pub/sub connection closed");
            }
        });

        tracing::debug!("Opened shared pub/sub connection");
        *current = Some(session.clone());
        Ok(session)
    }

    /// Records that a connection dropped and starts reconnecting.
    ///
    /// No-op unless the manager is currently `Connected`.
    pub fn report_connection_lost(&self, reason: &str) {
        if !self.advance(ConnectionState::Reconnecting { attempt: 1 }) {
            return;
        }

        tracing::warn!(reason, "Redis connection lost, reconnecting");
        let _ = self.shared.events.send(ConnectionEvent::Lost);

        let manager = self.clone();
        tokio::spawn(async move { manager.reconnect_loop().await });
    }

    /// Stops reconnecting and closes the shared connections.
    ///
    /// Subscriptions still held by their owners stop receiving.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.advance(ConnectionState::Closed);
        self.shared.connection.write().await.take();
        self.close_pubsub().await;
        tracing::info!("Redis connection manager shut down");
    }

    async fn close_pubsub(&self) {
        if let Some(session) = self.shared.pubsub.lock().await.take() {
            session.close();
        }
    }

    /// Applies a state transition; false if it is not valid from the current state.
    fn advance(&self, next: ConnectionState) -> bool {
        self.shared.state.send_if_modified(|state| match state.transition_to(next) {
            Ok(next) => {
                *state = next;
                true
            }
            Err(_) => false,
        })
    }

    async fn reconnect_loop(self) {
        // Subscriptions end with the old session and are replaced on `Reconnected`.
        self.close_pubsub().await;

        let backoff = self.shared.bus.reconnect.clone();
        let mut attempt = 1;

        loop {
            tokio::select! {
                _ = self.shared.shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff.delay_for(attempt)) => {}
            }

            match open_command_connection(&self.shared.client, self.shared.connect_timeout).await {
                Ok(connection) => {
                    *self.shared.connection.write().await = Some(connection);
                    if self.advance(ConnectionState::Connected) {
                        tracing::info!(attempt, "Redis connection re-established");
                        let _ = self.shared.events.send(ConnectionEvent::Reconnected);
                    }
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Redis reconnect attempt failed");

                    if !backoff.allows_attempt(attempt + 1) {
                        if self.advance(ConnectionState::Failed) {
                            tracing::error!(attempts = attempt, "Redis reconnection exhausted");
                            let _ = self.shared.events.send(ConnectionEvent::Failed);
                        }
                        return;
                    }

                    attempt += 1;
                    if !self.advance(ConnectionState::Reconnecting { attempt }) {
                        return;
                    }
                }
            }
        }
    }
}

async fn open_command_connection(
    client: &redis::Client,
    timeout: Duration,
) -> Result<MultiplexedConnection, ConnectError> {
    let connect = async {
        let mut connection = client.get_multiplexed_tokio_connection().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut connection)
            .await?;
        Ok::<_, redis::RedisError>(connection)
    };

    tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| ConnectError::Timeout(timeout))?
        .map_err(ConnectError::Unreachable)
}

#[async_trait]
impl BusConnectionFactory for RedisConnectionManager {
    async fn publisher(&self) -> Result<Arc<dyn Publisher>, PublishError> {
        if self.state().is_fatal() {
            return Err(PublishError::ConnectionLost);
        }
        Ok(Arc::new(RedisPublisher::new(self.clone())))
    }

    async fn subscriber(&self) -> Result<Arc<dyn Subscriber>, SubscribeError> {
        if self.state().is_fatal() {
            return Err(SubscribeError::ConnectionLost);
        }
        Ok(Arc::new(RedisSubscriber::new(self.clone())))
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }
}

impl std::fmt::Debug for RedisConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnectionManager")
            .field("state", &self.state())
            .field("bus", &self.shared.bus)
            .finish_non_exhaustive()
    }
}
