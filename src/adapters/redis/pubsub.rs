//! Shared pub/sub connection.
//!
//! Every subscription of a process is multiplexed onto one Redis pub/sub
//! connection. The connection's handshake runs through `redis::aio`, after
//! which the socket is split:
//!
//! ```text
//! subscribe/release ──SUBSCRIBE/UNSUBSCRIBE──▶ write half
//! read half ──frames──▶ PubSubSession::run ──by channel──▶ route senders ──▶ delivery loops
//! ```
//!
//! Command writes are serialized with routing-table updates, so the order
//! in which routes are added and removed matches the order the server
//! sees SUBSCRIBE and UNSUBSCRIBE for a channel.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use redis::{ConnectionAddr, ConnectionInfo, ErrorKind, RedisError, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::ports::SubscribeError;

use super::error::subscribe_error;

/// Why a session's reader stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    Closed,
    StreamClosed,
}

/// Raw reply stream of a pub/sub connection.
pub(crate) type FrameStream = Pin<Box<dyn Stream<Item = Value> + Send>>;

struct Route {
    id: u64,
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

#[derive(Default)]
struct Routes {
    channels: HashMap<String, Vec<Route>>,
    confirmations: HashMap<String, VecDeque<oneshot::Sender<()>>>,
}

/// One pub/sub connection shared by every subscription of a process.
pub(crate) struct PubSubSession {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    routes: std::sync::Mutex<Routes>,
    next_route: AtomicU64,
    closed: CancellationToken,
}

impl PubSubSession {
    /// Connects and authenticates a pub/sub connection.
    ///
    /// The returned frame stream must be handed to [`PubSubSession::run`].
    pub(crate) async fn open(
        info: &ConnectionInfo,
    ) -> Result<(Arc<Self>, FrameStream), RedisError> {
        let stream = match &info.addr {
            ConnectionAddr::Tcp(host, port) => TcpStream::connect((host.as_str(), *port)).await?,
            other => {
                return Err(RedisError::from((
                    ErrorKind::InvalidClientConfig,
                    "Shared pub/sub requires a plain TCP address",
                    other.to_string(),
                )))
            }
        };
        stream.set_nodelay(true)?;

        let (read, write) = stream.into_split();
        let writer = Arc::new(Mutex::new(write));
        let handshake = SessionStream {
            read,
            writer: writer.clone(),
        };

        // `Monitor` only supplies the untyped reply stream; MONITOR is never sent.
        let connection = redis::aio::Connection::new(&info.redis, handshake).await?;
        let frames: FrameStream = Box::pin(connection.into_monitor().into_on_message::<Value>());

        Ok((Arc::new(Self::with_writer(writer)), frames))
    }

    fn with_writer(writer: Arc<Mutex<OwnedWriteHalf>>) -> Self {
        Self {
            writer,
            routes: std::sync::Mutex::new(Routes::default()),
            next_route: AtomicU64::new(0),
            closed: CancellationToken::new(),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Routes incoming frames until the connection ends or the session is closed.
    ///
    /// Either way every route is dropped, which ends the delivery loops
    /// reading from them.
    pub(crate) async fn run(self: Arc<Self>, frames: FrameStream) -> SessionEnd {
        futures::pin_mut!(frames);

        let end = loop {
            let frame = tokio::select! {
                biased;
                _ = self.closed.cancelled() => break SessionEnd::Closed,
                next = frames.next() => match next {
                    Some(value) => Frame::parse(value),
                    None => break SessionEnd::StreamClosed,
                },
            };
            self.handle_frame(frame);
        };

        self.close();
        end
    }

    /// Closes the connection and drops every route.
    pub(crate) fn close(&self) {
        self.closed.cancel();
        let mut routes = self.lock_routes();
        routes.channels.clear();
        routes.confirmations.clear();
    }

    /// Adds a route for `channel`, subscribing on the server if it is the first.
    ///
    /// Waits up to `timeout` for the server to confirm a new subscription.
    pub(crate) async fn subscribe(
        &self,
        channel: &str,
        timeout: Duration,
    ) -> Result<(u64, mpsc::UnboundedReceiver<Vec<u8>>), SubscribeError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_route.fetch_add(1, Ordering::Relaxed);

        let confirmed = {
            let mut writer = self.writer.lock().await;
            let confirmed = {
                let mut routes = self.lock_routes();
                if !self.is_open() {
                    return Err(SubscribeError::Unavailable(
                        "pub/sub connection closed".to_string(),
                    ));
                }

                let routes = &mut *routes;
                let entry = routes.channels.entry(channel.to_string()).or_default();
                entry.push(Route { id, sender });
                if entry.len() > 1 {
                    None
                } else {
                    let (tx, rx) = oneshot::channel();
                    routes
                        .confirmations
                        .entry(channel.to_string())
                        .or_default()
                        .push_back(tx);
                    Some(rx)
                }
            };

            if confirmed.is_some() {
                let command = redis::cmd("SUBSCRIBE").arg(channel).get_packed_command();
                if let Err(e) = writer.write_all(&command).await {
                    self.remove_route(channel, id);
                    return Err(subscribe_error(&RedisError::from(e), timeout));
                }
            }
            confirmed
        };

        if let Some(confirmed) = confirmed {
            let outcome = tokio::time::timeout(timeout, confirmed).await;
            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(_)) => Some(SubscribeError::Unavailable(
                    "pub/sub connection closed".to_string(),
                )),
                Err(_) => Some(SubscribeError::Timeout(timeout)),
            };
            if let Some(error) = error {
                self.release(channel, id).await;
                return Err(error);
            }
        }

        Ok((id, receiver))
    }

    /// Removes a route, unsubscribing on the server once no route remains.
    pub(crate) async fn release(&self, channel: &str, id: u64) {
        let mut writer = self.writer.lock().await;
        if !self.remove_route(channel, id) || !self.is_open() {
            return;
        }

        let command = redis::cmd("UNSUBSCRIBE").arg(channel).get_packed_command();
        if let Err(e) = writer.write_all(&command).await {
            tracing::debug!(channel, error = %e, "UNSUBSCRIBE failed");
        }
    }

    /// Number of channels with at least one route.
    #[cfg(test)]
    pub(crate) fn channel_count(&self) -> usize {
        self.lock_routes().channels.len()
    }

    /// Returns true if the channel has no routes left.
    fn remove_route(&self, channel: &str, id: u64) -> bool {
        let mut routes = self.lock_routes();
        let Some(entry) = routes.channels.get_mut(channel) else {
            return false;
        };
        entry.retain(|route| route.id != id);
        if entry.is_empty() {
            routes.channels.remove(channel);
            true
        } else {
            false
        }
    }

    fn handle_frame(&self, frame: Frame) {
        let mut routes = self.lock_routes();
        match frame {
            Frame::Message { channel, payload } => {
                if let Some(entry) = routes.channels.get_mut(&channel) {
                    entry.retain(|route| route.sender.send(payload.clone()).is_ok());
                } else {
                    tracing::trace!(channel = %channel, "Message for released channel");
                }
            }
            Frame::Subscribed(channel) => {
                if let Some(waiting) = routes.confirmations.get_mut(&channel) {
                    while let Some(confirm) = waiting.pop_front() {
                        if confirm.send(()).is_ok() {
                            break;
                        }
                    }
                    if waiting.is_empty() {
                        routes.confirmations.remove(&channel);
                    }
                }
            }
            Frame::Other => {}
        }
    }

    fn lock_routes(&self) -> std::sync::MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Pub/sub reply kinds the session acts on.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Message { channel: String, payload: Vec<u8> },
    Subscribed(String),
    Other,
}

impl Frame {
    fn parse(value: Value) -> Self {
        let Value::Bulk(items) = value else {
            return Frame::Other;
        };
        let mut items = items.into_iter();
        let (Some(Value::Data(kind)), Some(Value::Data(channel))) = (items.next(), items.next())
        else {
            return Frame::Other;
        };
        let Ok(channel) = String::from_utf8(channel) else {
            return Frame::Other;
        };

        match (kind.as_slice(), items.next()) {
            (b"message", Some(Value::Data(payload))) => Frame::Message { channel, payload },
            (b"subscribe", _) => Frame::Subscribed(channel),
            _ => Frame::Other,
        }
    }
}

/// Socket view used for the handshake.
///
/// Reads own the read half; writes share the session's write half, which
/// nothing else holds until the handshake is done.
struct SessionStream {
    read: OwnedReadHalf,
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

impl SessionStream {
    fn poll_with_writer<T>(
        &self,
        f: impl FnOnce(Pin<&mut OwnedWriteHalf>) -> Poll<io::Result<T>>,
    ) -> Poll<io::Result<T>> {
        match self.writer.try_lock() {
            Ok(mut writer) => f(Pin::new(&mut *writer)),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "pub/sub writer in use",
            ))),
        }
    }
}

impl AsyncRead for SessionStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().read).poll_read(cx, buf)
    }
}

impl AsyncWrite for SessionStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_with_writer(|writer| writer.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_with_writer(|writer| writer.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_with_writer(|writer| writer.poll_shutdown(cx))
    }
}
