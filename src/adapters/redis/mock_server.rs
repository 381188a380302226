//! Minimal in-process Redis speaking just enough RESP for the adapters:
//! PING, SUBSCRIBE, UNSUBSCRIBE and PUBLISH.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Client {
    channels: HashSet<String>,
    subscribed_once: bool,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    kill: CancellationToken,
}

#[derive(Default)]
struct ServerState {
    opened: AtomicUsize,
    subscriber_connections: AtomicUsize,
    next_client: AtomicU64,
    clients: Mutex<HashMap<u64, Client>>,
}

pub(crate) struct MockRedis {
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
}

impl MockRedis {
    pub(crate) async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState::default());
        let shutdown = CancellationToken::new();

        {
            let state = state.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let accepted = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        accepted = listener.accept() => accepted,
                    };
                    let Ok((socket, _)) = accepted else { break };
                    tokio::spawn(serve(state.clone(), socket, shutdown.child_token()));
                }
            });
        }

        Self {
            addr,
            state,
            shutdown,
        }
    }

    pub(crate) fn url(&self) -> String {
        format!("redis://{}/", self.addr)
    }

    /// Connections accepted so far.
    pub(crate) fn connections_opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Connections that issued at least one SUBSCRIBE.
    pub(crate) fn subscriber_connections(&self) -> usize {
        self.state.subscriber_connections.load(Ordering::SeqCst)
    }

    /// Connections currently subscribed to `channel`.
    pub(crate) fn subscriber_count(&self, channel: &str) -> usize {
        self.state
            .clients
            .lock()
            .unwrap()
            .values()
            .filter(|client| client.channels.contains(channel))
            .count()
    }

    pub(crate) async fn wait_for_subscribers(&self, channel: &str, expected: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while self.subscriber_count(channel) != expected {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {} subscribers on {}",
                expected,
                channel
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub(crate) fn publish(&self, channel: &str, payload: &[u8]) -> usize {
        self.state.publish(channel.as_bytes(), payload)
    }

    /// Closes every connection that has subscriptions.
    pub(crate) fn drop_subscriber_connections(&self) {
        for client in self.state.clients.lock().unwrap().values() {
            if !client.channels.is_empty() {
                client.kill.cancel();
            }
        }
    }

    /// Stops accepting and closes every connection.
    pub(crate) fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for MockRedis {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl ServerState {
    fn publish(&self, channel: &[u8], payload: &[u8]) -> usize {
        let name = String::from_utf8_lossy(channel);
        let frame = array(&[bulk(b"message"), bulk(channel), bulk(payload)]);

        let clients = self.clients.lock().unwrap();
        clients
            .values()
            .filter(|client| client.channels.contains(name.as_ref()))
            .filter(|client| client.outbox.send(frame.clone()).is_ok())
            .count()
    }

    fn execute(&self, id: u64, args: Vec<Vec<u8>>) -> Vec<u8> {
        let Some((name, rest)) = args.split_first() else {
            return b"-ERR empty command\r\n".to_vec();
        };

        match name.to_ascii_uppercase().as_slice() {
            b"PING" => b"+PONG\r\n".to_vec(),
            b"SUBSCRIBE" => self.change_subscriptions(id, rest, true),
            b"UNSUBSCRIBE" => self.change_subscriptions(id, rest, false),
            b"PUBLISH" if rest.len() == 2 => {
                format!(":{}\r\n", self.publish(&rest[0], &rest[1])).into_bytes()
            }
            _ => b"-ERR unknown command\r\n".to_vec(),
        }
    }

    fn change_subscriptions(&self, id: u64, channels: &[Vec<u8>], subscribe: bool) -> Vec<u8> {
        let mut clients = self.clients.lock().unwrap();
        let Some(client) = clients.get_mut(&id) else {
            return Vec::new();
        };

        if subscribe && !client.subscribed_once {
            client.subscribed_once = true;
            self.subscriber_connections.fetch_add(1, Ordering::SeqCst);
        }

        let kind: &[u8] = if subscribe { b"subscribe" } else { b"unsubscribe" };
        let mut reply = Vec::new();
        for channel in channels {
            let name = String::from_utf8_lossy(channel).into_owned();
            if subscribe {
                client.channels.insert(name);
            } else {
                client.channels.remove(&name);
            }
            let count = format!(":{}\r\n", client.channels.len()).into_bytes();
            reply.extend(array(&[bulk(kind), bulk(channel), count]));
        }
        reply
    }
}

async fn serve(state: Arc<ServerState>, socket: TcpStream, kill: CancellationToken) {
    let id = state.next_client.fetch_add(1, Ordering::SeqCst);
    state.opened.fetch_add(1, Ordering::SeqCst);

    let (read, mut write) = socket.into_split();
    let (outbox, mut outgoing) = mpsc::unbounded_channel::<Vec<u8>>();
    state.clients.lock().unwrap().insert(
        id,
        Client {
            channels: HashSet::new(),
            subscribed_once: false,
            outbox: outbox.clone(),
            kill: kill.clone(),
        },
    );

    let writer = tokio::spawn(async move {
        while let Some(bytes) = outgoing.recv().await {
            if write.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut reader = BufReader::new(read);
    loop {
        let command = tokio::select! {
            _ = kill.cancelled() => break,
            command = read_command(&mut reader) => command,
        };
        let Some(args) = command else { break };
        let reply = state.execute(id, args);
        if outbox.send(reply).is_err() {
            break;
        }
    }

    state.clients.lock().unwrap().remove(&id);
    writer.abort();
}

async fn read_command<R: AsyncBufRead + Unpin>(reader: &mut R) -> Option<Vec<Vec<u8>>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await.ok()? == 0 {
        return None;
    }
    let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_line(&mut line).await.ok()?;
        let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
        let mut data = vec![0; len + 2];
        reader.read_exact(&mut data).await.ok()?;
        data.truncate(len);
        args.push(data);
    }
    Some(args)
}

fn bulk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

fn array(items: &[Vec<u8>]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", items.len()).into_bytes();
    for item in items {
        out.extend_from_slice(item);
    }
    out
}
