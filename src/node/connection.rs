use futures::{SinkExt, StreamExt};
use std::{
    io::ErrorKind,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::HeaderValue,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use super::{
    protocol::{self, Command, Frame},
    Node, OUTBOUND_BUFFER,
};
use crate::error::{Error, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLIENT_NAME: &str = concat!("solarlink/", env!("CARGO_PKG_VERSION"));

/// How a session on an open socket ended without an error.
enum SessionEnd {
    /// The node closed the socket; connect again.
    Reconnect,
    /// The node was stopped.
    Shutdown,
}

impl Node {
    /// Opens one WebSocket to the node with the identity headers.
    ///
    /// A 401/403 handshake response becomes [`Error::Authentication`].
    pub(crate) async fn connect(&self) -> Result<Socket> {
        let mut request = self.config.websocket_url().as_str().into_client_request()?;

        let headers = request.headers_mut();
        headers.insert("Authorization", header_value(&self.config.password)?);
        headers.insert("User-Id", header_value(&self.user_id.to_string())?);
        headers.insert("Num-Shards", header_value(&self.shard_count.to_string())?);
        headers.insert("Client-Name", HeaderValue::from_static(CLIENT_NAME));
        if let Some(key) = &self.config.resume_key {
            headers.insert("Resume-Key", header_value(key)?);
        }

        match connect_async(request).await {
            Ok((socket, _response)) => Ok(socket),
            Err(tungstenite::Error::Http(response)) if matches!(response.status().as_u16(), 401 | 403) => {
                Err(Error::Authentication {
                    host: self.address(),
                    status: response.status().as_u16(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The node's supervisory loop. Runs until the node is stopped, runs out
    /// of reconnect attempts, or fails authentication.
    ///
    /// `waiter` is resolved once: `Ok` on the first successful connect, the
    /// terminal error otherwise. The client's disconnect hook runs on every
    /// exit path.
    pub(crate) async fn run(self: Arc<Self>, waiter: oneshot::Sender<Result<()>>) {
        let mut waiter = Some(waiter);

        let result = self.supervise(&mut waiter).await;
        *self.sender.lock() = None;

        match result {
            Ok(()) => {
                info!("🔌 Node {} stopped", self.address());
                if let Some(waiter) = waiter.take() {
                    let _ = waiter.send(Err(Error::NodeUnavailable(self.address())));
                }
            }
            Err(err) => {
                error!("❌ Node {} gave up: {}", self.address(), err);
                if let Some(client) = self.client() {
                    client.report(format!("node {}", self.address()), &err).await;
                }
                if let Some(waiter) = waiter.take() {
                    let _ = waiter.send(Err(err));
                }
            }
        }

        if let Some(client) = self.client() {
            if let Err(err) = client.node_disconnected(&self).await {
                client.report("node_disconnected", &err).await;
            }
        }
    }

    async fn supervise(self: &Arc<Self>, waiter: &mut Option<oneshot::Sender<Result<()>>>) -> Result<()> {
        loop {
            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                result = tokio::time::timeout(self.policy.connect_timeout, self.connect()) => {
                    result.unwrap_or(Err(Error::Timeout(self.policy.connect_timeout)))
                }
            };

            let outcome = match connected {
                Ok(socket) => {
                    self.reconnect_attempts
                        .store(self.config.reconnect_attempts, Ordering::Release);
                    info!("✅ Connected to node {}", self.address());

                    let outcome = self.session(socket, waiter).await;
                    *self.sender.lock() = None;

                    if !matches!(outcome, Ok(SessionEnd::Shutdown)) {
                        if let Some(client) = self.client() {
                            if let Err(err) = client.node_disconnected(self).await {
                                client.report("node_disconnected", &err).await;
                            }
                        }
                    }

                    outcome
                }
                Err(err) => Err(err),
            };

            let delay = match outcome {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::Reconnect) => {
                    info!("🔄 Node {} closed the connection, reconnecting", self.address());
                    self.policy.retry_delay
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    let remaining = self.consume_attempt();
                    if remaining == 0 {
                        return Err(err);
                    }

                    let delay = self.backoff(&err);
                    warn!(
                        "Node {} connection failed ({}), {} attempts left, retrying in {:?}",
                        self.address(),
                        err,
                        remaining,
                        delay
                    );
                    delay
                }
            };

            if !delay.is_zero() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    /// Drives one open socket until it closes.
    async fn session(
        self: &Arc<Self>,
        socket: Socket,
        waiter: &mut Option<oneshot::Sender<Result<()>>>,
    ) -> Result<SessionEnd> {
        let (mut sink, mut stream) = socket.split();

        if let Some(key) = &self.config.resume_key {
            let command = Command::ConfigureResuming {
                key: key.clone(),
                timeout: self.config.resume_timeout.as_secs(),
            };
            sink.send(Message::Text(serde_json::to_string(&command)?)).await?;
        }

        let (tx, mut rx) = mpsc::channel(OUTBOUND_BUFFER);
        *self.sender.lock() = Some(tx);
        *self.stats.write() = None;

        if let Some(waiter) = waiter.take() {
            let _ = waiter.send(Ok(()));
        }

        // Migration sends through this socket, so it cannot run inline.
        if let Some(client) = self.client() {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = client.node_connected(&node).await {
                    client.report("node_connected", &err).await;
                }
            });
        }

        let read_timeout = self.policy.read_timeout;
        let mut deadline = Instant::now() + read_timeout;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    return Ok(SessionEnd::Shutdown);
                }
                outbound = rx.recv() => match outbound {
                    Some(message) => sink.send(message).await?,
                    None => return Ok(SessionEnd::Reconnect),
                },
                _ = tokio::time::sleep_until(deadline) => {
                    debug!("Node {} silent for {:?}", self.address(), read_timeout);
                    return Err(Error::Timeout(read_timeout));
                }
                frame = stream.next() => {
                    deadline = Instant::now() + read_timeout;

                    match frame {
                        Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                        Some(Ok(Message::Close(frame))) => {
                            debug!("Node {} sent close: {:?}", self.address(), frame);
                            return Ok(SessionEnd::Reconnect);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return Err(err.into()),
                        None => return Ok(SessionEnd::Reconnect),
                    }
                }
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        let Some(client) = self.client() else {
            return;
        };

        match protocol::parse_frame(text) {
            Ok(Frame::Stats(stats)) => {
                *self.stats.write() = Some(stats);
            }
            Ok(Frame::PlayerUpdate { guild_id, state }) => {
                // The player may have been removed concurrently.
                if let Some(player) = client.player(guild_id) {
                    player.update_state(state);
                }
            }
            Ok(Frame::Event(data)) => client.dispatch_event(data),
            Err(err) => client.spawn_report(format!("node {}", self.address()), err),
        }
    }

    /// Uses up one reconnect attempt and returns how many are left.
    fn consume_attempt(&self) -> u32 {
        self.reconnect_attempts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
            .map_or(0, |before| before - 1)
    }

    /// Delay before the next connect attempt after `err`.
    pub(crate) fn backoff(&self, err: &Error) -> Duration {
        match err {
            Error::Timeout(_) => Duration::ZERO,
            Error::WebSocket(ws) => match ws {
                tungstenite::Error::Http(_)
                | tungstenite::Error::ConnectionClosed
                | tungstenite::Error::AlreadyClosed
                | tungstenite::Error::Protocol(_) => Duration::ZERO,
                tungstenite::Error::Io(io) if is_unreachable(io.kind()) => self.policy.unreachable_delay,
                _ => self.policy.retry_delay,
            },
            Error::Io(io) if is_unreachable(io.kind()) => self.policy.unreachable_delay,
            _ => self.policy.retry_delay,
        }
    }
}

fn is_unreachable(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::AddrNotAvailable
            | ErrorKind::NotFound
    )
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|err| Error::InvalidHeader(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{NodeConfig, ReconnectPolicy},
        model::UserId,
    };
    use std::sync::Weak;
    use tokio_tungstenite::tungstenite::error::ProtocolError;

    fn node(attempts: u32) -> Arc<Node> {
        Node::new(
            NodeConfig::new("localhost", 2333, "pw").with_reconnect_attempts(attempts),
            ReconnectPolicy::default(),
            UserId::new(1),
            1,
            Weak::new(),
        )
    }

    #[test]
    fn test_backoff_classification() {
        let node = node(3);
        let policy = ReconnectPolicy::default();

        assert_eq!(node.backoff(&Error::Timeout(Duration::from_secs(30))), Duration::ZERO);
        assert_eq!(
            node.backoff(&Error::WebSocket(tungstenite::Error::ConnectionClosed)),
            Duration::ZERO
        );
        assert_eq!(
            node.backoff(&Error::WebSocket(tungstenite::Error::Protocol(
                ProtocolError::HandshakeIncomplete
            ))),
            Duration::ZERO
        );
        assert_eq!(
            node.backoff(&Error::WebSocket(tungstenite::Error::Io(std::io::Error::from(
                ErrorKind::ConnectionRefused
            )))),
            policy.unreachable_delay
        );
        assert_eq!(
            node.backoff(&Error::Io(std::io::Error::from(ErrorKind::PermissionDenied))),
            policy.retry_delay
        );
        assert_eq!(node.backoff(&Error::MalformedFrame("x".into())), policy.retry_delay);
    }

    #[test]
    fn test_consume_attempt_stops_at_zero() {
        let node = node(2);
        assert_eq!(node.consume_attempt(), 1);
        assert_eq!(node.consume_attempt(), 0);
        assert_eq!(node.consume_attempt(), 0);
        assert_eq!(node.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_node_exhausts_attempts() {
        // Nothing listens on port 9 of localhost in the test environment.
        let mut config = NodeConfig::new("127.0.0.1", 9, "pw").with_reconnect_attempts(2);
        config.resume_key = None;
        let policy = ReconnectPolicy {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            unreachable_delay: Duration::from_millis(10),
            retry_delay: Duration::from_millis(10),
        };
        let node = Node::new(config, policy, UserId::new(1), 1, Weak::new());

        let (tx, rx) = oneshot::channel();
        tokio::spawn(Arc::clone(&node).run(tx));

        let result = rx.await.unwrap();
        assert!(result.is_err());
        assert!(!node.available());
        assert_eq!(node.reconnect_attempts(), 0);
    }
}
