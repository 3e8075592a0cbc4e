//! # Node Module
//!
//! One [`Node`] owns the connection to one Lavalink process: a WebSocket for
//! commands, telemetry and events, plus the REST endpoints for track loading
//! and route planner management.
//!
//! ## Lifecycle
//!
//! A node is created by [`SolarClient::add_node`](crate::SolarClient::add_node)
//! and immediately enters its supervisory loop (`connection.rs`):
//!
//! ```text
//! disconnected -> connecting -> open -> closed/error -> reconnecting -> ...
//! ```
//!
//! The loop only ends when the node is stopped, when its reconnect budget is
//! exhausted, or when the node rejects our credentials. Whenever a session
//! ends the owning client is told so its players can move to another node.
//!
//! ## Outbound commands
//!
//! Commands are queued on a bounded channel drained by the session loop, so
//! [`Node::send`] only fails when the node has no open socket.

mod connection;
mod http;
pub mod protocol;

use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashSet,
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Weak,
    },
};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    protocol::{frame::coding::CloseCode, CloseFrame},
    Message,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    client::ClientInner,
    config::{NodeConfig, ReconnectPolicy},
    error::{Error, Result},
    model::{GuildId, Stats, UserId, UNAVAILABLE_PENALTY},
};

pub use protocol::{Band, Command};

/// Outbound frames buffered per open socket.
const OUTBOUND_BUFFER: usize = 64;

pub struct Node {
    config: NodeConfig,
    policy: ReconnectPolicy,
    user_id: UserId,
    shard_count: u32,
    reconnect_attempts: AtomicU32,
    stats: RwLock<Option<Stats>>,
    players: Mutex<HashSet<GuildId>>,
    sender: Mutex<Option<mpsc::Sender<Message>>>,
    http: reqwest::Client,
    shutdown: CancellationToken,
    client: Weak<ClientInner>,
}

impl Node {
    pub(crate) fn new(
        config: NodeConfig,
        policy: ReconnectPolicy,
        user_id: UserId,
        shard_count: u32,
        client: Weak<ClientInner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            reconnect_attempts: AtomicU32::new(config.reconnect_attempts),
            config,
            policy,
            user_id,
            shard_count,
            stats: RwLock::new(None),
            players: Mutex::new(HashSet::new()),
            sender: Mutex::new(None),
            http: reqwest::Client::new(),
            shutdown: CancellationToken::new(),
            client,
        })
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// `host:port`, the node's identity.
    pub fn address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    pub fn region(&self) -> Option<&str> {
        self.config.region.as_deref()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Reconnect attempts left before the node gives up.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Acquire)
    }

    /// Whether the node currently has an open socket.
    pub fn available(&self) -> bool {
        self.sender.lock().as_ref().is_some_and(|sender| !sender.is_closed())
    }

    /// Latest telemetry snapshot, if any arrived on the current socket.
    pub fn stats(&self) -> Option<Stats> {
        self.stats.read().clone()
    }

    /// Load score for node selection. Unavailable nodes and nodes without
    /// stats get [`UNAVAILABLE_PENALTY`].
    pub fn penalty(&self) -> f64 {
        if !self.available() {
            return UNAVAILABLE_PENALTY;
        }

        self.stats.read().as_ref().map_or(UNAVAILABLE_PENALTY, Stats::penalty)
    }

    /// Guilds whose player is assigned to this node.
    pub fn player_ids(&self) -> Vec<GuildId> {
        self.players.lock().iter().copied().collect()
    }

    pub(crate) fn add_player(&self, guild_id: GuildId) {
        self.players.lock().insert(guild_id);
    }

    pub(crate) fn remove_player(&self, guild_id: GuildId) {
        self.players.lock().remove(&guild_id);
    }

    pub(crate) fn take_players(&self) -> Vec<GuildId> {
        self.players.lock().drain().collect()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Queues `command` on the open socket.
    pub async fn send(&self, command: &Command) -> Result<()> {
        let payload = serde_json::to_string(command)?;
        self.send_message(Message::Text(payload)).await
    }

    async fn send_message(&self, message: Message) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| Error::NodeUnavailable(self.address()))?;

        trace!("-> {}: {:?}", self.address(), message);

        sender
            .send(message)
            .await
            .map_err(|_| Error::NodeUnavailable(self.address()))
    }

    /// Closes the socket with a normal close code. The supervisory loop will
    /// connect again; use [`Node::stop`] to shut the node down for good.
    ///
    /// Does nothing when the socket is already closed.
    pub async fn close(&self) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };

        if self.send_message(Message::Close(Some(frame))).await.is_err() {
            debug!("Node {} already closed", self.address());
        }
    }

    /// Stops the supervisory loop. The socket is closed normally and the
    /// node's players are handed back to the client.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub(crate) fn client(&self) -> Option<Arc<ClientInner>> {
        self.client.upgrade()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.address())
            .field("region", &self.config.region)
            .field("available", &self.available())
            .field("reconnect_attempts", &self.reconnect_attempts())
            .field("players", &self.players.lock().len())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_penalty_requires_connection_and_stats() {
        let (node, _rx) = attached_node("a", None, None, Weak::new());
        assert!(node.available());
        assert_eq!(node.penalty(), UNAVAILABLE_PENALTY);

        *node.stats.write() = Some(stats_with_penalty(10));
        assert!((node.penalty() - 10.0).abs() < 1e-9);

        detach(&node);
        assert!(!node.available());
        assert_eq!(node.penalty(), UNAVAILABLE_PENALTY);
    }

    #[tokio::test]
    async fn test_send_requires_open_socket() {
        let (node, mut rx) = attached_node("a", None, None, Weak::new());
        node.send(&Command::Stop { guild_id: GuildId::new(5) }).await.unwrap();

        let frames = drain(&mut rx);
        assert_eq!(frames, vec![serde_json::json!({ "op": "stop", "guildId": "5" })]);

        detach(&node);
        let err = node.send(&Command::Stop { guild_id: GuildId::new(5) }).await.unwrap_err();
        assert!(matches!(err, Error::NodeUnavailable(address) if address == "a:2333"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (node, mut rx) = attached_node("a", None, None, Weak::new());
        node.close().await;
        assert!(matches!(rx.try_recv(), Ok(Message::Close(Some(frame))) if frame.code == CloseCode::Normal));

        detach(&node);
        node.close().await;
        node.close().await;
    }

    #[test]
    fn test_player_bookkeeping() {
        let node = Node::new(
            NodeConfig::new("a", 2333, "pw"),
            ReconnectPolicy::default(),
            UserId::new(1),
            1,
            Weak::new(),
        );
        node.add_player(GuildId::new(1));
        node.add_player(GuildId::new(2));
        node.remove_player(GuildId::new(1));
        assert_eq!(node.player_ids(), vec![GuildId::new(2)]);

        assert_eq!(node.take_players(), vec![GuildId::new(2)]);
        assert!(node.player_ids().is_empty());
    }
}
