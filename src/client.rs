//! # Client
//!
//! [`SolarClient`] owns the node pool and one [`Player`] per guild.
//!
//! ## Node selection
//!
//! New players go to the available node with the lowest penalty, preferring
//! nodes in the requested region when any are up.
//!
//! ## Failover
//!
//! When a node's session ends, each of its players is moved to the best
//! remaining node near the same region. When no node is left the players
//! wait in a backlog until the next node connects.

use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::try_join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::{NodeConfig, ReconnectPolicy},
    error::{Error, Result},
    events::{self, EventHandler, NodeEvent},
    gateway::VoiceGateway,
    model::{ChannelId, GuildId, LoadResult, Track, TrackInfo, UserId},
    node::Node,
    player::Player,
};

pub(crate) struct ClientInner {
    gateway: Arc<dyn VoiceGateway>,
    handler: Arc<dyn EventHandler>,
    policy: ReconnectPolicy,
    nodes: RwLock<Vec<Arc<Node>>>,
    players: DashMap<GuildId, Arc<Player>>,
    /// Players whose node went away while no replacement was available.
    player_queue: Mutex<Vec<Arc<Player>>>,
    shutdown: CancellationToken,
}

impl ClientInner {
    pub(crate) fn player(&self, guild_id: GuildId) -> Option<Arc<Player>> {
        self.players.get(&guild_id).map(|player| Arc::clone(player.value()))
    }

    pub(crate) fn forget_player(&self, guild_id: GuildId) {
        self.players.remove(&guild_id);
        self.player_queue.lock().retain(|player| player.guild_id() != guild_id);
    }

    fn ideal_node(&self, region: Option<&str>, exclude: Option<&Arc<Node>>) -> Option<Arc<Node>> {
        let nodes = self
            .nodes
            .read()
            .iter()
            .filter(|node| node.available())
            .filter(|node| !exclude.is_some_and(|excluded| Arc::ptr_eq(excluded, *node)))
            .cloned()
            .collect::<Vec<_>>();

        let regional = match region {
            Some(region) => nodes.iter().filter(|node| node.region() == Some(region)).collect::<Vec<_>>(),
            None => Vec::new(),
        };
        let candidates = if regional.is_empty() { nodes.iter().collect() } else { regional };

        candidates
            .into_iter()
            .min_by(|a, b| a.penalty().total_cmp(&b.penalty()))
            .cloned()
    }

    /// Moves every backlogged player onto `node`.
    pub(crate) async fn node_connected(&self, node: &Arc<Node>) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }

        let waiting = std::mem::take(&mut *self.player_queue.lock());
        if waiting.is_empty() {
            return Ok(());
        }

        info!("♻️ Moving {} waiting players to {}", waiting.len(), node.address());
        self.migrate(waiting, node).await
    }

    /// Moves the players of `node` elsewhere, or parks them until a node
    /// connects.
    pub(crate) async fn node_disconnected(&self, node: &Arc<Node>) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }

        let orphans = node
            .take_players()
            .into_iter()
            .filter_map(|guild_id| self.player(guild_id))
            .collect::<Vec<_>>();
        if orphans.is_empty() {
            return Ok(());
        }

        match self.ideal_node(node.region(), Some(node)) {
            Some(replacement) => {
                info!(
                    "🔀 Moving {} players from {} to {}",
                    orphans.len(),
                    node.address(),
                    replacement.address()
                );
                self.migrate(orphans, &replacement).await
            }
            None => {
                warn!(
                    "⚠️ No node can take the {} players of {}, waiting for one to connect",
                    orphans.len(),
                    node.address()
                );
                self.park(orphans);
                Ok(())
            }
        }
    }

    /// Moves `players` onto `target` together. When one move fails the rest
    /// are cancelled, and every player that did not end up on a live
    /// `target` goes back to the backlog before the error is returned.
    async fn migrate(&self, players: Vec<Arc<Player>>, target: &Arc<Node>) -> Result<()> {
        let result = try_join_all(players.iter().map(|player| player.change_node(Arc::clone(target)))).await;

        let Err(err) = result else {
            return Ok(());
        };

        let stranded = players
            .into_iter()
            .filter(|player| self.players.contains_key(&player.guild_id()))
            .filter(|player| !Arc::ptr_eq(&player.node(), target) || !target.available())
            .collect::<Vec<_>>();
        for player in &stranded {
            target.remove_player(player.guild_id());
        }

        warn!(
            "⚠️ Moving players to {} failed ({}), {} back in the backlog",
            target.address(),
            err,
            stranded.len()
        );
        self.park(stranded);
        Err(err)
    }

    /// Adds players to the backlog, once per guild.
    fn park(&self, players: Vec<Arc<Player>>) {
        let mut queue = self.player_queue.lock();
        for player in players {
            if !queue.iter().any(|queued| queued.guild_id() == player.guild_id()) {
                queue.push(player);
            }
        }
    }

    /// Decodes an event frame and runs its handler in the background.
    pub(crate) fn dispatch_event(&self, data: Value) {
        let (guild_id, payload) = match events::parse_event(data) {
            Ok(parsed) => parsed,
            Err(err) => return self.spawn_report("event".to_string(), err),
        };

        let Some(player) = self.player(guild_id) else {
            debug!("Dropping event for unknown guild {}", guild_id);
            return;
        };

        let event = NodeEvent::new(player, payload);
        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            let name = event.name();
            if let Err(err) = events::dispatch(handler.as_ref(), event).await {
                handler.error(name, &err).await;
            }
        });
    }

    pub(crate) async fn report(&self, location: impl AsRef<str> + Send, err: &Error) {
        self.handler.error(location.as_ref(), err).await;
    }

    pub(crate) fn spawn_report(&self, location: String, err: Error) {
        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            handler.error(&location, &err).await;
        });
    }
}

/// Entry point of the library: nodes, players and voice forwarding.
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone)]
pub struct SolarClient {
    inner: Arc<ClientInner>,
}

impl SolarClient {
    pub fn new(gateway: Arc<dyn VoiceGateway>, handler: Arc<dyn EventHandler>) -> Self {
        Self::with_policy(gateway, handler, ReconnectPolicy::default())
    }

    pub fn with_policy(gateway: Arc<dyn VoiceGateway>, handler: Arc<dyn EventHandler>, policy: ReconnectPolicy) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                gateway,
                handler,
                policy,
                nodes: RwLock::new(Vec::new()),
                players: DashMap::new(),
                player_queue: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.inner.gateway.user_id()
    }

    // Nodes

    /// Registers a node and starts connecting it in the background.
    pub fn add_node(&self, config: NodeConfig) -> Arc<Node> {
        self.spawn_node(config).0
    }

    /// Registers a node and waits for its first successful connect. A node
    /// that never connects is removed again.
    pub async fn connect_node(&self, config: NodeConfig) -> Result<Arc<Node>> {
        let (node, waiter) = self.spawn_node(config);

        let result = waiter
            .await
            .unwrap_or_else(|_| Err(Error::NodeUnavailable(node.address())));

        match result {
            Ok(()) => Ok(node),
            Err(err) => {
                self.remove_node(&node);
                Err(err)
            }
        }
    }

    fn spawn_node(&self, config: NodeConfig) -> (Arc<Node>, oneshot::Receiver<Result<()>>) {
        let node = Node::new(
            config,
            self.inner.policy,
            self.inner.gateway.user_id(),
            self.inner.gateway.shard_count(),
            Arc::downgrade(&self.inner),
        );
        self.inner.nodes.write().push(Arc::clone(&node));

        let (tx, rx) = oneshot::channel();
        tokio::spawn(Arc::clone(&node).run(tx));

        info!("➕ Added node {}", node.address());
        (node, rx)
    }

    /// Stops `node` and drops it from the pool. Its players move elsewhere.
    pub fn remove_node(&self, node: &Arc<Node>) -> bool {
        let removed = {
            let mut nodes = self.inner.nodes.write();
            let before = nodes.len();
            nodes.retain(|candidate| !Arc::ptr_eq(candidate, node));
            nodes.len() != before
        };

        node.stop();
        if removed {
            info!("➖ Removed node {}", node.address());
        }
        removed
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.inner.nodes.read().clone()
    }

    /// The available node with the lowest penalty, preferring `region`.
    pub fn find_ideal_node(&self, region: Option<&str>) -> Option<Arc<Node>> {
        self.inner.ideal_node(region, None)
    }

    // Players

    /// Joins `channel_id`, creating the guild's player on the best node.
    ///
    /// An existing player is reused: nothing happens when it is already in
    /// `channel_id`, otherwise the bot is moved.
    pub async fn join_voice(&self, guild_id: GuildId, channel_id: ChannelId, region: Option<&str>) -> Result<Arc<Player>> {
        if let Some(player) = self.get_player(guild_id) {
            if player.channel_id() != Some(channel_id) {
                player.move_to(channel_id).await?;
            }
            return Ok(player);
        }

        let node = self.find_ideal_node(region).ok_or(Error::NoAvailableNodes)?;

        let player = match self.inner.players.entry(guild_id) {
            Entry::Occupied(entry) => return Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let player = Player::new(
                    guild_id,
                    channel_id,
                    node,
                    Arc::clone(&self.inner.gateway),
                    Arc::downgrade(&self.inner),
                );
                entry.insert(Arc::clone(&player));
                player
            }
        };

        if let Err(err) = self.inner.gateway.change_voice_state(guild_id, Some(channel_id)).await {
            self.inner.forget_player(guild_id);
            player.node().remove_player(guild_id);
            return Err(Error::Gateway(err));
        }

        info!("🔊 Guild {} joined {} on {}", guild_id, channel_id, player.node().address());
        Ok(player)
    }

    pub fn get_player(&self, guild_id: GuildId) -> Option<Arc<Player>> {
        self.inner.player(guild_id)
    }

    pub fn players(&self) -> Vec<Arc<Player>> {
        self.inner.players.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Players waiting for a node.
    pub fn player_queue_len(&self) -> usize {
        self.inner.player_queue.lock().len()
    }

    /// Stops every node. Node hooks become no-ops and players stay where
    /// they are.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
        for node in self.inner.nodes.read().iter() {
            node.stop();
        }
        info!("👋 Client stopped");
    }

    // REST

    fn rest_node(&self) -> Result<Arc<Node>> {
        self.find_ideal_node(None).ok_or(Error::NoAvailableNodes)
    }

    pub async fn get_tracks(&self, identifier: &str) -> Result<LoadResult> {
        self.rest_node()?.load_tracks(identifier).await
    }

    /// Loads `query` as is when it is a URL or carries a search prefix,
    /// and as a YouTube search otherwise.
    pub async fn search(&self, query: &str) -> Result<LoadResult> {
        let identifier = if Url::parse(query).is_ok() {
            query.to_string()
        } else {
            format!("ytsearch:{query}")
        };
        self.get_tracks(&identifier).await
    }

    pub async fn decode_track(&self, encoded: &str) -> Result<TrackInfo> {
        self.rest_node()?.decode_track(encoded).await
    }

    pub async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<Track>> {
        self.rest_node()?.decode_tracks(encoded).await
    }

    // Voice forwarding

    /// Forwards a `VOICE_SERVER_UPDATE`. A missing endpoint means the voice
    /// server is being reallocated and is ignored.
    pub async fn handle_voice_server_update(&self, guild_id: GuildId, token: &str, endpoint: Option<&str>) -> Result<()> {
        let Some(endpoint) = endpoint else {
            debug!("Voice server of guild {} is being reallocated", guild_id);
            return Ok(());
        };
        let Some(player) = self.get_player(guild_id) else {
            return Ok(());
        };

        player
            .update_voice_server(json!({
                "token": token,
                "guild_id": guild_id,
                "endpoint": endpoint,
            }))
            .await
    }

    /// Forwards a `VOICE_STATE_UPDATE` of the bot itself. Leaving the
    /// channel destroys the guild's player.
    pub async fn handle_voice_state_update(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        channel_id: Option<ChannelId>,
        session_id: &str,
    ) -> Result<()> {
        if user_id != self.user_id() {
            return Ok(());
        }
        let Some(player) = self.get_player(guild_id) else {
            return Ok(());
        };

        match channel_id {
            Some(channel_id) => {
                player.set_channel_id(Some(channel_id));
                player.update_voice_session(session_id.to_string()).await
            }
            None => {
                info!("👋 Guild {} left voice", guild_id);
                player.destroy().await;
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for SolarClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolarClient")
            .field("nodes", &self.inner.nodes.read().len())
            .field("players", &self.inner.players.len())
            .field("player_queue", &self.player_queue_len())
            .finish()
    }
}
