//! # Player Module
//!
//! A [`Player`] drives playback for one guild on one node.
//!
//! Every operation updates local state first and then sends exactly one
//! command to the owning node. Sends are best effort: state is not rolled
//! back when a send fails, and nothing is retried. After a node outage the
//! client moves the player with [`Player::change_node`], which replays the
//! voice session and the current track on the new node.
//!
//! ## Invariants
//!
//! - Only the current track can be paused; a player without a current track
//!   is never paused.
//! - The playback position is extrapolated from the last `playerUpdate` with
//!   a monotonic clock and clamped to the track duration.

pub mod equalizer;
mod queue;

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    client::ClientInner,
    error::{Error, Result},
    gateway::VoiceGateway,
    model::{ChannelId, ConfiguredTrack, GuildId},
    node::{protocol::PlayerUpdateState, Band, Command, Node},
};

use equalizer::{clamp_gain, EqPreset, BAND_COUNT};
use queue::TrackQueue;

pub const MAX_VOLUME: f32 = 10.0;
pub const DEFAULT_VOLUME: f32 = 1.0;

/// Voice session fields collected from the gateway. A voice update is sent
/// once both halves are known.
#[derive(Debug, Default, Clone)]
struct VoiceForward {
    session_id: Option<String>,
    event: Option<Value>,
}

impl VoiceForward {
    fn complete(&self, guild_id: GuildId) -> Option<Command> {
        match (&self.session_id, &self.event) {
            (Some(session_id), Some(event)) => Some(Command::VoiceUpdate {
                guild_id,
                session_id: session_id.clone(),
                event: event.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct PlayerState {
    channel_id: Option<ChannelId>,
    current: Option<ConfiguredTrack>,
    paused: bool,
    /// The current track changed while paused and was never sent to the node.
    pending_play: bool,
    queue: TrackQueue,
    position: Duration,
    position_update: Instant,
    volume: f32,
    bands: [f32; BAND_COUNT],
    forward: VoiceForward,
}

impl PlayerState {
    fn new(channel_id: ChannelId) -> Self {
        Self {
            channel_id: Some(channel_id),
            current: None,
            paused: false,
            pending_play: false,
            queue: TrackQueue::default(),
            position: Duration::ZERO,
            position_update: Instant::now(),
            volume: DEFAULT_VOLUME,
            bands: [0.0; BAND_COUNT],
            forward: VoiceForward::default(),
        }
    }

    fn reset_position(&mut self, position: Duration) {
        self.position = position;
        self.position_update = Instant::now();
    }

    fn position(&self) -> Duration {
        let Some(current) = &self.current else {
            return Duration::ZERO;
        };

        let position = if self.paused || self.pending_play {
            self.position
        } else {
            self.position + self.position_update.elapsed()
        };

        position.min(current.track().duration())
    }

    /// Sets `track` as current and returns the command that starts it, or
    /// nothing while paused.
    fn start(&mut self, guild_id: GuildId, track: ConfiguredTrack) -> Option<Command> {
        self.reset_position(track.start_time());
        let command = (!self.paused).then(|| play_command(guild_id, &track, None, None, None, false));
        self.pending_play = self.paused;
        self.current = Some(track);
        command
    }

    fn clear_current(&mut self) {
        self.current = None;
        self.paused = false;
        self.pending_play = false;
        self.reset_position(Duration::ZERO);
    }
}

fn play_command(
    guild_id: GuildId,
    track: &ConfiguredTrack,
    start: Option<Duration>,
    pause: Option<bool>,
    volume: Option<u32>,
    no_replace: bool,
) -> Command {
    let mut data = track.un_pack();
    if let Some(start) = start.filter(|start| !start.is_zero()) {
        data.insert("startTime".into(), json!(start.as_millis() as u64));
    }

    Command::Play {
        guild_id,
        track: data,
        pause,
        volume,
        no_replace,
    }
}

fn wire_volume(volume: f32) -> u32 {
    (volume * 100.0).floor() as u32
}

pub struct Player {
    guild_id: GuildId,
    node: RwLock<Arc<Node>>,
    state: Mutex<PlayerState>,
    gateway: Arc<dyn VoiceGateway>,
    client: Weak<ClientInner>,
}

impl Player {
    pub(crate) fn new(
        guild_id: GuildId,
        channel_id: ChannelId,
        node: Arc<Node>,
        gateway: Arc<dyn VoiceGateway>,
        client: Weak<ClientInner>,
    ) -> Arc<Self> {
        node.add_player(guild_id);

        Arc::new(Self {
            guild_id,
            node: RwLock::new(node),
            state: Mutex::new(PlayerState::new(channel_id)),
            gateway,
            client,
        })
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        self.state.lock().channel_id
    }

    pub(crate) fn set_channel_id(&self, channel_id: Option<ChannelId>) {
        self.state.lock().channel_id = channel_id;
    }

    /// The node currently serving this player.
    pub fn node(&self) -> Arc<Node> {
        Arc::clone(&self.node.read())
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.node().send(&command).await
    }

    async fn send_all(&self, commands: impl IntoIterator<Item = Command>) -> Result<()> {
        let node = self.node();
        for command in commands {
            node.send(&command).await?;
        }
        Ok(())
    }

    // Queue

    /// Queues `track`, starting it right away when nothing is playing.
    pub async fn append(&self, track: ConfiguredTrack) -> Result<()> {
        let command = {
            let mut state = self.state.lock();
            if state.current.is_none() {
                state.start(self.guild_id, track)
            } else {
                state.queue.push(track);
                None
            }
        };

        if let Some(command) = command {
            self.send(command).await?;
        }
        Ok(())
    }

    /// Inserts `track` into the queue at `index` without touching playback.
    pub fn insert(&self, index: usize, track: ConfiguredTrack) {
        self.state.lock().queue.insert(index, track);
    }

    /// Starts the next track after the current one finished.
    ///
    /// Does nothing while paused, or when there is neither a current track
    /// nor anything queued.
    pub async fn play_next(&self) -> Result<()> {
        let command = {
            let mut state = self.state.lock();
            if state.paused {
                return Ok(());
            }
            if state.current.is_none() && state.queue.is_empty() {
                return Ok(());
            }

            let finished = state.current.take();
            let had_current = finished.is_some();

            match state.queue.advance(finished) {
                Some(next) => {
                    info!("🎵 Guild {} playing: {}", self.guild_id, next.track().title());
                    state.start(self.guild_id, next)
                }
                None => {
                    state.clear_current();
                    had_current.then_some(Command::Stop {
                        guild_id: self.guild_id,
                    })
                }
            }
        };

        if let Some(command) = command {
            self.send(command).await?;
        }
        Ok(())
    }

    /// `skip(0)` skips the current track and returns it. `skip(n)` removes and
    /// returns the `n`-th queued track (1-based) without touching playback.
    /// Returns `None` for an index past the queue.
    pub async fn skip(&self, index: usize) -> Result<Option<ConfiguredTrack>> {
        if index > 0 {
            return Ok(self.state.lock().queue.remove(index - 1));
        }

        let (skipped, command) = {
            let mut state = self.state.lock();
            let skipped = state.current.take();

            let command = match state.queue.take_next() {
                Some(next) => state.start(self.guild_id, next),
                None => {
                    state.clear_current();
                    skipped.as_ref().map(|_| Command::Stop {
                        guild_id: self.guild_id,
                    })
                }
            };

            (skipped, command)
        };

        if let Some(command) = command {
            self.send(command).await?;
        }
        Ok(skipped)
    }

    /// Removes the `index`-th queued track (0-based).
    pub async fn remove(&self, index: usize) -> Result<Option<ConfiguredTrack>> {
        self.skip(index + 1).await
    }

    /// Stops playback and clears the queue.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            let cleared = state.queue.clear();
            state.clear_current();
            debug!("Guild {} stopped, {} queued tracks dropped", self.guild_id, cleared);
        }

        self.send(Command::Stop {
            guild_id: self.guild_id,
        })
        .await
    }

    // Playback

    pub async fn pause(&self) -> Result<()> {
        self.set_pause(true).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.set_pause(false).await
    }

    /// Pauses or resumes the current track. Without a current track, or when
    /// already in the requested state, nothing is sent.
    pub async fn set_pause(&self, pause: bool) -> Result<()> {
        let command = {
            let mut state = self.state.lock();
            let Some(current) = state.current.clone() else {
                return Ok(());
            };
            if state.paused == pause {
                return Ok(());
            }

            if pause {
                let position = state.position();
                state.reset_position(position);
                state.paused = true;
                Command::Pause {
                    guild_id: self.guild_id,
                    pause: true,
                }
            } else if state.pending_play {
                let position = state.position;
                state.reset_position(position);
                state.paused = false;
                state.pending_play = false;
                play_command(self.guild_id, &current, Some(position), None, None, false)
            } else {
                let position = state.position;
                state.reset_position(position);
                state.paused = false;
                Command::Pause {
                    guild_id: self.guild_id,
                    pause: false,
                }
            }
        };

        self.send(command).await
    }

    /// Seeks within the current track.
    pub async fn seek(&self, position: Duration) -> Result<()> {
        let command = {
            let mut state = self.state.lock();
            let Some(current) = &state.current else {
                return Ok(());
            };

            let duration = current.track().duration();
            if position > duration {
                return Err(Error::InvalidPosition { position, duration });
            }

            state.reset_position(position);
            if state.pending_play {
                return Ok(());
            }

            Command::Seek {
                guild_id: self.guild_id,
                position: position.as_millis() as u64,
            }
        };

        self.send(command).await
    }

    /// Sets the volume on a `0.0..=10.0` scale, clamping out of range values.
    pub async fn set_volume(&self, volume: f32) -> Result<()> {
        let volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, MAX_VOLUME) };
        self.state.lock().volume = volume;

        self.send(Command::Volume {
            guild_id: self.guild_id,
            volume: wire_volume(volume),
        })
        .await
    }

    pub async fn set_gain(&self, band: usize, gain: f32) -> Result<()> {
        self.set_gains(&[(band, gain)]).await
    }

    /// Sets several band gains in one command. Every band is checked before
    /// anything is stored or sent; gains are clamped to `-0.25..=1.0`.
    pub async fn set_gains(&self, gains: &[(usize, f32)]) -> Result<()> {
        if let Some(&(band, _)) = gains.iter().find(|(band, _)| *band >= BAND_COUNT) {
            return Err(Error::InvalidBand(band));
        }

        let bands = {
            let mut state = self.state.lock();
            gains
                .iter()
                .map(|&(band, gain)| {
                    let gain = clamp_gain(gain);
                    state.bands[band] = gain;
                    Band { band, gain }
                })
                .collect::<Vec<_>>()
        };

        self.send(Command::Equalizer {
            guild_id: self.guild_id,
            bands,
        })
        .await
    }

    pub async fn apply_preset(&self, preset: &EqPreset) -> Result<()> {
        info!("🎛️ Guild {} equalizer preset: {}", self.guild_id, preset.name);
        self.set_gains(&preset.bands()).await
    }

    pub fn set_repeat(&self, repeat: bool) {
        self.state.lock().queue.set_repeat(repeat);
    }

    pub fn set_shuffle(&self, shuffle: bool) {
        self.state.lock().queue.set_shuffle(shuffle);
    }

    // State

    pub fn current_track(&self) -> Option<ConfiguredTrack> {
        self.state.lock().current.clone()
    }

    /// The current track while paused.
    pub fn paused_track(&self) -> Option<ConfiguredTrack> {
        let state = self.state.lock();
        if state.paused {
            state.current.clone()
        } else {
            None
        }
    }

    pub fn queue(&self) -> Vec<ConfiguredTrack> {
        self.state.lock().queue.to_vec()
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn is_playing(&self) -> bool {
        let state = self.state.lock();
        state.current.is_some() && !state.paused
    }

    pub fn volume(&self) -> f32 {
        self.state.lock().volume
    }

    pub fn bands(&self) -> [f32; BAND_COUNT] {
        self.state.lock().bands
    }

    pub fn repeat(&self) -> bool {
        self.state.lock().queue.repeat()
    }

    pub fn shuffle(&self) -> bool {
        self.state.lock().queue.shuffle()
    }

    /// Live playback position.
    pub fn position(&self) -> Duration {
        self.state.lock().position()
    }

    /// The current track, if its blob is `encoded`.
    pub(crate) fn current_if(&self, encoded: Option<&str>) -> Option<ConfiguredTrack> {
        let state = self.state.lock();
        let current = state.current.as_ref()?;
        match encoded {
            Some(encoded) if current.track().encoded != encoded => None,
            _ => Some(current.clone()),
        }
    }

    pub(crate) fn update_state(&self, update: PlayerUpdateState) {
        let mut state = self.state.lock();
        if state.pending_play {
            return;
        }
        if let Some(position) = update.position {
            state.reset_position(Duration::from_millis(position));
        }
    }

    // Voice

    pub(crate) async fn update_voice_session(&self, session_id: String) -> Result<()> {
        let command = {
            let mut state = self.state.lock();
            state.forward.session_id = Some(session_id);
            state.forward.complete(self.guild_id)
        };
        self.voice_update(command).await
    }

    pub(crate) async fn update_voice_server(&self, event: Value) -> Result<()> {
        let command = {
            let mut state = self.state.lock();
            state.forward.event = Some(event);
            state.forward.complete(self.guild_id)
        };
        self.voice_update(command).await
    }

    async fn voice_update(&self, command: Option<Command>) -> Result<()> {
        match command {
            Some(command) => {
                debug!("Forwarding voice session of guild {}", self.guild_id);
                self.send(command).await
            }
            None => Ok(()),
        }
    }

    /// Moves the player to `node`, replaying the voice session, the current
    /// track at its live position, and any non-flat equalizer bands.
    pub async fn change_node(&self, node: Arc<Node>) -> Result<()> {
        let old = std::mem::replace(&mut *self.node.write(), Arc::clone(&node));

        if !Arc::ptr_eq(&old, &node) {
            old.remove_player(self.guild_id);
            if old.available() {
                if let Err(err) = old
                    .send(&Command::Destroy {
                        guild_id: self.guild_id,
                    })
                    .await
                {
                    debug!("Could not destroy guild {} on {}: {}", self.guild_id, old.address(), err);
                }
            }
        }
        node.add_player(self.guild_id);

        let commands = {
            let state = self.state.lock();
            let mut commands = Vec::new();

            if let Some(command) = state.forward.complete(self.guild_id) {
                commands.push(command);
            }

            if let Some(current) = &state.current {
                commands.push(play_command(
                    self.guild_id,
                    current,
                    Some(state.position()),
                    Some(state.paused),
                    Some(wire_volume(state.volume)),
                    false,
                ));
            }

            let bands = state
                .bands
                .iter()
                .enumerate()
                .filter(|(_, gain)| **gain != 0.0)
                .map(|(band, &gain)| Band { band, gain })
                .collect::<Vec<_>>();
            if !bands.is_empty() {
                commands.push(Command::Equalizer {
                    guild_id: self.guild_id,
                    bands,
                });
            }

            commands
        };

        info!("🔀 Guild {} moved from {} to {}", self.guild_id, old.address(), node.address());
        self.send_all(commands).await
    }

    /// Asks the gateway to move the bot to `channel_id`.
    pub async fn move_to(&self, channel_id: ChannelId) -> Result<()> {
        self.gateway
            .change_voice_state(self.guild_id, Some(channel_id))
            .await
            .map_err(Error::Gateway)
    }

    /// Rejoins the current voice channel, e.g. after the voice socket closed.
    pub async fn reconnect(&self) -> Result<()> {
        let Some(channel_id) = self.channel_id() else {
            return Ok(());
        };
        self.move_to(channel_id).await
    }

    /// Leaves the voice channel and destroys the player.
    pub async fn disconnect(&self) -> Result<()> {
        self.gateway
            .change_voice_state(self.guild_id, None)
            .await
            .map_err(Error::Gateway)?;

        self.destroy().await;
        Ok(())
    }

    /// Drops the player from its node and its client.
    pub(crate) async fn destroy(&self) {
        {
            let mut state = self.state.lock();
            state.queue.clear();
            state.clear_current();
            state.channel_id = None;
        }

        if let Some(client) = self.client.upgrade() {
            client.forget_player(self.guild_id);
        }

        let node = self.node();
        node.remove_player(self.guild_id);
        if let Err(err) = node
            .send(&Command::Destroy {
                guild_id: self.guild_id,
            })
            .await
        {
            warn!("Could not destroy guild {} on {}: {}", self.guild_id, node.address(), err);
        }
    }
}

impl fmt::Debug for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Player")
            .field("guild_id", &self.guild_id)
            .field("channel_id", &state.channel_id)
            .field("node", &self.node.read().address())
            .field("current", &state.current.as_ref().map(|t| t.track().title().to_string()))
            .field("paused", &state.paused)
            .field("queue", &state.queue.len())
            .finish()
    }
}
