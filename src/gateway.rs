use async_trait::async_trait;

use crate::model::{ChannelId, GuildId, UserId};

/// The slice of the host bot's Discord gateway solarlink needs.
///
/// Implement this on top of whatever Discord library drives the bot. The
/// host is also responsible for forwarding voice-state and voice-server
/// updates to [`SolarClient`](crate::SolarClient).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VoiceGateway: Send + Sync + 'static {
    /// The bot's own user id, sent to nodes as `User-Id`.
    fn user_id(&self) -> UserId;

    /// Number of gateway shards, sent to nodes as `Num-Shards`.
    fn shard_count(&self) -> u32;

    /// Join, move to, or (with `None`) leave a voice channel.
    async fn change_voice_state(&self, guild_id: GuildId, channel_id: Option<ChannelId>) -> anyhow::Result<()>;
}
