//! # Events
//!
//! Node `event` frames decoded into typed events and handed to an
//! [`EventHandler`].
//!
//! Dispatch is a closed table keyed on the frame's `type`:
//!
//! | `type`                 | Event                          |
//! |------------------------|--------------------------------|
//! | `TrackStartEvent`      | [`TrackStartEvent`]            |
//! | `TrackEndEvent`        | [`TrackEndEvent`]              |
//! | `TrackExceptionEvent`  | [`TrackExceptionEvent`]        |
//! | `TrackStuckEvent`      | [`TrackStuckEvent`]            |
//! | `WebSocketClosedEvent` | [`PlayerWebSocketClosedEvent`] |
//!
//! Anything else is an [`Error::UnknownEvent`] reported through
//! [`EventHandler::error`]; the node keeps reading.
//!
//! ## Default behaviour
//!
//! The provided [`EventHandler`] methods keep a guild playing without any
//! user code: a naturally finished track starts the next one, a failing or
//! stuck track is skipped, and a voice socket closed for a recoverable
//! reason rejoins the channel.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Error, Result},
    model::{ConfiguredTrack, GuildId},
    player::Player,
};

/// Voice close codes after which rejoining the channel can recover.
const RECONNECTABLE_CLOSE_CODES: [u16; 4] = [1006, 4006, 4009, 4015];

/// Close code sent when the bot was disconnected from the channel.
const DISCONNECTED_CLOSE_CODE: u16 = 4014;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

/// Decoded body of an event frame, before the player is resolved.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EventPayload {
    TrackStart {
        track: Option<String>,
    },
    TrackEnd {
        track: Option<String>,
        reason: TrackEndReason,
    },
    TrackException {
        track: Option<String>,
        message: Option<String>,
        severity: Option<String>,
    },
    TrackStuck {
        track: Option<String>,
        threshold: Duration,
    },
    WebSocketClosed {
        code: u16,
        reason: String,
        by_remote: bool,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    guild_id: GuildId,
    #[serde(rename = "type")]
    kind: String,
    track: Option<String>,
    reason: Option<Value>,
    exception: Option<RawException>,
    error: Option<String>,
    threshold_ms: Option<u64>,
    code: Option<u16>,
    by_remote: Option<bool>,
}

#[derive(Deserialize)]
struct RawException {
    message: Option<String>,
    severity: Option<String>,
}

fn missing(field: &str, kind: &str) -> Error {
    Error::MalformedFrame(format!("{kind} without `{field}`"))
}

pub(crate) fn parse_event(data: Value) -> Result<(GuildId, EventPayload)> {
    let raw: RawEvent = serde_json::from_value(data)?;
    let kind = raw.kind.as_str();

    let payload = match kind {
        "TrackStartEvent" => EventPayload::TrackStart { track: raw.track },
        "TrackEndEvent" => {
            let reason = raw.reason.ok_or_else(|| missing("reason", kind))?;
            EventPayload::TrackEnd {
                track: raw.track,
                reason: serde_json::from_value(reason)?,
            }
        }
        "TrackExceptionEvent" => {
            let (message, severity) = match raw.exception {
                Some(exception) => (exception.message, exception.severity),
                None => (raw.error, None),
            };
            EventPayload::TrackException {
                track: raw.track,
                message,
                severity,
            }
        }
        "TrackStuckEvent" => EventPayload::TrackStuck {
            track: raw.track,
            threshold: Duration::from_millis(raw.threshold_ms.ok_or_else(|| missing("thresholdMs", kind))?),
        },
        "WebSocketClosedEvent" => EventPayload::WebSocketClosed {
            code: raw.code.ok_or_else(|| missing("code", kind))?,
            reason: raw
                .reason
                .as_ref()
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            by_remote: raw.by_remote.unwrap_or(false),
        },
        other => return Err(Error::UnknownEvent(other.to_string())),
    };

    Ok((raw.guild_id, payload))
}

#[derive(Debug, Clone)]
pub struct TrackStartEvent {
    pub player: Arc<Player>,
    pub track: Option<ConfiguredTrack>,
}

#[derive(Debug, Clone)]
pub struct TrackEndEvent {
    pub player: Arc<Player>,
    /// The ended track, when it is still the player's current one.
    pub track: Option<ConfiguredTrack>,
    pub reason: TrackEndReason,
}

#[derive(Debug, Clone)]
pub struct TrackExceptionEvent {
    pub player: Arc<Player>,
    pub track: Option<ConfiguredTrack>,
    pub message: Option<String>,
    pub severity: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TrackStuckEvent {
    pub player: Arc<Player>,
    pub track: Option<ConfiguredTrack>,
    pub threshold: Duration,
}

#[derive(Debug, Clone)]
pub struct PlayerWebSocketClosedEvent {
    pub player: Arc<Player>,
    pub code: u16,
    pub reason: String,
    pub by_remote: bool,
}

impl PlayerWebSocketClosedEvent {
    pub fn is_reconnectable(&self) -> bool {
        RECONNECTABLE_CLOSE_CODES.contains(&self.code)
    }
}

#[derive(Debug, Clone)]
pub enum NodeEvent {
    TrackStart(TrackStartEvent),
    TrackEnd(TrackEndEvent),
    TrackException(TrackExceptionEvent),
    TrackStuck(TrackStuckEvent),
    PlayerWebSocketClosed(PlayerWebSocketClosedEvent),
}

impl NodeEvent {
    pub(crate) fn new(player: Arc<Player>, payload: EventPayload) -> Self {
        match payload {
            EventPayload::TrackStart { track } => NodeEvent::TrackStart(TrackStartEvent {
                track: player.current_if(track.as_deref()),
                player,
            }),
            EventPayload::TrackEnd { track, reason } => NodeEvent::TrackEnd(TrackEndEvent {
                track: player.current_if(track.as_deref()),
                player,
                reason,
            }),
            EventPayload::TrackException {
                track,
                message,
                severity,
            } => NodeEvent::TrackException(TrackExceptionEvent {
                track: player.current_if(track.as_deref()),
                player,
                message,
                severity,
            }),
            EventPayload::TrackStuck { track, threshold } => NodeEvent::TrackStuck(TrackStuckEvent {
                track: player.current_if(track.as_deref()),
                player,
                threshold,
            }),
            EventPayload::WebSocketClosed {
                code,
                reason,
                by_remote,
            } => NodeEvent::PlayerWebSocketClosed(PlayerWebSocketClosedEvent {
                player,
                code,
                reason,
                by_remote,
            }),
        }
    }

    pub fn player(&self) -> &Arc<Player> {
        match self {
            NodeEvent::TrackStart(event) => &event.player,
            NodeEvent::TrackEnd(event) => &event.player,
            NodeEvent::TrackException(event) => &event.player,
            NodeEvent::TrackStuck(event) => &event.player,
            NodeEvent::PlayerWebSocketClosed(event) => &event.player,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NodeEvent::TrackStart(_) => "track_start",
            NodeEvent::TrackEnd(_) => "track_end",
            NodeEvent::TrackException(_) => "track_exception",
            NodeEvent::TrackStuck(_) => "track_stuck",
            NodeEvent::PlayerWebSocketClosed(_) => "player_web_socket_closed",
        }
    }
}

/// Event slots a host can override. Every method has a working default.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn track_start(&self, event: TrackStartEvent) -> Result<()> {
        debug!(
            "Guild {} started {:?}",
            event.player.guild_id(),
            event.track.as_ref().map(|t| t.track().title().to_string())
        );
        Ok(())
    }

    /// Starts the next track when the previous one finished on its own.
    async fn track_end(&self, event: TrackEndEvent) -> Result<()> {
        if event.reason == TrackEndReason::Finished {
            event.player.play_next().await?;
        }
        Ok(())
    }

    /// Skips the failing track.
    async fn track_exception(&self, event: TrackExceptionEvent) -> Result<()> {
        warn!(
            "Guild {} track failed ({}): {}",
            event.player.guild_id(),
            event.severity.as_deref().unwrap_or("UNKNOWN"),
            event.message.as_deref().unwrap_or("no message")
        );
        event.player.skip(0).await?;
        Ok(())
    }

    /// Skips the stuck track.
    async fn track_stuck(&self, event: TrackStuckEvent) -> Result<()> {
        warn!("Guild {} track stuck for {:?}", event.player.guild_id(), event.threshold);
        event.player.skip(0).await?;
        Ok(())
    }

    /// Rejoins after a recoverable close, stops otherwise. A plain
    /// disconnect (4014) is left to the voice state handling.
    async fn player_web_socket_closed(&self, event: PlayerWebSocketClosedEvent) -> Result<()> {
        info!(
            "Guild {} voice socket closed: {} {} (by remote: {})",
            event.player.guild_id(),
            event.code,
            event.reason,
            event.by_remote
        );

        if event.is_reconnectable() {
            event.player.reconnect().await
        } else if event.code == DISCONNECTED_CLOSE_CODE {
            Ok(())
        } else {
            event.player.stop().await
        }
    }

    /// Sink for errors raised while reading nodes or running handlers.
    async fn error(&self, location: &str, err: &Error) {
        error!("❌ {}: {}", location, err);
    }
}

/// Handler that only uses the default behaviour.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEventHandler;

impl EventHandler for DefaultEventHandler {}

/// Routes `event` to its slot on `handler`.
pub async fn dispatch(handler: &dyn EventHandler, event: NodeEvent) -> Result<()> {
    match event {
        NodeEvent::TrackStart(event) => handler.track_start(event).await,
        NodeEvent::TrackEnd(event) => handler.track_end(event).await,
        NodeEvent::TrackException(event) => handler.track_exception(event).await,
        NodeEvent::TrackStuck(event) => handler.track_stuck(event).await,
        NodeEvent::PlayerWebSocketClosed(event) => handler.player_web_socket_closed(event).await,
    }
}
