//! Lavalink v3 WebSocket frames.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::{Error, Result},
    model::{GuildId, Stats},
};

/// One `{band, gain}` entry of an `equalizer` command.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Band {
    pub band: usize,
    pub gain: f32,
}

/// Outbound operations. Serialised with the operation name under `op`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    VoiceUpdate {
        guild_id: GuildId,
        session_id: String,
        event: Value,
    },
    Play {
        guild_id: GuildId,
        /// `track` plus optional `startTime` / `endTime`.
        #[serde(flatten)]
        track: Map<String, Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pause: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        volume: Option<u32>,
        no_replace: bool,
    },
    Stop {
        guild_id: GuildId,
    },
    Pause {
        guild_id: GuildId,
        pause: bool,
    },
    Seek {
        guild_id: GuildId,
        position: u64,
    },
    Volume {
        guild_id: GuildId,
        volume: u32,
    },
    Equalizer {
        guild_id: GuildId,
        bands: Vec<Band>,
    },
    Destroy {
        guild_id: GuildId,
    },
    ConfigureResuming {
        key: String,
        /// Seconds.
        timeout: u64,
    },
}

/// `state` object of a `playerUpdate` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PlayerUpdateState {
    /// Node wall clock in unix milliseconds.
    #[serde(default)]
    pub time: u64,
    /// Playback offset in milliseconds, absent while nothing plays.
    #[serde(default, alias = "positionMs")]
    pub position: Option<u64>,
    #[serde(default)]
    pub connected: bool,
}

/// Inbound frames, dispatched on `op`.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Stats(Stats),
    PlayerUpdate {
        guild_id: GuildId,
        state: PlayerUpdateState,
    },
    /// Raw event object, decoded further by [`crate::events`].
    Event(Value),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPlayerUpdate {
    guild_id: GuildId,
    state: PlayerUpdateState,
}

pub fn parse_frame(text: &str) -> Result<Frame> {
    let value: Value = serde_json::from_str(text)?;

    let op = value
        .get("op")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MalformedFrame("missing `op`".to_string()))?;

    match op {
        "stats" => Ok(Frame::Stats(serde_json::from_value(value)?)),
        "playerUpdate" => {
            let update: RawPlayerUpdate = serde_json::from_value(value)?;
            Ok(Frame::PlayerUpdate {
                guild_id: update.guild_id,
                state: update.state,
            })
        }
        "event" => Ok(Frame::Event(value)),
        other => Err(Error::UnknownOperation(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_play_command_shape() {
        let mut track = Map::new();
        track.insert("track".into(), json!("QAAA"));
        track.insert("startTime".into(), json!(1500));

        let command = Command::Play {
            guild_id: GuildId::new(1),
            track,
            pause: Some(false),
            volume: None,
            no_replace: false,
        };

        assert_eq!(
            serde_json::to_value(&command).unwrap(),
            json!({
                "op": "play",
                "guildId": "1",
                "track": "QAAA",
                "startTime": 1500,
                "pause": false,
                "noReplace": false
            })
        );
    }

    #[test]
    fn test_simple_commands() {
        let guild_id = GuildId::new(42);

        assert_eq!(
            serde_json::to_value(Command::Volume { guild_id, volume: 250 }).unwrap(),
            json!({ "op": "volume", "guildId": "42", "volume": 250 })
        );
        assert_eq!(
            serde_json::to_value(Command::Equalizer {
                guild_id,
                bands: vec![Band { band: 3, gain: 0.5 }]
            })
            .unwrap(),
            json!({ "op": "equalizer", "guildId": "42", "bands": [{ "band": 3, "gain": 0.5 }] })
        );
        assert_eq!(
            serde_json::to_value(Command::ConfigureResuming {
                key: "abc".into(),
                timeout: 60
            })
            .unwrap(),
            json!({ "op": "configureResuming", "key": "abc", "timeout": 60 })
        );
        assert_eq!(
            serde_json::to_value(Command::VoiceUpdate {
                guild_id,
                session_id: "sess".into(),
                event: json!({ "token": "t" })
            })
            .unwrap(),
            json!({ "op": "voiceUpdate", "guildId": "42", "sessionId": "sess", "event": { "token": "t" } })
        );
    }

    #[test]
    fn test_parse_player_update() {
        let frame = parse_frame(
            r#"{"op":"playerUpdate","guildId":"7","state":{"time":1500000000000,"position":60000,"connected":true}}"#,
        )
        .unwrap();

        assert_eq!(
            frame,
            Frame::PlayerUpdate {
                guild_id: GuildId::new(7),
                state: PlayerUpdateState {
                    time: 1500000000000,
                    position: Some(60000),
                    connected: true,
                },
            }
        );
    }

    #[test]
    fn test_parse_unknown_op() {
        let err = parse_frame(r#"{"op":"mystery"}"#).unwrap_err();
        assert!(matches!(err, Error::UnknownOperation(op) if op == "mystery"));

        let err = parse_frame(r#"{"nope":1}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
    }

    #[test]
    fn test_parse_event_is_passed_through() {
        let frame = parse_frame(r#"{"op":"event","type":"TrackStartEvent","guildId":"1","track":"QAAA"}"#).unwrap();
        assert!(matches!(frame, Frame::Event(value) if value["type"] == "TrackStartEvent"));
    }
}
