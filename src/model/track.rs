use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Metadata Lavalink attaches to a track blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    /// Length in milliseconds.
    pub length: u64,
    pub is_stream: bool,
    /// Start position in milliseconds.
    #[serde(default)]
    pub position: u64,
    pub title: String,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub source_name: Option<String>,
}

/// An audio track as returned by a node: the opaque base64 blob plus its info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    #[serde(rename = "track", alias = "encoded")]
    pub encoded: String,
    pub info: TrackInfo,
}

impl Track {
    pub fn new(encoded: impl Into<String>, info: TrackInfo) -> Self {
        Self {
            encoded: encoded.into(),
            info,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.info.length)
    }

    pub fn title(&self) -> &str {
        &self.info.title
    }

    pub fn is_stream(&self) -> bool {
        self.info.is_stream
    }
}

/// A queue entry: an immutable [`Track`] with a playback window and
/// user-attached attributes.
///
/// A zero `start_time` / `end_time` means "not set".
#[derive(Debug, Clone, PartialEq)]
pub struct ConfiguredTrack {
    track: Arc<Track>,
    start_time: Duration,
    end_time: Duration,
    attributes: Map<String, Value>,
}

impl ConfiguredTrack {
    /// Wraps `track`, checking that both ends of the window lie within its
    /// duration.
    pub fn new(track: impl Into<Arc<Track>>, start_time: Duration, end_time: Duration) -> Result<Self> {
        let track = track.into();
        let duration = track.duration();

        if start_time > duration {
            return Err(Error::InvalidTimeWindow {
                field: "start_time",
                value: start_time,
                duration,
            });
        }

        if end_time > duration {
            return Err(Error::InvalidTimeWindow {
                field: "end_time",
                value: end_time,
                duration,
            });
        }

        Ok(Self {
            track,
            start_time,
            end_time,
            attributes: Map::new(),
        })
    }

    /// A configured track covering the whole of `track`.
    pub fn full(track: impl Into<Arc<Track>>) -> Self {
        Self {
            track: track.into(),
            start_time: Duration::ZERO,
            end_time: Duration::ZERO,
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn track(&self) -> &Arc<Track> {
        &self.track
    }

    pub fn start_time(&self) -> Duration {
        self.start_time
    }

    pub fn end_time(&self) -> Duration {
        self.end_time
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    /// The play-command fragment for this entry. `startTime` and `endTime` are
    /// only present when set.
    pub fn un_pack(&self) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("track".into(), Value::String(self.track.encoded.clone()));

        if !self.start_time.is_zero() {
            data.insert("startTime".into(), (self.start_time.as_millis() as u64).into());
        }

        if !self.end_time.is_zero() {
            data.insert("endTime".into(), (self.end_time.as_millis() as u64).into());
        }

        data
    }
}

#[cfg(test)]
pub(crate) fn test_track(title: &str, length_ms: u64) -> Track {
    Track::new(
        format!("QAAA{title}"),
        TrackInfo {
            identifier: title.to_string(),
            is_seekable: true,
            author: "solarlink".to_string(),
            length: length_ms,
            is_stream: false,
            position: 0,
            title: title.to_string(),
            uri: Some(format!("https://example.com/{title}")),
            source_name: Some("http".to_string()),
        },
    )
}
