use serde::Deserialize;

use super::track::Track;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadType {
    TrackLoaded,
    PlaylistLoaded,
    SearchResult,
    NoMatches,
    LoadFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    pub name: Option<String>,
    /// Index of the selected track, `-1` when none.
    #[serde(default = "no_selection")]
    pub selected_track: i64,
}

fn no_selection() -> i64 {
    -1
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoadException {
    pub message: Option<String>,
    pub severity: String,
}

/// Response of `GET /loadtracks`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResult {
    pub load_type: LoadType,
    #[serde(default)]
    pub playlist_info: Option<PlaylistInfo>,
    #[serde(default)]
    pub tracks: Vec<Track>,
    #[serde(default)]
    pub exception: Option<LoadException>,
}

impl LoadResult {
    pub fn playlist_name(&self) -> Option<&str> {
        self.playlist_info.as_ref().and_then(|info| info.name.as_deref())
    }

    pub fn selected_track(&self) -> Option<&Track> {
        let index = self.playlist_info.as_ref()?.selected_track;
        usize::try_from(index).ok().and_then(|index| self.tracks.get(index))
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_playlist() {
        let raw = serde_json::json!({
            "loadType": "PLAYLIST_LOADED",
            "playlistInfo": { "name": "Mix", "selectedTrack": 1 },
            "tracks": [
                {
                    "track": "QAAA1",
                    "info": {
                        "identifier": "a", "isSeekable": true, "author": "x", "length": 1000,
                        "isStream": false, "position": 0, "title": "A", "uri": null
                    }
                },
                {
                    "track": "QAAA2",
                    "info": {
                        "identifier": "b", "isSeekable": true, "author": "x", "length": 2000,
                        "isStream": false, "position": 0, "title": "B", "uri": null
                    }
                }
            ]
        });

        let result: LoadResult = serde_json::from_value(raw).unwrap();
        assert_eq!(result.load_type, LoadType::PlaylistLoaded);
        assert_eq!(result.playlist_name(), Some("Mix"));
        assert_eq!(result.selected_track().map(|t| t.title()), Some("B"));
    }

    #[test]
    fn test_decode_failure() {
        let raw = serde_json::json!({
            "loadType": "LOAD_FAILED",
            "playlistInfo": {},
            "tracks": [],
            "exception": { "message": "The uploader has not made this video available in your country.", "severity": "COMMON" }
        });

        let result: LoadResult = serde_json::from_value(raw).unwrap();
        assert_eq!(result.load_type, LoadType::LoadFailed);
        assert!(result.is_empty());
        assert!(result.selected_track().is_none());
        assert_eq!(result.exception.unwrap().severity, "COMMON");
    }
}
