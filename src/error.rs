use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure solarlink can surface.
///
/// Transport errors are retried by the node loop, authentication errors never
/// are, protocol anomalies are reported to [`EventHandler::error`] and the
/// read loop keeps going. Invalid input is raised before any network I/O.
///
/// [`EventHandler::error`]: crate::events::EventHandler::error
#[derive(Debug, Error)]
pub enum Error {
    #[error("node {host} rejected the credentials (status {status})")]
    Authentication { host: String, status: u16 },

    #[error("no available nodes")]
    NoAvailableNodes,

    #[error("node {0} is not connected")]
    NodeUnavailable(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid node url: {0}")]
    Url(#[from] url::ParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unknown operation `{0}`")]
    UnknownOperation(String),

    #[error("unknown event type `{0}`")]
    UnknownEvent(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("band must be in 0..=14, got {0}")]
    InvalidBand(usize),

    #[error("{field} of {value:?} is outside the track duration {duration:?}")]
    InvalidTimeWindow {
        field: &'static str,
        value: Duration,
        duration: Duration,
    },

    #[error("position {position:?} is outside the track duration {duration:?}")]
    InvalidPosition {
        position: Duration,
        duration: Duration,
    },

    #[error("invalid header value: {0}")]
    InvalidHeader(String),

    #[error("gateway error: {0}")]
    Gateway(#[source] anyhow::Error),
}

impl Error {
    /// Whether the node loop may try again after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Authentication { .. } | Error::InvalidHeader(_))
    }
}
