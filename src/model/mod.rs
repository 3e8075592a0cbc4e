//! Wire models shared by nodes and players.
//!
//! Everything here is passive data decoded from (or encoded for) an audio
//! node: snowflake ids, tracks and queue entries, node telemetry, route
//! planner state and `loadtracks` results.

pub mod id;
pub mod load;
pub mod route_planner;
pub mod stats;
pub mod track;

pub use id::{ChannelId, GuildId, UserId};
pub use load::{LoadResult, LoadType, PlaylistInfo};
pub use route_planner::RoutePlannerStatus;
pub use stats::{Stats, UNAVAILABLE_PENALTY};
pub use track::{ConfiguredTrack, Track, TrackInfo};
