use std::time::Duration;

use serde::Deserialize;

/// Penalty reported for a node that has no stats yet or is not connected.
pub const UNAVAILABLE_PENALTY: f64 = 9e30;

/// Telemetry snapshot pushed by a node with the `stats` operation.
///
/// Each frame replaces the previous snapshot wholesale.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub players: u32,
    pub playing_players: u32,
    /// Uptime in milliseconds.
    pub uptime: u64,
    pub memory: MemoryStats,
    pub cpu: CpuStats,
    #[serde(default)]
    pub frame_stats: Option<FrameStats>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

/// Audio frame counters over the last minute. Absent when the node has no
/// playing players.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

impl Stats {
    pub fn uptime(&self) -> Duration {
        Duration::from_millis(self.uptime)
    }

    /// Load score used for least-loaded node selection. Lower is better.
    ///
    /// Playing players, plus an exponential CPU term, plus exponential terms
    /// for deficit and nulled frames (nulled frames weigh double).
    pub fn penalty(&self) -> f64 {
        let player_penalty = f64::from(self.playing_players);
        let cpu_penalty = 1.05f64.powf(100.0 * self.cpu.system_load) * 10.0 - 10.0;

        let (deficit_penalty, null_penalty) = match &self.frame_stats {
            Some(frames) => {
                let deficit = 1.03f64.powf(500.0 * (frames.deficit as f64 / 3000.0)) * 600.0 - 600.0;
                let nulled = (1.03f64.powf(500.0 * (frames.nulled as f64 / 3000.0)) * 300.0 - 300.0) * 2.0;
                (deficit, nulled)
            }
            None => (0.0, 0.0),
        };

        player_penalty + cpu_penalty + deficit_penalty + null_penalty
    }
}
