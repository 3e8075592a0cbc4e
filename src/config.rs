use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::model::UserId;

/// Connection settings for one audio node.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    /// Voice region this node prefers to serve.
    pub region: Option<String>,
    /// Session resumption token sent on connect.
    pub resume_key: Option<String>,
    /// How long the node keeps a session resumable after a disconnect.
    #[serde(with = "humantime_serde")]
    pub resume_timeout: Duration,
    /// Failed connection attempts tolerated before the node gives up.
    pub reconnect_attempts: u32,
}

impl NodeConfig {
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            password: password.into(),
            region: None,
            resume_key: None,
            resume_timeout: Duration::from_secs(60),
            reconnect_attempts: 3,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_resume_key(mut self, key: impl Into<String>) -> Self {
        self.resume_key = Some(key.into());
        self
    }

    pub fn with_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_attempts = attempts;
        self
    }

    pub fn websocket_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    pub fn rest_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Timeouts and backoff used by the node supervisory loop.
///
/// The delays are picked from the kind of failure: handshake, close and
/// timeout errors retry immediately, unreachable hosts wait
/// `unreachable_delay`, anything else waits `retry_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub unreachable_delay: Duration,
    pub retry_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            unreachable_delay: Duration::from_secs(5),
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Process configuration for the `solarlink` binary and for hosts that want
/// to configure their nodes from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub nodes: Vec<NodeConfig>,
    pub user_id: UserId,
    pub shard_count: u32,
    pub policy: ReconnectPolicy,
    /// How often the monitor logs node stats.
    pub stats_interval: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let password = std::env::var("LAVALINK_PASSWORD").unwrap_or_else(|_| "youshallnotpass".to_string());
        let resume_key = std::env::var("LAVALINK_RESUME_KEY").ok().filter(|key| !key.trim().is_empty());
        let resume_timeout = env_duration("LAVALINK_RESUME_TIMEOUT", "60s")?;
        let reconnect_attempts: u32 = std::env::var("NODE_RECONNECT_ATTEMPTS")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .context("NODE_RECONNECT_ATTEMPTS must be an integer")?;

        let specs = match std::env::var("LAVALINK_NODES") {
            Ok(val) if !val.trim().is_empty() => val,
            _ => {
                let host = std::env::var("LAVALINK_HOST").unwrap_or_else(|_| "localhost".to_string());
                let port = std::env::var("LAVALINK_PORT").unwrap_or_else(|_| "2333".to_string());
                format!("{host}:{port}")
            }
        };

        let nodes = specs
            .split(',')
            .map(str::trim)
            .filter(|spec| !spec.is_empty())
            .map(|spec| {
                let mut node = parse_node_spec(spec, &password)?;
                node.resume_key = resume_key.clone();
                node.resume_timeout = resume_timeout;
                node.reconnect_attempts = reconnect_attempts;
                Ok(node)
            })
            .collect::<Result<Vec<_>>>()?;

        let config = Self {
            nodes,
            user_id: std::env::var("BOT_USER_ID")
                .context("BOT_USER_ID is required")?
                .parse::<u64>()
                .context("BOT_USER_ID must be a snowflake")?
                .into(),
            shard_count: std::env::var("SHARD_COUNT")
                .unwrap_or_else(|_| "1".to_string())
                .parse()?,
            policy: ReconnectPolicy {
                connect_timeout: env_duration("NODE_CONNECT_TIMEOUT", "30s")?,
                read_timeout: env_duration("NODE_READ_TIMEOUT", "60s")?,
                unreachable_delay: env_duration("NODE_UNREACHABLE_DELAY", "5s")?,
                retry_delay: env_duration("NODE_RETRY_DELAY", "1s")?,
            },
            stats_interval: env_duration("STATS_INTERVAL", "60s")?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Sanity checks on the loaded values.
    ///
    /// - At least one node must be configured
    /// - Shard count must be positive
    /// - Timeouts must be non-zero
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            anyhow::bail!("At least one Lavalink node must be configured");
        }

        for node in &self.nodes {
            if node.host.is_empty() {
                anyhow::bail!("Node host must not be empty");
            }
            if node.password.is_empty() {
                anyhow::bail!("Node {}:{} has an empty password", node.host, node.port);
            }
        }

        if self.shard_count == 0 {
            anyhow::bail!("Shard count must be greater than 0");
        }

        if self.policy.connect_timeout.is_zero() || self.policy.read_timeout.is_zero() {
            anyhow::bail!("Node timeouts must be greater than 0");
        }

        if self.stats_interval.is_zero() {
            anyhow::bail!("Stats interval must be greater than 0");
        }

        Ok(())
    }

    /// Summary safe to log: passwords and resume keys are left out.
    pub fn summary(&self) -> String {
        let nodes = self
            .nodes
            .iter()
            .map(|node| match &node.region {
                Some(region) => format!("{}:{}@{}", node.host, node.port, region),
                None => format!("{}:{}", node.host, node.port),
            })
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "Config Summary:\n  \
            Nodes: {}\n  \
            Bot: user {} ({} shards)\n  \
            Reconnect: {} attempts, connect timeout {}, read timeout {}\n  \
            Resume: {}",
            nodes,
            self.user_id,
            self.shard_count,
            self.nodes.first().map_or(0, |node| node.reconnect_attempts),
            humantime::format_duration(self.policy.connect_timeout),
            humantime::format_duration(self.policy.read_timeout),
            if self.nodes.iter().any(|node| node.resume_key.is_some()) {
                "enabled"
            } else {
                "disabled"
            },
        )
    }
}

/// Parses `host:port[@region]`.
fn parse_node_spec(spec: &str, password: &str) -> Result<NodeConfig> {
    let (address, region) = match spec.split_once('@') {
        Some((address, region)) => (address, Some(region.to_string())),
        None => (spec, None),
    };

    let (host, port) = address
        .rsplit_once(':')
        .with_context(|| format!("Node `{spec}` must look like host:port[@region]"))?;
    let port = port
        .parse()
        .with_context(|| format!("Node `{spec}` has an invalid port"))?;

    let mut node = NodeConfig::new(host, port, password);
    node.region = region;
    Ok(node)
}

fn env_duration(key: &str, default: &str) -> Result<Duration> {
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    humantime::parse_duration(raw.trim()).with_context(|| format!("{key} must be a duration like `30s`"))
}
