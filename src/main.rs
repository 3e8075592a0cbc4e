use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use std::{sync::Arc, time::Duration};
use tracing::{error, info, warn};

use solarlink::{
    config::Config,
    model::{ChannelId, GuildId, UserId},
    DefaultEventHandler, SolarClient, VoiceGateway,
};

/// Gateway for running without a Discord connection: voice state changes
/// are only logged.
struct DetachedGateway {
    user_id: UserId,
    shard_count: u32,
}

#[async_trait]
impl VoiceGateway for DetachedGateway {
    fn user_id(&self) -> UserId {
        self.user_id
    }

    fn shard_count(&self) -> u32 {
        self.shard_count
    }

    async fn change_voice_state(&self, guild_id: GuildId, channel_id: Option<ChannelId>) -> anyhow::Result<()> {
        warn!(
            "No Discord gateway attached, ignoring voice state change for guild {} ({:?})",
            guild_id, channel_id
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("solarlink=debug".parse()?)
                .add_directive("reqwest=info".parse()?)
                .add_directive("tungstenite=info".parse()?),
        )
        .init();

    info!("🎵 Starting solarlink v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!("{}", config.summary());

    let gateway = Arc::new(DetachedGateway {
        user_id: config.user_id,
        shard_count: config.shard_count,
    });
    let client = SolarClient::with_policy(gateway, Arc::new(DefaultEventHandler), config.policy);

    let args = std::env::args().collect::<Vec<_>>();
    if args.iter().any(|arg| arg == "--health-check") {
        return health_check(&client, &config).await;
    }
    if let Some(query) = args
        .iter()
        .position(|arg| arg == "--search")
        .and_then(|index| args.get(index + 1))
    {
        return search(&client, &config, query).await;
    }

    for node in &config.nodes {
        client.add_node(node.clone());
    }

    let mut interval = tokio::time::interval(config.stats_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => log_stats(&client),
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    error!("Could not listen for Ctrl+C: {}", err);
                }
                info!("⚠️ Shutdown signal received, closing nodes...");
                break;
            }
        }
    }

    client.stop();
    // Give the sessions a moment to send their close frames.
    tokio::time::sleep(Duration::from_millis(250)).await;
    Ok(())
}

fn log_stats(client: &SolarClient) {
    for node in client.nodes() {
        match node.stats() {
            Some(stats) if node.available() => info!(
                "📊 {} | players {}/{} | cpu {:.1}% | memory {} MiB | penalty {:.1} | uptime {}",
                node.address(),
                stats.playing_players,
                stats.players,
                stats.cpu.lavalink_load * 100.0,
                stats.memory.used / 1024 / 1024,
                node.penalty(),
                humantime::format_duration(Duration::from_secs(stats.uptime().as_secs())),
            ),
            _ if node.available() => info!("📊 {} | connected, waiting for stats", node.address()),
            _ => warn!(
                "📊 {} | offline ({} reconnect attempts left)",
                node.address(),
                node.reconnect_attempts()
            ),
        }
    }

    if client.player_queue_len() > 0 {
        warn!("{} players are waiting for a node", client.player_queue_len());
    }
}

/// Connects every configured node once and prints `OK` when at least one of
/// them is usable.
async fn health_check(client: &SolarClient, config: &Config) -> Result<()> {
    let results = join_all(config.nodes.iter().cloned().map(|node| client.connect_node(node))).await;

    let mut failed = 0;
    for (node, result) in config.nodes.iter().zip(results) {
        if let Err(err) = result {
            error!("❌ {}:{} failed: {}", node.host, node.port, err);
            failed += 1;
        }
    }
    client.stop();

    if failed < config.nodes.len() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("None of the {} nodes is reachable", config.nodes.len());
    }
}

/// Resolves `query` on the first node that connects and prints the tracks.
async fn search(client: &SolarClient, config: &Config, query: &str) -> Result<()> {
    let results = join_all(config.nodes.iter().cloned().map(|node| client.connect_node(node))).await;
    if results.iter().all(|result| result.is_err()) {
        anyhow::bail!("No node could be reached");
    }

    let loaded = client.search(query).await;
    client.stop();
    let loaded = loaded?;

    if let Some(name) = loaded.playlist_name() {
        println!("Playlist: {name}");
    }
    if loaded.is_empty() {
        println!("No tracks found ({:?})", loaded.load_type);
    }
    for (index, track) in loaded.tracks.iter().enumerate() {
        let length = if track.is_stream() {
            "live".to_string()
        } else {
            humantime::format_duration(Duration::from_secs(track.duration().as_secs())).to_string()
        };
        println!("{:>3}. {} - {} [{}]", index + 1, track.info.author, track.title(), length);
    }
    Ok(())
}
