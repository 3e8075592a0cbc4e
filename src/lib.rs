//! # solarlink
//!
//! A client for [Lavalink](https://github.com/lavalink-devs/Lavalink) audio
//! nodes.
//!
//! The crate keeps a pool of [`Node`]s connected, places one [`Player`] per
//! guild on the least loaded node, and moves players to another node when
//! theirs goes away. Discord itself stays with the host bot: it implements
//! [`VoiceGateway`] and forwards its voice updates to [`SolarClient`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use solarlink::{
//!     config::NodeConfig,
//!     events::DefaultEventHandler,
//!     model::{ChannelId, GuildId},
//!     SolarClient, VoiceGateway,
//! };
//!
//! # async fn run(gateway: Arc<dyn VoiceGateway>) -> solarlink::Result<()> {
//! let client = SolarClient::new(gateway, Arc::new(DefaultEventHandler));
//! client.connect_node(NodeConfig::new("localhost", 2333, "youshallnotpass")).await?;
//!
//! let player = client.join_voice(GuildId::new(1), ChannelId::new(2), None).await?;
//! let tracks = client.search("never gonna give you up").await?;
//! if let Some(track) = tracks.tracks.into_iter().next() {
//!     player.append(solarlink::model::ConfiguredTrack::full(track)).await?;
//! }
//! # Ok(())
//! # }
//! ```

mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod model;
pub mod node;
pub mod player;

pub use client::SolarClient;
pub use error::{Error, Result};
pub use events::{DefaultEventHandler, EventHandler, NodeEvent};
pub use gateway::VoiceGateway;
pub use node::Node;
pub use player::Player;
