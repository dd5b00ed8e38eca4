//! # Open Music Link
//!
//! Client side of the Lavalink v4 protocol for Discord music bots: a pool of
//! audio nodes with load-aware placement and failover, a per-guild player
//! state machine and a query cache in front of track resolution.
//!
//! The node does the decoding and streaming. This crate keeps the sessions
//! alive, drives players over the WebSocket and moves them when a node goes
//! away.
//!
//! ```rust,no_run
//! use open_music_link::{config::Config, events::{listener, EventKind}, pool::NodePool};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let pool = NodePool::from_config(&config)?;
//! for node in &config.nodes {
//!     pool.register(node.clone())?;
//! }
//! pool.on(EventKind::QueueEnd, listener(|event| async move {
//!     println!("queue finished: {:?}", event.guild_id());
//! }));
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod node;
pub mod pool;
pub mod sources;

pub use audio::player::{PlayState, Player, VoiceState};
pub use error::Error;
pub use events::{Event, EventKind};
pub use node::{Node, NodeState};
pub use pool::NodePool;
pub use sources::{LoadResult, SearchSource, Track};

pub type Result<T> = std::result::Result<T, Error>;
