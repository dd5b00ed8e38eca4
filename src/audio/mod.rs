//! # Audio Module
//!
//! Per-guild playback state driven remotely on a node.
//!
//! Nothing here touches PCM: the node decodes, mixes and sends voice. This
//! module keeps what the client must know to drive it and to rebuild a
//! session elsewhere.
//!
//! ## Architecture
//!
//! ### [`player`] - Player state machine
//! - Idle, playing, paused and destroyed states
//! - Reacts to node track events and advances the queue
//! - Extrapolated position between `playerUpdate` reports
//! - Migration to another node with voice, track, position and filters
//!
//! ### [`queue`] - Queue Management
//! - FIFO queue with track and queue loop modes
//! - Shuffle of pending tracks
//! - Bounded history of finished tracks
//!
//! ### [`filters`] - Filter Catalog
//! - Typed records for every node-side filter
//! - Delta merging with validation before anything is sent
//!
//! ### [`equalizer`] - Presets
//! - Named 15-band gain sets convertible to an equalizer filter
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use open_music_link::audio::{equalizer::EqPresets, filters::FilterDelta};
//! use open_music_link::pool::NodePool;
//! use serenity::model::id::GuildId;
//!
//! # async fn example(pool: NodePool) -> open_music_link::Result<()> {
//! let player = pool.create_player(GuildId::new(1), None)?;
//! let result = pool.load_tracks("lofi beats", Default::default()).await?;
//! if let Some(track) = result.tracks().into_iter().next() {
//!     player.play(track).await?;
//! }
//! player
//!     .set_filters(FilterDelta::new().set(EqPresets::bass().to_filter()))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod equalizer;
pub mod filters;
pub mod player;
pub mod queue;

pub use filters::{Filter, FilterDelta, FilterKind, FilterSet};
pub use player::{PlayState, Player, VoiceState};
pub use queue::{LoopMode, TrackQueue};
