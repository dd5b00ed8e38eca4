//! Routes decoded frames to players and application listeners.

use serenity::model::id::GuildId;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

use super::protocol::{self, Command, Incoming, NodeEvent};
use super::Node;
use crate::events::Event;
use crate::pool::PoolInner;

/// Shared by every node of a pool. Holds the pool weakly so node tasks do
/// not keep a dropped pool alive.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    pool: Weak<PoolInner>,
}

impl Dispatcher {
    pub(crate) fn new(pool: Weak<PoolInner>) -> Self {
        Self { pool }
    }

    /// Handles one text frame. Returns the session id when the frame was a
    /// `ready`.
    ///
    /// Re-homing and listener calls are spawned; only the addressed player's
    /// own transition runs inline.
    pub(crate) async fn dispatch(&self, node: &Arc<Node>, text: &str) -> Option<String> {
        let frame = match protocol::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(node = %node.name(), error = %e, "descartando frame malformado");
                return None;
            }
        };
        let Some(pool) = self.pool.upgrade() else {
            debug!(node = %node.name(), "pool liberado, frame ignorado");
            return None;
        };

        match frame {
            Incoming::Ready { resumed, session_id } => {
                let lost = node.handle_ready(resumed, session_id.clone());
                pool.events().emit(Event::NodeReady {
                    node: node.name().to_string(),
                    session_id: session_id.clone(),
                    resumed,
                });

                let node = node.clone();
                tokio::spawn(async move {
                    if lost {
                        pool.rehome(&node, false).await;
                    }
                    pool.rehome_stranded().await;
                });
                return Some(session_id);
            }
            Incoming::Stats(stats) => {
                trace!(node = %node.name(), playing = stats.playing_players, "estadísticas recibidas");
                node.set_stats(stats.clone());
                pool.events().emit(Event::NodeStatsUpdate {
                    node: node.name().to_string(),
                    stats,
                });
            }
            Incoming::PlayerUpdate { guild_id, state } => {
                match pool.player(guild_id) {
                    Some(player) => player.handle_update(node, &state).await,
                    None => destroy_orphan(node, guild_id),
                }
                pool.events().emit(Event::PlayerUpdate { guild_id, state });
            }
            Incoming::Event { guild_id, event } => {
                for app_event in app_events(guild_id, &event) {
                    pool.events().emit(app_event);
                }
                match pool.player(guild_id) {
                    Some(player) => player.handle_event(node, &event).await,
                    None => debug!(node = %node.name(), guild_id = %guild_id, "evento para un player desconocido"),
                }
            }
            Incoming::Unknown { op, .. } => {
                debug!(node = %node.name(), %op, "op no manejado");
            }
        }
        None
    }

    /// The node exhausted its retries or rejected our credential.
    pub(crate) fn node_failed(&self, node: &Arc<Node>) {
        self.spawn_unreachable(node);
    }

    /// The resume window elapsed while the node was away.
    pub(crate) fn session_expired(&self, node: &Arc<Node>) {
        self.spawn_unreachable(node);
    }

    fn spawn_unreachable(&self, node: &Arc<Node>) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let node = node.clone();
        tokio::spawn(async move { pool.on_node_unreachable(&node).await });
    }
}

/// Tells the node to drop a player this pool does not know.
fn destroy_orphan(node: &Node, guild_id: GuildId) {
    debug!(node = %node.name(), guild_id = %guild_id, "destruyendo player remoto huérfano");
    if let Err(e) = node.send(Command::Destroy {
        guild_id: guild_id.to_string(),
    }) {
        debug!(node = %node.name(), error = %e, "destroy del huérfano no entregado");
    }
}

fn app_events(guild_id: GuildId, event: &NodeEvent) -> Vec<Event> {
    match event.clone() {
        NodeEvent::TrackStart { track } => vec![Event::TrackStart { guild_id, track }],
        NodeEvent::TrackEnd { track, reason } => vec![Event::TrackEnd {
            guild_id,
            track,
            reason,
        }],
        NodeEvent::TrackException { track, exception } => vec![Event::TrackException {
            guild_id,
            track,
            exception,
        }],
        NodeEvent::TrackStuck { track, threshold_ms } => vec![Event::TrackStuck {
            guild_id,
            track,
            threshold_ms,
        }],
        NodeEvent::WebSocketClosed {
            code,
            reason,
            by_remote,
        } => {
            let specific = Event::voice_close(guild_id, code, &reason);
            std::iter::once(Event::WebSocketClosed {
                guild_id,
                code,
                reason,
                by_remote,
            })
            .chain(specific)
            .collect()
        }
        NodeEvent::Unknown { kind, payload } => vec![Event::UnknownEvent {
            guild_id,
            kind,
            payload,
        }],
    }
}
