//! # Node Module
//!
//! One [`Node`] per configured server. The node object lives for the whole
//! process; its connection task mutates state in place across reconnects so
//! players can keep holding an `Arc<Node>`.
//!
//! ## Layout
//!
//! - [`protocol`]: frame decoding and outgoing commands
//! - [`connection`]: the WebSocket session loop with backoff and resume
//! - [`dispatcher`]: routes decoded frames to players and listeners
//! - [`rest`]: the HTTP endpoints (track loading, info, sessions)
//!
//! ## Outbound commands
//!
//! [`Node::send`] pushes into an unbounded channel drained by the session
//! loop only while the node is connected. While a resumable session is
//! reconnecting the channel buffers. Every command carries the session epoch
//! it was queued under; when a session turns out to be lost the epoch moves
//! on, the loop skips the stale backlog and players are re-homed instead.

pub mod connection;
pub mod dispatcher;
pub mod protocol;
pub mod rest;

use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use serenity::model::id::{GuildId, UserId};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{LoadWeights, NodeConfig, NodeOptions};
use crate::{Error, Result};
use protocol::{Command, Stats};
use rest::RestClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Failed,
}

/// Command tagged with the session epoch it was queued under.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub(crate) epoch: u64,
    pub(crate) command: Command,
}

/// Handshake identity shared by every node of a pool.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub user_id: UserId,
    pub client_name: String,
}

pub struct Node {
    config: NodeConfig,
    options: NodeOptions,
    identity: ClientIdentity,
    order: usize,
    state: RwLock<NodeState>,
    session_id: RwLock<Option<String>>,
    session_lost: AtomicBool,
    epoch: AtomicU64,
    stats: RwLock<Option<Stats>>,
    players: DashSet<GuildId>,
    outbound: mpsc::UnboundedSender<Outbound>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    cancel: CancellationToken,
    rest: Arc<RestClient>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .field("players", &self.players.len())
            .finish()
    }
}

impl Node {
    /// Builds the node without starting its connection task.
    pub(crate) fn new(
        config: NodeConfig,
        options: NodeOptions,
        identity: ClientIdentity,
        order: usize,
    ) -> Result<Self> {
        let rest = Arc::new(RestClient::new(&config, &options)?);
        let (outbound, receiver) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            options,
            identity,
            order,
            state: RwLock::new(NodeState::Connecting),
            session_id: RwLock::new(None),
            session_lost: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            stats: RwLock::new(None),
            players: DashSet::new(),
            outbound,
            receiver: Mutex::new(Some(receiver)),
            cancel: CancellationToken::new(),
            rest,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn options(&self) -> &NodeOptions {
        &self.options
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn region(&self) -> Option<&str> {
        self.config.region.as_deref()
    }

    /// Registration order within the pool.
    pub fn order(&self) -> usize {
        self.order
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == NodeState::Connected
    }

    pub(crate) fn set_state(&self, state: NodeState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(node = %self.name(), from = ?previous, to = ?state, "estado del nodo cambiado");
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    pub fn stats(&self) -> Option<Stats> {
        self.stats.read().clone()
    }

    pub(crate) fn set_stats(&self, stats: Stats) {
        *self.stats.write() = Some(stats);
    }

    pub fn rest(&self) -> Arc<RestClient> {
        self.rest.clone()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<Outbound>> {
        self.receiver.lock().take()
    }

    /// Whether a queued command still belongs to the live session.
    pub(crate) fn is_current(&self, outbound: &Outbound) -> bool {
        outbound.epoch == self.epoch.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Players asignados
    // ------------------------------------------------------------------

    pub(crate) fn bind(&self, guild_id: GuildId) {
        self.players.insert(guild_id);
    }

    pub(crate) fn unbind(&self, guild_id: GuildId) {
        self.players.remove(&guild_id);
    }

    pub fn is_bound(&self, guild_id: GuildId) -> bool {
        self.players.contains(&guild_id)
    }

    pub fn bound_players(&self) -> Vec<GuildId> {
        self.players.iter().map(|id| *id).collect()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    // ------------------------------------------------------------------
    // Comandos
    // ------------------------------------------------------------------

    /// Queues `command` for the session loop.
    ///
    /// Accepted while connected, or while disconnected with a session that
    /// may still be resumed.
    pub fn send(&self, command: Command) -> Result<()> {
        let accepting = match self.state() {
            NodeState::Connected => true,
            NodeState::Failed => return Err(Error::NodeFailed(self.name().to_string())),
            NodeState::Connecting | NodeState::Disconnected | NodeState::Reconnecting => {
                self.session_id.read().is_some()
            }
        };
        if !accepting {
            return Err(Error::NodeUnavailable);
        }

        debug!(node = %self.name(), op = command.op(), guild_id = command.guild_id(), "encolando comando");
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.outbound
            .send(Outbound { epoch, command })
            .map_err(|_| Error::NodeFailed(self.name().to_string()))
    }

    /// Drops commands buffered for a session that no longer exists.
    fn discard_backlog(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(node = %self.name(), epoch, "época de sesión avanzada");
    }

    // ------------------------------------------------------------------
    // Ciclo de vida de la sesión
    // ------------------------------------------------------------------

    /// Records a `ready` frame and marks the node connected.
    ///
    /// Returns `true` when the previous session could not be resumed while
    /// players were bound to it; those players must be re-homed.
    pub(crate) fn handle_ready(&self, resumed: bool, session_id: String) -> bool {
        let previous = self.session_id.write().replace(session_id.clone());
        let expired = self.session_lost.swap(false, Ordering::SeqCst);
        let lost = !resumed && (expired || previous.is_some()) && !self.players.is_empty();

        if lost {
            warn!(
                node = %self.name(),
                players = self.players.len(),
                "⚠️ La sesión no se reanudó, hay que reubicar los players"
            );
        }
        if !resumed {
            self.discard_backlog();
        }

        info!(node = %self.name(), session_id = %session_id, resumed, "✅ Nodo listo");
        self.set_state(NodeState::Connected);
        lost
    }

    /// Forgets a session whose resume window elapsed while disconnected.
    /// Returns `false` when there was nothing to expire.
    pub(crate) fn expire_session(&self) -> bool {
        if self.session_id.write().take().is_none() {
            return false;
        }
        self.session_lost.store(true, Ordering::SeqCst);
        self.discard_backlog();
        warn!(node = %self.name(), "Ventana de reanudación vencida, sesión descartada");
        true
    }

    /// Stops the connection task. The node ends up failed.
    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
        self.set_state(NodeState::Failed);
    }

    // ------------------------------------------------------------------
    // Carga
    // ------------------------------------------------------------------

    /// Placement penalty. Lower is better; nodes without stats score 0.
    ///
    /// Each component is on a 0-100 scale before weighting: playing
    /// players, CPU load percent, memory used of reservable percent and
    /// lost frames (nulled + deficit) of the expected 3000 per minute.
    pub fn load_score(&self, weights: &LoadWeights) -> f64 {
        let stats = self.stats.read();
        let Some(stats) = stats.as_ref() else {
            return 0.0;
        };

        let players = stats.playing_players as f64;
        let cpu = stats.cpu.system_load * 100.0;
        let memory = if stats.memory.reservable > 0 {
            stats.memory.used as f64 / stats.memory.reservable as f64 * 100.0
        } else {
            0.0
        };
        let frames = stats
            .frame_stats
            .map(|f| (f.nulled + f.deficit).max(0) as f64 / 30.0)
            .unwrap_or(0.0);

        players * weights.players
            + cpu * weights.cpu
            + memory * weights.memory
            + frames * weights.frames
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) fn node_config(name: &str) -> NodeConfig {
        NodeConfig {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port: 2333,
            password: "youshallnotpass".to_string(),
            secure: false,
            region: None,
        }
    }

    pub(crate) fn identity() -> ClientIdentity {
        ClientIdentity {
            user_id: UserId::new(99),
            client_name: "tests".to_string(),
        }
    }

    /// Node with no connection task, already connected.
    pub(crate) fn connected_node(name: &str, order: usize) -> Arc<Node> {
        let node = Node::new(node_config(name), NodeOptions::default(), identity(), order)
            .expect("test node");
        node.handle_ready(false, format!("{name}-session"));
        Arc::new(node)
    }

    /// Drains everything the session loop would have written.
    pub(crate) fn sent(node: &Node) -> Vec<Command> {
        let mut receiver = node.receiver.lock();
        let mut out = Vec::new();
        if let Some(rx) = receiver.as_mut() {
            while let Ok(outbound) = rx.try_recv() {
                if node.is_current(&outbound) {
                    out.push(outbound.command);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use pretty_assertions::assert_eq;
    use protocol::{Cpu, FrameStats, Memory};

    fn stop(guild: &str) -> Command {
        Command::Stop {
            guild_id: guild.to_string(),
        }
    }

    #[test]
    fn test_send_depends_on_state() {
        let node = Node::new(node_config("a"), NodeOptions::default(), identity(), 0).unwrap();
        assert!(matches!(node.send(stop("1")), Err(Error::NodeUnavailable)));

        node.handle_ready(false, "s1".into());
        node.send(stop("1")).unwrap();

        node.set_state(NodeState::Reconnecting);
        node.send(stop("2")).unwrap();
        assert_eq!(sent(&node), vec![stop("1"), stop("2")]);

        node.set_state(NodeState::Failed);
        assert!(matches!(node.send(stop("3")), Err(Error::NodeFailed(_))));
    }

    #[test]
    fn test_resumed_ready_keeps_backlog() {
        let node = connected_node("a", 0);
        node.bind(GuildId::new(1));
        node.set_state(NodeState::Reconnecting);
        node.send(stop("1")).unwrap();

        assert!(!node.handle_ready(true, "a-session".into()));
        assert_eq!(sent(&node), vec![stop("1")]);
        assert!(node.is_bound(GuildId::new(1)));
    }

    #[test]
    fn test_unresumed_ready_reports_loss_and_drops_backlog() {
        let node = connected_node("a", 0);
        node.bind(GuildId::new(1));
        node.set_state(NodeState::Reconnecting);
        node.send(stop("1")).unwrap();

        assert!(node.handle_ready(false, "new".into()));
        assert!(sent(&node).is_empty());
        assert_eq!(node.session_id().as_deref(), Some("new"));
    }

    #[test]
    fn test_expired_session_is_reported_on_next_ready() {
        let node = connected_node("a", 0);
        node.bind(GuildId::new(1));
        node.set_state(NodeState::Disconnected);

        assert!(node.expire_session());
        assert!(!node.expire_session());
        assert!(matches!(node.send(stop("1")), Err(Error::NodeUnavailable)));
        assert!(node.handle_ready(false, "fresh".into()));
    }

    #[test]
    fn test_load_score() {
        let node = connected_node("a", 0);
        let weights = LoadWeights::default();
        assert_eq!(node.load_score(&weights), 0.0);

        node.set_stats(Stats {
            players: 4,
            playing_players: 2,
            uptime: 0,
            memory: Memory {
                free: 0,
                used: 50,
                allocated: 100,
                reservable: 100,
            },
            cpu: Cpu {
                cores: 2,
                system_load: 0.25,
                lavalink_load: 0.1,
            },
            frame_stats: Some(FrameStats {
                sent: 2970,
                nulled: 15,
                deficit: 15,
            }),
        });
        // 2 + 25 + 50 * 0.5 + 1
        assert_eq!(node.load_score(&weights), 53.0);
    }
}
