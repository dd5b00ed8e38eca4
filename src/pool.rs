//! # Node Pool
//!
//! The one registry of nodes and players. Cloning a [`NodePool`] hands out
//! another handle to the same registry.
//!
//! Placement ranks connected nodes by [`Node::load_score`], then by the
//! number of bound players, then by registration order. When a node becomes
//! unreachable its players are re-homed onto the best remaining node; when
//! there is none they are paused and stay where they are until some node
//! comes back.

use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::RwLock;
use serenity::model::id::{GuildId, UserId};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tracing::{debug, info, warn};

use crate::audio::player::Player;
use crate::cache::QueryCache;
use crate::config::{Config, LoadWeights, NodeConfig, NodeOptions};
use crate::events::{Event, EventHub, EventKind, EventListener};
use crate::node::{connection, dispatcher::Dispatcher, ClientIdentity, Node, NodeState};
use crate::node::rest::TrackLoader;
use crate::sources::{LoadResult, SearchSource};
use crate::{Error, Result};

pub(crate) struct PoolInner {
    identity: ClientIdentity,
    options: NodeOptions,
    weights: LoadWeights,
    nodes: RwLock<Vec<Arc<Node>>>,
    players: DashMap<GuildId, Arc<Player>>,
    events: Arc<EventHub>,
    cache: QueryCache,
    next_order: AtomicUsize,
}

impl PoolInner {
    pub(crate) fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub(crate) fn player(&self, guild_id: GuildId) -> Option<Arc<Player>> {
        self.players.get(&guild_id).map(|p| p.value().clone())
    }

    /// Crea el nodo salvo que ya exista uno con el mismo nombre. Devuelve el
    /// nodo y si es nuevo.
    fn add_node(&self, config: NodeConfig) -> Result<(Arc<Node>, bool)> {
        let mut nodes = self.nodes.write();
        if let Some(existing) = nodes.iter().find(|n| n.name() == config.name) {
            if existing.config() == &config {
                return Ok((existing.clone(), false));
            }
            return Err(Error::InvalidData(format!(
                "node {} is already registered with a different config",
                config.name
            )));
        }

        let order = self.next_order.fetch_add(1, Ordering::SeqCst);
        let node = Arc::new(Node::new(
            config,
            self.options.clone(),
            self.identity.clone(),
            order,
        )?);
        nodes.push(node.clone());
        Ok((node, true))
    }

    /// Mejor nodo conectado, prefiriendo `region` cuando algún nodo la sirve.
    fn select(&self, region: Option<&str>, exclude: Option<&Arc<Node>>) -> Result<Arc<Node>> {
        let nodes = self.nodes.read();
        let candidates: Vec<&Arc<Node>> = nodes
            .iter()
            .filter(|n| n.is_connected())
            .filter(|n| exclude.map_or(true, |x| !Arc::ptr_eq(*n, x)))
            .collect();

        let regional: Vec<&Arc<Node>> = match region {
            Some(region) => candidates
                .iter()
                .copied()
                .filter(|n| n.region().is_some_and(|r| r.eq_ignore_ascii_case(region)))
                .collect(),
            None => Vec::new(),
        };
        let pick_from = if regional.is_empty() { candidates } else { regional };

        pick_from
            .into_iter()
            .min_by(|a, b| {
                a.load_score(&self.weights)
                    .total_cmp(&b.load_score(&self.weights))
                    .then_with(|| a.player_count().cmp(&b.player_count()))
                    .then_with(|| a.order().cmp(&b.order()))
            })
            .cloned()
            .ok_or(Error::NodeUnavailable)
    }

    /// Saca un player de `from`. Devuelve `false` si ningún nodo lo tomó.
    async fn rehome_player(&self, player: &Player, from: &Arc<Node>, exclude_source: bool) -> bool {
        let exclude = exclude_source.then_some(from);
        let target = match self.select(from.region(), exclude) {
            Ok(target) => target,
            Err(_) => return false,
        };

        if let Err(e) = player.migrate(from, target.clone()).await {
            warn!(guild_id = %player.guild_id(), node = %target.name(), error = %e, "la migración no se completó");
            player.migration_failed(&target).await;
        }
        true
    }

    /// Reubica cada player asignado a `from`. Sin `exclude_source` el propio
    /// origen sigue siendo elegible, como tras una reconexión que perdió la
    /// sesión.
    pub(crate) async fn rehome(&self, from: &Arc<Node>, exclude_source: bool) {
        let guilds = from.bound_players();
        if guilds.is_empty() {
            return;
        }
        info!(node = %from.name(), players = guilds.len(), "🔄 Reubicando players");

        for guild_id in guilds {
            let Some(player) = self.player(guild_id) else {
                from.unbind(guild_id);
                continue;
            };
            if !self.rehome_player(&player, from, exclude_source).await {
                player.migration_failed(from).await;
            }
        }
    }

    /// El nodo falló o su sesión ya no se puede reanudar.
    pub(crate) async fn on_node_unreachable(&self, node: &Arc<Node>) {
        self.rehome(node, true).await;
    }

    /// Reintenta los players que quedaron pausados en un nodo fallido o expirado.
    pub(crate) async fn rehome_stranded(&self) {
        let players: Vec<Arc<Player>> = self.players.iter().map(|p| p.value().clone()).collect();
        for player in players {
            let node = player.node().await;
            let stranded = node.state() == NodeState::Failed
                || (!node.is_connected() && node.session_id().is_none());
            if stranded && !self.rehome_player(&player, &node, true).await {
                debug!(guild_id = %player.guild_id(), "todavía no hay nodo para el player varado");
            }
        }
    }
}

/// Handle to the node and player registry.
#[derive(Clone)]
pub struct NodePool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for NodePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodePool")
            .field("nodes", &self.inner.nodes.read().len())
            .field("players", &self.inner.players.len())
            .finish()
    }
}

impl NodePool {
    pub fn new(
        identity: ClientIdentity,
        options: NodeOptions,
        weights: LoadWeights,
        cache_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                identity,
                options,
                weights,
                nodes: RwLock::new(Vec::new()),
                players: DashMap::new(),
                events: Arc::new(EventHub::new()),
                cache: QueryCache::new(cache_size),
                next_order: AtomicUsize::new(0),
            }),
        }
    }

    /// Builds an empty pool from the loaded configuration. Nodes are not
    /// registered yet.
    pub fn from_config(config: &Config) -> Result<Self> {
        if config.user_id == 0 {
            return Err(Error::InvalidData("user id must not be 0".into()));
        }
        Ok(Self::new(
            ClientIdentity {
                user_id: UserId::new(config.user_id),
                client_name: config.client_name.clone(),
            },
            config.node_options.clone(),
            config.load_weights,
            config.cache_size,
        ))
    }

    // ------------------------------------------------------------------
    // Nodos
    // ------------------------------------------------------------------

    /// Adds a node and starts connecting it. Registering an identical
    /// config again returns the existing node.
    pub fn register(&self, config: NodeConfig) -> Result<Arc<Node>> {
        let (node, created) = self.inner.add_node(config)?;
        if created {
            info!(node = %node.name(), url = %node.config().websocket_url(), "➕ Nodo registrado");
            let dispatcher = Dispatcher::new(Arc::downgrade(&self.inner));
            tokio::spawn(connection::run(node.clone(), dispatcher));
        } else {
            debug!(node = %node.name(), "nodo ya registrado");
        }
        Ok(node)
    }

    /// Detiene el nodo y mueve sus players a otro.
    pub async fn remove_node(&self, name: &str) -> Result<()> {
        let node = {
            let mut nodes = self.inner.nodes.write();
            let index = nodes
                .iter()
                .position(|n| n.name() == name)
                .ok_or_else(|| Error::InvalidData(format!("unknown node {name}")))?;
            nodes.remove(index)
        };

        node.shutdown();
        info!(node = %name, "➖ Nodo eliminado");
        self.inner.on_node_unreachable(&node).await;
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.inner.nodes.read().iter().find(|n| n.name() == name).cloned()
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.inner.nodes.read().clone()
    }

    /// Least-loaded connected node. Fails with `NodeUnavailable` when no
    /// node is connected.
    pub fn select_node(&self, region: Option<&str>) -> Result<Arc<Node>> {
        self.inner.select(region, None)
    }

    // ------------------------------------------------------------------
    // Players
    // ------------------------------------------------------------------

    /// Returns the guild's player, creating it on the best node if needed.
    pub fn create_player(&self, guild_id: GuildId, region: Option<&str>) -> Result<Arc<Player>> {
        match self.inner.players.entry(guild_id) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let node = self.inner.select(region, None)?;
                info!(guild_id = %guild_id, node = %node.name(), "🎵 Player creado");
                let player = Arc::new(Player::new(guild_id, node, self.inner.events.clone()));
                slot.insert(player.clone());
                Ok(player)
            }
        }
    }

    pub fn get_player(&self, guild_id: GuildId) -> Option<Arc<Player>> {
        self.inner.player(guild_id)
    }

    pub fn players(&self) -> Vec<Arc<Player>> {
        self.inner.players.iter().map(|p| p.value().clone()).collect()
    }

    /// Destruye el player en su nodo y lo olvida.
    pub async fn destroy_player(&self, guild_id: GuildId) -> Result<()> {
        let (_, player) = self
            .inner
            .players
            .remove(&guild_id)
            .ok_or_else(|| Error::InvalidState(format!("no player for guild {guild_id}")))?;

        if let Err(e) = player.destroy().await {
            debug!(guild_id = %guild_id, error = %e, "el player ya estaba destruido");
        }
        self.inner.events.emit(Event::PlayerDisconnect { guild_id });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tracks
    // ------------------------------------------------------------------

    /// Resolves `query` through the cache on the least-loaded node.
    pub async fn load_tracks(&self, query: &str, source: SearchSource) -> Result<LoadResult> {
        let node = self.inner.select(None, None)?;
        let loader: Arc<dyn TrackLoader> = node.rest();
        self.inner.cache.get_or_resolve(source, query, loader).await
    }

    pub fn cache(&self) -> &QueryCache {
        &self.inner.cache
    }

    // ------------------------------------------------------------------
    // Eventos
    // ------------------------------------------------------------------

    pub fn events(&self) -> &Arc<EventHub> {
        &self.inner.events
    }

    pub fn on(&self, kind: EventKind, listener: Arc<dyn EventListener>) {
        self.inner.events.on(kind, listener);
    }

    /// Cancela la tarea de cada nodo. Los players quedan como están.
    pub fn shutdown(&self) {
        for node in self.inner.nodes.read().iter() {
            node.shutdown();
        }
        info!(players = self.inner.players.len(), "🛑 Pool de nodos detenido");
    }
}

#[cfg(test)]
impl NodePool {
    /// Agrega un nodo ya construido sin lanzar su tarea de conexión.
    pub(crate) fn attach(&self, node: Arc<Node>) {
        self.inner.nodes.write().push(node);
    }

    pub(crate) fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(Arc::downgrade(&self.inner))
    }

    pub(crate) fn inner(&self) -> &Arc<PoolInner> {
        &self.inner
    }

    /// Registra un player asignado a `node` sin importar su estado.
    pub(crate) fn adopt(&self, guild_id: GuildId, node: Arc<Node>) -> Arc<Player> {
        let player = Arc::new(Player::new(guild_id, node, self.inner.events.clone()));
        self.inner.players.insert(guild_id, player.clone());
        player
    }
}
