use serenity::model::id::GuildId;
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, warn};

use super::filters::{FilterDelta, FilterSet};
use super::queue::{LoopMode, TrackQueue};
use crate::events::{Event, EventHub};
use crate::node::protocol::{Command, NodeEvent, PlayerUpdateState, TrackEndReason};
use crate::node::Node;
use crate::sources::Track;
use crate::{Error, Result};

pub const DEFAULT_VOLUME: u16 = 100;
pub const MAX_VOLUME: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Idle,
    Playing,
    Paused,
    Destroyed,
}

/// Credenciales de voz entregadas por el gateway de Discord.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceState {
    pub session_id: String,
    pub token: String,
    pub endpoint: String,
}

/// Última posición conocida y el instante en que se tomó.
#[derive(Debug, Clone, Copy)]
struct PositionClock {
    position_ms: u64,
    taken_at: Instant,
}

impl PositionClock {
    fn new() -> Self {
        Self {
            position_ms: 0,
            taken_at: Instant::now(),
        }
    }

    fn reset(&mut self, position_ms: u64) {
        self.position_ms = position_ms;
        self.taken_at = Instant::now();
    }

    /// Extrapolates while `running`, never past `limit_ms`.
    fn read(&self, running: bool, limit_ms: Option<u64>) -> u64 {
        let position = if running {
            let elapsed = u64::try_from(self.taken_at.elapsed().as_millis()).unwrap_or(u64::MAX);
            self.position_ms.saturating_add(elapsed)
        } else {
            self.position_ms
        };
        limit_ms.map_or(position, |limit| position.min(limit))
    }
}

/// Qué significa un evento del nodo para el player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reaction {
    Ignore,
    Started,
    /// Pop the next track honoring the loop mode.
    Advance,
    /// Move past the current track even when looping it.
    Skip,
}

/// Pure transition function of the player state machine.
///
/// Events about a track that is no longer current are stale and ignored;
/// this covers `replaced` ends, the `stopped` end caused by [`Player::stop`]
/// and the `loadFailed` end that trails an exception already skipped.
pub(crate) fn react(state: PlayState, current: Option<&Track>, event: &NodeEvent) -> Reaction {
    if state == PlayState::Destroyed {
        return Reaction::Ignore;
    }
    let Some(track) = event.track() else {
        return Reaction::Ignore;
    };
    if current != Some(track) {
        return Reaction::Ignore;
    }

    match event {
        NodeEvent::TrackStart { .. } => Reaction::Started,
        NodeEvent::TrackEnd { reason, .. } => match reason {
            TrackEndReason::Replaced => Reaction::Ignore,
            TrackEndReason::Finished | TrackEndReason::Stopped | TrackEndReason::Cleanup => {
                Reaction::Advance
            }
            TrackEndReason::LoadFailed => Reaction::Skip,
        },
        NodeEvent::TrackException { .. } | NodeEvent::TrackStuck { .. } => Reaction::Skip,
        NodeEvent::WebSocketClosed { .. } | NodeEvent::Unknown { .. } => Reaction::Ignore,
    }
}

struct PlayerCore {
    state: PlayState,
    node: Arc<Node>,
    queue: TrackQueue,
    clock: PositionClock,
    volume: u16,
    filters: FilterSet,
    voice: Option<VoiceState>,
    voice_connected: bool,
    ping_ms: i64,
    /// Pausado porque ningún nodo pudo tomarlo; se reanuda en la próxima migración.
    paused_by_failover: bool,
}

impl PlayerCore {
    fn ensure_alive(&self) -> Result<()> {
        if self.state == PlayState::Destroyed {
            return Err(Error::InvalidState("player has been destroyed".into()));
        }
        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        self.ensure_alive()?;
        if self.state == PlayState::Idle || self.queue.current().is_none() {
            return Err(Error::InvalidState("nothing is playing".into()));
        }
        Ok(())
    }

    fn limit_ms(&self) -> Option<u64> {
        self.queue
            .current()
            .and_then(Track::duration)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    fn position_ms(&self) -> u64 {
        self.clock
            .read(self.state == PlayState::Playing, self.limit_ms())
    }
}

/// Playback session of one guild.
///
/// Every mutation goes through one async lock, so application calls and
/// reactions to node events are serialized.
pub struct Player {
    guild_id: GuildId,
    events: Arc<EventHub>,
    core: Mutex<PlayerCore>,
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player").field("guild_id", &self.guild_id).finish()
    }
}

impl Player {
    pub(crate) fn new(guild_id: GuildId, node: Arc<Node>, events: Arc<EventHub>) -> Self {
        node.bind(guild_id);
        Self {
            guild_id,
            events,
            core: Mutex::new(PlayerCore {
                state: PlayState::Idle,
                node,
                queue: TrackQueue::new(),
                clock: PositionClock::new(),
                volume: DEFAULT_VOLUME,
                filters: FilterSet::default(),
                voice: None,
                voice_connected: false,
                ping_ms: -1,
                paused_by_failover: false,
            }),
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    fn key(&self) -> String {
        self.guild_id.to_string()
    }

    // ------------------------------------------------------------------
    // Accesores
    // ------------------------------------------------------------------

    pub async fn node(&self) -> Arc<Node> {
        self.core.lock().await.node.clone()
    }

    pub async fn state(&self) -> PlayState {
        self.core.lock().await.state
    }

    pub async fn current(&self) -> Option<Track> {
        self.core.lock().await.queue.current().cloned()
    }

    /// Extrapolated playback position, clamped to the track length.
    pub async fn position(&self) -> Duration {
        Duration::from_millis(self.core.lock().await.position_ms())
    }

    pub async fn volume(&self) -> u16 {
        self.core.lock().await.volume
    }

    pub async fn filters(&self) -> FilterSet {
        self.core.lock().await.filters.clone()
    }

    /// Voice connection flag and latency from the last `playerUpdate`.
    pub async fn voice_status(&self) -> (bool, Option<Duration>) {
        let core = self.core.lock().await;
        let ping = u64::try_from(core.ping_ms).ok().map(Duration::from_millis);
        (core.voice_connected, ping)
    }

    pub async fn queue(&self) -> Vec<Track> {
        self.core.lock().await.queue.tracks().cloned().collect()
    }

    pub async fn history(&self) -> Vec<Track> {
        self.core.lock().await.queue.history().to_vec()
    }

    pub async fn loop_mode(&self) -> LoopMode {
        self.core.lock().await.queue.loop_mode()
    }

    // ------------------------------------------------------------------
    // Cola
    // ------------------------------------------------------------------

    pub async fn enqueue(&self, track: Track) -> Result<()> {
        let mut core = self.core.lock().await;
        core.ensure_alive()?;
        core.queue.enqueue(track);
        Ok(())
    }

    pub async fn enqueue_many(&self, tracks: Vec<Track>) -> Result<usize> {
        let mut core = self.core.lock().await;
        core.ensure_alive()?;
        Ok(core.queue.enqueue_many(tracks))
    }

    /// Plays `track` right away when idle, otherwise appends it.
    /// Returns `true` when playback started.
    pub async fn play_or_enqueue(&self, track: Track) -> Result<bool> {
        let mut core = self.core.lock().await;
        core.ensure_alive()?;
        if core.state == PlayState::Idle {
            self.start(&mut core, track)?;
            Ok(true)
        } else {
            core.queue.enqueue(track);
            Ok(false)
        }
    }

    pub async fn remove(&self, index: usize) -> Result<Track> {
        let mut core = self.core.lock().await;
        core.ensure_alive()?;
        core.queue.remove(index)
    }

    pub async fn shuffle(&self) -> Result<()> {
        let mut core = self.core.lock().await;
        core.ensure_alive()?;
        core.queue.shuffle();
        Ok(())
    }

    pub async fn clear_queue(&self) -> Result<()> {
        let mut core = self.core.lock().await;
        core.ensure_alive()?;
        core.queue.clear();
        Ok(())
    }

    pub async fn set_loop(&self, mode: LoopMode) -> Result<()> {
        let mut core = self.core.lock().await;
        core.ensure_alive()?;
        core.queue.set_loop_mode(mode);
        debug!(guild_id = %self.guild_id, ?mode, "modo de loop cambiado");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Comandos de reproducción
    // ------------------------------------------------------------------

    fn play_command(&self, core: &PlayerCore, track: &Track, pause: bool) -> Command {
        Command::Play {
            guild_id: self.key(),
            track: track.encoded.clone(),
            start_time: None,
            volume: core.volume,
            pause,
            no_replace: false,
        }
    }

    /// Sends `play` for an explicit track; the node replaces whatever plays.
    fn start(&self, core: &mut PlayerCore, track: Track) -> Result<()> {
        core.node.send(self.play_command(core, &track, false))?;
        info!(guild_id = %self.guild_id, node = %core.node.name(), title = %track.title(), "🎵 Reproduciendo");
        core.queue.start(track);
        core.state = PlayState::Playing;
        core.paused_by_failover = false;
        core.clock.reset(0);
        Ok(())
    }

    pub async fn play(&self, track: Track) -> Result<()> {
        let mut core = self.core.lock().await;
        core.ensure_alive()?;
        self.start(&mut core, track)
    }

    /// Moves to the next queued track, ignoring a track loop.
    /// Returns the new track, or `None` when the queue ran out.
    pub async fn skip(&self) -> Result<Option<Track>> {
        let mut core = self.core.lock().await;
        core.ensure_alive()?;
        let was_playing = core.queue.current().is_some();
        let next = self.advance(&mut core, true);
        if next.is_none() && was_playing {
            core.node.send(Command::Stop { guild_id: self.key() })?;
        }
        Ok(next)
    }

    /// Stops the current track and goes idle. The queue is kept.
    pub async fn stop(&self) -> Result<()> {
        let mut core = self.core.lock().await;
        core.ensure_alive()?;
        core.queue.finish_current();
        core.state = PlayState::Idle;
        core.clock.reset(0);
        core.node.send(Command::Stop { guild_id: self.key() })
    }

    pub async fn pause(&self) -> Result<()> {
        self.set_paused(true).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.set_paused(false).await
    }

    async fn set_paused(&self, paused: bool) -> Result<()> {
        let mut core = self.core.lock().await;
        core.ensure_active()?;
        core.node.send(Command::Pause {
            guild_id: self.key(),
            pause: paused,
        })?;

        let position = core.position_ms();
        core.clock.reset(position);
        core.state = if paused {
            PlayState::Paused
        } else {
            PlayState::Playing
        };
        core.paused_by_failover = false;
        Ok(())
    }

    /// Seeks within the current track. The local position is updated
    /// optimistically and corrected by the next `playerUpdate`.
    pub async fn seek(&self, position: Duration) -> Result<()> {
        let mut core = self.core.lock().await;
        core.ensure_active()?;
        if core.queue.current().is_some_and(|t| !t.info.is_seekable) {
            return Err(Error::InvalidState("current track is not seekable".into()));
        }

        let requested = u64::try_from(position.as_millis()).unwrap_or(u64::MAX);
        let target = core.limit_ms().map_or(requested, |limit| requested.min(limit));
        core.node.send(Command::Seek {
            guild_id: self.key(),
            position: target,
        })?;
        core.clock.reset(target);
        Ok(())
    }

    /// Ajusta el volumen, limitado a 0..=1000. Devuelve el valor aplicado.
    pub async fn set_volume(&self, volume: u16) -> Result<u16> {
        let mut core = self.core.lock().await;
        core.ensure_alive()?;
        let volume = volume.min(MAX_VOLUME);
        core.node.send(Command::Volume {
            guild_id: self.key(),
            volume,
        })?;
        core.volume = volume;
        Ok(volume)
    }

    /// Merges `delta` into the active filters and sends the combined set.
    pub async fn set_filters(&self, delta: FilterDelta) -> Result<()> {
        let mut core = self.core.lock().await;
        core.ensure_alive()?;
        self.apply_filters(&mut core, &delta)
    }

    pub async fn clear_filters(&self) -> Result<()> {
        let mut core = self.core.lock().await;
        core.ensure_alive()?;
        let delta = FilterDelta::clear_all(&core.filters);
        self.apply_filters(&mut core, &delta)
    }

    fn apply_filters(&self, core: &mut PlayerCore, delta: &FilterDelta) -> Result<()> {
        let next = core.filters.merged(delta)?;
        core.node.send(Command::Filters {
            guild_id: self.key(),
            filters: next.to_payload()?,
        })?;
        debug!(guild_id = %self.guild_id, filters = ?next.kinds(), "filtros aplicados");
        core.filters = next;
        Ok(())
    }

    /// Reenvía credenciales de voz nuevas al nodo.
    pub async fn update_voice(&self, voice: VoiceState) -> Result<()> {
        let mut core = self.core.lock().await;
        core.ensure_alive()?;
        core.node.send(Command::VoiceUpdate {
            guild_id: self.key(),
            session_id: voice.session_id.clone(),
            token: voice.token.clone(),
            endpoint: voice.endpoint.clone(),
        })?;
        core.voice = Some(voice);
        Ok(())
    }

    /// Tears the player down on its node. Later calls fail with `InvalidState`.
    pub async fn destroy(&self) -> Result<()> {
        let mut core = self.core.lock().await;
        core.ensure_alive()?;
        if let Err(e) = core.node.send(Command::Destroy { guild_id: self.key() }) {
            debug!(guild_id = %self.guild_id, error = %e, "destroy no entregado");
        }
        core.node.unbind(self.guild_id);
        core.queue.finish_current();
        core.queue.clear();
        core.state = PlayState::Destroyed;
        info!(guild_id = %self.guild_id, "Player destruido");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transiciones impulsadas por el nodo
    // ------------------------------------------------------------------

    /// Pops the next track and plays it, or goes idle and raises `QueueEnd`.
    fn advance(&self, core: &mut PlayerCore, skip: bool) -> Option<Track> {
        let next = if skip {
            core.queue.skip()
        } else {
            core.queue.pop_next()
        };

        match next {
            Some(track) => {
                if let Err(e) = core.node.send(self.play_command(core, &track, false)) {
                    warn!(guild_id = %self.guild_id, error = %e, "no se pudo iniciar el siguiente track");
                }
                debug!(guild_id = %self.guild_id, title = %track.title(), "siguiente track seleccionado");
                core.state = PlayState::Playing;
                core.clock.reset(0);
                Some(track)
            }
            None => {
                core.state = PlayState::Idle;
                core.clock.reset(0);
                info!(guild_id = %self.guild_id, "📭 Cola vacía");
                self.events.emit(Event::QueueEnd {
                    guild_id: self.guild_id,
                });
                None
            }
        }
    }

    /// Applies a position report. Reports from a node the player has left
    /// are ignored.
    pub(crate) async fn handle_update(&self, node: &Arc<Node>, update: &PlayerUpdateState) {
        let mut core = self.core.lock().await;
        if core.state == PlayState::Destroyed || !Arc::ptr_eq(&core.node, node) {
            return;
        }
        if core.queue.current().is_some() {
            core.clock.reset(update.position);
        }
        core.voice_connected = update.connected;
        core.ping_ms = update.ping;
    }

    /// Pasa un evento del nodo por la máquina de estados.
    pub(crate) async fn handle_event(&self, node: &Arc<Node>, event: &NodeEvent) {
        let mut core = self.core.lock().await;
        if !Arc::ptr_eq(&core.node, node) {
            debug!(guild_id = %self.guild_id, node = %node.name(), "evento del nodo anterior ignorado");
            return;
        }

        match react(core.state, core.queue.current(), event) {
            Reaction::Ignore => {}
            Reaction::Started => {
                debug!(guild_id = %self.guild_id, "track iniciado en el nodo");
            }
            Reaction::Advance => {
                self.advance(&mut core, false);
            }
            Reaction::Skip => {
                warn!(guild_id = %self.guild_id, "⏭️ Track fallido, saltando");
                self.advance(&mut core, true);
            }
        }
    }

    /// Rebinds the player from `from` to `target` and replays its state
    /// there. Does nothing when the player already left `from`.
    pub(crate) async fn migrate(&self, from: &Arc<Node>, target: Arc<Node>) -> Result<()> {
        let mut core = self.core.lock().await;
        if core.state == PlayState::Destroyed || !Arc::ptr_eq(&core.node, from) {
            return Ok(());
        }

        let position = core.position_ms();
        core.clock.reset(position);

        from.unbind(self.guild_id);
        target.bind(self.guild_id);
        core.node = target.clone();

        if core.paused_by_failover {
            core.state = PlayState::Playing;
            core.paused_by_failover = false;
        }

        if let Some(voice) = core.voice.clone() {
            target.send(Command::VoiceUpdate {
                guild_id: self.key(),
                session_id: voice.session_id,
                token: voice.token,
                endpoint: voice.endpoint,
            })?;
        }
        if let Some(track) = core.queue.current().cloned() {
            let paused = core.state == PlayState::Paused;
            target.send(self.play_command(&core, &track, paused))?;
            target.send(Command::Seek {
                guild_id: self.key(),
                position,
            })?;
            target.send(Command::Filters {
                guild_id: self.key(),
                filters: core.filters.to_payload()?,
            })?;
        } else if !core.filters.is_empty() {
            target.send(Command::Filters {
                guild_id: self.key(),
                filters: core.filters.to_payload()?,
            })?;
        }

        info!(
            guild_id = %self.guild_id,
            from = %from.name(),
            to = %target.name(),
            position_ms = position,
            "🔄 Player migrado"
        );
        self.events.emit(Event::PlayerMigrated {
            guild_id: self.guild_id,
            from: from.name().to_string(),
            to: target.name().to_string(),
        });
        Ok(())
    }

    /// Ningún nodo pudo tomar el player: pausa local y aviso a la app.
    pub(crate) async fn migration_failed(&self, from: &Arc<Node>) {
        let mut core = self.core.lock().await;
        if core.state == PlayState::Destroyed || !Arc::ptr_eq(&core.node, from) {
            return;
        }
        let position = core.position_ms();
        core.clock.reset(position);
        if core.state == PlayState::Playing {
            core.state = PlayState::Paused;
            core.paused_by_failover = true;
        }
        warn!(guild_id = %self.guild_id, node = %core.node.name(), "⚠️ No hay nodo disponible, player pausado");
        self.events.emit(Event::MigrationFailed {
            guild_id: self.guild_id,
            node: core.node.name().to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::filters::{Filter, FilterKind, Timescale};
    use crate::events::EventKind;
    use crate::node::testing::{connected_node, sent};
    use crate::sources::fixtures::track;
    use crate::sources::{Severity, TrackError};
    use pretty_assertions::assert_eq;
    use tokio::sync::broadcast;

    fn setup() -> (Arc<Node>, Player, broadcast::Receiver<Event>) {
        let node = connected_node("main", 0);
        let hub = Arc::new(EventHub::new());
        let events = hub.subscribe();
        let player = Player::new(GuildId::new(42), node.clone(), hub);
        (node, player, events)
    }

    fn ops(node: &Node) -> Vec<&'static str> {
        sent(node).iter().map(Command::op).collect()
    }

    fn end(t: &Track, reason: TrackEndReason) -> NodeEvent {
        NodeEvent::TrackEnd {
            track: t.clone(),
            reason,
        }
    }

    fn played(node: &Node) -> Vec<String> {
        sent(node)
            .into_iter()
            .filter_map(|c| match c {
                Command::Play { track, .. } => Some(track),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_react_table() {
        let a = track("a", 1000);
        let b = track("b", 1000);
        let playing = PlayState::Playing;

        assert_eq!(react(playing, Some(&a), &end(&a, TrackEndReason::Finished)), Reaction::Advance);
        assert_eq!(react(playing, Some(&a), &end(&a, TrackEndReason::Cleanup)), Reaction::Advance);
        assert_eq!(react(playing, Some(&a), &end(&a, TrackEndReason::Replaced)), Reaction::Ignore);
        assert_eq!(react(playing, Some(&a), &end(&a, TrackEndReason::LoadFailed)), Reaction::Skip);
        assert_eq!(react(playing, Some(&b), &end(&a, TrackEndReason::Finished)), Reaction::Ignore);
        assert_eq!(react(PlayState::Idle, None, &end(&a, TrackEndReason::Stopped)), Reaction::Ignore);
        assert_eq!(
            react(PlayState::Destroyed, Some(&a), &end(&a, TrackEndReason::Finished)),
            Reaction::Ignore
        );
        assert_eq!(
            react(playing, Some(&a), &NodeEvent::TrackStart { track: a.clone() }),
            Reaction::Started
        );
    }

    #[tokio::test]
    async fn test_play_replaced_does_not_advance() {
        let (node, player, _events) = setup();
        let a = track("a", 10_000);
        let b = track("b", 10_000);
        player.enqueue(track("queued", 1000)).await.unwrap();

        player.play(a.clone()).await.unwrap();
        player.play(b.clone()).await.unwrap();
        assert_eq!(played(&node), vec!["a", "b"]);

        player.handle_event(&node, &end(&a, TrackEndReason::Replaced)).await;
        player.handle_event(&node, &NodeEvent::TrackStart { track: b.clone() }).await;

        assert!(sent(&node).is_empty());
        assert_eq!(player.current().await, Some(b));
        assert_eq!(player.state().await, PlayState::Playing);
        assert_eq!(player.queue().await.len(), 1);
    }

    #[tokio::test]
    async fn test_finished_advances_then_queue_end() {
        let (node, player, mut events) = setup();
        let a = track("a", 1000);
        let b = track("b", 1000);
        player.play(a.clone()).await.unwrap();
        player.enqueue(b.clone()).await.unwrap();
        sent(&node);

        player.handle_event(&node, &end(&a, TrackEndReason::Finished)).await;
        assert_eq!(played(&node), vec!["b"]);
        assert_eq!(player.current().await, Some(b.clone()));

        player.handle_event(&node, &end(&b, TrackEndReason::Finished)).await;
        assert_eq!(player.state().await, PlayState::Idle);
        assert_eq!(events.recv().await.unwrap().kind(), EventKind::QueueEnd);
        assert_eq!(
            player.history().await.iter().map(|t| t.encoded.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }

    #[tokio::test]
    async fn test_stop_makes_stopped_end_stale() {
        let (node, player, _events) = setup();
        let a = track("a", 1000);
        player.play(a.clone()).await.unwrap();
        player.enqueue(track("b", 1000)).await.unwrap();
        player.stop().await.unwrap();
        assert_eq!(ops(&node), vec!["play", "stop"]);

        player.handle_event(&node, &end(&a, TrackEndReason::Stopped)).await;
        assert!(sent(&node).is_empty());
        assert_eq!(player.state().await, PlayState::Idle);
        assert_eq!(player.queue().await.len(), 1);
    }

    #[tokio::test]
    async fn test_exception_skips_once() {
        let (node, player, _events) = setup();
        let a = track("a", 1000);
        player.play(a.clone()).await.unwrap();
        player.enqueue(track("b", 1000)).await.unwrap();
        player.set_loop(LoopMode::Track).await.unwrap();
        sent(&node);

        let exception = NodeEvent::TrackException {
            track: a.clone(),
            exception: TrackError {
                message: Some("boom".into()),
                severity: Severity::Fault,
                cause: "x".into(),
            },
        };
        player.handle_event(&node, &exception).await;
        player.handle_event(&node, &end(&a, TrackEndReason::LoadFailed)).await;

        assert_eq!(played(&node), vec!["b"]);
    }

    #[tokio::test]
    async fn test_invalid_state_rejections() {
        let (_node, player, _events) = setup();
        assert!(matches!(player.pause().await, Err(Error::InvalidState(_))));
        assert!(matches!(
            player.seek(Duration::from_secs(1)).await,
            Err(Error::InvalidState(_))
        ));

        player.destroy().await.unwrap();
        assert_eq!(player.state().await, PlayState::Destroyed);
        assert!(matches!(player.play(track("a", 1)).await, Err(Error::InvalidState(_))));
        assert!(matches!(player.set_volume(50).await, Err(Error::InvalidState(_))));
        assert!(matches!(player.destroy().await, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_destroy_unbinds() {
        let (node, player, _events) = setup();
        assert!(node.is_bound(GuildId::new(42)));
        player.destroy().await.unwrap();
        assert!(!node.is_bound(GuildId::new(42)));
        assert_eq!(ops(&node), vec!["destroy"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_position_extrapolates_and_clamps() {
        let (node, player, _events) = setup();
        player.play(track("a", 10_000)).await.unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(player.position().await, Duration::from_secs(3));

        player.pause().await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(player.position().await, Duration::from_secs(3));

        player.resume().await.unwrap();
        let update = PlayerUpdateState {
            time: chrono::Utc::now(),
            position: 1_000,
            connected: true,
            ping: 12,
        };
        player.handle_update(&node, &update).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(player.position().await, Duration::from_secs(3));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(player.position().await, Duration::from_secs(10));
        assert_eq!(
            player.voice_status().await,
            (true, Some(Duration::from_millis(12)))
        );
    }

    #[tokio::test]
    async fn test_seek_is_clamped_and_sent() {
        let (node, player, _events) = setup();
        player.play(track("a", 5_000)).await.unwrap();
        player.seek(Duration::from_secs(60)).await.unwrap();
        let seeks: Vec<_> = sent(&node)
            .into_iter()
            .filter_map(|c| match c {
                Command::Seek { position, .. } => Some(position),
                _ => None,
            })
            .collect();
        assert_eq!(seeks, vec![5_000]);
    }

    #[tokio::test]
    async fn test_filters_merge_and_send_full_set() {
        let (node, player, _events) = setup();
        player
            .set_filters(
                FilterDelta::new()
                    .set(Filter::Timescale(Timescale::default()))
                    .set(Filter::Volume(2.0)),
            )
            .await
            .unwrap();
        player
            .set_filters(FilterDelta::new().remove(FilterKind::Volume))
            .await
            .unwrap();

        let payloads: Vec<_> = sent(&node)
            .into_iter()
            .filter_map(|c| match c {
                Command::Filters { filters, .. } => Some(filters),
                _ => None,
            })
            .collect();
        assert_eq!(payloads.len(), 2);
        assert!(payloads[0].get("volume").is_some());
        assert!(payloads[1].get("volume").is_none());
        assert!(payloads[1].get("timescale").is_some());
        assert_eq!(player.filters().await.kinds(), vec![FilterKind::Timescale]);

        player.clear_filters().await.unwrap();
        assert!(player.filters().await.is_empty());
    }

    #[tokio::test]
    async fn test_events_from_other_node_are_ignored() {
        let (node, player, _events) = setup();
        let other = connected_node("other", 1);
        let a = track("a", 1000);
        player.play(a.clone()).await.unwrap();
        player.enqueue(track("b", 1000)).await.unwrap();
        sent(&node);

        player.handle_event(&other, &end(&a, TrackEndReason::Finished)).await;
        assert!(sent(&node).is_empty());
        assert!(sent(&other).is_empty());
        assert_eq!(player.current().await, Some(a));
    }

    #[tokio::test]
    async fn test_migrate_replays_state() {
        let (node, player, mut events) = setup();
        let target = connected_node("backup", 1);
        player
            .update_voice(VoiceState {
                session_id: "s".into(),
                token: "t".into(),
                endpoint: "e".into(),
            })
            .await
            .unwrap();
        player.play(track("a", 60_000)).await.unwrap();
        player.handle_update(
            &node,
            &PlayerUpdateState {
                time: chrono::Utc::now(),
                position: 30_000,
                connected: true,
                ping: 1,
            },
        )
        .await;
        player.pause().await.unwrap();

        player.migrate(&node, target.clone()).await.unwrap();

        assert!(!node.is_bound(GuildId::new(42)));
        assert!(target.is_bound(GuildId::new(42)));
        let commands = sent(&target);
        assert_eq!(
            commands.iter().map(Command::op).collect::<Vec<_>>(),
            vec!["voiceUpdate", "play", "seek", "filters"]
        );
        assert!(matches!(&commands[1], Command::Play { pause: true, .. }));
        assert!(matches!(&commands[2], Command::Seek { position, .. } if *position >= 30_000));
        assert_eq!(events.recv().await.unwrap().kind(), EventKind::PlayerMigrated);

        // una segunda reubicación desde el nodo viejo no hace nada
        player.migrate(&node, connected_node("third", 2)).await.unwrap();
        assert!(target.is_bound(GuildId::new(42)));
    }

    #[tokio::test]
    async fn test_failover_pause_resumes_after_migration() {
        let (node, player, mut events) = setup();
        player.play(track("a", 60_000)).await.unwrap();
        player.migration_failed(&node).await;
        assert_eq!(player.state().await, PlayState::Paused);
        assert_eq!(events.recv().await.unwrap().kind(), EventKind::MigrationFailed);

        let target = connected_node("backup", 1);
        player.migrate(&node, target.clone()).await.unwrap();
        assert_eq!(player.state().await, PlayState::Playing);
        assert!(matches!(&sent(&target)[0], Command::Play { pause: false, .. }));
    }
}
