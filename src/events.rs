//! Application-facing events.
//!
//! Every event the library raises is one variant of [`Event`]. Listeners are
//! registered per [`EventKind`] (or for all kinds) on the [`EventHub`]. Each
//! listener drains its own queue on a dedicated task: it sees events in emit
//! order, and a slow or panicking listener never holds up a node's receive
//! loop or the other listeners.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use serenity::model::id::GuildId;
use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, OnceLock},
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::node::protocol::{PlayerUpdateState, Stats, TrackEndReason};
use crate::sources::{Track, TrackError};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    NodeReady {
        node: String,
        session_id: String,
        resumed: bool,
    },
    NodeStatsUpdate {
        node: String,
        stats: Stats,
    },
    PlayerUpdate {
        guild_id: GuildId,
        state: PlayerUpdateState,
    },
    TrackStart {
        guild_id: GuildId,
        track: Track,
    },
    TrackEnd {
        guild_id: GuildId,
        track: Track,
        reason: TrackEndReason,
    },
    TrackException {
        guild_id: GuildId,
        track: Track,
        exception: TrackError,
    },
    TrackStuck {
        guild_id: GuildId,
        track: Track,
        threshold_ms: u64,
    },
    WebSocketClosed {
        guild_id: GuildId,
        code: u16,
        reason: String,
        by_remote: bool,
    },
    /// Voice close 4006.
    SessionExpired { guild_id: GuildId, reason: String },
    /// Voice close 4009.
    SessionTimeout { guild_id: GuildId, reason: String },
    /// Voice close 4014.
    VoiceServerChanged { guild_id: GuildId, reason: String },
    /// Voice close 4015.
    VoiceCrashed { guild_id: GuildId, reason: String },
    UnknownEvent {
        guild_id: GuildId,
        kind: String,
        payload: Value,
    },
    QueueEnd {
        guild_id: GuildId,
    },
    PlayerDisconnect {
        guild_id: GuildId,
    },
    PlayerMigrated {
        guild_id: GuildId,
        from: String,
        to: String,
    },
    MigrationFailed {
        guild_id: GuildId,
        node: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NodeReady,
    NodeStatsUpdate,
    PlayerUpdate,
    TrackStart,
    TrackEnd,
    TrackException,
    TrackStuck,
    WebSocketClosed,
    SessionExpired,
    SessionTimeout,
    VoiceServerChanged,
    VoiceCrashed,
    UnknownEvent,
    QueueEnd,
    PlayerDisconnect,
    PlayerMigrated,
    MigrationFailed,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::NodeReady { .. } => EventKind::NodeReady,
            Event::NodeStatsUpdate { .. } => EventKind::NodeStatsUpdate,
            Event::PlayerUpdate { .. } => EventKind::PlayerUpdate,
            Event::TrackStart { .. } => EventKind::TrackStart,
            Event::TrackEnd { .. } => EventKind::TrackEnd,
            Event::TrackException { .. } => EventKind::TrackException,
            Event::TrackStuck { .. } => EventKind::TrackStuck,
            Event::WebSocketClosed { .. } => EventKind::WebSocketClosed,
            Event::SessionExpired { .. } => EventKind::SessionExpired,
            Event::SessionTimeout { .. } => EventKind::SessionTimeout,
            Event::VoiceServerChanged { .. } => EventKind::VoiceServerChanged,
            Event::VoiceCrashed { .. } => EventKind::VoiceCrashed,
            Event::UnknownEvent { .. } => EventKind::UnknownEvent,
            Event::QueueEnd { .. } => EventKind::QueueEnd,
            Event::PlayerDisconnect { .. } => EventKind::PlayerDisconnect,
            Event::PlayerMigrated { .. } => EventKind::PlayerMigrated,
            Event::MigrationFailed { .. } => EventKind::MigrationFailed,
        }
    }

    pub fn guild_id(&self) -> Option<GuildId> {
        match self {
            Event::NodeReady { .. } | Event::NodeStatsUpdate { .. } => None,
            Event::PlayerUpdate { guild_id, .. }
            | Event::TrackStart { guild_id, .. }
            | Event::TrackEnd { guild_id, .. }
            | Event::TrackException { guild_id, .. }
            | Event::TrackStuck { guild_id, .. }
            | Event::WebSocketClosed { guild_id, .. }
            | Event::SessionExpired { guild_id, .. }
            | Event::SessionTimeout { guild_id, .. }
            | Event::VoiceServerChanged { guild_id, .. }
            | Event::VoiceCrashed { guild_id, .. }
            | Event::UnknownEvent { guild_id, .. }
            | Event::QueueEnd { guild_id }
            | Event::PlayerDisconnect { guild_id }
            | Event::PlayerMigrated { guild_id, .. }
            | Event::MigrationFailed { guild_id, .. } => Some(*guild_id),
        }
    }

    /// Code-specific companion of a voice `WebSocketClosed` event.
    pub fn voice_close(guild_id: GuildId, code: u16, reason: &str) -> Option<Event> {
        let reason = reason.to_string();
        match code {
            4006 => Some(Event::SessionExpired { guild_id, reason }),
            4009 => Some(Event::SessionTimeout { guild_id, reason }),
            4014 => Some(Event::VoiceServerChanged { guild_id, reason }),
            4015 => Some(Event::VoiceCrashed { guild_id, reason }),
            _ => None,
        }
    }
}

/// Application callback.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: Event);
}

struct FnListener<F>(F);

#[async_trait]
impl<F, Fut> EventListener for FnListener<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_event(&self, event: Event) {
        (self.0)(event).await
    }
}

/// Wraps an async closure as a listener.
pub fn listener<F, Fut>(f: F) -> Arc<dyn EventListener>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnListener(f))
}

/// Listener plus its delivery queue. The draining task starts on first
/// delivery so listeners can be registered outside a runtime.
struct Subscriber {
    listener: Arc<dyn EventListener>,
    queue: OnceLock<mpsc::UnboundedSender<Event>>,
}

impl Subscriber {
    fn new(listener: Arc<dyn EventListener>) -> Arc<Self> {
        Arc::new(Self {
            listener,
            queue: OnceLock::new(),
        })
    }

    fn deliver(&self, event: Event) {
        let queue = self.queue.get_or_init(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(drain(self.listener.clone(), rx));
            tx
        });
        if queue.send(event).is_err() {
            debug!("cola del listener cerrada, evento descartado");
        }
    }
}

/// Calls the listener once per queued event, one call at a time. Each call
/// runs on its own task so a panic only loses that event.
async fn drain(listener: Arc<dyn EventListener>, mut queue: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = queue.recv().await {
        let kind = event.kind();
        let listener = listener.clone();
        if let Err(e) = tokio::spawn(async move { listener.on_event(event).await }).await {
            if e.is_panic() {
                warn!(?kind, "⚠️ El listener de eventos entró en pánico");
            }
        }
    }
}

/// Handler table plus a broadcast tap.
pub struct EventHub {
    handlers: RwLock<HashMap<EventKind, Vec<Arc<Subscriber>>>>,
    catch_all: RwLock<Vec<Arc<Subscriber>>>,
    tap: broadcast::Sender<Event>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (tap, _) = broadcast::channel(256);
        Self {
            handlers: RwLock::new(HashMap::new()),
            catch_all: RwLock::new(Vec::new()),
            tap,
        }
    }

    pub fn on(&self, kind: EventKind, listener: Arc<dyn EventListener>) {
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push(Subscriber::new(listener));
    }

    pub fn on_any(&self, listener: Arc<dyn EventListener>) {
        self.catch_all.write().push(Subscriber::new(listener));
    }

    /// Stream of every emitted event. Slow receivers lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tap.subscribe()
    }

    /// Queues `event` for every matching listener.
    pub fn emit(&self, event: Event) {
        let kind = event.kind();
        trace!(?kind, "emitiendo evento");

        let mut targets: Vec<Arc<Subscriber>> = self
            .handlers
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        targets.extend(self.catch_all.read().iter().cloned());

        for target in targets {
            target.deliver(event.clone());
        }

        // sin suscriptores no es un error
        let _ = self.tap.send(event);
    }
}
