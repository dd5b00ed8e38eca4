//! Frames exchanged with a node over its WebSocket session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serenity::model::id::GuildId;

use crate::sources::{Track, TrackError};
use crate::{Error, Result};

// ============================================================================
// Servidor -> cliente
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cpu {
    pub cores: u32,
    /// Fraction of host CPU in use, 0.0 to 1.0.
    pub system_load: f64,
    pub lavalink_load: f64,
}

/// Audio frames of the last minute. A healthy node sends ~3000.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

/// Periodic load snapshot.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub players: u32,
    pub playing_players: u32,
    pub uptime: u64,
    pub memory: Memory,
    pub cpu: Cpu,
    #[serde(default)]
    pub frame_stats: Option<FrameStats>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdateState {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub position: u64,
    pub connected: bool,
    /// Voice gateway latency in ms, -1 when not connected.
    #[serde(default = "no_ping")]
    pub ping: i64,
}

fn no_ping() -> i64 {
    -1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

/// Track-scoped or voice-scoped event addressed to one player.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    TrackStart {
        track: Track,
    },
    TrackEnd {
        track: Track,
        reason: TrackEndReason,
    },
    TrackException {
        track: Track,
        exception: TrackError,
    },
    TrackStuck {
        track: Track,
        threshold_ms: u64,
    },
    WebSocketClosed {
        code: u16,
        reason: String,
        by_remote: bool,
    },
    /// Event type added by a node plugin.
    Unknown {
        kind: String,
        payload: Value,
    },
}

impl NodeEvent {
    pub fn track(&self) -> Option<&Track> {
        match self {
            NodeEvent::TrackStart { track }
            | NodeEvent::TrackEnd { track, .. }
            | NodeEvent::TrackException { track, .. }
            | NodeEvent::TrackStuck { track, .. } => Some(track),
            NodeEvent::WebSocketClosed { .. } | NodeEvent::Unknown { .. } => None,
        }
    }
}

/// Decoded server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Ready {
        resumed: bool,
        session_id: String,
    },
    Stats(Stats),
    PlayerUpdate {
        guild_id: GuildId,
        state: PlayerUpdateState,
    },
    Event {
        guild_id: GuildId,
        event: NodeEvent,
    },
    Unknown {
        op: String,
        payload: Value,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadyFrame {
    #[serde(default)]
    resumed: bool,
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayerUpdateFrame {
    guild_id: String,
    state: PlayerUpdateState,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
enum KnownEvent {
    #[serde(rename = "TrackStartEvent")]
    TrackStart { track: Track },
    #[serde(rename = "TrackEndEvent")]
    TrackEnd { track: Track, reason: TrackEndReason },
    #[serde(rename = "TrackExceptionEvent")]
    TrackException { track: Track, exception: TrackError },
    #[serde(rename = "TrackStuckEvent")]
    TrackStuck { track: Track, threshold_ms: u64 },
    #[serde(rename = "WebSocketClosedEvent")]
    WebSocketClosed {
        code: u16,
        #[serde(default)]
        reason: String,
        #[serde(default)]
        by_remote: bool,
    },
}

impl From<KnownEvent> for NodeEvent {
    fn from(event: KnownEvent) -> Self {
        match event {
            KnownEvent::TrackStart { track } => NodeEvent::TrackStart { track },
            KnownEvent::TrackEnd { track, reason } => NodeEvent::TrackEnd { track, reason },
            KnownEvent::TrackException { track, exception } => {
                NodeEvent::TrackException { track, exception }
            }
            KnownEvent::TrackStuck { track, threshold_ms } => {
                NodeEvent::TrackStuck { track, threshold_ms }
            }
            KnownEvent::WebSocketClosed {
                code,
                reason,
                by_remote,
            } => NodeEvent::WebSocketClosed {
                code,
                reason,
                by_remote,
            },
        }
    }
}

const KNOWN_EVENT_TYPES: [&str; 5] = [
    "TrackStartEvent",
    "TrackEndEvent",
    "TrackExceptionEvent",
    "TrackStuckEvent",
    "WebSocketClosedEvent",
];

pub(crate) fn parse_guild_id(raw: &str) -> Result<GuildId> {
    raw.parse::<u64>()
        .ok()
        .filter(|id| *id != 0)
        .map(GuildId::new)
        .ok_or_else(|| Error::InvalidData(format!("invalid guildId {raw:?}")))
}

fn str_field<'a>(value: &'a Value, key: &str) -> Result<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidData(format!("missing string field {key:?}")))
}

/// Decodes one text frame. Unknown ops and event types are carried through.
pub fn decode(text: &str) -> Result<Incoming> {
    let value: Value = serde_json::from_str(text)?;
    let op = str_field(&value, "op")?.to_string();

    let frame = match op.as_str() {
        "ready" => {
            let ready: ReadyFrame = serde_json::from_value(value)?;
            Incoming::Ready {
                resumed: ready.resumed,
                session_id: ready.session_id,
            }
        }
        "stats" => Incoming::Stats(serde_json::from_value(value)?),
        "playerUpdate" => {
            let update: PlayerUpdateFrame = serde_json::from_value(value)?;
            Incoming::PlayerUpdate {
                guild_id: parse_guild_id(&update.guild_id)?,
                state: update.state,
            }
        }
        "event" => {
            let guild_id = parse_guild_id(str_field(&value, "guildId")?)?;
            let kind = str_field(&value, "type")?;
            let event = if KNOWN_EVENT_TYPES.contains(&kind) {
                serde_json::from_value::<KnownEvent>(value)?.into()
            } else {
                NodeEvent::Unknown {
                    kind: kind.to_string(),
                    payload: value,
                }
            };
            Incoming::Event { guild_id, event }
        }
        _ => Incoming::Unknown { op, payload: value },
    };
    Ok(frame)
}

// ============================================================================
// Cliente -> servidor
// ============================================================================

/// Player command. Serialized as one JSON object keyed by `guildId`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    Play {
        guild_id: String,
        track: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        start_time: Option<u64>,
        volume: u16,
        pause: bool,
        no_replace: bool,
    },
    Stop {
        guild_id: String,
    },
    Pause {
        guild_id: String,
        pause: bool,
    },
    Seek {
        guild_id: String,
        position: u64,
    },
    Volume {
        guild_id: String,
        volume: u16,
    },
    Filters {
        guild_id: String,
        filters: Value,
    },
    Destroy {
        guild_id: String,
    },
    VoiceUpdate {
        guild_id: String,
        session_id: String,
        token: String,
        endpoint: String,
    },
}

impl Command {
    pub fn guild_id(&self) -> &str {
        match self {
            Command::Play { guild_id, .. }
            | Command::Stop { guild_id }
            | Command::Pause { guild_id, .. }
            | Command::Seek { guild_id, .. }
            | Command::Volume { guild_id, .. }
            | Command::Filters { guild_id, .. }
            | Command::Destroy { guild_id }
            | Command::VoiceUpdate { guild_id, .. } => guild_id,
        }
    }

    pub fn op(&self) -> &'static str {
        match self {
            Command::Play { .. } => "play",
            Command::Stop { .. } => "stop",
            Command::Pause { .. } => "pause",
            Command::Seek { .. } => "seek",
            Command::Volume { .. } => "volume",
            Command::Filters { .. } => "filters",
            Command::Destroy { .. } => "destroy",
            Command::VoiceUpdate { .. } => "voiceUpdate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn track_json() -> Value {
        json!({
            "encoded": "QAAA",
            "info": {
                "identifier": "abc",
                "isSeekable": true,
                "author": "someone",
                "length": 180000,
                "isStream": false,
                "position": 0,
                "title": "song",
                "sourceName": "youtube"
            }
        })
    }

    #[test]
    fn test_decode_ready() {
        let frame = decode(r#"{"op":"ready","resumed":false,"sessionId":"xyz"}"#).unwrap();
        assert_eq!(
            frame,
            Incoming::Ready {
                resumed: false,
                session_id: "xyz".into()
            }
        );
    }

    #[test]
    fn test_decode_stats() {
        let text = json!({
            "op": "stats",
            "players": 3,
            "playingPlayers": 2,
            "uptime": 1000,
            "memory": { "free": 1, "used": 2, "allocated": 3, "reservable": 4 },
            "cpu": { "cores": 4, "systemLoad": 0.5, "lavalinkLoad": 0.1 },
            "frameStats": null
        })
        .to_string();
        match decode(&text).unwrap() {
            Incoming::Stats(stats) => {
                assert_eq!(stats.playing_players, 2);
                assert_eq!(stats.cpu.system_load, 0.5);
                assert_eq!(stats.frame_stats, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_player_update() {
        let text = r#"{"op":"playerUpdate","guildId":"42","state":{"time":1700000000000,"position":1500,"connected":true,"ping":20}}"#;
        match decode(text).unwrap() {
            Incoming::PlayerUpdate { guild_id, state } => {
                assert_eq!(guild_id, GuildId::new(42));
                assert_eq!(state.position, 1500);
                assert_eq!(state.time.timestamp_millis(), 1_700_000_000_000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_track_end_and_closed() {
        let end = json!({
            "op": "event", "type": "TrackEndEvent", "guildId": "7",
            "track": track_json(), "reason": "loadFailed"
        })
        .to_string();
        match decode(&end).unwrap() {
            Incoming::Event { event: NodeEvent::TrackEnd { reason, .. }, .. } => {
                assert_eq!(reason, TrackEndReason::LoadFailed)
            }
            other => panic!("unexpected {other:?}"),
        }

        let closed = json!({
            "op": "event", "type": "WebSocketClosedEvent", "guildId": "7",
            "code": 4006, "reason": "Session is no longer valid.", "byRemote": true
        })
        .to_string();
        match decode(&closed).unwrap() {
            Incoming::Event { event: NodeEvent::WebSocketClosed { code, by_remote, .. }, .. } => {
                assert_eq!(code, 4006);
                assert!(by_remote);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_event_and_op_pass_through() {
        let plugin = r#"{"op":"event","type":"SegmentsLoaded","guildId":"7","segments":[]}"#;
        match decode(plugin).unwrap() {
            Incoming::Event { event: NodeEvent::Unknown { kind, payload }, .. } => {
                assert_eq!(kind, "SegmentsLoaded");
                assert_eq!(payload["segments"], json!([]));
            }
            other => panic!("unexpected {other:?}"),
        }

        let op = decode(r#"{"op":"pluginHello"}"#).unwrap();
        assert!(matches!(op, Incoming::Unknown { op, .. } if op == "pluginHello"));
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        assert!(matches!(decode("not json"), Err(Error::Json(_))));
        assert!(matches!(decode(r#"{"no":"op"}"#), Err(Error::InvalidData(_))));
        assert!(matches!(
            decode(r#"{"op":"playerUpdate","guildId":"0","state":{"time":0,"connected":false}}"#),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn test_command_wire_shape() {
        let play = Command::Play {
            guild_id: "42".into(),
            track: "QAAA".into(),
            start_time: None,
            volume: 100,
            pause: false,
            no_replace: false,
        };
        assert_eq!(
            serde_json::to_value(&play).unwrap(),
            json!({
                "op": "play", "guildId": "42", "track": "QAAA",
                "volume": 100, "pause": false, "noReplace": false
            })
        );

        let voice = Command::VoiceUpdate {
            guild_id: "42".into(),
            session_id: "s".into(),
            token: "t".into(),
            endpoint: "e".into(),
        };
        assert_eq!(serde_json::to_value(&voice).unwrap()["op"], json!("voiceUpdate"));
        assert_eq!(voice.op(), "voiceUpdate");
        assert_eq!(voice.guild_id(), "42");
    }
}
