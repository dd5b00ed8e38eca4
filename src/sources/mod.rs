//! # Sources Module
//!
//! Track model shared by the node protocol, the player queue and the query
//! cache.
//!
//! A [`Track`] is what a node hands back after resolving a query: an opaque
//! `encoded` blob the node can play, plus [`TrackInfo`] metadata. Tracks are
//! immutable once resolved and compare equal by their encoded blob.
//!
//! [`LoadResult`] mirrors the node's `loadtracks` answer and [`SearchSource`]
//! builds the identifier sent to it.

pub mod decoder;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::{Error, Result};

/// Metadata attached to a resolved track.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    /// Duration in milliseconds. Zero for streams of unknown length.
    pub length: u64,
    pub is_stream: bool,
    #[serde(default)]
    pub position: u64,
    pub title: String,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub artwork_url: Option<String>,
    #[serde(default)]
    pub isrc: Option<String>,
    #[serde(default = "unknown_source")]
    pub source_name: String,
}

fn unknown_source() -> String {
    "unknown".to_string()
}

/// A playable unit resolved by a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub encoded: String,
    pub info: TrackInfo,
    #[serde(default)]
    pub plugin_info: Value,
    #[serde(default)]
    pub user_data: Value,
}

impl PartialEq for Track {
    fn eq(&self, other: &Self) -> bool {
        self.encoded == other.encoded
    }
}

impl Eq for Track {}

impl Track {
    pub fn title(&self) -> &str {
        &self.info.title
    }

    /// Track length, `None` for live streams.
    pub fn duration(&self) -> Option<Duration> {
        if self.info.is_stream || self.info.length == 0 {
            None
        } else {
            Some(Duration::from_millis(self.info.length))
        }
    }

    /// Decodes the blob locally without asking a node.
    pub fn decode(encoded: &str) -> Result<Self> {
        let info = decoder::decode_track(encoded)?;
        Ok(Self {
            encoded: encoded.to_string(),
            info,
            plugin_info: Value::Null,
            user_data: Value::Null,
        })
    }
}

/// Severity of a load or playback failure as classified by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Common,
    Suspicious,
    Fault,
}

/// Exception payload reported by the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackError {
    #[serde(default)]
    pub message: Option<String>,
    pub severity: Severity,
    #[serde(default)]
    pub cause: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    pub name: String,
    #[serde(default = "no_selection")]
    pub selected_track: i64,
}

fn no_selection() -> i64 {
    -1
}

/// Answer of the node's `loadtracks` endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadResult {
    Track(Track),
    Playlist {
        info: PlaylistInfo,
        tracks: Vec<Track>,
    },
    Search(Vec<Track>),
    Empty,
    Error(TrackError),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLoadResult {
    load_type: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct RawPlaylist {
    info: PlaylistInfo,
    tracks: Vec<Track>,
}

impl LoadResult {
    pub fn from_value(value: Value) -> Result<Self> {
        let raw: RawLoadResult = serde_json::from_value(value)?;
        let result = match raw.load_type.as_str() {
            "track" => LoadResult::Track(serde_json::from_value(raw.data)?),
            "playlist" => {
                let playlist: RawPlaylist = serde_json::from_value(raw.data)?;
                LoadResult::Playlist {
                    info: playlist.info,
                    tracks: playlist.tracks,
                }
            }
            "search" => LoadResult::Search(serde_json::from_value(raw.data)?),
            "empty" => LoadResult::Empty,
            "error" => LoadResult::Error(serde_json::from_value(raw.data)?),
            other => {
                return Err(Error::InvalidData(format!("unknown loadType {other}")));
            }
        };
        Ok(result)
    }

    /// Converts the error form into [`Error::LoadFailed`].
    pub fn into_result(self) -> Result<Self> {
        match self {
            LoadResult::Error(e) => Err(Error::LoadFailed {
                message: e.message.unwrap_or(e.cause),
                severity: e.severity,
            }),
            other => Ok(other),
        }
    }

    pub fn tracks(&self) -> Vec<Track> {
        match self {
            LoadResult::Track(t) => vec![t.clone()],
            LoadResult::Playlist { tracks, .. } | LoadResult::Search(tracks) => tracks.clone(),
            LoadResult::Empty | LoadResult::Error(_) => Vec::new(),
        }
    }

    /// Track pre-selected by a playlist link, if any.
    pub fn selected_track(&self) -> Option<&Track> {
        match self {
            LoadResult::Playlist { info, tracks } => usize::try_from(info.selected_track)
                .ok()
                .and_then(|i| tracks.get(i)),
            _ => None,
        }
    }
}

/// Search provider prefix understood by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchSource {
    #[default]
    YouTube,
    YouTubeMusic,
    SoundCloud,
    Spotify,
    Deezer,
    AppleMusic,
    /// Identifier passed as-is.
    Raw,
}

impl SearchSource {
    pub fn prefix(self) -> Option<&'static str> {
        match self {
            SearchSource::YouTube => Some("ytsearch:"),
            SearchSource::YouTubeMusic => Some("ytmsearch:"),
            SearchSource::SoundCloud => Some("scsearch:"),
            SearchSource::Spotify => Some("spsearch:"),
            SearchSource::Deezer => Some("dzsearch:"),
            SearchSource::AppleMusic => Some("amsearch:"),
            SearchSource::Raw => None,
        }
    }

    /// Builds the `identifier` sent to `loadtracks`. URLs are never prefixed.
    pub fn identifier(self, query: &str) -> String {
        let query = query.trim();
        if is_url(query) {
            return query.to_string();
        }
        match self.prefix() {
            Some(prefix) => format!("{prefix}{query}"),
            None => query.to_string(),
        }
    }
}

pub(crate) fn is_url(query: &str) -> bool {
    query.starts_with("http://") || query.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn track_json(encoded: &str, title: &str, length: u64) -> Value {
        json!({
            "encoded": encoded,
            "info": {
                "identifier": format!("id-{encoded}"),
                "isSeekable": true,
                "author": "artist",
                "length": length,
                "isStream": false,
                "position": 0,
                "title": title,
                "uri": "https://example.com/watch",
                "sourceName": "youtube"
            }
        })
    }

    #[test]
    fn test_search_identifier() {
        assert_eq!(SearchSource::YouTube.identifier(" lofi beats "), "ytsearch:lofi beats");
        assert_eq!(SearchSource::SoundCloud.identifier("rain"), "scsearch:rain");
        assert_eq!(
            SearchSource::Spotify.identifier("https://youtu.be/dQw4w9WgXcQ"),
            "https://youtu.be/dQw4w9WgXcQ"
        );
        assert_eq!(SearchSource::Raw.identifier("local.mp3"), "local.mp3");
    }

    #[test]
    fn test_load_result_search() {
        let value = json!({
            "loadType": "search",
            "data": [track_json("a", "First", 1000), track_json("b", "Second", 2000)]
        });
        let result = LoadResult::from_value(value).unwrap();
        let titles: Vec<_> = result.tracks().iter().map(|t| t.title().to_string()).collect();
        assert_eq!(titles, vec!["First", "Second"]);
    }

    #[test]
    fn test_load_result_playlist_selected() {
        let value = json!({
            "loadType": "playlist",
            "data": {
                "info": { "name": "mix", "selectedTrack": 1 },
                "pluginInfo": {},
                "tracks": [track_json("a", "First", 1000), track_json("b", "Second", 2000)]
            }
        });
        let result = LoadResult::from_value(value).unwrap();
        assert_eq!(result.selected_track().map(|t| t.encoded.as_str()), Some("b"));
    }

    #[test]
    fn test_load_result_empty_and_error() {
        let empty = LoadResult::from_value(json!({ "loadType": "empty", "data": {} })).unwrap();
        assert_eq!(empty, LoadResult::Empty);

        let error = LoadResult::from_value(json!({
            "loadType": "error",
            "data": { "message": "video unavailable", "severity": "common", "cause": "x" }
        }))
        .unwrap();
        match error.into_result() {
            Err(Error::LoadFailed { message, severity }) => {
                assert_eq!(message, "video unavailable");
                assert_eq!(severity, Severity::Common);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_track_equality_by_encoded() {
        let a: Track = serde_json::from_value(track_json("same", "One", 10)).unwrap();
        let b: Track = serde_json::from_value(track_json("same", "Two", 20)).unwrap();
        let c: Track = serde_json::from_value(track_json("other", "One", 10)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}

/// Fixtures shared by tests across modules.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::Track;

    pub(crate) fn track(encoded: &str, length: u64) -> Track {
        serde_json::from_value(serde_json::json!({
            "encoded": encoded,
            "info": {
                "identifier": encoded,
                "isSeekable": true,
                "author": "artist",
                "length": length,
                "isStream": false,
                "title": format!("title {encoded}"),
                "sourceName": "youtube"
            }
        }))
        .expect("fixture track")
    }
}
