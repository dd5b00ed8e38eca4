//! Node-side audio filters.
//!
//! Each filter kind is a fixed-shape record. A player keeps a [`FilterSet`]
//! and sends the whole combined payload on every change; a [`FilterDelta`]
//! describes one change (set or remove per kind).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::{Error, Result};

pub const EQUALIZER_BANDS: usize = 15;

/// 15-band equalizer. Gains are multipliers in [-0.25, 1.0], 0.0 is flat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Equalizer {
    pub gains: [f32; EQUALIZER_BANDS],
}

impl Default for Equalizer {
    fn default() -> Self {
        Self {
            gains: [0.0; EQUALIZER_BANDS],
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Band {
    band: usize,
    gain: f32,
}

impl Serialize for Equalizer {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let bands: Vec<Band> = self
            .gains
            .iter()
            .enumerate()
            .map(|(band, &gain)| Band { band, gain })
            .collect();
        bands.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Equalizer {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bands = Vec::<Band>::deserialize(deserializer)?;
        let mut eq = Equalizer::default();
        for Band { band, gain } in bands {
            let slot = eq.gains.get_mut(band).ok_or_else(|| {
                serde::de::Error::custom(format!("equalizer band {band} out of range"))
            })?;
            *slot = gain;
        }
        Ok(eq)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Karaoke {
    pub level: f32,
    pub mono_level: f32,
    pub filter_band: f32,
    pub filter_width: f32,
}

impl Default for Karaoke {
    fn default() -> Self {
        Self {
            level: 1.0,
            mono_level: 1.0,
            filter_band: 220.0,
            filter_width: 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timescale {
    pub speed: f32,
    pub pitch: f32,
    pub rate: f32,
}

impl Default for Timescale {
    fn default() -> Self {
        Self {
            speed: 1.0,
            pitch: 1.0,
            rate: 1.0,
        }
    }
}

/// Shared shape of tremolo and vibrato.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Oscillation {
    pub frequency: f32,
    pub depth: f32,
}

impl Default for Oscillation {
    fn default() -> Self {
        Self {
            frequency: 2.0,
            depth: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rotation {
    pub rotation_hz: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LowPass {
    pub smoothing: f32,
}

impl Default for LowPass {
    fn default() -> Self {
        Self { smoothing: 20.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMix {
    pub left_to_left: f32,
    pub left_to_right: f32,
    pub right_to_left: f32,
    pub right_to_right: f32,
}

impl Default for ChannelMix {
    fn default() -> Self {
        Self {
            left_to_left: 1.0,
            left_to_right: 0.0,
            right_to_left: 0.0,
            right_to_right: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Distortion {
    pub sin_offset: f32,
    pub sin_scale: f32,
    pub cos_offset: f32,
    pub cos_scale: f32,
    pub tan_offset: f32,
    pub tan_scale: f32,
    pub offset: f32,
    pub scale: f32,
}

impl Default for Distortion {
    fn default() -> Self {
        Self {
            sin_offset: 0.0,
            sin_scale: 1.0,
            cos_offset: 0.0,
            cos_scale: 1.0,
            tan_offset: 0.0,
            tan_scale: 1.0,
            offset: 0.0,
            scale: 1.0,
        }
    }
}

/// Catalog of filter kinds understood by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FilterKind {
    Equalizer,
    Karaoke,
    Timescale,
    Tremolo,
    Vibrato,
    Rotation,
    LowPass,
    ChannelMix,
    Volume,
    Distortion,
}

impl FilterKind {
    /// Key used in the node payload.
    pub fn wire_name(self) -> &'static str {
        match self {
            FilterKind::Equalizer => "equalizer",
            FilterKind::Karaoke => "karaoke",
            FilterKind::Timescale => "timescale",
            FilterKind::Tremolo => "tremolo",
            FilterKind::Vibrato => "vibrato",
            FilterKind::Rotation => "rotation",
            FilterKind::LowPass => "lowPass",
            FilterKind::ChannelMix => "channelMix",
            FilterKind::Volume => "volume",
            FilterKind::Distortion => "distortion",
        }
    }
}

impl FromStr for FilterKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let kind = match s {
            "equalizer" => FilterKind::Equalizer,
            "karaoke" => FilterKind::Karaoke,
            "timescale" => FilterKind::Timescale,
            "tremolo" => FilterKind::Tremolo,
            "vibrato" => FilterKind::Vibrato,
            "rotation" => FilterKind::Rotation,
            "lowPass" => FilterKind::LowPass,
            "channelMix" => FilterKind::ChannelMix,
            "volume" => FilterKind::Volume,
            "distortion" => FilterKind::Distortion,
            other => return Err(Error::UnknownFilter(other.to_string())),
        };
        Ok(kind)
    }
}

/// One filter with its parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Filter {
    Equalizer(Equalizer),
    Karaoke(Karaoke),
    Timescale(Timescale),
    Tremolo(Oscillation),
    Vibrato(Oscillation),
    Rotation(Rotation),
    LowPass(LowPass),
    ChannelMix(ChannelMix),
    Volume(f32),
    Distortion(Distortion),
}

fn check(ok: bool, msg: &str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidFilter(msg.to_string()))
    }
}

fn unit_range(v: f32) -> bool {
    (0.0..=1.0).contains(&v)
}

impl Filter {
    pub fn kind(&self) -> FilterKind {
        match self {
            Filter::Equalizer(_) => FilterKind::Equalizer,
            Filter::Karaoke(_) => FilterKind::Karaoke,
            Filter::Timescale(_) => FilterKind::Timescale,
            Filter::Tremolo(_) => FilterKind::Tremolo,
            Filter::Vibrato(_) => FilterKind::Vibrato,
            Filter::Rotation(_) => FilterKind::Rotation,
            Filter::LowPass(_) => FilterKind::LowPass,
            Filter::ChannelMix(_) => FilterKind::ChannelMix,
            Filter::Volume(_) => FilterKind::Volume,
            Filter::Distortion(_) => FilterKind::Distortion,
        }
    }

    /// Range checks applied before anything is sent to the node.
    pub fn validate(&self) -> Result<()> {
        match self {
            Filter::Equalizer(eq) => check(
                eq.gains.iter().all(|g| (-0.25..=1.0).contains(g)),
                "equalizer gains must be within [-0.25, 1.0]",
            ),
            Filter::Karaoke(_) | Filter::Distortion(_) => Ok(()),
            Filter::Timescale(t) => check(
                t.speed > 0.0 && t.pitch > 0.0 && t.rate > 0.0,
                "timescale speed, pitch and rate must be above 0",
            ),
            Filter::Tremolo(o) => check(
                o.frequency > 0.0 && o.depth > 0.0 && o.depth <= 1.0,
                "tremolo frequency must be above 0 and depth within (0, 1]",
            ),
            Filter::Vibrato(o) => check(
                o.frequency > 0.0 && o.frequency <= 14.0 && o.depth > 0.0 && o.depth <= 1.0,
                "vibrato frequency must be within (0, 14] and depth within (0, 1]",
            ),
            Filter::Rotation(r) => check(r.rotation_hz >= 0.0, "rotation_hz must not be negative"),
            Filter::LowPass(l) => check(l.smoothing > 1.0, "smoothing must be above 1"),
            Filter::ChannelMix(m) => check(
                unit_range(m.left_to_left)
                    && unit_range(m.left_to_right)
                    && unit_range(m.right_to_left)
                    && unit_range(m.right_to_right),
                "channel mix factors must be within [0, 1]",
            ),
            Filter::Volume(v) => check((0.0..=5.0).contains(v), "volume must be within [0, 5]"),
        }
    }

    fn to_value(self) -> Result<Value> {
        let value = match self {
            Filter::Equalizer(f) => serde_json::to_value(f)?,
            Filter::Karaoke(f) => serde_json::to_value(f)?,
            Filter::Timescale(f) => serde_json::to_value(f)?,
            Filter::Tremolo(f) | Filter::Vibrato(f) => serde_json::to_value(f)?,
            Filter::Rotation(f) => serde_json::to_value(f)?,
            Filter::LowPass(f) => serde_json::to_value(f)?,
            Filter::ChannelMix(f) => serde_json::to_value(f)?,
            Filter::Volume(v) => serde_json::to_value(v)?,
            Filter::Distortion(f) => serde_json::to_value(f)?,
        };
        Ok(value)
    }

    /// Parses one payload entry. Shape errors are reported as `InvalidFilter`.
    pub fn from_wire(kind: FilterKind, value: Value) -> Result<Self> {
        fn parse<T: serde::de::DeserializeOwned>(value: Value, kind: FilterKind) -> Result<T> {
            serde_json::from_value(value)
                .map_err(|e| Error::InvalidFilter(format!("{}: {e}", kind.wire_name())))
        }

        let filter = match kind {
            FilterKind::Equalizer => Filter::Equalizer(parse(value, kind)?),
            FilterKind::Karaoke => Filter::Karaoke(parse(value, kind)?),
            FilterKind::Timescale => Filter::Timescale(parse(value, kind)?),
            FilterKind::Tremolo => Filter::Tremolo(parse(value, kind)?),
            FilterKind::Vibrato => Filter::Vibrato(parse(value, kind)?),
            FilterKind::Rotation => Filter::Rotation(parse(value, kind)?),
            FilterKind::LowPass => Filter::LowPass(parse(value, kind)?),
            FilterKind::ChannelMix => Filter::ChannelMix(parse(value, kind)?),
            FilterKind::Volume => Filter::Volume(parse(value, kind)?),
            FilterKind::Distortion => Filter::Distortion(parse(value, kind)?),
        };
        Ok(filter)
    }
}

/// Active filters of one player. An absent kind is disabled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterSet {
    filters: BTreeMap<FilterKind, Filter>,
}

impl FilterSet {
    pub fn get(&self, kind: FilterKind) -> Option<&Filter> {
        self.filters.get(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn kinds(&self) -> Vec<FilterKind> {
        self.filters.keys().copied().collect()
    }

    /// Returns the set obtained by applying `delta`; `self` is left untouched
    /// so a rejected delta never half-applies.
    pub fn merged(&self, delta: &FilterDelta) -> Result<FilterSet> {
        let mut next = self.clone();
        for (kind, change) in &delta.changes {
            match change {
                Some(filter) => {
                    filter.validate()?;
                    next.filters.insert(*kind, *filter);
                }
                None => {
                    next.filters.remove(kind);
                }
            }
        }
        Ok(next)
    }

    /// Combined payload sent with the `filters` op.
    pub fn to_payload(&self) -> Result<Value> {
        let mut map = Map::new();
        for (kind, filter) in &self.filters {
            map.insert(kind.wire_name().to_string(), filter.to_value()?);
        }
        Ok(Value::Object(map))
    }
}

/// Per-kind change: `Some` sets or replaces, `None` removes. Kinds not
/// mentioned keep their current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterDelta {
    changes: BTreeMap<FilterKind, Option<Filter>>,
}

impl FilterDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, filter: Filter) -> Self {
        self.changes.insert(filter.kind(), Some(filter));
        self
    }

    pub fn remove(mut self, kind: FilterKind) -> Self {
        self.changes.insert(kind, None);
        self
    }

    /// Delta that removes every filter currently in `set`.
    pub fn clear_all(set: &FilterSet) -> Self {
        set.kinds()
            .into_iter()
            .fold(Self::new(), |delta, kind| delta.remove(kind))
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Parses `{"timescale": {...}, "karaoke": null}`. Unknown kinds reject the
    /// whole delta.
    pub fn from_json(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(Error::InvalidData("filter delta must be an object".into()));
        };
        let mut delta = Self::new();
        for (key, value) in map {
            let kind = FilterKind::from_str(&key)?;
            delta = if value.is_null() {
                delta.remove(kind)
            } else {
                delta.set(Filter::from_wire(kind, value)?)
            };
        }
        Ok(delta)
    }
}
