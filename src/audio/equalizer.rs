use super::filters::{Equalizer, Filter, EQUALIZER_BANDS};

/// Center frequencies of the node's 15 equalizer bands.
pub const EQ_FREQUENCIES: [f32; EQUALIZER_BANDS] = [
    25.0, 40.0, 63.0, 100.0, 160.0, // Bass
    250.0, 400.0, 630.0, 1000.0, 1600.0, // Mids
    2500.0, 4000.0, 6300.0, 10000.0, 16000.0, // Highs
];

/// Named equalizer curve. Gains are node multipliers, not dB.
#[derive(Debug, Clone, PartialEq)]
pub struct EqPreset {
    pub name: &'static str,
    pub gains: [f32; EQUALIZER_BANDS],
}

impl EqPreset {
    pub fn to_filter(&self) -> Filter {
        Filter::Equalizer(Equalizer { gains: self.gains })
    }
}

/// Built-in presets
pub struct EqPresets;

impl EqPresets {
    pub fn flat() -> EqPreset {
        EqPreset {
            name: "flat",
            gains: [0.0; EQUALIZER_BANDS],
        }
    }

    pub fn bass() -> EqPreset {
        EqPreset {
            name: "bass",
            gains: [
                0.25, 0.22, 0.2, 0.15, 0.1, 0.05, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            ],
        }
    }

    pub fn pop() -> EqPreset {
        EqPreset {
            name: "pop",
            gains: [
                -0.05, 0.0, 0.08, 0.12, 0.17, 0.2, 0.15, 0.1, 0.05, 0.0, -0.05, -0.05, -0.05, 0.0,
                0.0,
            ],
        }
    }

    pub fn rock() -> EqPreset {
        EqPreset {
            name: "rock",
            gains: [
                0.2, 0.18, 0.15, 0.1, 0.05, -0.05, -0.05, -0.05, 0.0, 0.05, 0.08, 0.12, 0.15, 0.17,
                0.17,
            ],
        }
    }

    pub fn jazz() -> EqPreset {
        EqPreset {
            name: "jazz",
            gains: [
                0.0, 0.02, 0.05, 0.08, 0.1, 0.12, 0.08, 0.05, 0.02, 0.0, 0.05, 0.08, 0.1, 0.12, 0.12,
            ],
        }
    }

    pub fn classical() -> EqPreset {
        EqPreset {
            name: "classical",
            gains: [
                0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, -0.05, -0.08, -0.08, -0.1, -0.12,
                -0.12,
            ],
        }
    }

    pub fn electronic() -> EqPreset {
        EqPreset {
            name: "electronic",
            gains: [
                0.2, 0.18, 0.15, 0.05, 0.0, -0.05, -0.08, 0.0, 0.08, 0.05, 0.0, 0.05, 0.12, 0.15,
                0.17,
            ],
        }
    }

    pub fn vocal() -> EqPreset {
        EqPreset {
            name: "vocal",
            gains: [
                -0.08, -0.05, -0.03, 0.0, 0.05, 0.1, 0.15, 0.17, 0.15, 0.1, 0.08, 0.05, 0.0, -0.03,
                -0.05,
            ],
        }
    }

    /// Looks a preset up by name, case-insensitive.
    pub fn get(name: &str) -> Option<EqPreset> {
        match name.to_lowercase().as_str() {
            "flat" | "normal" => Some(Self::flat()),
            "bass" => Some(Self::bass()),
            "pop" => Some(Self::pop()),
            "rock" => Some(Self::rock()),
            "jazz" => Some(Self::jazz()),
            "classical" => Some(Self::classical()),
            "electronic" => Some(Self::electronic()),
            "vocal" => Some(Self::vocal()),
            _ => None,
        }
    }

    pub fn list() -> Vec<&'static str> {
        vec![
            "flat",
            "bass",
            "pop",
            "rock",
            "jazz",
            "classical",
            "electronic",
            "vocal",
        ]
    }
}
