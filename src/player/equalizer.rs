/// Number of equalizer bands a node exposes (25 Hz … 16 kHz).
pub const BAND_COUNT: usize = 15;

/// Lowest gain a band accepts; `-0.25` mutes the band.
pub const MIN_GAIN: f32 = -0.25;

/// Highest gain a band accepts; `0.25` doubles the band.
pub const MAX_GAIN: f32 = 1.0;

/// Centre frequency of each band in Hz.
pub const BAND_FREQUENCIES: [f32; BAND_COUNT] = [
    25.0, 40.0, 63.0, 100.0, 160.0, 250.0, 400.0, 630.0, 1000.0, 1600.0, 2500.0, 4000.0, 6300.0, 10000.0, 16000.0,
];

pub fn clamp_gain(gain: f32) -> f32 {
    if gain.is_nan() {
        return 0.0;
    }
    gain.clamp(MIN_GAIN, MAX_GAIN)
}

/// A named set of band gains.
#[derive(Debug, Clone, PartialEq)]
pub struct EqPreset {
    pub name: String,
    pub gains: [f32; BAND_COUNT],
}

impl EqPreset {
    pub fn custom(gains: [f32; BAND_COUNT]) -> Self {
        Self {
            name: "Custom".to_string(),
            gains: gains.map(clamp_gain),
        }
    }

    /// `(band, gain)` pairs for every band.
    pub fn bands(&self) -> Vec<(usize, f32)> {
        self.gains.iter().copied().enumerate().collect()
    }
}

/// Built-in presets.
pub struct EqPresets;

impl EqPresets {
    pub fn flat() -> EqPreset {
        EqPreset {
            name: "Flat".to_string(),
            gains: [0.0; BAND_COUNT],
        }
    }

    pub fn bass() -> EqPreset {
        EqPreset {
            name: "Bass".to_string(),
            gains: [
                0.25, 0.2, 0.15, 0.1, 0.05, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            ],
        }
    }

    pub fn pop() -> EqPreset {
        EqPreset {
            name: "Pop".to_string(),
            gains: [
                -0.02, -0.01, 0.08, 0.1, 0.15, 0.1, 0.03, -0.02, -0.035, -0.05, -0.05, -0.05, -0.05, -0.05, -0.05,
            ],
        }
    }

    pub fn rock() -> EqPreset {
        EqPreset {
            name: "Rock".to_string(),
            gains: [
                0.3, 0.25, 0.2, 0.1, 0.05, -0.05, -0.15, -0.2, -0.1, -0.05, 0.05, 0.1, 0.2, 0.25, 0.3,
            ],
        }
    }

    pub fn classical() -> EqPreset {
        EqPreset {
            name: "Classical".to_string(),
            gains: [
                0.375, 0.35, 0.125, 0.0, 0.0, 0.125, 0.55, 0.05, 0.125, 0.25, 0.2, 0.25, 0.3, 0.25, 0.3,
            ],
        }
    }

    pub fn electronic() -> EqPreset {
        EqPreset {
            name: "Electronic".to_string(),
            gains: [
                0.375, 0.35, 0.125, 0.0, 0.0, -0.125, -0.125, 0.0, 0.25, 0.125, 0.15, 0.2, 0.25, 0.35, 0.4,
            ],
        }
    }

    pub fn vocal() -> EqPreset {
        EqPreset {
            name: "Vocal".to_string(),
            gains: [
                -0.2, -0.15, -0.1, 0.0, 0.1, 0.2, 0.25, 0.25, 0.2, 0.1, 0.05, 0.0, -0.05, -0.1, -0.1,
            ],
        }
    }

    pub fn get(name: &str) -> Option<EqPreset> {
        match name.to_lowercase().as_str() {
            "flat" | "normal" => Some(Self::flat()),
            "bass" => Some(Self::bass()),
            "pop" => Some(Self::pop()),
            "rock" => Some(Self::rock()),
            "classical" => Some(Self::classical()),
            "electronic" => Some(Self::electronic()),
            "vocal" => Some(Self::vocal()),
            _ => None,
        }
    }

    pub fn list() -> Vec<&'static str> {
        vec!["flat", "bass", "pop", "rock", "classical", "electronic", "vocal"]
    }
}
