//! Parameters for the generated tone layers.
//!
//! Only the frequency bookkeeping lives here; synthesis itself is the audio
//! engine's job.

use serde::{Deserialize, Serialize};

/// The nine solfeggio frequencies, in Hz.
pub const SOLFEGGIO_FREQUENCIES: [f64; 9] =
    [174.0, 285.0, 396.0, 417.0, 528.0, 639.0, 741.0, 852.0, 963.0];

pub const MIN_CARRIER_HZ: f64 = 100.0;
pub const MAX_CARRIER_HZ: f64 = 1000.0;

/// Named beat-frequency ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeatBand {
    Delta,
    Theta,
    Alpha,
    Beta,
    Gamma,
}

impl BeatBand {
    /// Inclusive `(min, max)` beat frequency in Hz.
    pub fn range(self) -> (f64, f64) {
        match self {
            BeatBand::Delta => (0.5, 4.0),
            BeatBand::Theta => (4.0, 8.0),
            BeatBand::Alpha => (8.0, 13.0),
            BeatBand::Beta => (13.0, 30.0),
            BeatBand::Gamma => (30.0, 100.0),
        }
    }

    pub fn contains(self, beat_hz: f64) -> bool {
        let (min, max) = self.range();
        beat_hz >= min && beat_hz <= max
    }
}

impl std::fmt::Display for BeatBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BeatBand::Delta => write!(f, "delta"),
            BeatBand::Theta => write!(f, "theta"),
            BeatBand::Alpha => write!(f, "alpha"),
            BeatBand::Beta => write!(f, "beta"),
            BeatBand::Gamma => write!(f, "gamma"),
        }
    }
}

/// A stereo tone: one sine per channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneSpec {
    pub left_hz: f64,
    pub right_hz: f64,
}

impl ToneSpec {
    /// The same pitch in both ears.
    pub fn solfeggio(frequency_hz: f64) -> Result<Self, String> {
        if !SOLFEGGIO_FREQUENCIES.contains(&frequency_hz) {
            return Err(format!(
                "{frequency_hz} Hz is not a solfeggio frequency (allowed: {SOLFEGGIO_FREQUENCIES:?})"
            ));
        }
        Ok(Self {
            left_hz: frequency_hz,
            right_hz: frequency_hz,
        })
    }

    /// Left = carrier − beat/2, right = carrier + beat/2.
    pub fn binaural(carrier_hz: f64, beat_hz: f64, band: BeatBand) -> Result<Self, String> {
        if !(MIN_CARRIER_HZ..=MAX_CARRIER_HZ).contains(&carrier_hz) {
            return Err(format!(
                "carrier {carrier_hz} Hz outside {MIN_CARRIER_HZ}-{MAX_CARRIER_HZ} Hz"
            ));
        }
        if !band.contains(beat_hz) {
            let (min, max) = band.range();
            return Err(format!(
                "beat {beat_hz} Hz outside {band} band ({min}-{max} Hz)"
            ));
        }
        Ok(Self {
            left_hz: carrier_hz - beat_hz / 2.0,
            right_hz: carrier_hz + beat_hz / 2.0,
        })
    }

    pub fn beat_hz(&self) -> f64 {
        self.right_hz - self.left_hz
    }
}
