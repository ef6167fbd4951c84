//! The stereo audio engine capability.
//!
//! The render pipeline never touches samples itself. Synthesis of tones,
//! mixing, loudness work and encoding are delegated to an [`AudioEngine`],
//! which operates on files inside the job workspace.

mod ffmpeg;
mod tones;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::EngineError;
use crate::job::OutputFormat;

pub use ffmpeg::FfmpegEngine;
pub use tones::{BeatBand, MAX_CARRIER_HZ, MIN_CARRIER_HZ, SOLFEGGIO_FREQUENCIES, ToneSpec};

/// Stream properties reported by [`AudioEngine::probe`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioInfo {
    pub duration_secs: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate_kbps: Option<u32>,
}

impl AudioInfo {
    pub fn is_stereo(&self) -> bool {
        self.channels == 2
    }
}

/// Result of a loudness analysis pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Loudness {
    pub integrated_lufs: f64,
    pub true_peak_db: f64,
    pub range_lu: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoudnessTarget {
    pub integrated_lufs: f64,
    pub true_peak_db: f64,
    pub range_lu: f64,
}

/// One layer going into [`AudioEngine::mix`].
#[derive(Debug, Clone, PartialEq)]
pub struct MixInput {
    pub path: PathBuf,
    pub gain_db: f64,
    /// Repeat the input until the mix duration is filled.
    pub looped: bool,
}

#[async_trait]
pub trait AudioEngine: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<AudioInfo, EngineError>;

    /// Join `inputs` in order with `gap_secs` of silence between them.
    async fn concat(
        &self,
        inputs: &[PathBuf],
        gap_secs: f64,
        sample_rate: u32,
        output: &Path,
    ) -> Result<(), EngineError>;

    async fn to_stereo(&self, input: &Path, output: &Path, sample_rate: u32)
    -> Result<(), EngineError>;

    async fn generate_tone(
        &self,
        tone: ToneSpec,
        duration_secs: f64,
        sample_rate: u32,
        output: &Path,
    ) -> Result<(), EngineError>;

    /// Sum the inputs at their gains, padded or trimmed to `duration_secs`.
    async fn mix(
        &self,
        inputs: &[MixInput],
        duration_secs: f64,
        sample_rate: u32,
        output: &Path,
    ) -> Result<(), EngineError>;

    async fn measure(&self, path: &Path) -> Result<Loudness, EngineError>;

    async fn soft_limit(&self, input: &Path, output: &Path, ceiling_db: f64)
    -> Result<(), EngineError>;

    async fn normalize(
        &self,
        input: &Path,
        output: &Path,
        target: &LoudnessTarget,
        sample_rate: u32,
    ) -> Result<(), EngineError>;

    /// Encode to `format`. Output is always 2-channel at `sample_rate`.
    async fn encode(
        &self,
        input: &Path,
        output: &Path,
        format: OutputFormat,
        sample_rate: u32,
        bitrate_kbps: u32,
    ) -> Result<(), EngineError>;
}

/// Gain reduction applied to every layer so `layer_count` summed layers do
/// not build up past full scale.
pub fn gain_staging_db(layer_count: usize) -> f64 {
    if layer_count < 2 {
        0.0
    } else {
        -10.0 * (layer_count as f64).log10()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_staging_values() {
        assert_eq!(gain_staging_db(0), 0.0);
        assert_eq!(gain_staging_db(1), 0.0);
        assert!((gain_staging_db(2) + 3.0103).abs() < 1e-3);
        assert!((gain_staging_db(4) + 6.0206).abs() < 1e-3);
    }
}
