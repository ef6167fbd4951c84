use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audio::BeatBand;
use crate::error::ErrorDetail;

/// Lifecycle status of a render job.
///
/// Transitions are monotonic: `Pending → Processing → {Completed | Failed |
/// Cancelled}`, plus `Pending → Cancelled`. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Where the narration comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoiceRef {
    /// Synthesize the script with a text-to-speech provider.
    #[serde(rename_all = "camelCase")]
    Provider {
        provider: String,
        voice_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default = "default_speed")]
        speed: f32,
        #[serde(default)]
        pitch: f32,
    },
    /// A pre-recorded narration file.
    Uploaded { url: String },
}

fn default_speed() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundLayer {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolfeggioLayer {
    pub frequency_hz: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinauralLayer {
    pub carrier_hz: f64,
    pub beat_hz: f64,
    pub band: BeatBand,
}

/// Per-layer gain in dB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerGains {
    pub voice: f64,
    pub background: f64,
    pub solfeggio: f64,
    pub binaural: f64,
}

impl Default for LayerGains {
    fn default() -> Self {
        Self {
            voice: 0.0,
            background: -12.0,
            solfeggio: -20.0,
            binaural: -18.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerConfig {
    #[serde(default = "default_true")]
    pub voice: bool,
    #[serde(default)]
    pub background: Option<BackgroundLayer>,
    #[serde(default)]
    pub solfeggio: Option<SolfeggioLayer>,
    #[serde(default)]
    pub binaural: Option<BinauralLayer>,
    #[serde(default)]
    pub gains: LayerGains,
}

fn default_true() -> bool {
    true
}

/// The declarative description of what to render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    #[serde(default)]
    pub script_text: String,
    pub voice_ref: VoiceRef,
    pub duration_min: f64,
    #[serde(default)]
    pub pause_sec: f64,
    #[serde(default)]
    pub loop_mode: bool,
    pub layers: LayerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp3,
    Wav,
    Aac,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "mp3",
            OutputFormat::Wav => "wav",
            OutputFormat::Aac => "m4a",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "audio/mpeg",
            OutputFormat::Wav => "audio/wav",
            OutputFormat::Aac => "audio/mp4",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Mp3 => write!(f, "mp3"),
            OutputFormat::Wav => write!(f, "wav"),
            OutputFormat::Aac => write!(f, "aac"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    Medium,
    High,
}

impl Quality {
    pub fn bitrate_kbps(self) -> u32 {
        match self {
            Quality::Low => 128,
            Quality::Medium => 192,
            Quality::High => 320,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageLocation {
    Public,
    Private,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputOptions {
    pub format: OutputFormat,
    pub quality: Quality,
    pub storage_location: StorageLocation,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::Mp3,
            quality: Quality::High,
            storage_location: StorageLocation::Private,
        }
    }
}

/// What a finished job reports back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    pub duration_secs: f64,
    pub format: OutputFormat,
    pub sample_rate: u32,
    pub bitrate_kbps: u32,
    pub channels: u16,
    pub stereo_verified: bool,
    pub loudness_lufs: f64,
    pub true_peak_db: f64,
    pub file_size: u64,
    pub layers_used: Vec<String>,
    pub processing_ms: u64,
    pub storage_key: String,
    pub storage_url: String,
}

/// Submission payload for a new job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub owner_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub priority: i32,
    pub payload: JobPayload,
    #[serde(default)]
    pub output_options: OutputOptions,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

/// A persisted render job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub owner_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    pub status: JobStatus,
    #[serde(default)]
    pub priority: i32,
    pub payload: JobPayload,
    #[serde(default)]
    pub output_options: OutputOptions,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub progress_message: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub locked_by: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_details: Option<ErrorDetail>,
    #[serde(default)]
    pub metadata: Option<ResultMetadata>,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: spec.owner_id,
            project_id: spec.project_id,
            status: JobStatus::Pending,
            priority: spec.priority,
            payload: spec.payload,
            output_options: spec.output_options,
            progress: 0,
            progress_message: None,
            retry_count: 0,
            max_retries: spec.max_retries,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            locked_at: None,
            locked_by: None,
            error_message: None,
            error_details: None,
            metadata: None,
        }
    }
}

/// Filter for [`JobStore::list`](crate::job::JobStore::list).
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub project_id: Option<String>,
    pub limit: Option<usize>,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn payload() -> JobPayload {
        JobPayload {
            script_text: "Breathe in. Breathe out.".into(),
            voice_ref: VoiceRef::Provider {
                provider: "openai".into(),
                voice_id: "alloy".into(),
                model: None,
                speed: 1.0,
                pitch: 0.0,
            },
            duration_min: 5.0,
            pause_sec: 0.0,
            loop_mode: false,
            layers: LayerConfig {
                voice: true,
                background: None,
                solfeggio: None,
                binaural: None,
                gains: LayerGains::default(),
            },
        }
    }

    pub fn spec(owner: &str) -> JobSpec {
        JobSpec {
            owner_id: owner.into(),
            project_id: None,
            priority: 0,
            payload: payload(),
            output_options: OutputOptions::default(),
            max_retries: 3,
        }
    }
}
