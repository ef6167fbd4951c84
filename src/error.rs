use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::progress::Stage;
use crate::tts::SynthesisError;

/// Errors raised by a [`JobStore`](crate::job::JobStore) implementation.
///
/// Store errors are surfaced as-is; retrying is the poll loop's business.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job store unreachable: {0}")]
    Unreachable(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: crate::job::JobStatus,
        to: crate::job::JobStatus,
    },

    #[error("Job store returned status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Failed to decode job store response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            StoreError::Decode(err.to_string())
        } else {
            StoreError::Unreachable(err.to_string())
        }
    }
}

/// Errors raised by blob storage and asset downloads.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage returned status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Rejected { status, .. } => *status == 429 || *status >= 500,
            StorageError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            StorageError::Io(_) => false,
        }
    }
}

/// Errors raised by the audio engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("could not parse engine output: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal outcome of a failed render pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Synthesis failed: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("Upload failed: {0}")]
    Upload(#[from] StorageError),

    #[error("{stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: EngineError,
    },

    #[error("Stereo compliance violated at {stage}: expected 2 channels, got {channels}")]
    PostCondition { stage: Stage, channels: u16 },

    #[error("Job cancelled before {0}")]
    Cancelled(Stage),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn stage(stage: Stage, source: EngineError) -> Self {
        PipelineError::Stage { stage, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::Synthesis(e) if e.is_invalid_request() => ErrorKind::Validation,
            PipelineError::Synthesis(_) | PipelineError::Upload(_) => ErrorKind::Provider,
            PipelineError::Stage { .. } => ErrorKind::Stage,
            PipelineError::PostCondition { .. } => ErrorKind::PostCondition,
            PipelineError::Cancelled(_) => ErrorKind::Cancelled,
            PipelineError::Store(_) | PipelineError::Io(_) | PipelineError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// The structured detail persisted next to the job's error message.
    pub fn detail(&self, failed_stage: Option<Stage>) -> ErrorDetail {
        let stage = match self {
            PipelineError::Stage { stage, .. }
            | PipelineError::PostCondition { stage, .. }
            | PipelineError::Cancelled(stage) => Some(*stage),
            _ => failed_stage,
        };
        ErrorDetail {
            kind: self.kind(),
            stage,
            message: self.to_string(),
        }
    }
}

/// Classifies a job failure for the persisted error detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input; permanent, never retried.
    Validation,
    /// Provider failure after retries were exhausted.
    Provider,
    /// Mixing, normalization, conversion or tone generation failed.
    Stage,
    /// Engine returned output that breaks the stereo invariant.
    PostCondition,
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Provider => write!(f, "provider"),
            ErrorKind::Stage => write!(f, "stage"),
            ErrorKind::PostCondition => write!(f, "post_condition"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// Persisted as `errorDetails` on a failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub message: String,
}
