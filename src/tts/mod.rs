//! Text-to-speech providers behind one capability interface.
//!
//! Each provider owns a [`RateLimiter`] and a [`RetryPolicy`]; the shape of
//! that policy is the same for every provider. Splitting long scripts is the
//! caller's job, see [`crate::chunk`].

mod elevenlabs;
mod error;
mod limiter;
mod openai;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use elevenlabs::ElevenLabsSpeech;
pub use error::SynthesisError;
pub use limiter::{RateLimiter, RetryPolicy, retry};
pub use openai::OpenAiSpeech;

/// Per-call synthesis knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisOptions {
    pub model: Option<String>,
    pub speed: f32,
    pub pitch: f32,
    /// Container requested from the provider, e.g. "mp3".
    pub format: String,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            model: None,
            speed: 1.0,
            pitch: 0.0,
            format: "mp3".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Registry name, also part of the cache key.
    fn name(&self) -> &str;

    /// Maximum characters accepted by a single `synthesize` call.
    fn char_limit(&self) -> usize;

    /// Inclusive playback speed bounds the provider accepts.
    fn speed_range(&self) -> (f32, f32);

    /// Model used when the options do not name one.
    fn default_model(&self) -> &str;

    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        options: &SynthesisOptions,
    ) -> Result<Vec<u8>, SynthesisError>;

    async fn list_voices(&self) -> Result<Vec<VoiceInfo>, SynthesisError>;

    fn is_available(&self) -> bool;
}

/// Reject requests no provider could serve, before they cost a call.
pub(crate) fn validate_request(
    text: &str,
    options: &SynthesisOptions,
    speed_range: (f32, f32),
    char_limit: usize,
) -> Result<(), SynthesisError> {
    if text.trim().is_empty() {
        return Err(SynthesisError::InvalidRequest("text is empty".into()));
    }
    let chars = text.chars().count();
    if chars > char_limit {
        return Err(SynthesisError::InvalidRequest(format!(
            "text has {chars} characters, limit is {char_limit}"
        )));
    }
    let (min, max) = speed_range;
    if !(min..=max).contains(&options.speed) {
        return Err(SynthesisError::InvalidRequest(format!(
            "speed {} outside {min}-{max}",
            options.speed
        )));
    }
    Ok(())
}

/// Map 429 and other non-success statuses onto [`SynthesisError`].
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, SynthesisError> {
    let status = response.status();

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs * 1000)
            .unwrap_or(1000);
        return Err(SynthesisError::RateLimited {
            retry_after_ms: retry_after,
        });
    }

    if !status.is_success() {
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        return Err(SynthesisError::Api {
            status: status.as_u16(),
            message,
        });
    }

    Ok(response)
}

/// The providers a worker was constructed with, keyed by name.
#[derive(Clone, Default)]
pub struct SynthesizerSet {
    providers: HashMap<String, Arc<dyn SpeechSynthesizer>>,
}

impl SynthesizerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: Arc<dyn SpeechSynthesizer>) -> Self {
        self.providers.insert(provider.name().to_string(), provider);
        self
    }

    /// The named provider, if registered and configured.
    pub fn get(&self, name: &str) -> Result<Arc<dyn SpeechSynthesizer>, SynthesisError> {
        match self.providers.get(name) {
            Some(p) if p.is_available() => Ok(p.clone()),
            Some(_) => Err(SynthesisError::Unavailable(format!(
                "{name} is not configured"
            ))),
            None => Err(SynthesisError::Unavailable(format!(
                "{name} is not a registered provider"
            ))),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for SynthesizerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthesizerSet")
            .field("providers", &self.names())
            .finish()
    }
}
