use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use super::{
    RateLimiter, RetryPolicy, SpeechSynthesizer, SynthesisError, SynthesisOptions, VoiceInfo,
    check_status, validate_request,
};

const API_URL: &str = "https://api.openai.com";
const CHAR_LIMIT: usize = 4096;
const SPEED_RANGE: (f32, f32) = (0.25, 4.0);
const VOICES: [&str; 9] = [
    "alloy", "ash", "coral", "echo", "fable", "onyx", "nova", "sage", "shimmer",
];

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
    speed: f32,
}

/// OpenAI `/v1/audio/speech`.
pub struct OpenAiSpeech {
    api_key: String,
    client: Client,
    base_url: String,
    model: String,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl OpenAiSpeech {
    /// Concurrent calls and requests per minute when not configured.
    pub const DEFAULT_LIMITS: (usize, u32) = (3, 50);

    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, API_URL.to_string())
    }

    /// Create a client pointing at a custom base URL (useful for testing).
    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build HTTP client");
        Self {
            api_key,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: "tts-1-hd".to_string(),
            limiter: RateLimiter::new(Self::DEFAULT_LIMITS.0, Self::DEFAULT_LIMITS.1),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_model(mut self, model: String) -> Self {
        self.model = model;
        self
    }

    pub fn with_limits(mut self, max_concurrent: usize, requests_per_minute: u32) -> Self {
        self.limiter = RateLimiter::new(max_concurrent, requests_per_minute);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn send(&self, req: &SpeechRequest<'_>) -> Result<Vec<u8>, SynthesisError> {
        let response = self
            .client
            .post(format!("{}/v1/audio/speech", self.base_url))
            .bearer_auth(&self.api_key)
            .json(req)
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeech {
    fn name(&self) -> &str {
        "openai"
    }

    fn char_limit(&self) -> usize {
        CHAR_LIMIT
    }

    fn speed_range(&self) -> (f32, f32) {
        SPEED_RANGE
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        options: &SynthesisOptions,
    ) -> Result<Vec<u8>, SynthesisError> {
        if !self.is_available() {
            return Err(SynthesisError::Unavailable("openai api key missing".into()));
        }
        validate_request(text, options, SPEED_RANGE, CHAR_LIMIT)?;
        let req = SpeechRequest {
            model: options.model.as_deref().unwrap_or(&self.model),
            input: text,
            voice,
            response_format: &options.format,
            speed: options.speed,
        };
        debug!(voice, chars = text.chars().count(), "openai synthesis");
        self.limiter
            .execute(&self.retry, "openai", || self.send(&req))
            .await
    }

    async fn list_voices(&self) -> Result<Vec<VoiceInfo>, SynthesisError> {
        Ok(VOICES
            .iter()
            .map(|v| VoiceInfo {
                id: v.to_string(),
                name: v.to_string(),
                category: Some("premade".to_string()),
            })
            .collect())
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }
}
