use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    RateLimiter, RetryPolicy, SpeechSynthesizer, SynthesisError, SynthesisOptions, VoiceInfo,
    check_status, validate_request,
};

const API_URL: &str = "https://api.elevenlabs.io";
const CHAR_LIMIT: usize = 5000;
const SPEED_RANGE: (f32, f32) = (0.7, 1.2);

#[derive(Debug, Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
    speed: f32,
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

#[derive(Debug, Deserialize)]
struct VoicesResponse {
    voices: Vec<RemoteVoice>,
}

#[derive(Debug, Deserialize)]
struct RemoteVoice {
    voice_id: String,
    name: String,
    #[serde(default)]
    category: Option<String>,
}

/// ElevenLabs `/v1/text-to-speech/{voice_id}`.
pub struct ElevenLabsSpeech {
    api_key: String,
    client: Client,
    base_url: String,
    model: String,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl ElevenLabsSpeech {
    /// Concurrent calls and requests per minute when not configured.
    pub const DEFAULT_LIMITS: (usize, u32) = (2, 100);

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
            model: "eleven_multilingual_v2".to_string(),
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

    fn output_format(format: &str) -> &'static str {
        match format {
            "wav" | "pcm" => "pcm_44100",
            _ => "mp3_44100_128",
        }
    }

    async fn send(
        &self,
        voice: &str,
        format: &str,
        req: &SpeechRequest<'_>,
    ) -> Result<Vec<u8>, SynthesisError> {
        let response = self
            .client
            .post(format!("{}/v1/text-to-speech/{voice}", self.base_url))
            .query(&[("output_format", Self::output_format(format))])
            .header("xi-api-key", &self.api_key)
            .json(req)
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSpeech {
    fn name(&self) -> &str {
        "elevenlabs"
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
            return Err(SynthesisError::Unavailable(
                "elevenlabs api key missing".into(),
            ));
        }
        validate_request(text, options, SPEED_RANGE, CHAR_LIMIT)?;
        let req = SpeechRequest {
            text,
            model_id: options.model.as_deref().unwrap_or(&self.model),
            voice_settings: VoiceSettings {
                stability: 0.5,
                similarity_boost: 0.75,
                speed: options.speed,
            },
        };
        debug!(voice, chars = text.chars().count(), "elevenlabs synthesis");
        self.limiter
            .execute(&self.retry, "elevenlabs", || {
                self.send(voice, &options.format, &req)
            })
            .await
    }

    async fn list_voices(&self) -> Result<Vec<VoiceInfo>, SynthesisError> {
        let voices = self
            .limiter
            .execute(&self.retry, "elevenlabs", || async {
                let response = self
                    .client
                    .get(format!("{}/v1/voices", self.base_url))
                    .header("xi-api-key", &self.api_key)
                    .send()
                    .await?;
                let response = check_status(response).await?;
                Ok::<_, SynthesisError>(response.json::<VoicesResponse>().await?)
            })
            .await?;
        Ok(voices
            .voices
            .into_iter()
            .map(|v| VoiceInfo {
                id: v.voice_id,
                name: v.name,
                category: v.category,
            })
            .collect())
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> ElevenLabsSpeech {
        ElevenLabsSpeech::with_base_url("xi-test".into(), server.uri())
            .with_limits(1, 0)
            .with_retry(RetryPolicy {
                max_retries: 1,
                base_delay_ms: 1,
                max_delay_ms: 5,
                jitter_ms: 0,
            })
    }

    #[tokio::test]
    async fn synthesize_targets_voice_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/text-to-speech/rachel"))
            .and(query_param("output_format", "mp3_44100_128"))
            .and(header("xi-api-key", "xi-test"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![9, 9, 9]))
            .expect(1)
            .mount(&server)
            .await;

        let audio = client(&server)
            .synthesize("Let go.", "rachel", &SynthesisOptions::default())
            .await
            .unwrap();
        assert_eq!(audio, vec![9, 9, 9]);
    }

    #[tokio::test]
    async fn server_error_exhausts_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/text-to-speech/rachel"))
            .respond_with(ResponseTemplate::new(500).set_body_string("oops"))
            .expect(2)
            .mount(&server)
            .await;

        let err = client(&server)
            .synthesize("Let go.", "rachel", &SynthesisOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SynthesisError::Api { status: 500, .. }));
    }

    #[tokio::test]
    async fn list_voices_maps_remote_shape() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/voices"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "voices": [
                    {"voice_id": "21m00", "name": "Rachel", "category": "premade"},
                    {"voice_id": "abc", "name": "Custom"}
                ]
            })))
            .mount(&server)
            .await;

        let voices = client(&server).list_voices().await.unwrap();
        assert_eq!(voices.len(), 2);
        assert_eq!(voices[0].id, "21m00");
        assert_eq!(voices[1].category, None);
    }

    #[tokio::test]
    async fn speed_outside_provider_range_is_rejected() {
        let opts = SynthesisOptions {
            speed: 2.0,
            ..Default::default()
        };
        let err = ElevenLabsSpeech::new("k".into())
            .synthesize("Hi", "rachel", &opts)
            .await
            .unwrap_err();
        assert!(err.is_invalid_request());
    }

    #[tokio::test]
    async fn missing_key_is_unavailable() {
        let speech = ElevenLabsSpeech::new(String::new());
        assert!(!speech.is_available());
        let err = speech
            .synthesize("Hi", "rachel", &SynthesisOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SynthesisError::Unavailable(_)));
    }
}
