//! Renders one claimed job from payload to published track.
//!
//! [`JobProcessor::run`] is the top-level executor: it owns the progress
//! tracker, runs the stage pipeline, and reports exactly one terminal outcome
//! (complete or fail) to the job store. The job's scratch directory lives in
//! a [`JobWorkspace`] that is dropped on every exit path.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::{AudioEngine, LoudnessTarget, MixInput, ToneSpec, gain_staging_db};
use crate::cache::{ContentCache, SynthesisParams};
use crate::chunk::split_text;
use crate::error::{EngineError, PipelineError, StoreError};
use crate::job::{BackgroundLayer, Job, JobPayload, JobStore, ResultMetadata, VoiceRef};
use crate::progress::{ProgressTracker, Stage};
use crate::storage::{BlobStorage, download_to, is_remote_url};
use crate::tts::{SynthesisOptions, SynthesizerSet};
use crate::workspace::JobWorkspace;

/// Limits and audio targets applied to every job.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorConfig {
    pub max_duration_min: f64,
    pub max_script_chars: usize,
    pub sample_rate: u32,
    pub target_lufs: f64,
    pub true_peak_db: f64,
    pub loudness_range_lu: f64,
    /// Apply `-10·log10(n)` dB to every layer when two or more are mixed.
    pub auto_gain_staging: bool,
    pub soft_limiter: bool,
    /// Peak (dBTP) above which the soft limiter runs.
    pub limiter_threshold_db: f64,
    pub progress_throttle: Duration,
    /// Parent directory for job workspaces; the system temp dir when `None`.
    pub workspace_root: Option<PathBuf>,
    /// Accept `file://` URLs and bare paths for voice and background assets.
    /// Payloads come from the queue, so only local renders turn this on.
    pub allow_local_assets: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_duration_min: 60.0,
            max_script_chars: 50_000,
            sample_rate: 44_100,
            target_lufs: -16.0,
            true_peak_db: -1.5,
            loudness_range_lu: 11.0,
            auto_gain_staging: true,
            soft_limiter: true,
            limiter_threshold_db: -1.0,
            progress_throttle: Duration::from_millis(500),
            workspace_root: None,
            allow_local_assets: false,
        }
    }
}

/// Validated tone layers and duration, computed before any resource is taken.
#[derive(Debug, Clone, PartialEq)]
struct RenderPlan {
    duration_secs: f64,
    solfeggio: Option<ToneSpec>,
    binaural: Option<ToneSpec>,
}

/// What [`JobProcessor::run`] did with a job.
#[derive(Debug)]
pub struct JobRun {
    pub outcome: Result<ResultMetadata, PipelineError>,
    /// Set when the terminal report itself could not be delivered.
    pub store_error: Option<StoreError>,
    pub elapsed: Duration,
}

struct Layer {
    name: &'static str,
    input: MixInput,
}

#[derive(Clone)]
pub struct JobProcessor {
    engine: Arc<dyn AudioEngine>,
    synthesizers: SynthesizerSet,
    storage: Arc<dyn BlobStorage>,
    cache: Option<Arc<Mutex<ContentCache>>>,
    http: reqwest::Client,
    config: ProcessorConfig,
}

impl JobProcessor {
    pub fn new(
        engine: Arc<dyn AudioEngine>,
        synthesizers: SynthesizerSet,
        storage: Arc<dyn BlobStorage>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            engine,
            synthesizers,
            storage,
            cache: None,
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn with_cache(mut self, cache: Arc<Mutex<ContentCache>>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Render `job` and report the terminal outcome to `store`.
    ///
    /// Progress updates are forwarded to the store as they happen and are
    /// fully drained before the terminal report, so the record never shows
    /// progress arriving after completion.
    pub async fn run(&self, job: &Job, store: &dyn JobStore, cancel: CancellationToken) -> JobRun {
        let started = Instant::now();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tracker = ProgressTracker::new(self.config.progress_throttle, true)
            .with_sink(move |update| {
                let _ = tx.send(update.clone());
            });

        let forward = async {
            while let Some(update) = rx.recv().await {
                if let Err(e) = store
                    .report_progress(&job.id, update.progress, &update.message)
                    .await
                {
                    debug!(job_id = %job.id, error = %e, "progress update dropped");
                }
            }
        };

        let work = async move {
            let outcome = AssertUnwindSafe(self.process(job, &mut tracker, &cancel))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(PipelineError::Internal(format!(
                        "job panicked: {}",
                        panic_message(panic.as_ref())
                    )))
                });
            let stage = tracker.current_stage();
            match &outcome {
                Ok(_) => tracker.finish(),
                Err(e) => tracker.record_error(e.to_string()),
            }
            // Dropping the tracker closes the progress channel.
            (outcome, stage)
        };

        let ((outcome, failed_stage), ()) = tokio::join!(work, forward);
        let elapsed = started.elapsed();

        let report = match &outcome {
            Ok(metadata) => {
                info!(
                    job_id = %job.id,
                    ms = elapsed.as_millis() as u64,
                    layers = ?metadata.layers_used,
                    "job completed"
                );
                store.complete(&job.id, metadata).await
            }
            Err(e) => {
                let detail = e.detail(failed_stage);
                warn!(job_id = %job.id, kind = %detail.kind, stage = ?detail.stage, error = %e, "job failed");
                store.fail(&job.id, &e.to_string(), &detail).await
            }
        };

        JobRun {
            outcome,
            store_error: report.err(),
            elapsed,
        }
    }

    async fn process(
        &self,
        job: &Job,
        tracker: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<ResultMetadata, PipelineError> {
        let started = Instant::now();
        let payload = &job.payload;
        let sample_rate = self.config.sample_rate;

        tracker.start_stage(Stage::Initializing);
        let plan = self.validate(payload)?;
        let workspace = JobWorkspace::create(self.config.workspace_root.as_deref(), &job.id)?;
        tracker.complete_stage();

        checkpoint(cancel, Stage::FetchingAssets)?;
        let mut layers: Vec<Layer> = Vec::new();
        if let Some(background) = &payload.layers.background
            && let Some(path) = self.fetch_background(background, &workspace, tracker).await
        {
            layers.push(Layer {
                name: "background",
                input: MixInput {
                    path,
                    gain_db: payload.layers.gains.background,
                    looped: true,
                },
            });
        }
        tracker.complete_stage();

        checkpoint(cancel, Stage::SynthesizingVoice)?;
        if payload.layers.voice {
            let path = self.voice_layer(job, &workspace, tracker, cancel).await?;
            layers.insert(
                0,
                Layer {
                    name: "voice",
                    input: MixInput {
                        path,
                        gain_db: payload.layers.gains.voice,
                        looped: payload.loop_mode,
                    },
                },
            );
        }
        tracker.complete_stage();

        checkpoint(cancel, Stage::GeneratingTones)?;
        let tones = [
            ("solfeggio", plan.solfeggio, payload.layers.gains.solfeggio),
            ("binaural", plan.binaural, payload.layers.gains.binaural),
        ];
        let tone_count = tones.iter().filter(|(_, t, _)| t.is_some()).count();
        let mut generated = 0;
        for (name, tone, gain_db) in tones {
            let Some(tone) = tone else {
                continue;
            };
            let path = workspace.path(&format!("{name}.wav"));
            self.engine
                .generate_tone(tone, plan.duration_secs, sample_rate, &path)
                .await
                .map_err(|e| PipelineError::stage(Stage::GeneratingTones, e))?;
            self.ensure_stereo(&path, Stage::GeneratingTones).await?;
            layers.push(Layer {
                name,
                input: MixInput {
                    path,
                    gain_db,
                    looped: false,
                },
            });
            generated += 1;
            tracker.update_fraction(generated as f64 / tone_count as f64);
        }
        tracker.complete_stage();

        checkpoint(cancel, Stage::Mixing)?;
        if layers.is_empty() {
            return Err(PipelineError::Internal(
                "no audio layers left to mix".into(),
            ));
        }
        let staging = if self.config.auto_gain_staging {
            gain_staging_db(layers.len())
        } else {
            0.0
        };
        let inputs: Vec<MixInput> = layers
            .iter()
            .map(|l| MixInput {
                gain_db: l.input.gain_db + staging,
                ..l.input.clone()
            })
            .collect();
        let mixed = workspace.path("mix.wav");
        self.engine
            .mix(&inputs, plan.duration_secs, sample_rate, &mixed)
            .await
            .map_err(|e| PipelineError::stage(Stage::Mixing, e))?;
        tracker.update_fraction(0.6);
        let mixed = self.limit_peaks(mixed, &workspace).await?;
        tracker.complete_stage();

        checkpoint(cancel, Stage::Normalizing)?;
        let normalized = workspace.path("normalized.wav");
        let target = LoudnessTarget {
            integrated_lufs: self.config.target_lufs,
            true_peak_db: self.config.true_peak_db,
            range_lu: self.config.loudness_range_lu,
        };
        self.engine
            .normalize(&mixed, &normalized, &target, sample_rate)
            .await
            .map_err(|e| PipelineError::stage(Stage::Normalizing, e))?;
        let loudness = self
            .engine
            .measure(&normalized)
            .await
            .map_err(|e| PipelineError::stage(Stage::Normalizing, e))?;
        tracker.complete_stage();

        checkpoint(cancel, Stage::Publishing)?;
        let options = &job.output_options;
        let ext = options.format.extension();
        let bitrate = options.quality.bitrate_kbps();
        let encoded = workspace.path(&format!("output.{ext}"));
        self.engine
            .encode(&normalized, &encoded, options.format, sample_rate, bitrate)
            .await
            .map_err(|e| PipelineError::stage(Stage::Publishing, e))?;
        let info = self.ensure_stereo(&encoded, Stage::Publishing).await?;
        tracker.update_fraction(0.3);

        let key = format!("{}/{}.{ext}", job.owner_id, job.id);
        let uploaded = self
            .storage
            .upload(
                &encoded,
                &key,
                options.storage_location,
                options.format.content_type(),
            )
            .await?;
        tracker.complete_stage();

        let metadata = ResultMetadata {
            duration_secs: info.duration_secs,
            format: options.format,
            sample_rate: info.sample_rate,
            bitrate_kbps: info.bitrate_kbps.unwrap_or(bitrate),
            channels: info.channels,
            stereo_verified: true,
            loudness_lufs: loudness.integrated_lufs,
            true_peak_db: loudness.true_peak_db,
            file_size: uploaded.size,
            layers_used: layers.iter().map(|l| l.name.to_string()).collect(),
            processing_ms: started.elapsed().as_millis() as u64,
            storage_key: uploaded.key,
            storage_url: uploaded.url,
        };
        // Failures are logged by close; the track is already published.
        let _ = workspace.close();
        Ok(metadata)
    }

    fn validate(&self, payload: &JobPayload) -> Result<RenderPlan, PipelineError> {
        let max = self.config.max_duration_min;
        if !payload.duration_min.is_finite() || payload.duration_min <= 0.0 {
            return Err(PipelineError::Validation(format!(
                "duration {} min must be positive",
                payload.duration_min
            )));
        }
        if payload.duration_min > max {
            return Err(PipelineError::Validation(format!(
                "duration {} min exceeds maximum {max}",
                payload.duration_min
            )));
        }

        let chars = payload.script_text.chars().count();
        if chars > self.config.max_script_chars {
            return Err(PipelineError::Validation(format!(
                "script has {chars} characters, limit is {}",
                self.config.max_script_chars
            )));
        }
        if !payload.pause_sec.is_finite() || payload.pause_sec < 0.0 {
            return Err(PipelineError::Validation(format!(
                "pause {} s must not be negative",
                payload.pause_sec
            )));
        }

        if payload.layers.voice {
            match &payload.voice_ref {
                VoiceRef::Uploaded { url } => {
                    if !self.asset_allowed(url) {
                        return Err(PipelineError::Validation(format!(
                            "voice url {url} must be http or https"
                        )));
                    }
                }
                VoiceRef::Provider {
                    provider, speed, ..
                } => {
                    if payload.script_text.trim().is_empty() {
                        return Err(PipelineError::Validation(
                            "voice layer enabled but script is empty".into(),
                        ));
                    }
                    let synth = self
                        .synthesizers
                        .get(provider)
                        .map_err(|e| PipelineError::Validation(e.to_string()))?;
                    let (min, max) = synth.speed_range();
                    if !speed.is_finite() || !(min..=max).contains(speed) {
                        return Err(PipelineError::Validation(format!(
                            "speed {speed} outside {min}-{max} for {provider}"
                        )));
                    }
                }
            }
        }

        let solfeggio = payload
            .layers
            .solfeggio
            .as_ref()
            .map(|s| ToneSpec::solfeggio(s.frequency_hz))
            .transpose()
            .map_err(PipelineError::Validation)?;
        let binaural = payload
            .layers
            .binaural
            .as_ref()
            .map(|b| ToneSpec::binaural(b.carrier_hz, b.beat_hz, b.band))
            .transpose()
            .map_err(PipelineError::Validation)?;

        let layers = &payload.layers;
        if !layers.voice && layers.background.is_none() && solfeggio.is_none() && binaural.is_none()
        {
            return Err(PipelineError::Validation("no layers enabled".into()));
        }

        Ok(RenderPlan {
            duration_secs: payload.duration_min * 60.0,
            solfeggio,
            binaural,
        })
    }

    fn asset_allowed(&self, url: &str) -> bool {
        self.config.allow_local_assets || is_remote_url(url)
    }

    /// Download and convert the background track. Failures drop the layer.
    async fn fetch_background(
        &self,
        background: &BackgroundLayer,
        workspace: &JobWorkspace,
        tracker: &mut ProgressTracker,
    ) -> Option<PathBuf> {
        if !self.asset_allowed(&background.url) {
            warn!(url = %background.url, "background is not an http(s) url, continuing without it");
            tracker.record_error(format!(
                "background unavailable: {} is not an http(s) url",
                background.url
            ));
            return None;
        }
        let source = workspace.path("background.src");
        if let Err(e) = download_to(&self.http, &background.url, &source).await {
            warn!(url = %background.url, error = %e, "background unavailable, continuing without it");
            tracker.record_error(format!("background unavailable: {e}"));
            return None;
        }
        tracker.update_fraction(0.5);

        let path = workspace.path("background.wav");
        if let Err(e) = self
            .engine
            .to_stereo(&source, &path, self.config.sample_rate)
            .await
        {
            warn!(url = %background.url, error = %e, "background unreadable, continuing without it");
            tracker.record_error(format!("background unreadable: {e}"));
            return None;
        }
        Some(path)
    }

    async fn voice_layer(
        &self,
        job: &Job,
        workspace: &JobWorkspace,
        tracker: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError> {
        let payload = &job.payload;
        let raw = workspace.path("voice_raw.wav");

        match &payload.voice_ref {
            VoiceRef::Uploaded { url } => {
                let source = workspace.path("voice.src");
                download_to(&self.http, url, &source).await?;
                tracker.update_fraction(0.5);
                self.engine
                    .concat(&[source], 0.0, self.config.sample_rate, &raw)
                    .await
                    .map_err(|e| PipelineError::stage(Stage::SynthesizingVoice, e))?;
            }
            VoiceRef::Provider {
                provider,
                voice_id,
                model,
                speed,
                pitch,
            } => {
                let synth = self.synthesizers.get(provider)?;
                let options = SynthesisOptions {
                    model: model.clone(),
                    speed: *speed,
                    pitch: *pitch,
                    format: "mp3".to_string(),
                };
                let model = options
                    .model
                    .clone()
                    .unwrap_or_else(|| synth.default_model().to_string());
                let chunks = split_text(&payload.script_text, synth.char_limit());
                debug!(job_id = %job.id, chunks = chunks.len(), provider = %provider, "synthesizing voice");

                let mut paths = Vec::with_capacity(chunks.len());
                for (i, text) in chunks.iter().enumerate() {
                    if i > 0 {
                        checkpoint(cancel, Stage::SynthesizingVoice)?;
                    }
                    tracker.set_message(format!(
                        "Synthesizing voice ({}/{})",
                        i + 1,
                        chunks.len()
                    ));
                    let params = SynthesisParams {
                        text,
                        voice: voice_id,
                        model: &model,
                        provider,
                        speed: *speed,
                        pitch: *pitch,
                        format: &options.format,
                    };
                    let audio = match self.cached(&params).await {
                        Some(audio) => audio,
                        None => {
                            let audio = synth.synthesize(text, voice_id, &options).await?;
                            self.store_cached(&params, &audio, &job.id).await;
                            audio
                        }
                    };
                    let path = workspace.path(&format!("chunk_{i:03}.mp3"));
                    tokio::fs::write(&path, &audio).await?;
                    paths.push(path);
                    tracker.update_fraction((i + 1) as f64 / chunks.len() as f64 * 0.9);
                }
                tracker.clear_message();
                self.engine
                    .concat(&paths, payload.pause_sec, self.config.sample_rate, &raw)
                    .await
                    .map_err(|e| PipelineError::stage(Stage::SynthesizingVoice, e))?;
            }
        }

        let voice = workspace.path("voice.wav");
        self.engine
            .to_stereo(&raw, &voice, self.config.sample_rate)
            .await
            .map_err(|e| PipelineError::stage(Stage::SynthesizingVoice, e))?;
        self.ensure_stereo(&voice, Stage::SynthesizingVoice).await?;
        Ok(voice)
    }

    async fn cached(&self, params: &SynthesisParams<'_>) -> Option<Vec<u8>> {
        let cache = self.cache.as_ref()?;
        let key = ContentCache::generate_key(params);
        cache.lock().await.get(&key).await.map(|entry| entry.data)
    }

    async fn store_cached(&self, params: &SynthesisParams<'_>, audio: &[u8], job_id: &str) {
        let Some(cache) = &self.cache else {
            return;
        };
        let key = ContentCache::generate_key(params);
        let metadata = json!({
            "provider": params.provider,
            "voice": params.voice,
            "model": params.model,
            "chars": params.text.chars().count(),
            "jobId": job_id,
        });
        if let Err(e) = cache.lock().await.set(&key, audio, metadata).await {
            warn!(key, error = %e, "could not cache synthesized audio");
        }
    }

    /// Run the soft limiter when the mix peaks above the threshold.
    async fn limit_peaks(
        &self,
        mixed: PathBuf,
        workspace: &JobWorkspace,
    ) -> Result<PathBuf, PipelineError> {
        if !self.config.soft_limiter {
            return Ok(mixed);
        }
        let measured = self
            .engine
            .measure(&mixed)
            .await
            .map_err(|e| PipelineError::stage(Stage::Mixing, e))?;
        if measured.true_peak_db <= self.config.limiter_threshold_db {
            return Ok(mixed);
        }
        debug!(peak = measured.true_peak_db, "mix peaks above threshold, limiting");
        let limited = workspace.path("mix_limited.wav");
        self.engine
            .soft_limit(&mixed, &limited, self.config.limiter_threshold_db)
            .await
            .map_err(|e| PipelineError::stage(Stage::Mixing, e))?;
        Ok(limited)
    }

    async fn ensure_stereo(
        &self,
        path: &Path,
        stage: Stage,
    ) -> Result<crate::audio::AudioInfo, PipelineError> {
        let info = self
            .engine
            .probe(path)
            .await
            .map_err(|e: EngineError| PipelineError::stage(stage, e))?;
        if !info.is_stereo() {
            return Err(PipelineError::PostCondition {
                stage,
                channels: info.channels,
            });
        }
        Ok(info)
    }
}

fn checkpoint(cancel: &CancellationToken, next: Stage) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled(next))
    } else {
        Ok(())
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
