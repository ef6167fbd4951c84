use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use soundbath::audio::FfmpegEngine;
use soundbath::cache::ContentCache;
use soundbath::cli::{CacheAction, Cli, Command, ProviderArg};
use soundbath::config::WorkerConfig;
use soundbath::job::{HttpJobStore, JobSpec, JobStore, MemoryJobStore};
use soundbath::orchestrator::Orchestrator;
use soundbath::processor::{JobProcessor, ProcessorConfig};
use soundbath::server::{self, StatusState};
use soundbath::storage::{BlobStorage, HttpBlobStorage, LocalBlobStorage};
use soundbath::tts::{ElevenLabsSpeech, OpenAiSpeech, SynthesizerSet};
use soundbath::ui::{self, RenderProgress};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = WorkerConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve {
            max_concurrent_jobs,
            idle_timeout_ms,
        } => {
            if let Some(n) = max_concurrent_jobs {
                config.worker.max_concurrent_jobs = n;
            }
            if let Some(ms) = idle_timeout_ms {
                config.worker.idle_timeout_ms = ms;
            }
            serve(config).await
        }
        Command::Render { file, out } => {
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let spec: JobSpec = serde_json::from_str(&contents)
                .with_context(|| format!("parsing job spec {}", file.display()))?;
            let storage = Arc::new(LocalBlobStorage::new(out));
            render(config, spec, storage).await
        }
        Command::Voices { provider } => voices(&config, provider).await,
        Command::Cache { action } => cache(&config, action).await,
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("soundbath=debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "soundbath=info".into())
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn synthesizers(config: &WorkerConfig) -> SynthesizerSet {
    let mut set = SynthesizerSet::new();

    let openai = &config.providers.openai;
    if openai.is_configured() {
        let mut provider = match &openai.base_url {
            Some(url) => OpenAiSpeech::with_base_url(openai.api_key.clone(), url.clone()),
            None => OpenAiSpeech::new(openai.api_key.clone()),
        };
        if let Some(model) = &openai.model {
            provider = provider.with_model(model.clone());
        }
        let (max_concurrent, rpm) = openai.limits(OpenAiSpeech::DEFAULT_LIMITS);
        set = set.with(Arc::new(
            provider
                .with_limits(max_concurrent, rpm)
                .with_retry(config.retry.clone()),
        ));
    }

    let elevenlabs = &config.providers.elevenlabs;
    if elevenlabs.is_configured() {
        let mut provider = match &elevenlabs.base_url {
            Some(url) => ElevenLabsSpeech::with_base_url(elevenlabs.api_key.clone(), url.clone()),
            None => ElevenLabsSpeech::new(elevenlabs.api_key.clone()),
        };
        if let Some(model) = &elevenlabs.model {
            provider = provider.with_model(model.clone());
        }
        let (max_concurrent, rpm) = elevenlabs.limits(ElevenLabsSpeech::DEFAULT_LIMITS);
        set = set.with(Arc::new(
            provider
                .with_limits(max_concurrent, rpm)
                .with_retry(config.retry.clone()),
        ));
    }

    if set.names().is_empty() {
        warn!("no speech provider configured, voice layers will fail");
    }
    set
}

async fn open_cache(config: &WorkerConfig) -> Result<ContentCache> {
    let mut cache = ContentCache::open(
        config.cache.dir.clone(),
        config.cache.max_bytes,
        Duration::from_secs(config.cache.ttl_secs),
    )
    .await
    .with_context(|| format!("opening cache at {}", config.cache.dir.display()))?;
    let purged = cache.purge_expired().await;
    if purged > 0 {
        info!(purged, "expired cache entries removed");
    }
    Ok(cache)
}

async fn processor(
    config: &WorkerConfig,
    storage: Arc<dyn BlobStorage>,
    allow_local_assets: bool,
) -> Result<JobProcessor> {
    let engine = Arc::new(FfmpegEngine::new(
        config.audio.ffmpeg.clone(),
        config.audio.ffprobe.clone(),
    ));
    let mut processor = JobProcessor::new(
        engine,
        synthesizers(config),
        storage,
        ProcessorConfig {
            allow_local_assets,
            ..config.processor_config()
        },
    );
    if config.cache.enabled {
        let cache = open_cache(config).await?;
        info!(
            entries = cache.len(),
            bytes = cache.total_size(),
            "synthesis cache ready"
        );
        processor = processor.with_cache(Arc::new(Mutex::new(cache)));
    }
    Ok(processor)
}

fn remote_storage(config: &WorkerConfig) -> Result<Arc<dyn BlobStorage>> {
    if let Some(dir) = &config.storage.local_dir {
        return Ok(Arc::new(LocalBlobStorage::new(dir.clone())));
    }
    let (url, api_key) = config.storage_endpoint();
    if url.is_empty() {
        bail!("storage url not configured (set [storage].url or [store].url)");
    }
    Ok(Arc::new(
        HttpBlobStorage::new(url, api_key, config.storage.buckets.clone())
            .with_retry(config.retry.clone()),
    ))
}

async fn serve(config: WorkerConfig) -> Result<()> {
    if config.store.url.is_empty() {
        bail!("job store url not configured (set [store].url or SOUNDBATH_STORE_URL)");
    }
    let mut http_store = HttpJobStore::new(config.store.url.clone(), config.store.api_key.clone());
    if let Some(ms) = config.store.subscribe_poll_ms {
        http_store = http_store.with_poll_interval(Duration::from_millis(ms));
    }
    let store: Arc<dyn JobStore> = Arc::new(http_store);
    let processor = processor(&config, remote_storage(&config)?, false).await?;
    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(processor),
        config.orchestrator_config(),
    );
    let handle = orchestrator.handle();

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    let signal_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(active_jobs = signal_handle.active_jobs(), "ctrl-c received, draining");
            on_signal.cancel();
        }
    });

    let status = tokio::spawn(server::serve(
        config.worker.status_addr,
        StatusState {
            snapshot: handle.watch(),
            store,
        },
        shutdown.clone(),
    ));

    let stats = orchestrator.run(shutdown.clone()).await;
    // The orchestrator may also stop on idle timeout.
    shutdown.cancel();
    status.await.context("status server task")??;

    info!(
        processed = stats.processed,
        succeeded = stats.succeeded,
        failed = stats.failed,
        "worker stopped"
    );
    Ok(())
}

async fn render(config: WorkerConfig, spec: JobSpec, storage: Arc<dyn BlobStorage>) -> Result<()> {
    // The job file is local input, so it may point at local assets.
    let processor = processor(&config, storage, true).await?;
    let store = MemoryJobStore::new();
    let submitted = store.submit(spec).await?;
    let mut updates = store.subscribe(&submitted.id).await?;
    let job = store
        .claim_next("local")
        .await?
        .context("submitted job could not be claimed")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let progress = RenderProgress::start(&job.id);
    let pending = processor.run(&job, &store, cancel);
    tokio::pin!(pending);
    let run = loop {
        tokio::select! {
            run = &mut pending => break run,
            Some(update) = updates.next() => {
                progress.update(update.progress, update.progress_message.as_deref());
            }
        }
    };

    if let Some(e) = &run.store_error {
        warn!(error = %e, "terminal report was not recorded");
    }
    match run.outcome {
        Ok(metadata) => {
            progress.complete(&metadata);
            println!("{}", serde_json::to_string_pretty(&metadata)?);
            Ok(())
        }
        Err(e) => {
            progress.fail(&e.to_string());
            Err(e.into())
        }
    }
}

async fn voices(config: &WorkerConfig, provider: ProviderArg) -> Result<()> {
    let synthesizers = synthesizers(config);
    let synth = synthesizers.get(provider.as_str())?;
    let voices = synth.list_voices().await?;
    ui::print_voices(provider.as_str(), &voices);
    Ok(())
}

async fn cache(config: &WorkerConfig, action: CacheAction) -> Result<()> {
    let mut cache = open_cache(config).await?;
    match action {
        CacheAction::Stats => ui::print_cache_stats(&cache.statistics()),
        CacheAction::Clear => {
            let entries = cache.len();
            cache.clear().await?;
            println!("Cleared {entries} entries from {}", cache.dir().display());
        }
    }
    Ok(())
}
