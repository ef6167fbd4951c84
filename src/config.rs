//! Configuração do worker carregada a partir de `soundbath.toml`.
//!
//! A struct [`WorkerConfig`] agrupa os parâmetros por seção (`[worker]`,
//! `[store]`, `[storage]`, `[cache]`, `[audio]`, `[progress]`, `[retry]`,
//! `[providers.*]`). Valores ausentes no arquivo usam defaults sensíveis.
//! Variáveis de ambiente têm precedência sobre o arquivo para segredos e
//! endpoints.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::orchestrator::OrchestratorConfig;
use crate::processor::ProcessorConfig;
use crate::storage::Buckets;
use crate::tts::RetryPolicy;

/// Arquivo lido quando `--config` não é informado.
pub const DEFAULT_CONFIG_FILE: &str = "soundbath.toml";

/// Configuração de nível superior carregada de `soundbath.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub audio: AudioSection,
    #[serde(default)]
    pub progress: ProgressSection,
    /// Política de retentativa compartilhada por provedores e uploads.
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub providers: ProvidersSection,
}

/// Agendamento e limites de jobs.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    /// Identificador do worker; gerado quando vazio.
    #[serde(default)]
    pub worker_id: String,

    /// Máximo de jobs processados simultaneamente.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Encerra o worker após este tempo ocioso. Zero desativa.
    #[serde(default)]
    pub idle_timeout_ms: u64,

    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,

    /// Locks de processamento mais antigos que isto são liberados na partida.
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,

    /// Duração máxima de uma faixa, em minutos.
    #[serde(default = "default_max_duration_min")]
    pub max_duration_min: f64,

    /// Tamanho máximo do roteiro, em caracteres.
    #[serde(default = "default_max_script_chars")]
    pub max_script_chars: usize,

    /// Endereço dos endpoints `/health` e `/stats`.
    #[serde(default = "default_status_addr")]
    pub status_addr: SocketAddr,

    /// Diretório pai dos workspaces temporários.
    #[serde(default)]
    pub workspace_dir: Option<PathBuf>,
}

// Valor padrão de jobs simultâneos: 2.
fn default_max_concurrent_jobs() -> usize {
    2
}

// Valor padrão do intervalo de polling: 5000ms.
fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_stats_interval_ms() -> u64 {
    60_000
}

// Trinta minutos.
fn default_lock_timeout_secs() -> u64 {
    1800
}

fn default_max_duration_min() -> f64 {
    60.0
}

fn default_max_script_chars() -> usize {
    50_000
}

fn default_status_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            worker_id: String::new(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            poll_interval_ms: default_poll_interval_ms(),
            idle_timeout_ms: 0,
            stats_interval_ms: default_stats_interval_ms(),
            lock_timeout_secs: default_lock_timeout_secs(),
            max_duration_min: default_max_duration_min(),
            max_script_chars: default_max_script_chars(),
            status_addr: default_status_addr(),
            workspace_dir: None,
        }
    }
}

/// Fila de jobs remota (PostgREST).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreSection {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    /// Intervalo de releitura das assinaturas de progresso, em ms.
    #[serde(default)]
    pub subscribe_poll_ms: Option<u64>,
}

/// Armazenamento dos arquivos renderizados.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageSection {
    /// URL do serviço de objetos; usa a URL do store quando ausente.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub buckets: Buckets,
    /// Quando definido, grava os arquivos neste diretório em vez de enviar.
    #[serde(default)]
    pub local_dir: Option<PathBuf>,
}

/// Cache em disco de áudio sintetizado.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    /// Orçamento total em bytes.
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".soundbath/cache")
}

// 512 MiB.
fn default_cache_max_bytes() -> u64 {
    512 * 1024 * 1024
}

// Sete dias.
fn default_cache_ttl_secs() -> u64 {
    7 * 24 * 3600
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_cache_dir(),
            max_bytes: default_cache_max_bytes(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// Motor de áudio e alvos de loudness.
#[derive(Debug, Clone, Deserialize)]
pub struct AudioSection {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: PathBuf,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Loudness integrado alvo (LUFS).
    #[serde(default = "default_target_lufs")]
    pub target_lufs: f64,
    /// Teto de true peak (dBTP).
    #[serde(default = "default_true_peak_db")]
    pub true_peak_db: f64,
    #[serde(default = "default_loudness_range_lu")]
    pub loudness_range_lu: f64,
    #[serde(default = "default_true")]
    pub auto_gain_staging: bool,
    #[serde(default = "default_true")]
    pub soft_limiter: bool,
    #[serde(default = "default_limiter_threshold_db")]
    pub limiter_threshold_db: f64,
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_sample_rate() -> u32 {
    44_100
}

// Padrão de streaming: -16 LUFS.
fn default_target_lufs() -> f64 {
    -16.0
}

fn default_true_peak_db() -> f64 {
    -1.5
}

fn default_loudness_range_lu() -> f64 {
    11.0
}

fn default_limiter_threshold_db() -> f64 {
    -1.0
}

impl Default for AudioSection {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            sample_rate: default_sample_rate(),
            target_lufs: default_target_lufs(),
            true_peak_db: default_true_peak_db(),
            loudness_range_lu: default_loudness_range_lu(),
            auto_gain_staging: true,
            soft_limiter: true,
            limiter_threshold_db: default_limiter_threshold_db(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressSection {
    /// Intervalo mínimo entre atualizações de progresso não forçadas.
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,
}

fn default_throttle_ms() -> u64 {
    500
}

impl Default for ProgressSection {
    fn default() -> Self {
        Self {
            throttle_ms: default_throttle_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersSection {
    #[serde(default)]
    pub openai: ProviderSection,
    #[serde(default)]
    pub elevenlabs: ProviderSection,
}

/// Credenciais e limites de um provedor de TTS.
///
/// Limites ausentes usam os defaults do próprio provedor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderSection {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
}

impl ProviderSection {
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Limites efetivos, completando os ausentes com `defaults`.
    pub fn limits(&self, defaults: (usize, u32)) -> (usize, u32) {
        (
            self.max_concurrent.unwrap_or(defaults.0),
            self.requests_per_minute.unwrap_or(defaults.1),
        )
    }
}

impl WorkerConfig {
    /// Carrega a configuração de `path`, ou de `soundbath.toml` no diretório
    /// atual. Usa valores padrão se o arquivo padrão não existir; um arquivo
    /// informado explicitamente precisa existir.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                if !path.exists() {
                    bail!("config file {} not found", path.display());
                }
                Self::from_file(path)?
            }
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)?
                } else {
                    Self::default()
                }
            }
        };

        // Variáveis de ambiente têm precedência sobre o arquivo de configuração.
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str::<WorkerConfig>(&contents)
            .with_context(|| format!("parsing {}", path.display()))
    }

    /// Aplica sobreposições vindas de `lookup` (normalmente `std::env::var`).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(url) = get("SOUNDBATH_STORE_URL") {
            self.store.url = url;
        }
        if let Some(key) = get("SOUNDBATH_STORE_KEY") {
            self.store.api_key = key;
        }
        if let Some(key) = get("OPENAI_API_KEY") {
            self.providers.openai.api_key = key;
        }
        if let Some(key) = get("ELEVENLABS_API_KEY") {
            self.providers.elevenlabs.api_key = key;
        }
        if let Some(id) = get("SOUNDBATH_WORKER_ID") {
            self.worker.worker_id = id;
        }
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            max_duration_min: self.worker.max_duration_min,
            max_script_chars: self.worker.max_script_chars,
            sample_rate: self.audio.sample_rate,
            target_lufs: self.audio.target_lufs,
            true_peak_db: self.audio.true_peak_db,
            loudness_range_lu: self.audio.loudness_range_lu,
            auto_gain_staging: self.audio.auto_gain_staging,
            soft_limiter: self.audio.soft_limiter,
            limiter_threshold_db: self.audio.limiter_threshold_db,
            progress_throttle: Duration::from_millis(self.progress.throttle_ms),
            workspace_root: self.worker.workspace_dir.clone(),
            allow_local_assets: false,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let defaults = OrchestratorConfig::default();
        OrchestratorConfig {
            worker_id: if self.worker.worker_id.is_empty() {
                defaults.worker_id
            } else {
                self.worker.worker_id.clone()
            },
            max_concurrent_jobs: self.worker.max_concurrent_jobs,
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms),
            idle_timeout: Duration::from_millis(self.worker.idle_timeout_ms),
            stats_interval: Duration::from_millis(self.worker.stats_interval_ms),
            lock_timeout: Duration::from_secs(self.worker.lock_timeout_secs),
        }
    }

    /// URL e chave do armazenamento, herdando as do store quando ausentes.
    pub fn storage_endpoint(&self) -> (String, String) {
        (
            self.storage
                .url
                .clone()
                .unwrap_or_else(|| self.store.url.clone()),
            self.storage
                .api_key
                .clone()
                .unwrap_or_else(|| self.store.api_key.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_values() {
        let config = WorkerConfig::default();
        assert_eq!(config.worker.max_concurrent_jobs, 2);
        assert_eq!(config.worker.poll_interval_ms, 5000);
        assert_eq!(config.worker.idle_timeout_ms, 0);
        assert_eq!(config.audio.target_lufs, -16.0);
        assert_eq!(config.audio.sample_rate, 44_100);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert!(config.cache.enabled);
        assert!(config.providers.openai.api_key.is_empty());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            [worker]
            max_concurrent_jobs = 4
            max_duration_min = 15

            [audio]
            target_lufs = -14.0

            [retry]
            max_retries = 5

            [providers.elevenlabs]
            api_key = "xi-123"
            requests_per_minute = 20

            [storage.buckets]
            public = "tracks"
        "#;
        let config: WorkerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.worker.max_concurrent_jobs, 4);
        assert_eq!(config.worker.max_duration_min, 15.0);
        assert_eq!(config.worker.poll_interval_ms, 5000);
        assert_eq!(config.audio.target_lufs, -14.0);
        assert_eq!(config.audio.true_peak_db, -1.5);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert_eq!(config.providers.elevenlabs.api_key, "xi-123");
        assert_eq!(config.providers.elevenlabs.requests_per_minute, Some(20));
        assert_eq!(config.providers.elevenlabs.max_concurrent, None);
        assert_eq!(config.providers.elevenlabs.limits((2, 100)), (2, 20));
        assert!(config.providers.elevenlabs.is_configured());
        assert!(!config.providers.openai.is_configured());
        assert_eq!(config.storage.buckets.public, "tracks");
        assert_eq!(config.storage.buckets.private, "audio-private");
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config: WorkerConfig = toml::from_str(
            r#"
            [store]
            url = "https://file.example"
            api_key = "from-file"
            "#,
        )
        .unwrap();
        let env: HashMap<&str, &str> = [
            ("SOUNDBATH_STORE_URL", "https://env.example"),
            ("OPENAI_API_KEY", "sk-env"),
            ("SOUNDBATH_WORKER_ID", "worker-env"),
            ("ELEVENLABS_API_KEY", ""),
        ]
        .into_iter()
        .collect();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.store.url, "https://env.example");
        assert_eq!(config.store.api_key, "from-file");
        assert_eq!(config.providers.openai.api_key, "sk-env");
        assert!(config.providers.elevenlabs.api_key.is_empty());
        assert_eq!(config.orchestrator_config().worker_id, "worker-env");
    }

    #[test]
    fn derived_runtime_configs() {
        let mut config = WorkerConfig::default();
        config.worker.idle_timeout_ms = 30_000;
        config.progress.throttle_ms = 250;

        let orch = config.orchestrator_config();
        assert!(orch.worker_id.starts_with("worker-"));
        assert_eq!(orch.idle_timeout, Duration::from_secs(30));
        assert_eq!(orch.lock_timeout, Duration::from_secs(1800));

        let proc = config.processor_config();
        assert_eq!(proc.progress_throttle, Duration::from_millis(250));
        assert_eq!(proc.max_script_chars, 50_000);
        assert!(!proc.allow_local_assets);
    }

    #[test]
    fn store_subscribe_poll_is_optional() {
        let config: WorkerConfig = toml::from_str(
            r#"
            [store]
            url = "https://db.example"
            subscribe_poll_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.store.subscribe_poll_ms, Some(500));
        assert_eq!(WorkerConfig::default().store.subscribe_poll_ms, None);
    }

    #[test]
    fn storage_inherits_store_endpoint() {
        let mut config = WorkerConfig::default();
        config.store.url = "https://db.example".into();
        config.store.api_key = "service".into();
        assert_eq!(
            config.storage_endpoint(),
            ("https://db.example".to_string(), "service".to_string())
        );
        config.storage.url = Some("https://blobs.example".into());
        assert_eq!(config.storage_endpoint().0, "https://blobs.example");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = WorkerConfig::load(Some(Path::new("/nonexistent/soundbath.toml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("worker.toml");
        std::fs::write(&path, "[worker]\nmax_concurrent_jobs = 7\n").unwrap();
        let config = WorkerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.worker.max_concurrent_jobs, 7);
    }
}
