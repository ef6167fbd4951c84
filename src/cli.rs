//! Interface de linha de comando do soundbath baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (serve, render,
//! voices, cache) e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// soundbath: worker de renderização de faixas de meditação em camadas.
#[derive(Debug, Parser)]
#[command(name = "soundbath", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: soundbath.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Provedores de TTS aceitos pela CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderArg {
    Openai,
    Elevenlabs,
}

impl ProviderArg {
    /// Nome do provedor no registro de sintetizadores.
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderArg::Openai => "openai",
            ProviderArg::Elevenlabs => "elevenlabs",
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Processa jobs da fila até Ctrl-C ou timeout de ociosidade.
    Serve {
        /// Sobrepõe `worker.max_concurrent_jobs`.
        #[arg(long)]
        max_concurrent_jobs: Option<usize>,

        /// Sobrepõe `worker.idle_timeout_ms` (0 desativa).
        #[arg(long)]
        idle_timeout_ms: Option<u64>,
    },

    /// Renderiza um único job localmente, sem fila remota.
    Render {
        /// Arquivo JSON com a especificação do job.
        #[arg(long)]
        file: PathBuf,

        /// Diretório onde o arquivo final é gravado.
        #[arg(long, default_value = "out")]
        out: PathBuf,
    },

    /// Lista as vozes de um provedor.
    Voices {
        #[arg(long, value_enum)]
        provider: ProviderArg,
    },

    /// Inspeciona ou limpa o cache de síntese.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum CacheAction {
    /// Mostra estatísticas do cache.
    Stats,
    /// Remove todas as entradas.
    Clear,
}
