//! Interface de terminal do soundbath: barra de progresso e saída colorida.
//!
//! Usa as crates `indicatif` para a barra de progresso e `console` para
//! estilização com cores. O [`RenderProgress`] acompanha visualmente
//! a renderização local de um job no terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::cache::CacheStats;
use crate::job::ResultMetadata;
use crate::tts::VoiceInfo;

/// Indicador visual de progresso para a renderização de um job.
///
/// Exibe uma barra de 0 a 100 durante o processamento e mensagens
/// coloridas para sucesso (verde) e falha (vermelho).
pub struct RenderProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    dim: Style,
}

impl RenderProgress {
    /// Inicia a barra com o identificador do job.
    pub fn start(job_id: &str) -> Self {
        let pb = ProgressBar::new(100);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
                .expect("invalid template")
                .progress_chars("=> "),
        );
        pb.set_message(format!("queued {job_id}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            dim: Style::new().dim(),
        }
    }

    /// Atualiza a posição e a mensagem da etapa atual.
    pub fn update(&self, progress: u8, message: Option<&str>) {
        self.pb.set_position(u64::from(progress.min(100)));
        if let Some(message) = message {
            self.pb.set_message(message.to_string());
        }
    }

    /// Finaliza a barra e exibe o resumo da faixa gerada.
    pub fn complete(&self, metadata: &ResultMetadata) {
        self.pb.finish_and_clear();
        println!(
            "  {} Rendered {:.1}s {} ({} layers, {:.1} LUFS, {:.1} dBTP)",
            self.green.apply_to("✓"),
            metadata.duration_secs,
            metadata.format,
            metadata.layers_used.len(),
            metadata.loudness_lufs,
            metadata.true_peak_db,
        );
        println!("    {}", self.dim.apply_to(&metadata.storage_url));
    }

    /// Finaliza a barra e exibe o motivo da falha.
    pub fn fail(&self, message: &str) {
        self.pb.abandon();
        println!("  {} Render failed: {message}", self.red.apply_to("✗"));
    }
}

/// Imprime as vozes de um provedor, uma por linha.
pub fn print_voices(provider: &str, voices: &[VoiceInfo]) {
    let header = Style::new().cyan().bold();
    let dim = Style::new().dim();
    println!("{}", header.apply_to(format!("─── {provider} voices ───")));
    for voice in voices {
        match &voice.category {
            Some(category) => println!(
                "  {:<28} {} {}",
                voice.id,
                voice.name,
                dim.apply_to(format!("({category})"))
            ),
            None => println!("  {:<28} {}", voice.id, voice.name),
        }
    }
}

/// Imprime as estatísticas do cache formatadas em JSON.
pub fn print_cache_stats(stats: &CacheStats) {
    let header = Style::new().cyan().bold();
    println!("{}", header.apply_to("─── Cache ───"));
    println!("{}", serde_json::to_string_pretty(stats).unwrap_or_default());
}
