use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::{AudioEngine, AudioInfo, Loudness, LoudnessTarget, MixInput, ToneSpec};
use crate::error::EngineError;
use crate::job::OutputFormat;

/// [`AudioEngine`] backed by the `ffmpeg` and `ffprobe` binaries.
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for FfmpegEngine {
    fn default() -> Self {
        Self::new("ffmpeg".into(), "ffprobe".into())
    }
}

impl FfmpegEngine {
    pub fn new(ffmpeg: PathBuf, ffprobe: PathBuf) -> Self {
        Self { ffmpeg, ffprobe }
    }

    /// Run a program to completion, returning its stdout and stderr.
    async fn run(&self, program: &Path, args: &[String]) -> Result<(String, String), EngineError> {
        let name = program.display().to_string();
        debug!(program = %name, ?args, "running audio engine command");
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| EngineError::Spawn {
                program: name.clone(),
                source,
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(EngineError::Failed {
                program: name,
                code: output.status.code(),
                stderr: tail(&stderr, 2000),
            });
        }
        Ok((stdout, stderr))
    }

    async fn ffmpeg(&self, args: Vec<String>) -> Result<String, EngineError> {
        let mut full = vec!["-hide_banner".to_string(), "-nostdin".to_string(), "-y".to_string()];
        full.extend(args);
        let (_, stderr) = self.run(&self.ffmpeg, &full).await?;
        Ok(stderr)
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

fn tail(text: &str, max: usize) -> String {
    let start = text.len().saturating_sub(max);
    let start = (start..text.len())
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(text.len());
    text[start..].to_string()
}

fn db_to_linear(db: f64) -> f64 {
    10f64.powf(db / 20.0)
}

fn concat_filter(count: usize, gap_secs: f64, sample_rate: u32) -> String {
    let mut graph = String::new();
    let mut labels = String::new();
    for i in 0..count {
        graph.push_str(&format!(
            "[{i}:a]aformat=sample_rates={sample_rate}:channel_layouts=stereo"
        ));
        if gap_secs > 0.0 && i + 1 < count {
            graph.push_str(&format!(",apad=pad_dur={gap_secs}"));
        }
        graph.push_str(&format!("[c{i}];"));
        labels.push_str(&format!("[c{i}]"));
    }
    graph.push_str(&format!("{labels}concat=n={count}:v=0:a=1[out]"));
    graph
}

fn mix_filter(inputs: &[MixInput], duration_secs: f64, sample_rate: u32) -> String {
    let mut graph = String::new();
    let mut labels = String::new();
    for (i, input) in inputs.iter().enumerate() {
        graph.push_str(&format!(
            "[{i}:a]aformat=sample_rates={sample_rate}:channel_layouts=stereo,volume={:.2}dB[l{i}];",
            input.gain_db
        ));
        labels.push_str(&format!("[l{i}]"));
    }
    if inputs.len() > 1 {
        graph.push_str(&format!(
            "{labels}amix=inputs={}:duration=longest:normalize=0[m];[m]",
            inputs.len()
        ));
    } else {
        graph.push_str(&labels);
    }
    graph.push_str(&format!(
        "apad=whole_dur={duration_secs:.3},atrim=duration={duration_secs:.3}[out]"
    ));
    graph
}

fn codec_args(format: OutputFormat, bitrate_kbps: u32) -> Vec<String> {
    let mut args = Vec::new();
    match format {
        OutputFormat::Mp3 => {
            args.extend(["-c:a".to_string(), "libmp3lame".to_string()]);
            args.extend(["-b:a".to_string(), format!("{bitrate_kbps}k")]);
        }
        OutputFormat::Aac => {
            args.extend(["-c:a".to_string(), "aac".to_string()]);
            args.extend(["-b:a".to_string(), format!("{bitrate_kbps}k")]);
        }
        OutputFormat::Wav => {
            args.extend(["-c:a".to_string(), "pcm_s16le".to_string()]);
        }
    }
    args
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    #[serde(default)]
    codec_type: Option<String>,
    #[serde(default)]
    channels: Option<u16>,
    #[serde(default)]
    sample_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    bit_rate: Option<String>,
}

fn parse_probe(json: &str) -> Result<AudioInfo, EngineError> {
    let probe: ProbeOutput =
        serde_json::from_str(json).map_err(|e| EngineError::Parse(format!("ffprobe: {e}")))?;
    let stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref().is_none_or(|t| t == "audio"))
        .ok_or_else(|| EngineError::Parse("no audio stream".into()))?;
    let format = probe.format.as_ref();
    Ok(AudioInfo {
        duration_secs: format
            .and_then(|f| f.duration.as_deref())
            .and_then(|d| d.parse().ok())
            .unwrap_or(0.0),
        sample_rate: stream
            .sample_rate
            .as_deref()
            .and_then(|r| r.parse().ok())
            .unwrap_or(0),
        channels: stream.channels.unwrap_or(0),
        bitrate_kbps: format
            .and_then(|f| f.bit_rate.as_deref())
            .and_then(|b| b.parse::<u64>().ok())
            .map(|b| (b / 1000) as u32),
    })
}

#[derive(Debug, Deserialize)]
struct LoudnormSummary {
    input_i: String,
    input_tp: String,
    input_lra: String,
}

/// Pull the JSON block `loudnorm=print_format=json` writes to stderr.
fn parse_loudnorm(stderr: &str) -> Result<Loudness, EngineError> {
    let start = stderr
        .rfind('{')
        .ok_or_else(|| EngineError::Parse("loudnorm summary missing".into()))?;
    let end = stderr[start..]
        .find('}')
        .map(|i| start + i + 1)
        .ok_or_else(|| EngineError::Parse("loudnorm summary truncated".into()))?;
    let summary: LoudnormSummary = serde_json::from_str(&stderr[start..end])
        .map_err(|e| EngineError::Parse(format!("loudnorm: {e}")))?;
    let number = |field: &str, value: &str| {
        value
            .trim()
            .parse::<f64>()
            .map_err(|_| EngineError::Parse(format!("loudnorm {field}: {value:?}")))
    };
    Ok(Loudness {
        integrated_lufs: number("input_i", &summary.input_i)?,
        true_peak_db: number("input_tp", &summary.input_tp)?,
        range_lu: number("input_lra", &summary.input_lra)?,
    })
}

#[async_trait]
impl AudioEngine for FfmpegEngine {
    async fn probe(&self, path: &Path) -> Result<AudioInfo, EngineError> {
        let args = [
            "-v",
            "error",
            "-show_entries",
            "stream=codec_type,channels,sample_rate:format=duration,bit_rate",
            "-of",
            "json",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain(std::iter::once(path_arg(path)))
        .collect::<Vec<_>>();
        let (stdout, _) = self.run(&self.ffprobe, &args).await?;
        parse_probe(&stdout)
    }

    async fn concat(
        &self,
        inputs: &[PathBuf],
        gap_secs: f64,
        sample_rate: u32,
        output: &Path,
    ) -> Result<(), EngineError> {
        let mut args = Vec::new();
        for input in inputs {
            args.extend(["-i".to_string(), path_arg(input)]);
        }
        args.extend([
            "-filter_complex".to_string(),
            concat_filter(inputs.len(), gap_secs, sample_rate),
            "-map".to_string(),
            "[out]".to_string(),
            path_arg(output),
        ]);
        self.ffmpeg(args).await.map(|_| ())
    }

    async fn to_stereo(
        &self,
        input: &Path,
        output: &Path,
        sample_rate: u32,
    ) -> Result<(), EngineError> {
        let args = vec![
            "-i".to_string(),
            path_arg(input),
            "-ac".to_string(),
            "2".to_string(),
            "-ar".to_string(),
            sample_rate.to_string(),
            path_arg(output),
        ];
        self.ffmpeg(args).await.map(|_| ())
    }

    async fn generate_tone(
        &self,
        tone: ToneSpec,
        duration_secs: f64,
        sample_rate: u32,
        output: &Path,
    ) -> Result<(), EngineError> {
        let sine = |hz: f64| {
            format!("sine=frequency={hz}:sample_rate={sample_rate}:duration={duration_secs:.3}")
        };
        let args = vec![
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            sine(tone.left_hz),
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            sine(tone.right_hz),
            "-filter_complex".to_string(),
            "[0:a][1:a]amerge=inputs=2[out]".to_string(),
            "-map".to_string(),
            "[out]".to_string(),
            "-ac".to_string(),
            "2".to_string(),
            path_arg(output),
        ];
        self.ffmpeg(args).await.map(|_| ())
    }

    async fn mix(
        &self,
        inputs: &[MixInput],
        duration_secs: f64,
        sample_rate: u32,
        output: &Path,
    ) -> Result<(), EngineError> {
        let mut args = Vec::new();
        for input in inputs {
            if input.looped {
                args.extend(["-stream_loop".to_string(), "-1".to_string()]);
            }
            args.extend(["-i".to_string(), path_arg(&input.path)]);
        }
        args.extend([
            "-filter_complex".to_string(),
            mix_filter(inputs, duration_secs, sample_rate),
            "-map".to_string(),
            "[out]".to_string(),
            "-t".to_string(),
            format!("{duration_secs:.3}"),
            "-ac".to_string(),
            "2".to_string(),
            path_arg(output),
        ]);
        self.ffmpeg(args).await.map(|_| ())
    }

    async fn measure(&self, path: &Path) -> Result<Loudness, EngineError> {
        let args = vec![
            "-nostats".to_string(),
            "-i".to_string(),
            path_arg(path),
            "-af".to_string(),
            "loudnorm=print_format=json".to_string(),
            "-f".to_string(),
            "null".to_string(),
            "-".to_string(),
        ];
        let stderr = self.ffmpeg(args).await?;
        parse_loudnorm(&stderr)
    }

    async fn soft_limit(
        &self,
        input: &Path,
        output: &Path,
        ceiling_db: f64,
    ) -> Result<(), EngineError> {
        // alimiter accepts limits between 0.0625 and 1.
        let limit = db_to_linear(ceiling_db).clamp(0.0625, 1.0);
        let args = vec![
            "-i".to_string(),
            path_arg(input),
            "-af".to_string(),
            format!("alimiter=limit={limit:.4}:level=false"),
            path_arg(output),
        ];
        self.ffmpeg(args).await.map(|_| ())
    }

    async fn normalize(
        &self,
        input: &Path,
        output: &Path,
        target: &LoudnessTarget,
        sample_rate: u32,
    ) -> Result<(), EngineError> {
        let args = vec![
            "-i".to_string(),
            path_arg(input),
            "-af".to_string(),
            format!(
                "loudnorm=I={}:TP={}:LRA={}",
                target.integrated_lufs, target.true_peak_db, target.range_lu
            ),
            // loudnorm upsamples internally.
            "-ar".to_string(),
            sample_rate.to_string(),
            "-ac".to_string(),
            "2".to_string(),
            path_arg(output),
        ];
        self.ffmpeg(args).await.map(|_| ())
    }

    async fn encode(
        &self,
        input: &Path,
        output: &Path,
        format: OutputFormat,
        sample_rate: u32,
        bitrate_kbps: u32,
    ) -> Result<(), EngineError> {
        let mut args = vec![
            "-i".to_string(),
            path_arg(input),
            "-ac".to_string(),
            "2".to_string(),
            "-ar".to_string(),
            sample_rate.to_string(),
        ];
        args.extend(codec_args(format, bitrate_kbps));
        args.push(path_arg(output));
        self.ffmpeg(args).await.map(|_| ())
    }
}
