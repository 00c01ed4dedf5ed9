use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

/// Reads an audio file's duration in seconds, which decides how long its
/// turn is held on screen.
pub trait DurationProbe: Send + Sync {
    fn duration(&self, path: &Path) -> Result<f64>;
}

/// Probes with the system `ffprobe`.
#[derive(Debug, Clone, Default)]
pub struct FfprobeDuration;

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    #[serde(default)]
    codec_type: Option<String>,
    #[serde(default)]
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    #[serde(default)]
    duration: Option<String>,
}

impl DurationProbe for FfprobeDuration {
    fn duration(&self, path: &Path) -> Result<f64> {
        let output = Command::new("ffprobe")
            .arg("-v")
            .arg("error")
            .arg("-show_streams")
            .arg("-show_format")
            .arg("-print_format")
            .arg("json")
            .arg(path)
            .output()
            .with_context(|| format!("failed to spawn ffprobe for {}", path.display()))?;

        if !output.status.success() {
            bail!(
                "ffprobe failed for {} (exit status: {})",
                path.display(),
                output.status
            );
        }

        parse_duration(&output.stdout)
            .with_context(|| format!("no usable duration for {}", path.display()))
    }
}

/// Audio stream duration, falling back to the container's.
fn parse_duration(stdout: &[u8]) -> Result<f64> {
    let parsed: FfprobeOutput =
        serde_json::from_slice(stdout).context("failed to parse ffprobe JSON")?;

    parsed
        .streams
        .iter()
        .filter(|stream| stream.codec_type.as_deref() == Some("audio"))
        .find_map(|stream| stream.duration.as_deref().and_then(parse_seconds))
        .or_else(|| {
            parsed
                .format
                .as_ref()
                .and_then(|format| format.duration.as_deref())
                .and_then(parse_seconds)
        })
        .ok_or_else(|| anyhow!("ffprobe reported no positive duration"))
}

fn parse_seconds(raw: &str) -> Option<f64> {
    let parsed = raw.trim().parse::<f64>().ok()?;
    (parsed.is_finite() && parsed > 0.0).then_some(parsed)
}
