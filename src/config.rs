use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use url::Url;

pub const ENV_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_PORT: &str = "PORT";
pub const ENV_OUTPUT_DIR: &str = "CHATREEL_OUTPUT_DIR";
pub const ENV_FONT: &str = "CHATREEL_FONT";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Settings {
    pub server: ServerSettings,
    pub paths: PathSettings,
    pub layout: LayoutSettings,
    pub reveal: RevealSettings,
    pub timeline: TimelineSettings,
    pub speech: SpeechSettings,
    pub dialogue: DialogueSettings,
    pub encoder: EncoderSettings,
    /// Never read from the file; only from `OPENAI_API_KEY`.
    #[serde(skip)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub max_concurrent_jobs: usize,
    pub max_queued_jobs: usize,
    /// Finished job records kept for status and download; oldest go first.
    pub max_finished_jobs: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 5001,
            cors_origins: vec![
                "http://localhost:3000".to_owned(),
                "http://localhost:5001".to_owned(),
            ],
            max_concurrent_jobs: 2,
            max_queued_jobs: 32,
            max_finished_jobs: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PathSettings {
    pub output_dir: PathBuf,
    /// Regular text face. Platform fallbacks are searched when unset.
    pub font: Option<PathBuf>,
    /// Face used for avatar initials; falls back to `font`.
    pub bold_font: Option<PathBuf>,
    pub tick_sound: Option<PathBuf>,
    /// Contact picture for the header; initials are drawn when unset.
    pub profile_image: Option<PathBuf>,
    pub persist_frames: bool,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            font: None,
            bold_font: None,
            tick_sound: None,
            profile_image: None,
            persist_frames: true,
        }
    }
}

/// Geometry of the phone viewport, in pixels.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct LayoutSettings {
    pub width: u32,
    pub height: u32,
    pub header_height: u32,
    pub padding: u32,
    pub bubble_padding: u32,
    pub bubble_gap: u32,
    pub bubble_radius: f32,
    pub font_size: f32,
    pub line_spacing: u32,
    pub header_font_size: f32,
    pub avatar_size: u32,
    /// Wrap width in characters, not pixels.
    pub wrap_columns: usize,
    pub self_sender: String,
}

impl Default for LayoutSettings {
    fn default() -> Self {
        Self {
            width: 375,
            height: 667,
            header_height: 120,
            padding: 20,
            bubble_padding: 10,
            bubble_gap: 10,
            bubble_radius: 20.0,
            font_size: 18.0,
            line_spacing: 5,
            header_font_size: 20.0,
            avatar_size: 50,
            wrap_columns: 30,
            self_sender: "You".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct RevealSettings {
    pub transition_frames: u32,
    pub slide_offset: u32,
}

impl Default for RevealSettings {
    fn default() -> Self {
        Self {
            transition_frames: 5,
            slide_offset: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct TimelineSettings {
    pub fps: u32,
    /// Seconds each reveal frame is shown. Defaults to one output frame.
    pub reveal_frame_duration: Option<f64>,
    pub default_hold: f64,
    pub inter_turn_pause: f64,
    pub tick_gain: f32,
}

impl Default for TimelineSettings {
    fn default() -> Self {
        Self {
            fps: 24,
            reveal_frame_duration: None,
            default_hold: 1.0,
            inter_turn_pause: 0.0,
            tick_gain: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SpeechSettings {
    pub base_url: String,
    pub model: String,
    pub self_voice: String,
    pub other_voice: String,
    /// Gender keyword (lowercase) to voice id.
    pub voice_map: BTreeMap<String, String>,
    pub timeout_seconds: u64,
    pub concurrency: usize,
}

impl Default for SpeechSettings {
    fn default() -> Self {
        let mut voice_map = BTreeMap::new();
        voice_map.insert("male".to_owned(), "ash".to_owned());
        voice_map.insert("female".to_owned(), "sage".to_owned());
        Self {
            base_url: "https://api.openai.com/v1".to_owned(),
            model: "tts-1".to_owned(),
            self_voice: "nova".to_owned(),
            other_voice: "fable".to_owned(),
            voice_map,
            timeout_seconds: 30,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DialogueSettings {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub timeout_seconds: u64,
}

impl Default for DialogueSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_owned(),
            model: "gpt-3.5-turbo".to_owned(),
            temperature: 0.9,
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FfmpegMode {
    #[default]
    Auto,
    System,
    Sidecar,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EncoderSettings {
    pub mode: FfmpegMode,
    pub preset: String,
    pub crf: u8,
    pub audio_codec: String,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            mode: FfmpegMode::Auto,
            preset: "medium".to_owned(),
            crf: 18,
            audio_codec: "aac".to_owned(),
        }
    }
}

impl Settings {
    /// Loads settings from an optional YAML file, then applies environment
    /// overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml_str(&contents).with_context(|| format!("in config {}", path.display()))
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents).map_err(|error| {
            let location = error
                .location()
                .map(|location| format!("line {}, column {}", location.line(), location.column()))
                .unwrap_or_else(|| "unknown location".to_owned());
            anyhow!("failed to parse yaml at {}: {}", location, error)
        })
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(key) = lookup(ENV_API_KEY).filter(|key| !key.trim().is_empty()) {
            self.api_key = Some(key.trim().to_owned());
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("{ENV_PORT} must be a port number, got '{port}'"))?;
        }
        if let Some(dir) = lookup(ENV_OUTPUT_DIR).filter(|dir| !dir.trim().is_empty()) {
            self.paths.output_dir = PathBuf::from(dir);
        }
        if let Some(font) = lookup(ENV_FONT).filter(|font| !font.trim().is_empty()) {
            self.paths.font = Some(PathBuf::from(font));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let layout = &self.layout;
        if layout.width == 0 || layout.height == 0 {
            bail!(
                "layout viewport must be positive, got {}x{}",
                layout.width,
                layout.height
            );
        }
        if layout.header_height >= layout.height {
            bail!(
                "layout header_height ({}) must be smaller than the viewport height ({})",
                layout.header_height,
                layout.height
            );
        }
        if !layout.font_size.is_finite() || layout.font_size <= 0.0 {
            bail!("layout font_size must be > 0");
        }
        if !layout.header_font_size.is_finite() || layout.header_font_size <= 0.0 {
            bail!("layout header_font_size must be > 0");
        }
        if layout.wrap_columns == 0 {
            bail!("layout wrap_columns must be > 0");
        }
        if layout.self_sender.trim().is_empty() {
            bail!("layout self_sender cannot be empty");
        }

        if self.reveal.transition_frames == 0 {
            bail!("reveal transition_frames must be > 0");
        }

        let timeline = &self.timeline;
        if timeline.fps == 0 {
            bail!("timeline fps must be > 0");
        }
        if let Some(duration) = timeline.reveal_frame_duration {
            if !duration.is_finite() || duration <= 0.0 {
                bail!("timeline reveal_frame_duration must be > 0");
            }
        }
        if !timeline.default_hold.is_finite() || timeline.default_hold <= 0.0 {
            bail!("timeline default_hold must be > 0 seconds");
        }
        if !timeline.inter_turn_pause.is_finite() || timeline.inter_turn_pause < 0.0 {
            bail!("timeline inter_turn_pause must be >= 0 seconds");
        }
        if !timeline.tick_gain.is_finite() || timeline.tick_gain < 0.0 {
            bail!("timeline tick_gain must be >= 0");
        }

        if self.server.max_concurrent_jobs == 0 {
            bail!("server max_concurrent_jobs must be > 0");
        }
        if self.speech.concurrency == 0 {
            bail!("speech concurrency must be > 0");
        }
        if self.speech.timeout_seconds == 0 || self.dialogue.timeout_seconds == 0 {
            bail!("service timeouts must be > 0 seconds");
        }

        Url::parse(&self.speech.base_url)
            .with_context(|| format!("invalid speech base_url '{}'", self.speech.base_url))?;
        Url::parse(&self.dialogue.base_url)
            .with_context(|| format!("invalid dialogue base_url '{}'", self.dialogue.base_url))?;

        if self.encoder.crf > 51 {
            bail!("encoder crf must be within 0..=51, got {}", self.encoder.crf);
        }

        Ok(())
    }

    /// Seconds each reveal frame is displayed.
    pub fn reveal_frame_duration(&self) -> f64 {
        self.timeline
            .reveal_frame_duration
            .unwrap_or(1.0 / f64::from(self.timeline.fps))
    }

    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| anyhow!("{ENV_API_KEY} is not set; speech and dialogue services need it"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_yields_defaults() {
        let settings = Settings::from_yaml_str("").unwrap();
        assert_eq!(settings.timeline.fps, 24);
        assert_eq!(settings.reveal.transition_frames, 5);
        assert_eq!(settings.layout.width, 375);
        settings.validate().unwrap();
        assert!((settings.reveal_frame_duration() - 1.0 / 24.0).abs() < 1e-12);
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let settings = Settings::from_yaml_str(
            r#"
timeline:
  fps: 30
  inter_turn_pause: 0.25
layout:
  self_sender: Me
"#,
        )
        .unwrap();
        assert_eq!(settings.timeline.fps, 30);
        assert_eq!(settings.timeline.default_hold, 1.0);
        assert_eq!(settings.layout.self_sender, "Me");
        assert_eq!(settings.layout.header_height, 120);
    }

    #[test]
    fn unknown_fields_are_rejected_with_location() {
        let error = Settings::from_yaml_str("timeline:\n  fsp: 30\n").unwrap_err();
        let message = error.to_string();
        assert!(message.contains("line 2"), "{message}");
        assert!(message.contains("fsp"), "{message}");
    }

    #[test]
    fn env_overrides_apply() {
        let mut settings = Settings::default();
        settings
            .apply_env(|key| match key {
                ENV_API_KEY => Some(" sk-test ".to_owned()),
                ENV_PORT => Some("8080".to_owned()),
                ENV_OUTPUT_DIR => Some("/tmp/reels".to_owned()),
                _ => None,
            })
            .unwrap();
        assert_eq!(settings.api_key.as_deref(), Some("sk-test"));
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.paths.output_dir, PathBuf::from("/tmp/reels"));
        assert!(settings.paths.font.is_none());
    }

    #[test]
    fn bad_port_env_is_an_error() {
        let mut settings = Settings::default();
        let error = settings
            .apply_env(|key| (key == ENV_PORT).then(|| "http".to_owned()))
            .unwrap_err();
        assert!(error.to_string().contains("PORT"));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.timeline.fps = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.timeline.default_hold = 0.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.reveal.transition_frames = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.speech.base_url = "not a url".to_owned();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.layout.header_height = 700;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn missing_api_key_is_reported() {
        let settings = Settings::default();
        assert!(settings.require_api_key().is_err());
    }
}
