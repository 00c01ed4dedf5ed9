//! Stand-ins for fonts, the speech service, ffprobe and ffmpeg.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use image::{Rgba, RgbaImage};

use chatreel::config::Settings;
use chatreel::encoding::VideoEncoder;
use chatreel::error::{PipelineError, PipelineResult};
use chatreel::frames::FrameStore;
use chatreel::pipeline::{Pipeline, RendererFactory, Services};
use chatreel::probe::DurationProbe;
use chatreel::reveal::{BubbleRenderer, FrameScene};
use chatreel::speech::SpeechSynthesizer;
use chatreel::timeline::Timeline;

/// Paints each bubble's top edge and turn into the first pixel row.
pub struct StripeRenderer {
    width: u32,
    height: u32,
}

impl BubbleRenderer for StripeRenderer {
    fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn render(&mut self, scene: &FrameScene) -> Result<RgbaImage> {
        let mut image = RgbaImage::from_pixel(self.width, self.height, Rgba([0, 0, 0, 255]));
        for (idx, bubble) in scene.bubbles.iter().enumerate() {
            if idx as u32 >= self.width {
                break;
            }
            let value = (bubble.top % 251) as u8;
            image.put_pixel(idx as u32, 0, Rgba([value, bubble.turn_index as u8, 0, 255]));
        }
        Ok(image)
    }
}

pub struct StripeFactory;

impl RendererFactory for StripeFactory {
    fn renderer(&self, _contact_name: &str, _work_dir: &Path) -> Result<Box<dyn BubbleRenderer + Send>> {
        Ok(Box::new(StripeRenderer {
            width: 16,
            height: 16,
        }))
    }
}

/// Writes the turn text as the clip; fails for texts listed in `fail_on`.
#[derive(Default)]
pub struct FakeSpeech {
    pub fail_on: Vec<String>,
}

#[async_trait]
impl SpeechSynthesizer for FakeSpeech {
    async fn synthesize(&self, text: &str, _voice: &str, output: &Path) -> Result<()> {
        if self.fail_on.iter().any(|failing| failing == text) {
            bail!("speech service unavailable");
        }
        tokio::fs::write(output, text).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Durations keyed by file name.
#[derive(Default)]
pub struct TableProbe {
    pub durations: HashMap<String, f64>,
}

impl TableProbe {
    pub fn voices(durations: &[f64]) -> Self {
        Self {
            durations: durations
                .iter()
                .enumerate()
                .map(|(idx, duration)| (format!("line_{idx:03}.mp3"), *duration))
                .collect(),
        }
    }
}

impl DurationProbe for TableProbe {
    fn duration(&self, path: &Path) -> Result<f64> {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        match self.durations.get(&name) {
            Some(duration) => Ok(*duration),
            None => bail!("no duration for {name}"),
        }
    }
}

/// Records what it was asked to encode and writes a placeholder file.
#[derive(Default)]
pub struct RecordingEncoder {
    pub timelines: Mutex<Vec<Timeline>>,
    pub frame_counts: Mutex<Vec<usize>>,
    pub fail: bool,
}

impl VideoEncoder for RecordingEncoder {
    fn encode(&self, timeline: &Timeline, frames: &FrameStore, output: &Path) -> PipelineResult<()> {
        if self.fail {
            return Err(PipelineError::Encoding("ffmpeg exited with status 1".to_owned()));
        }
        self.timelines
            .lock()
            .map_err(|_| PipelineError::Encoding("poisoned".to_owned()))?
            .push(timeline.clone());
        self.frame_counts
            .lock()
            .map_err(|_| PipelineError::Encoding("poisoned".to_owned()))?
            .push(frames.len());
        std::fs::write(output, b"\x00\x00\x00\x18ftypmp42")?;
        Ok(())
    }
}

pub struct Harness {
    pub settings: Arc<Settings>,
    pub encoder: Arc<RecordingEncoder>,
    pub pipeline: Pipeline,
    pub output_dir: PathBuf,
    _dir: tempfile::TempDir,
}

pub fn harness(speech: FakeSpeech, probe: TableProbe, encoder: RecordingEncoder) -> Harness {
    harness_with(speech, probe, encoder, |_| {})
}

pub fn harness_with(
    speech: FakeSpeech,
    probe: TableProbe,
    encoder: RecordingEncoder,
    adjust: impl FnOnce(&mut Settings),
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.paths.output_dir = dir.path().join("output");
    adjust(&mut settings);
    let settings = Arc::new(settings);

    let encoder = Arc::new(encoder);
    let services = Services {
        renderer: Arc::new(StripeFactory),
        speech: Arc::new(speech),
        probe: Arc::new(probe),
        encoder: encoder.clone(),
        dialogue: None,
    };
    Harness {
        output_dir: settings.paths.output_dir.clone(),
        pipeline: Pipeline::new(Arc::clone(&settings), services),
        settings,
        encoder,
        _dir: dir,
    }
}
