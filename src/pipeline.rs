//! One video job end to end: script, frames, speech, timeline, encode.
//!
//! Stages run strictly in order. Rendering and encoding are CPU/process work
//! and run on the blocking pool; speech is the only stage with concurrent
//! network calls.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use image::RgbaImage;
use serde::Serialize;

use crate::avatar::{initials_avatar, load_profile_image};
use crate::bubble::{ChatPainter, Theme};
use crate::config::{LayoutSettings, PathSettings, Settings};
use crate::conversation::{Conversation, VoiceSelection};
use crate::dialogue::{DialogueRequest, DialogueSource};
use crate::encoding::VideoEncoder;
use crate::error::{PipelineError, PipelineResult};
use crate::font_assets::load_font_pair;
use crate::probe::DurationProbe;
use crate::reveal::{plan_reveal, render_reveal, BubbleRenderer, RevealFrames};
use crate::speech::{synthesize_all, SpeechSynthesizer};
use crate::timeline::{assemble, AssemblyConfig, AudioClip, Timeline};

/// Work-directory key for runs that are not tied to a job.
pub const SCROLL_KEY: &str = "scroll";

/// Pipeline milestones and the progress reported once each is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scripted,
    Rendered,
    Synthesized,
    Assembled,
    Encoded,
}

impl Stage {
    pub fn progress(self) -> u8 {
        match self {
            Stage::Scripted => 10,
            Stage::Rendered => 40,
            Stage::Synthesized => 70,
            Stage::Assembled => 80,
            Stage::Encoded => 100,
        }
    }
}

/// Where the dialogue comes from.
#[derive(Debug, Clone)]
pub enum Script {
    Turns(Conversation),
    Generate(DialogueRequest),
}

#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub contact_name: String,
    pub voices: VoiceSelection,
    pub script: Script,
}

/// Builds the painter for one job. Fonts and the avatar are resolved per
/// job so a missing asset fails that job, not the server.
pub trait RendererFactory: Send + Sync {
    fn renderer(
        &self,
        contact_name: &str,
        work_dir: &Path,
    ) -> anyhow::Result<Box<dyn BubbleRenderer + Send>>;
}

pub struct ChatPainterFactory {
    layout: LayoutSettings,
    paths: PathSettings,
    theme: Theme,
}

impl ChatPainterFactory {
    pub fn new(settings: &Settings) -> Self {
        Self {
            layout: settings.layout.clone(),
            paths: settings.paths.clone(),
            theme: Theme::default(),
        }
    }
}

impl RendererFactory for ChatPainterFactory {
    fn renderer(
        &self,
        contact_name: &str,
        work_dir: &Path,
    ) -> anyhow::Result<Box<dyn BubbleRenderer + Send>> {
        let (regular, bold) =
            load_font_pair(self.paths.font.as_deref(), self.paths.bold_font.as_deref())?;
        tracing::debug!(
            font = %regular.path.display(),
            sha256 = %regular.sha256,
            "loaded text font"
        );

        let avatar = match self.paths.profile_image.as_deref() {
            Some(path) => load_profile_image(path)?,
            None => {
                let avatar = initials_avatar(contact_name, bold.font);
                save_avatar(&avatar, contact_name, work_dir)?;
                avatar
            }
        };

        let painter = ChatPainter::new(
            &self.layout,
            self.theme.clone(),
            regular.font,
            contact_name,
            &avatar,
        )?;
        Ok(Box::new(painter))
    }
}

fn save_avatar(avatar: &RgbaImage, contact_name: &str, work_dir: &Path) -> anyhow::Result<()> {
    let file = format!(
        "profile_{}_initials.png",
        contact_name.split_whitespace().collect::<Vec<_>>().join("_")
    );
    let path = work_dir.join(file);
    avatar
        .save(&path)
        .with_context(|| format!("failed to write avatar {}", path.display()))
}

/// External collaborators of the pipeline.
#[derive(Clone)]
pub struct Services {
    pub renderer: Arc<dyn RendererFactory>,
    pub speech: Arc<dyn SpeechSynthesizer>,
    pub probe: Arc<dyn DurationProbe>,
    pub encoder: Arc<dyn VideoEncoder>,
    /// `None` when no dialogue service is configured.
    pub dialogue: Option<Arc<dyn DialogueSource>>,
}

#[derive(Clone)]
pub struct Pipeline {
    settings: Arc<Settings>,
    services: Services,
}

/// Paths of one run's artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkLayout {
    pub work_dir: PathBuf,
    pub frames_dir: PathBuf,
    pub audio_dir: PathBuf,
    pub output: PathBuf,
}

impl WorkLayout {
    pub fn new(output_dir: &Path, key: &str) -> Self {
        let work_dir = output_dir.join("work").join(key);
        Self {
            frames_dir: work_dir.join("frames"),
            audio_dir: work_dir.join("audio"),
            output: output_dir.join(format!("chat_video_{key}.mp4")),
            work_dir,
        }
    }
}

impl Pipeline {
    pub fn new(settings: Arc<Settings>, services: Services) -> Self {
        Self { settings, services }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Runs every stage and returns the encoded video's path. `progress` is
    /// called as each stage completes.
    pub async fn run(
        &self,
        request: RenderRequest,
        key: &str,
        progress: &(dyn Fn(Stage) + Send + Sync),
    ) -> PipelineResult<PathBuf> {
        let conversation = self.resolve_script(request.script).await?;
        conversation.require_content()?;
        progress(Stage::Scripted);

        let layout = WorkLayout::new(&self.settings.paths.output_dir, key);
        tokio::fs::create_dir_all(&layout.work_dir).await?;

        let frames = self
            .render(conversation.clone(), request.contact_name.clone(), &layout)
            .await?;
        progress(Stage::Rendered);

        let voices = synthesize_all(
            &conversation,
            &request.voices,
            &self.settings.layout.self_sender,
            self.services.speech.as_ref(),
            Arc::clone(&self.services.probe),
            &layout.audio_dir,
            self.settings.speech.concurrency,
        )
        .await?;
        progress(Stage::Synthesized);

        let tick = self.tick_clip().await;
        let timeline = assemble(
            &frames.groups,
            &voices,
            tick.as_ref(),
            &AssemblyConfig::from_settings(&self.settings),
        )?;
        log_timeline(&timeline);
        progress(Stage::Assembled);

        self.encode(timeline, frames, layout.output.clone()).await?;
        progress(Stage::Encoded);

        Ok(layout.output)
    }

    async fn resolve_script(&self, script: Script) -> PipelineResult<Conversation> {
        match script {
            Script::Turns(conversation) => Ok(conversation),
            Script::Generate(request) => {
                let source = self.services.dialogue.as_ref().ok_or_else(|| {
                    PipelineError::Configuration(
                        "dialogue generation requested but no dialogue service is configured"
                            .to_owned(),
                    )
                })?;
                source.generate(&request).await
            }
        }
    }

    async fn render(
        &self,
        conversation: Conversation,
        contact_name: String,
        layout: &WorkLayout,
    ) -> PipelineResult<RevealFrames> {
        let factory = Arc::clone(&self.services.renderer);
        let settings = Arc::clone(&self.settings);
        let work_dir = layout.work_dir.clone();
        let frames_dir = layout.frames_dir.clone();

        tokio::task::spawn_blocking(move || {
            let mut renderer = factory
                .renderer(&contact_name, &work_dir)
                .map_err(|error| PipelineError::configuration_chain(&error))?;
            let plan = plan_reveal(&conversation, &settings.layout, &settings.reveal);
            let mut frames = render_reveal(&plan, renderer.as_mut())?;
            tracing::debug!(
                frames = frames.store.len(),
                fingerprint = %frames.store.fingerprint(),
                "reveal frames rendered"
            );
            if settings.paths.persist_frames {
                frames
                    .store
                    .persist(&frames_dir)
                    .map_err(|error| PipelineError::configuration_chain(&error))?;
            }
            Ok(frames)
        })
        .await
        .map_err(|error| PipelineError::Configuration(format!("render task failed: {error}")))?
    }

    /// The tick clip, when one is configured and readable.
    async fn tick_clip(&self) -> Option<AudioClip> {
        let path = self.settings.paths.tick_sound.clone()?;
        if !path.is_file() {
            tracing::warn!(path = %path.display(), "tick sound not found; skipping ticks");
            return None;
        }
        let probe = Arc::clone(&self.services.probe);
        let probed = path.clone();
        match tokio::task::spawn_blocking(move || probe.duration(&probed)).await {
            Ok(Ok(duration)) => Some(AudioClip::tick(path, duration)),
            Ok(Err(error)) => {
                tracing::warn!(path = %path.display(), error = %format!("{error:#}"), "tick sound unreadable; skipping ticks");
                None
            }
            Err(error) => {
                tracing::warn!(error = %error, "tick probe task failed; skipping ticks");
                None
            }
        }
    }

    async fn encode(
        &self,
        timeline: Timeline,
        frames: RevealFrames,
        output: PathBuf,
    ) -> PipelineResult<()> {
        let encoder = Arc::clone(&self.services.encoder);
        tokio::task::spawn_blocking(move || encoder.encode(&timeline, &frames.store, &output))
            .await
            .map_err(|error| PipelineError::Encoding(format!("encode task failed: {error}")))?
    }
}

fn log_timeline(timeline: &Timeline) {
    let total = timeline.total_duration();
    let drift = (total - timeline.audio_length).abs();
    if drift > timeline.frame_interval() {
        tracing::warn!(
            total,
            audio = timeline.audio_length,
            "timeline drifted more than one frame from the audio track"
        );
    }
    tracing::debug!(
        entries = timeline.entries.len(),
        audio_clips = timeline.audio.len(),
        total,
        "timeline assembled"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_layout_is_keyed() {
        let layout = WorkLayout::new(Path::new("/srv/output"), "abc");
        assert_eq!(layout.work_dir, PathBuf::from("/srv/output/work/abc"));
        assert_eq!(layout.frames_dir, PathBuf::from("/srv/output/work/abc/frames"));
        assert_eq!(layout.audio_dir, PathBuf::from("/srv/output/work/abc/audio"));
        assert_eq!(layout.output, PathBuf::from("/srv/output/chat_video_abc.mp4"));

        let scroll = WorkLayout::new(Path::new("out"), SCROLL_KEY);
        assert_eq!(scroll.output, PathBuf::from("out/chat_video_scroll.mp4"));
    }

    #[test]
    fn progress_only_grows() {
        let stages = [
            Stage::Scripted,
            Stage::Rendered,
            Stage::Synthesized,
            Stage::Assembled,
            Stage::Encoded,
        ];
        assert!(stages
            .windows(2)
            .all(|pair| pair[0].progress() < pair[1].progress()));
        assert_eq!(Stage::Encoded.progress(), 100);
    }

    #[test]
    fn avatar_file_name_joins_name_parts() {
        let dir = tempfile::tempdir().unwrap();
        let avatar = RgbaImage::new(2, 2);
        save_avatar(&avatar, "Mary  Jane", dir.path()).unwrap();
        assert!(dir.path().join("profile_Mary_Jane_initials.png").is_file());
    }
}
