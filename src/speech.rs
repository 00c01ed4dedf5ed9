//! Per-turn speech synthesis.
//!
//! Every turn gets one request. A failed or timed-out request only costs that
//! turn its voice: the turn is still revealed and held for the default hold.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::config::SpeechSettings;
use crate::conversation::{Conversation, Side, VoiceSelection};
use crate::error::{PipelineError, PipelineResult};
use crate::probe::DurationProbe;
use crate::timeline::AudioClip;

/// Turns one line of text into an audio file.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &str, output: &Path) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Client for an OpenAI-compatible `/audio/speech` endpoint.
pub struct OpenAiSpeech {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    voice: &'a str,
    input: &'a str,
}

impl OpenAiSpeech {
    pub fn new(settings: &SpeechSettings, api_key: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("chatreel/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()
            .context("failed to build speech http client")?;
        Ok(Self {
            http,
            endpoint: format!("{}/audio/speech", settings.base_url.trim_end_matches('/')),
            model: settings.model.clone(),
            api_key: api_key.to_owned(),
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeech {
    async fn synthesize(&self, text: &str, voice: &str, output: &Path) -> Result<()> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&SpeechRequest {
                model: &self.model,
                voice,
                input: text,
            })
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    anyhow!("speech request timed out")
                } else {
                    anyhow!("speech request failed: {error}")
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("speech service returned {status}: {}", truncate(&body, 300));
        }

        let bytes = response
            .bytes()
            .await
            .context("failed to read speech response body")?;
        if bytes.is_empty() {
            bail!("speech service returned an empty body");
        }
        tokio::fs::write(output, &bytes)
            .await
            .with_context(|| format!("failed to write {}", output.display()))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

pub fn clip_path(audio_dir: &Path, turn_index: usize) -> PathBuf {
    audio_dir.join(format!("line_{turn_index:03}.mp3"))
}

/// Synthesizes every turn, at most `concurrency` at a time, and returns one
/// slot per turn in turn order. Only failing to prepare `audio_dir` is fatal.
pub async fn synthesize_all(
    conversation: &Conversation,
    voices: &VoiceSelection,
    self_sender: &str,
    synthesizer: &dyn SpeechSynthesizer,
    probe: Arc<dyn DurationProbe>,
    audio_dir: &Path,
    concurrency: usize,
) -> PipelineResult<Vec<Option<AudioClip>>> {
    tokio::fs::create_dir_all(audio_dir).await?;

    let requests = conversation
        .turns()
        .iter()
        .enumerate()
        .map(|(turn_index, turn)| {
            let voice = voices.for_side(Side::of(&turn.sender, self_sender)).to_owned();
            (turn_index, turn.text.clone(), voice, clip_path(audio_dir, turn_index))
        })
        .collect::<Vec<_>>();

    let clips = stream::iter(requests)
        .map(|(turn_index, text, voice, output)| {
            let probe = Arc::clone(&probe);
            async move {
                match synthesize_turn(synthesizer, probe, turn_index, &text, &voice, output).await {
                    Ok(clip) => Some(clip),
                    Err(error) => {
                        tracing::warn!(
                            turn = turn_index,
                            voice = %voice,
                            backend = synthesizer.name(),
                            error = %error,
                            "speech synthesis failed; turn will use the default hold"
                        );
                        None
                    }
                }
            }
        })
        .buffered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

    let failed = clips.iter().filter(|clip| clip.is_none()).count();
    tracing::info!(turns = clips.len(), failed, "speech synthesis finished");
    Ok(clips)
}

async fn synthesize_turn(
    synthesizer: &dyn SpeechSynthesizer,
    probe: Arc<dyn DurationProbe>,
    turn_index: usize,
    text: &str,
    voice: &str,
    output: PathBuf,
) -> PipelineResult<AudioClip> {
    let failure = |message: String| PipelineError::Synthesis {
        turn: turn_index,
        message,
    };

    synthesizer
        .synthesize(text, voice, &output)
        .await
        .map_err(|error| failure(format!("{error:#}")))?;

    let probed = output.clone();
    let duration = tokio::task::spawn_blocking(move || probe.duration(&probed))
        .await
        .map_err(|error| failure(format!("duration probe panicked: {error}")))?
        .map_err(|error| failure(format!("{error:#}")))?;

    tracing::debug!(turn = turn_index, voice, duration, "voice clip ready");
    Ok(AudioClip::voice(output, duration))
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect::<String>().trim().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpeechSettings;
    use crate::conversation::ConversationTurn;
    use std::sync::Mutex;

    /// Writes the text as the "audio" and records which voice was asked for.
    struct ScriptedSpeech {
        fail_on: Option<&'static str>,
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl SpeechSynthesizer for ScriptedSpeech {
        async fn synthesize(&self, text: &str, voice: &str, output: &Path) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((text.to_owned(), voice.to_owned()));
            if Some(text) == self.fail_on {
                bail!("quota exceeded");
            }
            tokio::fs::write(output, text).await?;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    /// Duration is a tenth of a second per byte of the file.
    struct ByteLengthProbe;

    impl DurationProbe for ByteLengthProbe {
        fn duration(&self, path: &Path) -> Result<f64> {
            Ok(std::fs::metadata(path)?.len() as f64 / 10.0)
        }
    }

    fn conversation() -> Conversation {
        Conversation::new(vec![
            ConversationTurn::new("You", "Hi"),
            ConversationTurn::new("Alice", "Hey there"),
            ConversationTurn::new("You", "What's up?"),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn clips_come_back_in_turn_order_with_side_voices() {
        let dir = tempfile::tempdir().unwrap();
        let speech = ScriptedSpeech {
            fail_on: None,
            calls: Mutex::new(Vec::new()),
        };
        let voices = VoiceSelection::from_genders("male", "female", &SpeechSettings::default());

        let clips = synthesize_all(
            &conversation(),
            &voices,
            "You",
            &speech,
            Arc::new(ByteLengthProbe),
            dir.path(),
            3,
        )
        .await
        .unwrap();

        assert_eq!(clips.len(), 3);
        let clips = clips.into_iter().map(Option::unwrap).collect::<Vec<_>>();
        assert_eq!(clips[0].source, dir.path().join("line_000.mp3"));
        assert!((clips[1].duration - 0.9).abs() < 1e-9);
        assert!((clips[2].duration - 1.0).abs() < 1e-9);

        let mut calls = speech.calls.lock().unwrap().clone();
        calls.sort();
        assert!(calls.contains(&("Hi".to_owned(), "ash".to_owned())));
        assert!(calls.contains(&("Hey there".to_owned(), "sage".to_owned())));
    }

    #[tokio::test]
    async fn failed_turn_leaves_an_empty_slot() {
        let dir = tempfile::tempdir().unwrap();
        let speech = ScriptedSpeech {
            fail_on: Some("Hey there"),
            calls: Mutex::new(Vec::new()),
        };
        let clips = synthesize_all(
            &conversation(),
            &VoiceSelection::defaults(&SpeechSettings::default()),
            "You",
            &speech,
            Arc::new(ByteLengthProbe),
            dir.path(),
            1,
        )
        .await
        .unwrap();

        assert!(clips[0].is_some());
        assert!(clips[1].is_none());
        assert!(clips[2].is_some());
    }

    #[tokio::test]
    async fn probe_failure_is_a_per_turn_failure() {
        struct Unreadable;
        impl DurationProbe for Unreadable {
            fn duration(&self, path: &Path) -> Result<f64> {
                bail!("cannot decode {}", path.display())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let speech = ScriptedSpeech {
            fail_on: None,
            calls: Mutex::new(Vec::new()),
        };
        let clips = synthesize_all(
            &conversation(),
            &VoiceSelection::defaults(&SpeechSettings::default()),
            "You",
            &speech,
            Arc::new(Unreadable),
            dir.path(),
            2,
        )
        .await
        .unwrap();
        assert!(clips.iter().all(Option::is_none));
    }

    #[test]
    fn clip_paths_are_zero_padded() {
        assert_eq!(
            clip_path(Path::new("/w/audio"), 7),
            PathBuf::from("/w/audio/line_007.mp3")
        );
    }
}
