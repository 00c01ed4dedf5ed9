//! Frame/audio timeline assembly.
//!
//! Merges per-turn reveal frames with per-turn speech durations into one
//! playback sequence at a fixed output frame rate, and places every audio
//! clip on a shared track so that each voice starts exactly on the first
//! frame of its turn's hold.

use std::path::PathBuf;

use serde::Serialize;

use crate::config::Settings;
use crate::error::{PipelineError, PipelineResult};
use crate::frames::FrameAsset;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioRole {
    Voice,
    Tick,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioClip {
    pub source: PathBuf,
    /// Seconds.
    pub duration: f64,
    pub role: AudioRole,
}

impl AudioClip {
    pub fn voice(source: impl Into<PathBuf>, duration: f64) -> Self {
        Self {
            source: source.into(),
            duration,
            role: AudioRole::Voice,
        }
    }

    pub fn tick(source: impl Into<PathBuf>, duration: f64) -> Self {
        Self {
            source: source.into(),
            duration,
            role: AudioRole::Tick,
        }
    }

    fn has_usable_duration(&self) -> bool {
        self.duration.is_finite() && self.duration > 0.0
    }
}

/// A clip placed on the shared audio track. `clip.duration` is the length
/// actually played, after any clamping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioTrackEntry {
    pub clip: AudioClip,
    pub start_offset: f64,
    pub gain: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimelineEntry {
    pub frame: FrameAsset,
    pub duration: f64,
}

/// Where one turn landed in the assembled timeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnSpan {
    pub turn_index: usize,
    pub first_entry: usize,
    pub reveal_entries: usize,
    pub hold_entries: usize,
    pub start: f64,
    pub hold_start: f64,
    pub end: f64,
    pub voiced: bool,
}

impl TurnSpan {
    pub fn entry_count(&self) -> usize {
        self.reveal_entries + self.hold_entries
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timeline {
    pub fps: u32,
    pub entries: Vec<TimelineEntry>,
    pub audio: Vec<AudioTrackEntry>,
    pub turns: Vec<TurnSpan>,
    /// Unquantized length of the audio track: every turn's reveal, hold and
    /// pause added up. A hold stretched to its one-frame minimum counts the
    /// extra time as pause.
    pub audio_length: f64,
}

impl Timeline {
    pub fn total_duration(&self) -> f64 {
        self.entries.iter().map(|entry| entry.duration).sum()
    }

    pub fn entries_for_turn(&self, position: usize) -> &[TimelineEntry] {
        let span = &self.turns[position];
        &self.entries[span.first_entry..span.first_entry + span.entry_count()]
    }

    pub fn frame_interval(&self) -> f64 {
        1.0 / f64::from(self.fps)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssemblyConfig {
    pub fps: u32,
    pub transition_frames: u32,
    pub reveal_frame_duration: f64,
    pub default_hold: f64,
    pub inter_turn_pause: f64,
    pub tick_gain: f32,
}

impl AssemblyConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            fps: settings.timeline.fps,
            transition_frames: settings.reveal.transition_frames,
            reveal_frame_duration: settings.reveal_frame_duration(),
            default_hold: settings.timeline.default_hold,
            inter_turn_pause: settings.timeline.inter_turn_pause,
            tick_gain: settings.timeline.tick_gain,
        }
    }

    fn validate(&self) -> PipelineResult<()> {
        if self.fps == 0 {
            return Err(PipelineError::Configuration("fps must be > 0".to_owned()));
        }
        if self.transition_frames == 0 {
            return Err(PipelineError::Configuration(
                "transition_frames must be > 0".to_owned(),
            ));
        }
        if !self.reveal_frame_duration.is_finite() || self.reveal_frame_duration <= 0.0 {
            return Err(PipelineError::Configuration(
                "reveal_frame_duration must be > 0".to_owned(),
            ));
        }
        if !self.default_hold.is_finite() || self.default_hold <= 0.0 {
            return Err(PipelineError::Configuration(
                "default_hold must be > 0".to_owned(),
            ));
        }
        if !self.inter_turn_pause.is_finite() || self.inter_turn_pause < 0.0 {
            return Err(PipelineError::Configuration(
                "inter_turn_pause must be >= 0".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Builds the playback timeline.
///
/// `groups[i]` are the reveal frames of turn `i` and `voices[i]` its speech
/// clip, `None` when synthesis failed. Hold lengths are rounded on the
/// running total so the video never drifts more than half a frame from the
/// audio, whatever the number of turns.
pub fn assemble(
    groups: &[Vec<FrameAsset>],
    voices: &[Option<AudioClip>],
    tick: Option<&AudioClip>,
    config: &AssemblyConfig,
) -> PipelineResult<Timeline> {
    config.validate()?;

    if groups.is_empty() && voices.is_empty() {
        return Err(PipelineError::NoContent(
            "no turns to assemble; refusing to build an empty timeline".to_owned(),
        ));
    }
    if groups.len() != voices.len() {
        return Err(PipelineError::Consistency(format!(
            "{} reveal groups but {} voice slots",
            groups.len(),
            voices.len()
        )));
    }

    let fps = f64::from(config.fps);
    let frame_interval = 1.0 / fps;
    let reveal_count = config.transition_frames as usize;
    let tick = tick.filter(|clip| clip.has_usable_duration());

    let mut entries = Vec::with_capacity(groups.len() * (reveal_count + config.fps as usize));
    let mut audio = Vec::with_capacity(groups.len() * 2);
    let mut turns = Vec::with_capacity(groups.len());

    let mut position = 0.0_f64;
    let mut hold_budget = 0.0_f64;
    let mut hold_frames_emitted = 0_u64;
    let mut audio_length = 0.0_f64;

    for (turn_index, (group, voice)) in groups.iter().zip(voices).enumerate() {
        let last = group.last().ok_or_else(|| {
            PipelineError::Consistency(format!("turn {turn_index} has no rendered frames"))
        })?;
        if let Some(stray) = group.iter().find(|asset| asset.turn_index != turn_index) {
            return Err(PipelineError::Consistency(format!(
                "reveal group {turn_index} contains a frame of turn {}",
                stray.turn_index
            )));
        }
        let settled = group
            .iter()
            .rev()
            .find(|asset| asset.is_final_for_turn)
            .unwrap_or(last);

        let voice = match voice {
            Some(clip) if clip.role != AudioRole::Voice => {
                return Err(PipelineError::Consistency(format!(
                    "turn {turn_index} voice slot holds a {:?} clip",
                    clip.role
                )));
            }
            Some(clip) if clip.has_usable_duration() => Some(clip),
            Some(clip) => {
                tracing::warn!(
                    turn = turn_index,
                    duration = clip.duration,
                    "voice clip has no usable duration; holding for the default"
                );
                None
            }
            None => None,
        };
        let hold_seconds = voice.map_or(config.default_hold, |clip| clip.duration);

        let first_entry = entries.len();
        let start = position;
        for step in 0..reveal_count {
            let frame = group[step.min(group.len() - 1)];
            entries.push(TimelineEntry {
                frame,
                duration: config.reveal_frame_duration,
            });
        }
        let hold_start = start + reveal_count as f64 * config.reveal_frame_duration;

        hold_budget += hold_seconds + config.inter_turn_pause;
        let target = (hold_budget * fps).round().max(0.0) as u64;
        let owed = target.saturating_sub(hold_frames_emitted);
        let hold_frames = owed.max(1);
        // A forced frame counts as extra pause so later holds stay aligned.
        let overshoot = (hold_frames - owed) as f64 * frame_interval;
        hold_budget += overshoot;
        hold_frames_emitted += hold_frames;
        for _ in 0..hold_frames {
            entries.push(TimelineEntry {
                frame: *settled,
                duration: frame_interval,
            });
        }
        position = hold_start + hold_frames as f64 * frame_interval;

        if let Some(clip) = voice {
            audio.push(AudioTrackEntry {
                clip: clip.clone(),
                start_offset: hold_start,
                gain: 1.0,
            });
        }
        if let Some(tick) = tick {
            let mut clip = tick.clone();
            clip.duration = clip.duration.min(hold_seconds);
            audio.push(AudioTrackEntry {
                clip,
                start_offset: hold_start,
                gain: config.tick_gain,
            });
        }

        audio_length += reveal_count as f64 * config.reveal_frame_duration
            + hold_seconds
            + config.inter_turn_pause
            + overshoot;

        turns.push(TurnSpan {
            turn_index,
            first_entry,
            reveal_entries: reveal_count,
            hold_entries: hold_frames as usize,
            start,
            hold_start,
            end: position,
            voiced: voice.is_some(),
        });
    }

    Ok(Timeline {
        fps: config.fps,
        entries,
        audio,
        turns,
        audio_length,
    })
}
