//! Scroll/reveal frame generation.
//!
//! Planning is separate from painting: [`plan_reveal`] makes every layout
//! decision (wrapping, stacking, window resets, slide offsets) without
//! touching a font, and [`render_reveal`] walks the plan through a
//! [`BubbleRenderer`] to produce pixels.

use anyhow::Result;
use image::RgbaImage;
use serde::Serialize;

use crate::config::{LayoutSettings, RevealSettings};
use crate::conversation::{Conversation, Side};
use crate::error::{PipelineError, PipelineResult};
use crate::frames::{FrameAsset, FrameStore};
use crate::layout::{BubbleMetrics, VisibleWindow, WindowSlot};

/// A bubble positioned on one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SceneBubble {
    pub turn_index: usize,
    pub side: Side,
    pub lines: Vec<String>,
    pub top: u32,
    pub height: u32,
}

/// Everything a renderer needs to paint one frame. Bubbles are ordered top
/// to bottom; the last one is the bubble sliding in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameScene {
    pub bubbles: Vec<SceneBubble>,
}

/// Paints a scene. Implementations must be pure: the same scene always
/// yields the same pixels.
pub trait BubbleRenderer {
    fn frame_size(&self) -> (u32, u32);
    fn render(&mut self, scene: &FrameScene) -> Result<RgbaImage>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RevealStep {
    /// 1-based step within the turn's reveal.
    pub step: u32,
    /// Pixels below the settled position.
    pub slide_offset: u32,
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnReveal {
    pub turn_index: usize,
    pub side: Side,
    pub metrics: BubbleMetrics,
    /// True when this turn did not fit and the window was cleared for it.
    pub reset: bool,
    /// Window after this turn was added; the last slot is this turn.
    pub window: Vec<WindowSlot>,
    pub steps: Vec<RevealStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevealPlan {
    pub turns: Vec<TurnReveal>,
}

/// Linear slide offset for step `step` of `steps`, truncated to whole pixels.
pub fn slide_offset(step: u32, steps: u32, max_offset: u32) -> u32 {
    if steps == 0 || step >= steps {
        return 0;
    }
    let remaining = u64::from(steps - step) * u64::from(max_offset);
    (remaining / u64::from(steps)) as u32
}

pub fn plan_reveal(
    conversation: &Conversation,
    layout: &LayoutSettings,
    reveal: &RevealSettings,
) -> RevealPlan {
    let mut window = VisibleWindow::new(layout);
    let mut turns = Vec::with_capacity(conversation.len());

    for (turn_index, turn) in conversation.turns().iter().enumerate() {
        let metrics = BubbleMetrics::measure(&turn.text, layout);
        let reset = window.push(turn_index, metrics.slot_height);
        let steps = (1..=reveal.transition_frames)
            .map(|step| RevealStep {
                step,
                slide_offset: slide_offset(step, reveal.transition_frames, reveal.slide_offset),
                is_final: step == reveal.transition_frames,
            })
            .collect();

        turns.push(TurnReveal {
            turn_index,
            side: Side::of(&turn.sender, &layout.self_sender),
            metrics,
            reset,
            window: window.slots().to_vec(),
            steps,
        });
    }

    RevealPlan { turns }
}

impl RevealPlan {
    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    pub fn frame_count(&self) -> usize {
        self.turns.iter().map(|turn| turn.steps.len()).sum()
    }

    /// Scene for one reveal step of turn `position`.
    pub fn scene(&self, position: usize, step: &RevealStep) -> FrameScene {
        let turn = &self.turns[position];
        let bubbles = turn
            .window
            .iter()
            .map(|slot| {
                let owner = &self.turns[slot.turn_index];
                let entering = slot.turn_index == turn.turn_index;
                SceneBubble {
                    turn_index: slot.turn_index,
                    side: owner.side,
                    lines: owner.metrics.lines.clone(),
                    top: if entering {
                        slot.top.saturating_add(step.slide_offset)
                    } else {
                        slot.top
                    },
                    height: owner.metrics.bubble_height,
                }
            })
            .collect();
        FrameScene { bubbles }
    }
}

/// Rendered reveal frames grouped by turn.
#[derive(Debug, Clone)]
pub struct RevealFrames {
    pub store: FrameStore,
    pub groups: Vec<Vec<FrameAsset>>,
}

pub fn render_reveal(
    plan: &RevealPlan,
    renderer: &mut dyn BubbleRenderer,
) -> PipelineResult<RevealFrames> {
    let (width, height) = renderer.frame_size();
    let mut store = FrameStore::new(width, height);
    let mut groups = Vec::with_capacity(plan.turn_count());

    for (position, turn) in plan.turns.iter().enumerate() {
        if turn.reset {
            tracing::debug!(turn = turn.turn_index, "viewport full, window reset");
        }
        let mut group = Vec::with_capacity(turn.steps.len());
        for step in &turn.steps {
            let scene = plan.scene(position, step);
            let image = renderer.render(&scene).map_err(|error| {
                PipelineError::Configuration(format!(
                    "failed to render turn {} step {}: {error:#}",
                    turn.turn_index, step.step
                ))
            })?;
            let asset = store
                .push(turn.turn_index, step.is_final, image)
                .map_err(|error| PipelineError::configuration_chain(&error))?;
            group.push(asset);
        }
        groups.push(group);
    }

    Ok(RevealFrames { store, groups })
}
