use serde::Serialize;

use crate::config::LayoutSettings;

/// Greedy word wrap on character columns.
///
/// Runs of whitespace collapse to one space; explicit newlines start a new
/// line; words longer than `columns` are split into `columns`-sized chunks.
pub fn wrap_text(text: &str, columns: usize) -> Vec<String> {
    let columns = columns.max(1);
    let mut lines = Vec::new();

    for paragraph in text.split('\n') {
        let mut current = String::new();
        let mut current_len = 0usize;

        for word in paragraph.split_whitespace() {
            let mut chars = word.chars().collect::<Vec<_>>();

            while chars.len() > columns {
                if current_len > 0 {
                    lines.push(std::mem::take(&mut current));
                    current_len = 0;
                }
                let rest = chars.split_off(columns);
                lines.push(chars.into_iter().collect());
                chars = rest;
            }
            if chars.is_empty() {
                continue;
            }

            let word_len = chars.len();
            let needed = if current_len == 0 {
                word_len
            } else {
                current_len + 1 + word_len
            };
            if needed > columns {
                lines.push(std::mem::take(&mut current));
                current_len = 0;
            }
            if current_len > 0 {
                current.push(' ');
                current_len += 1;
            }
            current.extend(chars);
            current_len += word_len;
        }

        if current_len > 0 {
            lines.push(current);
        }
    }

    lines
}

/// Vertical metrics of one wrapped bubble.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BubbleMetrics {
    pub lines: Vec<String>,
    pub bubble_height: u32,
    /// Bubble height plus the gap below it: the space it takes in the stack.
    pub slot_height: u32,
}

impl BubbleMetrics {
    pub fn measure(text: &str, layout: &LayoutSettings) -> Self {
        let lines = wrap_text(text, layout.wrap_columns);
        let bubble_height = text_block_height(lines.len(), layout);
        Self {
            lines,
            bubble_height,
            slot_height: bubble_height + layout.bubble_gap,
        }
    }
}

pub fn line_advance(layout: &LayoutSettings) -> u32 {
    layout.font_size.round().max(1.0) as u32 + layout.line_spacing
}

fn text_block_height(line_count: usize, layout: &LayoutSettings) -> u32 {
    let line_count = u32::try_from(line_count).unwrap_or(u32::MAX);
    line_count
        .saturating_mul(line_advance(layout))
        .saturating_add(layout.bubble_padding)
}

/// First y coordinate available to bubbles.
pub fn content_top(layout: &LayoutSettings) -> u32 {
    layout.header_height + layout.padding
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowSlot {
    pub turn_index: usize,
    /// Settled top edge of the bubble.
    pub top: u32,
    pub slot_height: u32,
}

/// The turns currently stacked below the header.
///
/// Appending a turn that would run past the bottom of the viewport clears
/// the window first, so the new turn starts again at the top.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibleWindow {
    top: u32,
    viewport_height: u32,
    cursor: u32,
    slots: Vec<WindowSlot>,
}

impl VisibleWindow {
    pub fn new(layout: &LayoutSettings) -> Self {
        let top = content_top(layout);
        Self {
            top,
            viewport_height: layout.height,
            cursor: top,
            slots: Vec::new(),
        }
    }

    /// Adds a turn and returns true when the window had to be reset to make
    /// room for it.
    pub fn push(&mut self, turn_index: usize, slot_height: u32) -> bool {
        let reset =
            !self.slots.is_empty() && self.cursor.saturating_add(slot_height) > self.viewport_height;
        if reset {
            self.slots.clear();
            self.cursor = self.top;
        }

        self.slots.push(WindowSlot {
            turn_index,
            top: self.cursor,
            slot_height,
        });
        self.cursor = self.cursor.saturating_add(slot_height);
        reset
    }

    pub fn slots(&self) -> &[WindowSlot] {
        &self.slots
    }

    pub fn turn_indices(&self) -> Vec<usize> {
        self.slots.iter().map(|slot| slot.turn_index).collect()
    }

    /// Next free y coordinate.
    pub fn cursor(&self) -> u32 {
        self.cursor
    }
}
