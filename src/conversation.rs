use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::SpeechSettings;
use crate::error::PipelineError;

pub const MAX_TURN_CHARS: usize = 2_000;

/// One message of the simulated conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub sender: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "time")]
    pub timestamp: Option<String>,
}

impl ConversationTurn {
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            text: text.into(),
            timestamp: None,
        }
    }
}

/// Which side of the chat a sender sits on. Drives bubble color, alignment
/// and voice choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Own,
    Other,
}

impl Side {
    pub fn of(sender: &str, self_sender: &str) -> Self {
        if sender.trim().eq_ignore_ascii_case(self_sender.trim()) {
            Side::Own
        } else {
            Side::Other
        }
    }
}

/// A validated, ordered conversation. Construction is the only place turns
/// are checked, so everything downstream can assume well-formed input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    turns: Vec<ConversationTurn>,
}

impl Conversation {
    pub fn new(turns: Vec<ConversationTurn>) -> Result<Self, PipelineError> {
        let mut cleaned = Vec::with_capacity(turns.len());
        for (index, turn) in turns.into_iter().enumerate() {
            cleaned.push(validate_turn(index, turn)?);
        }
        Ok(Self { turns: cleaned })
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Fails with a "no content" error when there is nothing to render.
    pub fn require_content(&self) -> Result<(), PipelineError> {
        if self.turns.is_empty() {
            return Err(PipelineError::NoContent(
                "conversation has no turns; refusing to encode an empty video".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read conversation {}", path.display()))?;
        let turns: Vec<ConversationTurn> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse conversation json {}", path.display()))?;
        Ok(Self::new(turns)?)
    }
}

fn validate_turn(index: usize, turn: ConversationTurn) -> Result<ConversationTurn, PipelineError> {
    let sender = turn.sender.trim().to_owned();
    if sender.is_empty() {
        return Err(PipelineError::Configuration(format!(
            "turn {index} has an empty sender"
        )));
    }
    let text = turn.text.trim().to_owned();
    if text.is_empty() {
        return Err(PipelineError::Configuration(format!(
            "turn {index} ({sender}) has empty text"
        )));
    }
    if text.chars().count() > MAX_TURN_CHARS {
        return Err(PipelineError::Configuration(format!(
            "turn {index} ({sender}) exceeds {MAX_TURN_CHARS} characters"
        )));
    }
    if text.chars().any(|ch| ch.is_control() && ch != '\n') {
        return Err(PipelineError::Configuration(format!(
            "turn {index} ({sender}) contains control characters"
        )));
    }
    Ok(ConversationTurn {
        sender,
        text,
        timestamp: turn.timestamp.filter(|value| !value.trim().is_empty()),
    })
}

/// Voices picked for the two sides of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceSelection {
    pub own: String,
    pub other: String,
}

impl VoiceSelection {
    /// Maps the participants' genders through the configured voice map,
    /// falling back to the default voice of each side.
    pub fn from_genders(your_gender: &str, contact_gender: &str, speech: &SpeechSettings) -> Self {
        let lookup = |gender: &str| {
            speech
                .voice_map
                .get(&gender.trim().to_ascii_lowercase())
                .cloned()
        };
        Self {
            own: lookup(your_gender).unwrap_or_else(|| speech.self_voice.clone()),
            other: lookup(contact_gender).unwrap_or_else(|| speech.other_voice.clone()),
        }
    }

    pub fn defaults(speech: &SpeechSettings) -> Self {
        Self {
            own: speech.self_voice.clone(),
            other: speech.other_voice.clone(),
        }
    }

    pub fn for_side(&self, side: Side) -> &str {
        match side {
            Side::Own => &self.own,
            Side::Other => &self.other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turns_are_trimmed_and_kept_in_order() {
        let convo = Conversation::new(vec![
            ConversationTurn::new(" You ", " Hi "),
            ConversationTurn::new("Alice", "Hey!"),
        ])
        .unwrap();
        assert_eq!(convo.len(), 2);
        assert_eq!(convo.turns()[0], ConversationTurn::new("You", "Hi"));
        assert_eq!(convo.turns()[1].sender, "Alice");
    }

    #[test]
    fn malformed_turns_are_rejected_with_their_index() {
        let error = Conversation::new(vec![
            ConversationTurn::new("You", "ok"),
            ConversationTurn::new("Alice", "   "),
        ])
        .unwrap_err();
        assert!(matches!(error, PipelineError::Configuration(_)));
        assert!(error.to_string().contains("turn 1"));

        let error = Conversation::new(vec![ConversationTurn::new("", "hello")]).unwrap_err();
        assert!(error.to_string().contains("empty sender"));
    }

    #[test]
    fn empty_conversation_has_no_content() {
        let convo = Conversation::new(Vec::new()).unwrap();
        assert!(matches!(
            convo.require_content(),
            Err(PipelineError::NoContent(_))
        ));
    }

    #[test]
    fn side_matching_ignores_case() {
        assert_eq!(Side::of("you", "You"), Side::Own);
        assert_eq!(Side::of("YOU ", "You"), Side::Own);
        assert_eq!(Side::of("Alice", "You"), Side::Other);
    }

    #[test]
    fn voices_follow_gender_map_with_side_defaults() {
        let speech = SpeechSettings::default();
        let voices = VoiceSelection::from_genders("Male", "female", &speech);
        assert_eq!(voices.own, "ash");
        assert_eq!(voices.other, "sage");

        let voices = VoiceSelection::from_genders("other", "", &speech);
        assert_eq!(voices.for_side(Side::Own), "nova");
        assert_eq!(voices.for_side(Side::Other), "fable");
    }

    #[test]
    fn timestamp_accepts_time_alias() {
        let turn: ConversationTurn =
            serde_json::from_str(r#"{"sender":"Alice","text":"Hey","time":"09:01 AM"}"#).unwrap();
        assert_eq!(turn.timestamp.as_deref(), Some("09:01 AM"));
    }
}
