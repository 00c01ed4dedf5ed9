//! Scripted-dialogue generation through a chat-completions service.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Local, TimeDelta};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::DialogueSettings;
use crate::conversation::{Conversation, ConversationTurn};
use crate::error::{PipelineError, PipelineResult};

pub const DEFAULT_STYLE: &str = "light and funny";
pub const DEFAULT_MESSAGE_COUNT: usize = 20;
pub const MAX_MESSAGE_COUNT: usize = 100;
const TIMESTAMP_FORMAT: &str = "%I:%M %p";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogueRequest {
    pub contact_name: String,
    pub self_name: String,
    pub messages: usize,
    pub style: String,
    pub topic: Option<String>,
}

#[async_trait]
pub trait DialogueSource: Send + Sync {
    async fn generate(&self, request: &DialogueRequest) -> PipelineResult<Conversation>;
}

pub struct OpenAiDialogue {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    temperature: f32,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeneratedTurn {
    sender: String,
    text: String,
}

impl OpenAiDialogue {
    pub fn new(settings: &DialogueSettings, api_key: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("chatreel/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()
            .context("failed to build dialogue http client")?;
        Ok(Self {
            http,
            endpoint: format!(
                "{}/chat/completions",
                settings.base_url.trim_end_matches('/')
            ),
            model: settings.model.clone(),
            temperature: settings.temperature,
            api_key: api_key.to_owned(),
        })
    }
}

#[async_trait]
impl DialogueSource for OpenAiDialogue {
    async fn generate(&self, request: &DialogueRequest) -> PipelineResult<Conversation> {
        let prompt = system_prompt(request);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "system",
                content: &prompt,
            }],
            temperature: self.temperature,
        };

        tracing::info!(
            model = %self.model,
            messages = request.messages,
            "requesting generated dialogue"
        );
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|error| PipelineError::Upstream(format!("dialogue request failed: {error}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::Upstream(format!(
                "dialogue service returned {status}: {}",
                text.chars().take(300).collect::<String>()
            )));
        }

        let reply: ChatResponse = response.json().await.map_err(|error| {
            PipelineError::Upstream(format!("unreadable dialogue response: {error}"))
        })?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| PipelineError::Upstream("dialogue response had no content".to_owned()))?;

        let turns = parse_turns(&content)?;
        Conversation::new(stamp_turns(turns, Local::now()))
    }
}

pub fn system_prompt(request: &DialogueRequest) -> String {
    let mut prompt = format!(
        "You are simulating a text message conversation between two people named {} and {}.\n\
         Write a back-and-forth chat with {} messages total.\n\
         Keep the tone {}.\n",
        request.contact_name, request.self_name, request.messages, request.style
    );
    if let Some(topic) = request.topic.as_deref().filter(|topic| !topic.trim().is_empty()) {
        prompt.push_str(&format!("The conversation should be about: {}\n", topic.trim()));
    }
    prompt.push_str(
        "Format it as a JSON list of objects like this:\n\
         [{\"sender\": \"Alice\", \"text\": \"Hey!\"}, ...]\n\
         Only return the JSON. Do not include explanations or markdown.",
    );
    prompt
}

fn fence_pattern() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)^\s*```[A-Za-z]*\s*(.*?)\s*```\s*$")
            .expect("code fence regex should compile")
    })
}

/// Parses the model's reply, tolerating a markdown code fence around it.
fn parse_turns(content: &str) -> PipelineResult<Vec<GeneratedTurn>> {
    let body = fence_pattern()
        .captures(content)
        .and_then(|captures| captures.get(1))
        .map_or(content.trim(), |inner| inner.as_str());
    let turns: Vec<GeneratedTurn> = serde_json::from_str(body).map_err(|error| {
        PipelineError::Upstream(format!("dialogue service did not return valid JSON: {error}"))
    })?;
    if turns.is_empty() {
        return Err(PipelineError::Upstream(
            "dialogue service returned no messages".to_owned(),
        ));
    }
    Ok(turns)
}

/// Timestamps one minute apart, the first a minute after `start`.
fn stamp_turns(turns: Vec<GeneratedTurn>, start: DateTime<Local>) -> Vec<ConversationTurn> {
    turns
        .into_iter()
        .enumerate()
        .map(|(index, turn)| {
            let at = start + TimeDelta::minutes(index as i64 + 1);
            ConversationTurn {
                sender: turn.sender,
                text: turn.text,
                timestamp: Some(at.format(TIMESTAMP_FORMAT).to_string()),
            }
        })
        .collect()
}
