use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub const CONFIGURATION_ERROR: &str = "CONFIGURATION_ERROR";
pub const NO_CONTENT: &str = "NO_CONTENT";
pub const CONSISTENCY_ERROR: &str = "CONSISTENCY_ERROR";
pub const ENCODING_ERROR: &str = "ENCODING_ERROR";
pub const SYNTHESIS_ERROR: &str = "SYNTHESIS_ERROR";
pub const UPSTREAM_ERROR: &str = "UPSTREAM_ERROR";
pub const IO_ERROR: &str = "IO_ERROR";

/// Failures of the video pipeline.
///
/// Everything except [`PipelineError::Synthesis`] aborts the job. Synthesis
/// failures are per turn and are absorbed by the speech stage.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no content: {0}")]
    NoContent(String),

    #[error("consistency error: {0}")]
    Consistency(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("speech synthesis failed for turn {turn}: {message}")]
    Synthesis { turn: usize, message: String },

    #[error("upstream service error: {0}")]
    Upstream(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Flattens an anyhow chain so the job record shows every cause.
    pub fn configuration_chain(error: &anyhow::Error) -> Self {
        Self::Configuration(format!("{error:#}"))
    }

    pub fn encoding_chain(error: &anyhow::Error) -> Self {
        Self::Encoding(format!("{error:#}"))
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => CONFIGURATION_ERROR,
            Self::NoContent(_) => NO_CONTENT,
            Self::Consistency(_) => CONSISTENCY_ERROR,
            Self::Encoding(_) => ENCODING_ERROR,
            Self::Synthesis { .. } => SYNTHESIS_ERROR,
            Self::Upstream(_) => UPSTREAM_ERROR,
            Self::Io(_) => IO_ERROR,
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope::new(self.code(), self.to_string(), None)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub ok: bool,
    pub error: ErrorEnvelopeBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelopeBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorEnvelope {
    pub fn new(code: &str, message: impl Into<String>, details: Option<Value>) -> Self {
        Self {
            ok: false,
            error: ErrorEnvelopeBody {
                code: code.to_owned(),
                message: message.into(),
                details,
            },
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
