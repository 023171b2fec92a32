use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use cbag_core::domain::message::{Message, ToolCall};

/// Function declaration advertised to the model.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("model client is not configured: {0}")]
    Configuration(String),
    #[error("network error talking to the model: {0}")]
    Network(String),
    #[error("model rate limit exceeded")]
    RateLimited,
    #[error("model API returned HTTP {status}: {body}")]
    Api { status: u16, body: String },
    #[error("could not parse model response: {0}")]
    Parse(String),
    #[error("model returned no candidates: {0}")]
    NoCandidates(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::RateLimited => true,
            Self::Api { status, .. } => *status >= 500,
            Self::Configuration(_) | Self::Parse(_) | Self::NoCandidates(_) => false,
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<LlmResponse, LlmError>;
}
