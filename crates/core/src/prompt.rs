//! System prompt and per-invocation date context for the CBAM assistant.
//!
//! The system prompt is stored once at the head of a session. The date context
//! is rebuilt for every model call and never written back to the history, so a
//! long-lived session always reasons against today's date.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use thiserror::Error;

use crate::domain::message::Message;

const BUILTIN_PROMPT: &str = include_str!("../prompts/cbam_system.md");

pub fn builtin_system_prompt() -> &'static str {
    BUILTIN_PROMPT.trim_end()
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("could not read system prompt `{path}`: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("system prompt `{0}` is empty")]
    Empty(PathBuf),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemPrompt(Arc<str>);

impl Default for SystemPrompt {
    fn default() -> Self {
        Self(Arc::from(builtin_system_prompt()))
    }
}

impl SystemPrompt {
    pub fn new(text: impl Into<String>) -> Self {
        Self(Arc::from(text.into()))
    }

    /// Loads the prompt override at `path`, or the built-in prompt when none is configured.
    pub fn load(path: Option<&Path>) -> Result<Self, PromptError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let raw = fs::read_to_string(path)
            .map_err(|source| PromptError::Read { path: path.to_path_buf(), source })?;
        let text = raw.trim();
        if text.is_empty() {
            return Err(PromptError::Empty(path.to_path_buf()));
        }

        Ok(Self::new(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_message(&self) -> Message {
        Message::system(self.as_str())
    }
}

pub fn format_prompt_date(date: NaiveDate) -> String {
    date.format("%B %d, %Y").to_string()
}

pub fn date_context(date: NaiveDate) -> Message {
    Message::system(format!(
        "CURRENT DATE: {}\n\nFor any deadline or timeline question, use this date to determine which deadlines have passed and which are upcoming.",
        format_prompt_date(date)
    ))
}
