//! Test doubles shared by this crate's tests and downstream crates (behind the
//! `test-support` feature).

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use cbag_core::domain::message::{Message, ToolCall};

use crate::llm::{LlmClient, LlmError, LlmResponse, TokenUsage, ToolDefinition};

/// Replays queued responses in order and records every request it receives.
#[derive(Default)]
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, text: &str) -> Self {
        self.push(Ok(LlmResponse {
            content: text.to_string(),
            tool_calls: Vec::new(),
            usage: TokenUsage { input_tokens: 10, output_tokens: 5 },
            finish_reason: Some("STOP".to_string()),
        }))
    }

    pub fn call_tool(self, id: &str, name: &str, arguments: Value) -> Self {
        self.push(Ok(LlmResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
                thought_signature: None,
            }],
            usage: TokenUsage { input_tokens: 10, output_tokens: 1 },
            finish_reason: Some("STOP".to_string()),
        }))
    }

    pub fn fail(self, error: LlmError) -> Self {
        self.push(Err(error))
    }

    pub fn push(self, response: Result<LlmResponse, LlmError>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(response);
        }
        self
    }

    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().map(|requests| requests.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<LlmResponse, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(messages.to_vec());
        }

        let next = self.script.lock().ok().and_then(|mut script| script.pop_front());
        next.unwrap_or_else(|| Err(LlmError::Parse("scripted client ran out of responses".into())))
    }
}

/// Serves `router` on an ephemeral local port and returns its base URL.
#[cfg(test)]
pub(crate) async fn spawn_stub(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
    let address = listener.local_addr().expect("stub address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{address}")
}
