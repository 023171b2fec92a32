//! Gemini `generateContent` client with function calling.
//!
//! System messages are folded into `systemInstruction`, assistant turns are
//! sent as `model` content carrying `functionCall` parts, and runs of tool
//! results become a single `user` content of `functionResponse` parts.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, warn};

use cbag_core::config::LlmConfig;
use cbag_core::domain::message::{Message, Role, ToolCall};

use crate::llm::{LlmClient, LlmError, LlmResponse, TokenUsage, ToolDefinition};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(4);

pub struct GeminiClient {
    http: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    temperature: f32,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl GeminiClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.expose_secret().trim().is_empty())
            .ok_or_else(|| LlmError::Configuration("llm.api_key is not set".to_string()))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| LlmError::Configuration(error.to_string()))?;

        Ok(Self {
            http,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_retries: config.max_retries,
            retry_base_delay: Duration::from_millis(250),
        })
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_base_delay.saturating_mul(factor).min(MAX_RETRY_DELAY)
    }

    async fn send_once(&self, body: &Value) -> Result<LlmResponse, LlmError> {
        let response = self
            .http
            .post(self.endpoint())
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|error| LlmError::Network(error.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status: status.as_u16(), body });
        }

        let json: Value =
            response.json().await.map_err(|error| LlmError::Parse(error.to_string()))?;
        parse_response(&json)
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<LlmResponse, LlmError> {
        let body = build_request_body(messages, tools, self.temperature);
        let mut attempt = 0;

        loop {
            debug!(model = %self.model, attempt, message_count = messages.len(), "gemini request");
            match self.send_once(&body).await {
                Ok(response) => return Ok(response),
                Err(error) if error.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.retry_delay(attempt);
                    warn!(
                        event_name = "agent.llm.retry",
                        model = %self.model,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying model call"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

pub(crate) fn build_request_body(
    messages: &[Message],
    tools: &[ToolDefinition],
    temperature: f32,
) -> Value {
    let mut system_parts = Vec::new();
    let mut contents: Vec<Value> = Vec::new();
    let mut pending_responses: Vec<Value> = Vec::new();

    for message in messages {
        if message.role != Role::Tool && !pending_responses.is_empty() {
            contents.push(json!({ "role": "user", "parts": std::mem::take(&mut pending_responses) }));
        }

        match message.role {
            Role::System => system_parts.push(message.content.as_str()),
            Role::User => {
                contents.push(json!({ "role": "user", "parts": [{ "text": message.content }] }));
            }
            Role::Assistant => {
                let mut parts = Vec::new();
                if !message.content.is_empty() {
                    parts.push(json!({ "text": message.content }));
                }
                parts.extend(message.tool_calls.iter().map(function_call_part));
                if !parts.is_empty() {
                    contents.push(json!({ "role": "model", "parts": parts }));
                }
            }
            Role::Tool => pending_responses.push(json!({
                "functionResponse": {
                    "name": message.tool_name.as_deref().unwrap_or_default(),
                    "response": { "content": message.content },
                }
            })),
        }
    }

    if !pending_responses.is_empty() {
        contents.push(json!({ "role": "user", "parts": pending_responses }));
    }

    let mut body = json!({
        "contents": contents,
        "generationConfig": { "temperature": temperature },
    });

    if !system_parts.is_empty() {
        body["systemInstruction"] = json!({ "parts": [{ "text": system_parts.join("\n\n") }] });
    }

    if !tools.is_empty() {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                })
            })
            .collect();
        body["tools"] = json!([{ "functionDeclarations": declarations }]);
    }

    body
}

fn function_call_part(call: &ToolCall) -> Value {
    let mut part = json!({ "functionCall": { "name": call.name, "args": call.arguments } });
    if let Some(signature) = &call.thought_signature {
        part["thoughtSignature"] = Value::String(signature.clone());
    }
    part
}

pub(crate) fn parse_response(json: &Value) -> Result<LlmResponse, LlmError> {
    let candidates = json["candidates"].as_array().cloned().unwrap_or_default();
    let Some(first) = candidates.first() else {
        let reason = json["promptFeedback"]["blockReason"]
            .as_str()
            .map(|reason| format!("prompt blocked ({reason})"))
            .unwrap_or_else(|| "empty candidate list".to_string());
        return Err(LlmError::NoCandidates(reason));
    };

    let parts = first["content"]["parts"].as_array().cloned().unwrap_or_default();
    let mut content = String::new();
    let mut tool_calls = Vec::new();

    for part in &parts {
        if part["thought"].as_bool() == Some(true) {
            continue;
        }
        if let Some(text) = part["text"].as_str() {
            content.push_str(text);
        }
        if let Some(call) = part.get("functionCall") {
            let name = call["name"]
                .as_str()
                .filter(|name| !name.is_empty())
                .ok_or_else(|| LlmError::Parse("functionCall without a name".to_string()))?;
            tool_calls.push(ToolCall {
                id: call["id"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                name: name.to_string(),
                arguments: call.get("args").cloned().unwrap_or_else(|| json!({})),
                thought_signature: part["thoughtSignature"].as_str().map(str::to_string),
            });
        }
    }

    let usage = TokenUsage {
        input_tokens: json["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0),
        output_tokens: json["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0),
    };

    let finish_reason = first["finishReason"].as_str().map(str::to_string);

    Ok(LlmResponse { content, tool_calls, usage, finish_reason })
}
