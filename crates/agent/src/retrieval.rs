//! `retrieve_cbam_info`: forwards a question to the hosted CBAM knowledge-base
//! assistant and hands its answer back to the model.
//!
//! Every failure is reported as answer text so the model can explain the
//! outage instead of the whole turn failing.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{info, warn};

use cbag_core::config::RetrievalConfig;

use crate::tools::Tool;

pub const RETRIEVAL_TOOL_NAME: &str = "retrieve_cbam_info";

const NOT_CONFIGURED: &str = "Error: PINECONE_API_KEY not configured.";

pub struct RetrievalTool {
    http: reqwest::Client,
    api_key: Option<SecretString>,
    endpoint: String,
    api_version: String,
    model: String,
    include_highlights: bool,
}

impl RetrievalTool {
    pub fn from_config(config: &RetrievalConfig) -> Result<Self, reqwest::Error> {
        let http =
            reqwest::Client::builder().timeout(Duration::from_secs(config.timeout_secs)).build()?;

        Ok(Self {
            http,
            api_key: config.api_key.clone().filter(|key| !key.expose_secret().trim().is_empty()),
            endpoint: format!(
                "{}/assistant/chat/{}",
                config.base_url.trim_end_matches('/'),
                config.assistant
            ),
            api_version: config.api_version.clone(),
            model: config.model.clone(),
            include_highlights: config.include_highlights,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn query(&self, query: &str) -> String {
        let Some(api_key) = &self.api_key else {
            warn!(event_name = "agent.retrieval.unconfigured", "retrieval api key missing");
            return NOT_CONFIGURED.to_string();
        };

        match self.send(api_key, query).await {
            Ok(data) => {
                info!(
                    event_name = "agent.retrieval.answered",
                    query_chars = query.chars().count(),
                    "knowledge base answered"
                );
                extract_answer(&data)
            }
            Err(error) => {
                warn!(event_name = "agent.retrieval.failed", error = %error, "knowledge base query failed");
                format!("Error querying Pinecone: {error}")
            }
        }
    }

    async fn send(&self, api_key: &SecretString, query: &str) -> Result<Value, reqwest::Error> {
        let payload = json!({
            "messages": [{ "role": "user", "content": query }],
            "stream": false,
            "model": self.model,
            "include_highlights": self.include_highlights,
        });

        self.http
            .post(&self.endpoint)
            .header("Api-Key", api_key.expose_secret())
            .header("X-Pinecone-API-Version", &self.api_version)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await
    }
}

#[async_trait]
impl Tool for RetrievalTool {
    fn name(&self) -> &'static str {
        RETRIEVAL_TOOL_NAME
    }

    fn description(&self) -> &'static str {
        "Queries the Pinecone Assistant for information related to CBAM (Carbon Border Adjustment Mechanism). \
         Use this tool to get factual answers, legal text references, and official guidance."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The CBAM question to look up in the knowledge base"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, input: Value) -> Result<String> {
        let query = input["query"]
            .as_str()
            .map(str::trim)
            .filter(|query| !query.is_empty())
            .ok_or_else(|| anyhow!("missing required argument `query`"))?;
        Ok(self.query(query).await)
    }
}

/// Chat-completion shape first, then the assistant `message` shape, else the raw JSON.
///
/// A shape only counts when its `content` is a string.
pub fn extract_answer(data: &Value) -> String {
    let from_choices = data
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|first| first["message"]["content"].as_str());
    let from_message = data.get("message").and_then(|message| message["content"].as_str());

    from_choices.or(from_message).map(str::to_string).unwrap_or_else(|| data.to_string())
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use cbag_core::config::AppConfig;

    use super::{extract_answer, RetrievalTool};
    use crate::testing::spawn_stub;
    use crate::tools::Tool;

    fn tool_for(base_url: &str, api_key: Option<&str>) -> RetrievalTool {
        let mut config = AppConfig::default().retrieval;
        config.base_url = base_url.to_string();
        config.api_key = api_key.map(|key| key.to_string().into());
        RetrievalTool::from_config(&config).expect("tool")
    }

    #[test]
    fn extract_prefers_choices_then_message_then_raw() {
        let choices = json!({"choices": [{"message": {"content": "from choices"}}], "message": {"content": "ignored"}});
        assert_eq!(extract_answer(&choices), "from choices");

        let message = json!({"message": {"role": "assistant", "content": "from message"}});
        assert_eq!(extract_answer(&message), "from message");

        let empty_choices = json!({"choices": [], "message": {"content": "fallback"}});
        assert_eq!(extract_answer(&empty_choices), "fallback");

        let raw = json!({"answer": "unexpected"});
        assert_eq!(extract_answer(&raw), r#"{"answer":"unexpected"}"#);

        let choice_without_message = json!({"choices": [{"finish_reason": "stop"}]});
        assert_eq!(extract_answer(&choice_without_message), r#"{"choices":[{"finish_reason":"stop"}]}"#);

        let null_message = json!({"message": null});
        assert_eq!(extract_answer(&null_message), r#"{"message":null}"#);
    }

    #[test]
    fn endpoint_targets_named_assistant() {
        let tool = tool_for("https://prod-1-data.ke.pinecone.io/", Some("key"));
        assert_eq!(tool.endpoint(), "https://prod-1-data.ke.pinecone.io/assistant/chat/cbam");
    }

    #[tokio::test]
    async fn missing_key_is_reported_without_a_request() {
        let tool = tool_for("http://127.0.0.1:9", None);
        let output = tool.execute(json!({"query": "What is CBAM?"})).await.expect("output");
        assert_eq!(output, "Error: PINECONE_API_KEY not configured.");
    }

    #[tokio::test]
    async fn missing_query_argument_is_an_error() {
        let tool = tool_for("http://127.0.0.1:9", Some("key"));
        let error = tool.execute(json!({})).await.expect_err("query required");
        assert!(error.to_string().contains("query"));
    }

    #[tokio::test]
    async fn query_sends_assistant_chat_request() {
        async fn handler(headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
            let header = |name: &str| {
                headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or_default().to_string()
            };
            Json(json!({
                "message": {
                    "role": "assistant",
                    "content": format!(
                        "{}|{}|{}|{}|{}|{}",
                        header("api-key"),
                        header("x-pinecone-api-version"),
                        body["messages"][0]["content"].as_str().unwrap_or_default(),
                        body["model"].as_str().unwrap_or_default(),
                        body["stream"],
                        body["include_highlights"],
                    )
                }
            }))
        }

        let base_url =
            spawn_stub(Router::new().route("/assistant/chat/cbam", post(handler))).await;
        let tool = tool_for(&base_url, Some("pc-key"));

        let output = tool.query("Default values for cement?").await;
        assert_eq!(output, "pc-key|2025-01|Default values for cement?|gpt-4o|false|true");
    }

    #[tokio::test]
    async fn http_failure_becomes_error_text() {
        async fn handler() -> (StatusCode, &'static str) {
            (StatusCode::UNAUTHORIZED, "invalid key")
        }

        let base_url =
            spawn_stub(Router::new().route("/assistant/chat/cbam", post(handler))).await;
        let tool = tool_for(&base_url, Some("wrong"));

        let output = tool.query("anything").await;
        assert!(output.starts_with("Error querying Pinecone: "), "got {output}");
        assert!(output.contains("401"));
    }
}
