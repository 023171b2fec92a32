use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::commands::{block_on, CommandResult};

pub const DEFAULT_WEBHOOK_URL: &str = "http://127.0.0.1:8080/webhook";
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum AskError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook returned HTTP {status}: {detail}")]
    Status { status: u16, detail: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookAnswer {
    pub output: String,
    pub thread_id: String,
}

#[derive(Debug, Deserialize)]
struct RawAnswer {
    #[serde(default)]
    output: Value,
    #[serde(default)]
    thread_id: Option<String>,
}

pub fn http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()
}

/// Accepts a plain string or an array of `{ "text": .. }` parts.
pub fn parse_output(output: &Value) -> String {
    match output {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => "No output".to_string(),
        other => other.to_string(),
    }
}

pub async fn post_turn(
    client: &reqwest::Client,
    url: &str,
    question: &str,
    session_id: &str,
) -> Result<WebhookAnswer, AskError> {
    let response =
        client.post(url).json(&json!({ "input": question, "sessionId": session_id })).send().await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|value| value.get("detail").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(body);
        return Err(AskError::Status { status: status.as_u16(), detail });
    }

    let raw = response.json::<RawAnswer>().await?;
    Ok(WebhookAnswer {
        output: parse_output(&raw.output),
        thread_id: raw.thread_id.unwrap_or_else(|| session_id.to_string()),
    })
}

pub fn run(question: &str, url: &str, session: Option<String>) -> CommandResult {
    let session_id = session.unwrap_or_else(|| format!("cli-{}", Uuid::new_v4()));

    let result = match block_on("ask", async {
        let client = http_client()?;
        post_turn(&client, url, question, &session_id).await
    }) {
        Ok(result) => result,
        Err(failure) => return failure,
    };

    match result {
        Ok(answer) => CommandResult {
            exit_code: 0,
            output: format!("{}\n\n[session: {}]", answer.output, answer.thread_id),
        },
        Err(error @ AskError::Request(_)) => {
            CommandResult::failure("ask", "webhook_unreachable", error.to_string(), 4)
        }
        Err(error @ AskError::Status { .. }) => {
            CommandResult::failure("ask", "webhook_error", error.to_string(), 5)
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use super::{http_client, parse_output, post_turn, AskError};

    async fn spawn(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("address");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{address}/webhook")
    }

    #[test]
    fn output_accepts_string_or_text_parts() {
        assert_eq!(parse_output(&json!("plain answer")), "plain answer");
        assert_eq!(
            parse_output(&json!([{"type": "text", "text": "line one"}, {"image": "x"}, {"text": "line two"}])),
            "line one\nline two"
        );
        assert_eq!(parse_output(&Value::Null), "No output");
    }

    #[tokio::test]
    async fn post_turn_sends_input_and_session() {
        async fn handler(Json(body): Json<Value>) -> Json<Value> {
            Json(json!({
                "output": [{"text": format!("echo: {}", body["input"].as_str().unwrap_or_default())}],
                "thread_id": body["sessionId"],
            }))
        }
        let url = spawn(Router::new().route("/webhook", post(handler))).await;

        let answer = post_turn(&http_client().expect("client"), &url, "What is CBAM?", "cli-1")
            .await
            .expect("answer");

        assert_eq!(answer.output, "echo: What is CBAM?");
        assert_eq!(answer.thread_id, "cli-1");
    }

    #[tokio::test]
    async fn error_detail_is_surfaced() {
        async fn handler() -> (StatusCode, Json<Value>) {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"detail": "Please enter a CBAM question.", "correlation_id": "c"})),
            )
        }
        let url = spawn(Router::new().route("/webhook", post(handler))).await;

        let error =
            post_turn(&http_client().expect("client"), &url, " ", "cli-2").await.expect_err("400");

        match error {
            AskError::Status { status, detail } => {
                assert_eq!(status, 400);
                assert_eq!(detail, "Please enter a CBAM question.");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
