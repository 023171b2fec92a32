use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::OwnedMutexGuard;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use cbag_agent::{AgentRuntime, Conversation, GuardrailDecision, InputPolicy, TurnOutcome};
use cbag_core::domain::message::SessionId;
use cbag_core::errors::{ApplicationError, InterfaceError};
use cbag_core::prompt::SystemPrompt;
use cbag_db::SessionRepository;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<dyn SessionRepository>,
    pub runtime: Arc<AgentRuntime>,
    pub system_prompt: SystemPrompt,
    pub input_policy: InputPolicy,
    locks: Arc<SessionLocks>,
}

impl AppState {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        runtime: Arc<AgentRuntime>,
        system_prompt: SystemPrompt,
        input_policy: InputPolicy,
    ) -> Self {
        Self { sessions, runtime, system_prompt, input_policy, locks: Arc::default() }
    }
}

/// One async mutex per session with a turn in flight.
///
/// Entries are dropped again once no turn holds or waits on them.
#[derive(Default)]
struct SessionLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    async fn acquire(self: &Arc<Self>, id: &SessionId) -> SessionTurnGuard {
        let lock = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.entry(id.as_str().to_string()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        SessionTurnGuard { key: id.as_str().to_string(), locks: Arc::clone(self), guard: Some(guard) }
    }

    fn release(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            inner.remove(key);
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct SessionTurnGuard {
    key: String,
    locks: Arc<SessionLocks>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionTurnGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.release(&self.key);
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct WebhookRequest {
    #[serde(default)]
    pub input: String,
    #[serde(default, rename = "sessionId")]
    pub session_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WebhookResponse {
    pub output: String,
    pub thread_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub detail: String,
    pub correlation_id: String,
}

#[derive(Debug)]
pub struct WebhookError(pub InterfaceError);

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            detail: self.0.message().to_string(),
            correlation_id: self.0.correlation_id().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    // CorsLayer answers every OPTIONS request itself, so it only wraps POST.
    Router::new()
        .route("/webhook", post(webhook).layer(cors).options(preflight))
        .with_state(state)
}

pub async fn preflight() -> impl IntoResponse {
    (
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_METHODS, "*"),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, "*"),
        ],
        Json(json!({})),
    )
}

/// The body is read as JSON whatever the `Content-Type` header says.
fn parse_request(body: &[u8], correlation_id: &str) -> Result<WebhookRequest, WebhookError> {
    serde_json::from_slice(body).map_err(|error| {
        warn!(
            event_name = "server.webhook.rejected",
            correlation_id = %correlation_id,
            reason_code = "invalid_payload",
            error = %error,
            "webhook payload rejected"
        );
        WebhookError(InterfaceError::BadRequest {
            message: format!("invalid webhook payload: {error}"),
            correlation_id: correlation_id.to_string(),
        })
    })
}

pub async fn webhook(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<WebhookResponse>, WebhookError> {
    let correlation_id = Uuid::new_v4().to_string();
    let request = parse_request(&body, &correlation_id)?;
    let session_id = SessionId::from_optional(request.session_id.as_deref());

    if let GuardrailDecision::Deny { reason_code, error } = state.input_policy.evaluate(&request.input)
    {
        warn!(
            event_name = "server.webhook.rejected",
            correlation_id = %correlation_id,
            session_id = %session_id,
            reason_code,
            "webhook input rejected"
        );
        return Err(WebhookError(ApplicationError::from(error).into_interface(correlation_id)));
    }

    let started = Instant::now();
    let _turn = state.locks.acquire(&session_id).await;

    match run_turn(&state, &session_id, &request.input).await {
        Ok((outcome, reply)) => {
            info!(
                event_name = "server.webhook.completed",
                correlation_id = %correlation_id,
                session_id = %session_id,
                model_calls = outcome.model_calls,
                tool_rounds = outcome.tool_rounds,
                input_tokens = outcome.usage.input_tokens,
                output_tokens = outcome.usage.output_tokens,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "webhook turn completed"
            );
            Ok(Json(WebhookResponse { output: reply, thread_id: session_id.to_string() }))
        }
        Err(failure) => {
            error!(
                event_name = "server.webhook.failed",
                correlation_id = %correlation_id,
                session_id = %session_id,
                error = %failure,
                "webhook turn failed"
            );
            Err(WebhookError(failure.into_interface(correlation_id)))
        }
    }
}

/// History is written back only after the whole turn succeeded.
async fn run_turn(
    state: &AppState,
    session_id: &SessionId,
    input: &str,
) -> Result<(TurnOutcome, String), ApplicationError> {
    let stored = state.sessions.load(session_id).await?;
    let mut conversation = Conversation::resume(stored);
    conversation.begin_turn(&state.system_prompt, input);

    let outcome = state.runtime.run_turn(conversation.messages_mut()).await?;
    let reply = conversation
        .last_reply()
        .map(str::to_string)
        .ok_or_else(|| ApplicationError::Integration("turn ended without an answer".to_string()))?;

    state.sessions.save(session_id, conversation.messages()).await?;
    Ok((outcome, reply))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use cbag_agent::testing::ScriptedLlmClient;
    use cbag_agent::{AgentRuntime, InputPolicy, LlmError, LlmResponse, ToolRegistry};
    use cbag_core::domain::message::{Message, Role, SessionId};
    use cbag_core::prompt::SystemPrompt;
    use cbag_db::{InMemorySessionRepository, RepositoryError, SessionRepository};

    use super::{router, AppState};

    fn state_with(
        sessions: Arc<dyn SessionRepository>,
        llm: Arc<ScriptedLlmClient>,
    ) -> AppState {
        AppState::new(
            sessions,
            Arc::new(AgentRuntime::new(llm, ToolRegistry::default())),
            SystemPrompt::new("You are a CBAM expert."),
            InputPolicy::new(200),
        )
    }

    async fn post(app: Router, body: Value) -> (StatusCode, Value) {
        post_raw(app, Some("application/json"), body.to_string()).await
    }

    async fn post_raw(app: Router, content_type: Option<&str>, body: String) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(Method::POST).uri("/webhook");
        if let Some(content_type) = content_type {
            builder = builder.header("content-type", content_type);
        }
        let request = builder.body(Body::from(body)).expect("request");
        let response = app.oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, serde_json::from_slice(&bytes).expect("json body"))
    }

    #[tokio::test]
    async fn first_turn_answers_and_stores_history() {
        let sessions = Arc::new(InMemorySessionRepository::default());
        let llm = Arc::new(ScriptedLlmClient::new().reply("CBAM applies from 2026."));
        let app = router(state_with(sessions.clone(), llm));

        let (status, body) =
            post(app, json!({"input": "When does CBAM apply?", "sessionId": "client-1"})).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"output": "CBAM applies from 2026.", "thread_id": "client-1"}));

        let stored = sessions
            .load(&SessionId("client-1".to_string()))
            .await
            .expect("load")
            .expect("history saved");
        let roles: Vec<Role> = stored.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn missing_session_id_uses_default_thread() {
        let sessions = Arc::new(InMemorySessionRepository::default());
        let llm = Arc::new(ScriptedLlmClient::new().reply("ok"));
        let app = router(state_with(sessions, llm));

        let (status, body) = post(app, json!({"input": "hi"})).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["thread_id"], "default");
    }

    #[tokio::test]
    async fn follow_up_turn_sees_history_without_second_system_prompt() {
        let sessions = Arc::new(InMemorySessionRepository::default());
        let llm = Arc::new(ScriptedLlmClient::new().reply("first").reply("second"));
        let state = state_with(sessions.clone(), llm.clone());

        post(router(state.clone()), json!({"input": "q1", "sessionId": "s"})).await;
        let (status, body) = post(router(state), json!({"input": "q2", "sessionId": "s"})).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["output"], "second");

        let second_request = &llm.requests()[1];
        let contents: Vec<&str> = second_request.iter().map(|m| m.content.as_str()).collect();
        assert!(contents[0].starts_with("CURRENT DATE: "));
        assert_eq!(&contents[1..], &["You are a CBAM expert.", "q1", "first", "q2"]);

        let stored = sessions.load(&SessionId("s".to_string())).await.expect("load").expect("saved");
        assert_eq!(stored.iter().filter(|m| m.role == Role::System).count(), 1);
        assert_eq!(stored.len(), 5);
    }

    #[tokio::test]
    async fn blank_input_is_rejected_before_the_model_runs() {
        let sessions = Arc::new(InMemorySessionRepository::default());
        let llm = Arc::new(ScriptedLlmClient::new());
        let app = router(state_with(sessions.clone(), llm.clone()));

        let (status, body) = post(app, json!({"input": "   ", "sessionId": "s"})).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "Please enter a CBAM question.");
        assert!(!body["correlation_id"].as_str().unwrap_or_default().is_empty());
        assert!(llm.requests().is_empty());
        assert!(sessions.is_empty().await);
    }

    #[tokio::test]
    async fn malformed_payloads_get_the_error_body() {
        let sessions = Arc::new(InMemorySessionRepository::default());
        let llm = Arc::new(ScriptedLlmClient::new());
        let state = state_with(sessions.clone(), llm.clone());

        let (status, body) =
            post_raw(router(state.clone()), Some("application/json"), "{not json".to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap_or_default().starts_with("invalid webhook payload"));
        assert!(!body["correlation_id"].as_str().unwrap_or_default().is_empty());

        let (status, body) = post(router(state), json!({"input": 5})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap_or_default().contains("invalid type"));

        assert!(llm.requests().is_empty());
        assert!(sessions.is_empty().await);
    }

    #[tokio::test]
    async fn body_without_content_type_is_still_read_as_json() {
        let sessions = Arc::new(InMemorySessionRepository::default());
        let llm = Arc::new(ScriptedLlmClient::new().reply("Quarterly reports."));
        let app = router(state_with(sessions, llm));

        let body = json!({"input": "How often do I report?", "sessionId": "plain"}).to_string();
        let (status, body) = post_raw(app, None, body).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"output": "Quarterly reports.", "thread_id": "plain"}));
    }

    #[tokio::test]
    async fn oversize_input_is_rejected_with_lengths() {
        let sessions = Arc::new(InMemorySessionRepository::default());
        let llm = Arc::new(ScriptedLlmClient::new());
        let app = router(state_with(sessions.clone(), llm.clone()));

        let (status, body) = post(app, json!({"input": "x".repeat(201), "sessionId": "s"})).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body["detail"],
            "Your message is too long (201 characters). Please keep it under 200 characters."
        );
        assert!(llm.requests().is_empty());
        assert!(sessions.is_empty().await);
    }

    #[tokio::test]
    async fn tool_round_limit_returns_500_and_persists_nothing() {
        let sessions = Arc::new(InMemorySessionRepository::default());
        let llm = Arc::new(
            ScriptedLlmClient::new()
                .call_tool("c1", "retrieve_cbam_info", json!({"query": "steel"}))
                .call_tool("c2", "retrieve_cbam_info", json!({"query": "steel"})),
        );
        let state = AppState::new(
            sessions.clone(),
            Arc::new(AgentRuntime::new(llm, ToolRegistry::default()).with_max_tool_rounds(1)),
            SystemPrompt::new("You are a CBAM expert."),
            InputPolicy::new(200),
        );

        let (status, body) = post(router(state), json!({"input": "steel?", "sessionId": "s"})).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["detail"].as_str().unwrap_or_default().contains("after 1 rounds"));
        assert!(!body["correlation_id"].as_str().unwrap_or_default().is_empty());
        assert!(sessions.is_empty().await);
    }

    #[tokio::test]
    async fn empty_model_answer_returns_500_and_keeps_history_clean() {
        let sessions = Arc::new(InMemorySessionRepository::default());
        let llm = Arc::new(
            ScriptedLlmClient::new()
                .push(Ok(LlmResponse {
                    finish_reason: Some("SAFETY".to_string()),
                    ..LlmResponse::default()
                }))
                .reply("A carbon border levy."),
        );
        let state = state_with(sessions.clone(), llm.clone());

        let (status, body) = post(router(state.clone()), json!({"input": "q1", "sessionId": "s"})).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["detail"].as_str().unwrap_or_default().contains("SAFETY"));
        assert_eq!(sessions.load(&SessionId("s".to_string())).await.expect("load"), None);

        let (status, _) = post(router(state), json!({"input": "What is CBAM?", "sessionId": "s"})).await;
        assert_eq!(status, StatusCode::OK);
        let roles: Vec<Role> = llm.requests()[1].iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::System, Role::User]);
    }

    #[tokio::test]
    async fn model_failure_returns_500_and_persists_nothing() {
        let sessions = Arc::new(InMemorySessionRepository::default());
        let llm = Arc::new(
            ScriptedLlmClient::new().fail(LlmError::Api { status: 400, body: "bad".to_string() }),
        );
        let app = router(state_with(sessions.clone(), llm));

        let (status, body) = post(app, json!({"input": "q", "sessionId": "s"})).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["detail"].as_str().unwrap_or_default().contains("HTTP 400"));
        assert_eq!(sessions.load(&SessionId("s".to_string())).await.expect("load"), None);
    }

    struct UnavailableStore;

    #[async_trait]
    impl SessionRepository for UnavailableStore {
        async fn load(&self, _id: &SessionId) -> Result<Option<Vec<Message>>, RepositoryError> {
            Err(RepositoryError::Database(sqlx::Error::PoolClosed))
        }

        async fn save(&self, _id: &SessionId, _messages: &[Message]) -> Result<(), RepositoryError> {
            Err(RepositoryError::Database(sqlx::Error::PoolClosed))
        }

        async fn delete(&self, _id: &SessionId) -> Result<bool, RepositoryError> {
            Err(RepositoryError::Database(sqlx::Error::PoolClosed))
        }

        async fn health(&self) -> Result<(), RepositoryError> {
            Err(RepositoryError::Database(sqlx::Error::PoolClosed))
        }

        fn backend(&self) -> &'static str {
            "unavailable"
        }
    }

    #[tokio::test]
    async fn store_failure_returns_503() {
        let llm = Arc::new(ScriptedLlmClient::new().reply("never sent"));
        let app = router(state_with(Arc::new(UnavailableStore), llm.clone()));

        let (status, body) = post(app, json!({"input": "q"})).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["detail"].as_str().unwrap_or_default().contains("database error"));
        assert!(llm.requests().is_empty());
    }

    #[tokio::test]
    async fn options_returns_empty_object() {
        let sessions = Arc::new(InMemorySessionRepository::default());
        let app = router(state_with(sessions, Arc::new(ScriptedLlmClient::new())));

        let request =
            Request::builder().method(Method::OPTIONS).uri("/webhook").body(Body::empty()).expect("request");
        let response = app.oneshot(request).await.expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("access-control-allow-origin").and_then(|v| v.to_str().ok()),
            Some("*")
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        assert_eq!(&bytes[..], b"{}");
    }

    #[tokio::test]
    async fn cors_allows_any_origin() {
        let sessions = Arc::new(InMemorySessionRepository::default());
        let app = router(state_with(sessions, Arc::new(ScriptedLlmClient::new().reply("ok"))));

        let request = Request::builder()
            .method(Method::POST)
            .uri("/webhook")
            .header("origin", "https://cbam.example")
            .header("content-type", "application/json")
            .body(Body::from(json!({"input": "hi"}).to_string()))
            .expect("request");
        let response = app.oneshot(request).await.expect("response");

        assert_eq!(
            response.headers().get("access-control-allow-origin").and_then(|v| v.to_str().ok()),
            Some("*")
        );
        assert!(response.headers().get("access-control-allow-credentials").is_none());
    }

    #[tokio::test]
    async fn concurrent_turns_on_one_session_are_serialized() {
        let sessions = Arc::new(InMemorySessionRepository::default());
        let llm = Arc::new(ScriptedLlmClient::new().reply("a").reply("b"));
        let state = state_with(sessions.clone(), llm);

        let (first, second) = tokio::join!(
            post(router(state.clone()), json!({"input": "one", "sessionId": "shared"})),
            post(router(state.clone()), json!({"input": "two", "sessionId": "shared"})),
        );

        assert_eq!(first.0, StatusCode::OK);
        assert_eq!(second.0, StatusCode::OK);

        let stored =
            sessions.load(&SessionId("shared".to_string())).await.expect("load").expect("saved");
        let roles: Vec<Role> = stored.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
        assert_eq!(state.locks.tracked(), 0);
    }
}
