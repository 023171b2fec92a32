use std::sync::Arc;
use std::time::Instant;

use chrono::{Local, NaiveDate};
use thiserror::Error;
use tracing::{debug, info};

use cbag_core::domain::message::Message;
use cbag_core::errors::ApplicationError;
use cbag_core::prompt::date_context;

use crate::llm::{LlmClient, LlmError, TokenUsage};
use crate::tools::ToolRegistry;

pub type Clock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("model call failed: {0}")]
    Llm(#[from] LlmError),
    #[error("model kept calling tools after {limit} rounds without answering")]
    ToolRoundLimit { limit: u32 },
    #[error("model returned an empty answer (finish reason: {finish_reason})")]
    EmptyReply { finish_reason: String },
}

impl From<AgentError> for ApplicationError {
    fn from(value: AgentError) -> Self {
        match value {
            AgentError::Llm(LlmError::Configuration(message)) => Self::Configuration(message),
            other => Self::Integration(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TurnOutcome {
    pub model_calls: u32,
    pub tool_rounds: u32,
    pub usage: TokenUsage,
}

/// Drives one turn: ask the model, run any tools it asked for, repeat until it answers.
pub struct AgentRuntime {
    llm: Arc<dyn LlmClient>,
    tools: ToolRegistry,
    max_tool_rounds: u32,
    clock: Clock,
}

impl AgentRuntime {
    pub fn new(llm: Arc<dyn LlmClient>, tools: ToolRegistry) -> Self {
        Self { llm, tools, max_tool_rounds: 8, clock: Arc::new(|| Local::now().date_naive()) }
    }

    pub fn with_max_tool_rounds(mut self, max_tool_rounds: u32) -> Self {
        self.max_tool_rounds = max_tool_rounds.max(1);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Appends the model's messages (and tool results) to `history`.
    ///
    /// On error `history` may hold a partial turn; callers are expected to
    /// discard it rather than persist it.
    pub async fn run_turn(&self, history: &mut Vec<Message>) -> Result<TurnOutcome, AgentError> {
        let definitions = self.tools.definitions();
        let mut usage = TokenUsage::default();
        let mut model_calls = 0;
        let mut tool_rounds = 0;

        loop {
            let mut request = Vec::with_capacity(history.len() + 1);
            request.push(date_context((self.clock)()));
            request.extend(history.iter().cloned());

            let response = self.llm.complete(&request, &definitions).await?;
            model_calls += 1;
            usage.add(response.usage);
            debug!(
                event_name = "agent.turn.model_response",
                model_calls,
                tool_calls = response.tool_calls.len(),
                "model responded"
            );

            if response.tool_calls.is_empty() {
                if response.content.trim().is_empty() {
                    return Err(AgentError::EmptyReply {
                        finish_reason: response.finish_reason.unwrap_or_else(|| "unknown".to_string()),
                    });
                }
                history.push(Message::assistant(response.content));
                return Ok(TurnOutcome { model_calls, tool_rounds, usage });
            }

            if tool_rounds >= self.max_tool_rounds {
                return Err(AgentError::ToolRoundLimit { limit: self.max_tool_rounds });
            }
            tool_rounds += 1;

            let calls = response.tool_calls.clone();
            history.push(Message::assistant_with_tools(response.content, response.tool_calls));

            for call in &calls {
                let started = Instant::now();
                let execution = self.tools.execute(call).await;
                info!(
                    event_name = "agent.tool.executed",
                    tool = %call.name,
                    tool_call_id = %call.id,
                    failed = execution.failed,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "tool call finished"
                );
                history.push(Message::tool_result(call, execution.output));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use serde_json::{json, Value};

    use cbag_core::domain::message::{Message, Role};
    use cbag_core::errors::ApplicationError;

    use super::{AgentError, AgentRuntime};
    use crate::llm::{LlmError, LlmResponse};
    use crate::testing::ScriptedLlmClient;
    use crate::tools::{Tool, ToolRegistry};

    struct FakeKnowledgeBase;

    #[async_trait]
    impl Tool for FakeKnowledgeBase {
        fn name(&self) -> &'static str {
            "retrieve_cbam_info"
        }

        fn description(&self) -> &'static str {
            "fake"
        }

        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(&self, input: Value) -> Result<String> {
            Ok(format!("kb: {}", input["query"].as_str().unwrap_or_default()))
        }
    }

    fn runtime(llm: Arc<ScriptedLlmClient>) -> AgentRuntime {
        let mut tools = ToolRegistry::default();
        tools.register(FakeKnowledgeBase);
        AgentRuntime::new(llm, tools)
            .with_clock(Arc::new(|| NaiveDate::from_ymd_opt(2025, 12, 6).expect("date")))
    }

    #[tokio::test]
    async fn plain_answer_finishes_in_one_call() {
        let llm = Arc::new(ScriptedLlmClient::new().reply("Quarterly."));
        let mut history = vec![Message::system("prompt"), Message::user("How often do I report?")];

        let outcome = runtime(llm.clone()).run_turn(&mut history).await.expect("turn");

        assert_eq!(outcome.model_calls, 1);
        assert_eq!(outcome.tool_rounds, 0);
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].role, Role::Assistant);
        assert_eq!(history[2].content, "Quarterly.");
    }

    #[tokio::test]
    async fn date_context_is_sent_but_never_stored() {
        let llm = Arc::new(ScriptedLlmClient::new().reply("ok"));
        let mut history = vec![Message::system("prompt"), Message::user("Next deadline?")];

        runtime(llm.clone()).run_turn(&mut history).await.expect("turn");

        let requests = llm.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0][0].content.starts_with("CURRENT DATE: December 06, 2025"));
        assert_eq!(requests[0][1].content, "prompt");
        assert!(history.iter().all(|m| !m.content.starts_with("CURRENT DATE")));
    }

    #[tokio::test]
    async fn tool_call_round_trip_feeds_result_back() {
        let llm = Arc::new(
            ScriptedLlmClient::new()
                .call_tool("c1", "retrieve_cbam_info", json!({"query": "steel default value"}))
                .reply("Steel default: 1.9 tCO2e/t. **Source: Pinecone Knowledge Base**"),
        );
        let mut history = vec![Message::system("prompt"), Message::user("steel?")];

        let outcome = runtime(llm.clone()).run_turn(&mut history).await.expect("turn");

        assert_eq!(outcome.tool_rounds, 1);
        assert_eq!(outcome.model_calls, 2);
        assert_eq!(outcome.usage.input_tokens, 20);
        let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
        assert_eq!(history[3].content, "kb: steel default value");
        assert_eq!(history[3].tool_call_id.as_deref(), Some("c1"));

        let second_request = &llm.requests()[1];
        assert_eq!(second_request.last().map(|m| m.role), Some(Role::Tool));
    }

    #[tokio::test]
    async fn unknown_tool_does_not_abort_the_turn() {
        let llm = Arc::new(
            ScriptedLlmClient::new()
                .call_tool("c1", "web_search", json!({}))
                .reply("I could not search the web."),
        );
        let mut history = vec![Message::user("search")];

        let outcome = runtime(llm).run_turn(&mut history).await.expect("turn");

        assert_eq!(outcome.tool_rounds, 1);
        assert!(history[2].content.starts_with("Error: web_search is not a valid tool"));
        assert_eq!(history[3].content, "I could not search the web.");
    }

    #[tokio::test]
    async fn endless_tool_calls_hit_the_round_limit() {
        let mut script = ScriptedLlmClient::new();
        for round in 0..3 {
            script = script.call_tool(&format!("c{round}"), "retrieve_cbam_info", json!({"query": "x"}));
        }
        let llm = Arc::new(script);
        let mut history = vec![Message::user("loop")];

        let error = runtime(llm)
            .with_max_tool_rounds(2)
            .run_turn(&mut history)
            .await
            .expect_err("round limit");

        assert!(matches!(error, AgentError::ToolRoundLimit { limit: 2 }));
        assert!(matches!(ApplicationError::from(error), ApplicationError::Integration(_)));
    }

    #[tokio::test]
    async fn empty_answer_fails_the_turn_without_storing_it() {
        let llm = Arc::new(ScriptedLlmClient::new().push(Ok(LlmResponse {
            finish_reason: Some("MAX_TOKENS".to_string()),
            ..LlmResponse::default()
        })));
        let mut history = vec![Message::system("prompt"), Message::user("Explain CBAM.")];

        let error = runtime(llm).run_turn(&mut history).await.expect_err("empty answer");

        assert!(
            matches!(error, AgentError::EmptyReply { ref finish_reason } if finish_reason == "MAX_TOKENS")
        );
        assert_eq!(history.len(), 2);
        assert!(matches!(ApplicationError::from(error), ApplicationError::Integration(_)));
    }

    #[tokio::test]
    async fn model_failure_propagates() {
        let llm = Arc::new(ScriptedLlmClient::new().fail(LlmError::RateLimited));
        let mut history = vec![Message::user("hi")];

        let error = runtime(llm).run_turn(&mut history).await.expect_err("failure");

        assert!(matches!(error, AgentError::Llm(LlmError::RateLimited)));
    }
}
