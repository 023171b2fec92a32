//! Agent runtime for the CBAM assistant.
//!
//! This crate owns everything between an inbound user message and the final
//! reply:
//! - `guardrails` rejects empty or oversize input before any model call
//! - `conversation` seeds the system prompt on a session's first turn
//! - `runtime` runs the model/tool loop and prepends today's date to every call
//! - `gemini` talks to the Gemini `generateContent` API with function calling
//! - `retrieval` exposes the hosted CBAM knowledge base as `retrieve_cbam_info`
//!
//! # Key Types
//!
//! - `AgentRuntime` - turn orchestrator (see `runtime` module)
//! - `LlmClient` - seam between the loop and the model provider
//! - `Tool` / `ToolRegistry` - tools the model may call
//!
//! Session storage lives outside this crate: callers load history, hand it to
//! `AgentRuntime::run_turn` and persist the result themselves.

pub mod conversation;
pub mod gemini;
pub mod guardrails;
pub mod llm;
pub mod retrieval;
pub mod runtime;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod tools;

pub use conversation::Conversation;
pub use gemini::GeminiClient;
pub use guardrails::{GuardrailDecision, InputPolicy};
pub use llm::{LlmClient, LlmError, LlmResponse, TokenUsage, ToolDefinition};
pub use retrieval::{RetrievalTool, RETRIEVAL_TOOL_NAME};
pub use runtime::{AgentError, AgentRuntime, Clock, TurnOutcome};
pub use tools::{Tool, ToolExecution, ToolRegistry};
