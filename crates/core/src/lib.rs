//! Core types for the CBAM compliance assistant: configuration, the error
//! taxonomy shared by every layer, the conversation message model and the
//! system prompt.

pub mod config;
pub mod domain;
pub mod errors;
pub mod prompt;

pub use domain::message::{Message, Role, SessionId, ToolCall, DEFAULT_SESSION_ID};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use prompt::{date_context, SystemPrompt};
