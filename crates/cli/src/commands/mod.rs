pub mod ask;
pub mod config;
pub mod doctor;
pub mod migrate;
pub mod probe;

use std::future::Future;

use serde::Serialize;

/// What a subcommand prints and the process exit code that goes with it.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Ok,
    Skipped,
    Error,
}

#[derive(Debug, Serialize)]
struct CommandOutcome<'a> {
    command: &'a str,
    status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_class: Option<&'a str>,
    message: String,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::structured(command, OutcomeStatus::Ok, None, message.into(), 0)
    }

    /// Nothing to do for the current configuration; still a zero exit.
    pub fn skipped(command: &str, message: impl Into<String>) -> Self {
        Self::structured(command, OutcomeStatus::Skipped, None, message.into(), 0)
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        Self::structured(command, OutcomeStatus::Error, Some(error_class), message.into(), exit_code)
    }

    pub fn plain(output: String) -> Self {
        Self { exit_code: 0, output }
    }

    fn structured(
        command: &str,
        status: OutcomeStatus,
        error_class: Option<&str>,
        message: String,
        exit_code: u8,
    ) -> Self {
        let outcome = CommandOutcome { command, status, error_class, message };
        let output = serde_json::to_string(&outcome).unwrap_or_else(|error| {
            format!(
                "{{\"command\":\"{command}\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
                error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
            )
        });
        Self { exit_code, output }
    }
}

/// Runs `future` on a single-threaded runtime; exit code 3 when the runtime cannot start.
pub(crate) fn block_on<F: Future>(command: &str, future: F) -> Result<F::Output, CommandResult> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
        CommandResult::failure(
            command,
            "runtime_init",
            format!("failed to initialize async runtime: {error}"),
            3,
        )
    })?;
    Ok(runtime.block_on(future))
}
