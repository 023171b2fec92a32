use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use cbag_core::domain::message::ToolCall;

use crate::llm::ToolDefinition;

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value;
    async fn execute(&self, input: Value) -> Result<String>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolExecution {
    pub output: String,
    pub failed: bool,
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.names()
            .into_iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect()
    }

    /// Failures come back as text for the model instead of ending the turn.
    pub async fn execute(&self, call: &ToolCall) -> ToolExecution {
        let Some(tool) = self.tools.get(&call.name) else {
            return ToolExecution {
                output: format!(
                    "Error: {} is not a valid tool, try one of [{}].",
                    call.name,
                    self.names().join(", ")
                ),
                failed: true,
            };
        };

        match tool.execute(call.arguments.clone()).await {
            Ok(output) => ToolExecution { output, failed: false },
            Err(error) => ToolExecution { output: format!("Error: {error}"), failed: true },
        }
    }
}
