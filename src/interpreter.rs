use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::decision::extract_json_block;
use crate::tools::{NO_TOOL, ToolCall, ToolOutput, ToolRegistry};

/// Normalized outcome of executing one decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResult {
    Success { tool: String, result: ToolOutput },
    Error { message: String },
    NoAction,
}

impl ToolResult {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Error { .. } => "error",
            Self::NoAction => "no_action",
        }
    }
}

/// Turns decision text into a validated tool call and runs it.
pub struct ActionInterpreter {
    registry: Arc<ToolRegistry>,
}

impl ActionInterpreter {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    /// Execute a decision such as `{"tool": "google_ads_visual", "args": {}}`.
    /// Never fails: every problem comes back as `ToolResult::Error`.
    pub async fn execute_action(&self, raw: &str) -> ToolResult {
        let Some(data) = extract_json_block(raw) else {
            warn!("No structured action found in decision text");
            return ToolResult::NoAction;
        };

        let tool = match data.get("tool").and_then(Value::as_str) {
            Some(t) if t.trim() != NO_TOOL => t.to_string(),
            Some(_) => return ToolResult::NoAction,
            None => {
                warn!("Decision carries no tool name");
                return ToolResult::NoAction;
            }
        };
        let args = data
            .get("args")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let shown = Value::Object(args.clone());
        info!(tool = %tool, args = %shown, "Executing action");

        let call = match ToolCall::from_args(&tool, &args) {
            Ok(call) => call,
            Err(e) => {
                warn!("Rejected action: {}", e);
                return ToolResult::error(e.to_string());
            }
        };

        match self.registry.dispatch(&call).await {
            Ok(result) => ToolResult::Success {
                tool: call.name().as_str().to_string(),
                result,
            },
            Err(e) => {
                error!(tool = %tool, args = ?args, "Action execution failed: {}", e);
                ToolResult::error(e.to_string())
            }
        }
    }
}
