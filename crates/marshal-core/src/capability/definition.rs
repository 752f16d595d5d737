//! The [`Capability`] contract and the call/result types around it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::filter::Platform;
use crate::approval::Origin;
use crate::process::ProcessError;

/// A unit of executable behavior the agent can invoke by name.
///
/// Implementations must be `Send + Sync`; the registry hands out
/// `Arc<dyn Capability>` across tasks.
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the call's `args`.
    fn input_schema(&self) -> Value;

    /// Platforms this capability runs on. Empty means all.
    fn platforms(&self) -> &[Platform] {
        &[]
    }

    /// Category used for permission filtering at registration.
    fn category(&self) -> Option<&str> {
        None
    }

    fn requires_approval(&self) -> bool {
        false
    }

    /// Serialize execution with every other exclusive capability, for
    /// actions driving a shared desktop or UI.
    fn requires_exclusive(&self) -> bool {
        false
    }

    /// Human-readable rendering of a call, shown to approvers and checked by
    /// the safeguard. `None` falls back to the raw args.
    fn command_text(&self, _args: &Value) -> Option<String> {
        None
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolResult, CapabilityError>;
}

/// A request to run one capability.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
    pub origin: Origin,
    pub cancel: CancellationToken,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            args,
            origin: Origin::Interactive,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Required string argument.
    pub fn str_arg(&self, key: &str) -> Result<&str, CapabilityError> {
        match self.args.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.as_str()),
            Some(Value::String(_)) | None | Some(Value::Null) => {
                Err(CapabilityError::InvalidInput(format!("missing required field '{key}'")))
            }
            Some(_) => Err(CapabilityError::InvalidInput(format!(
                "field '{key}' must be a string"
            ))),
        }
    }

    pub fn opt_str_arg(&self, key: &str) -> Option<&str> {
        self.args
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    pub fn opt_u64_arg(&self, key: &str) -> Option<u64> {
        self.args.get(key).and_then(Value::as_u64)
    }

    pub fn bool_arg(&self, key: &str) -> bool {
        self.args.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

/// What the caller gets back, success or failure alike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{message}")]
    Execution { message: String, output: String },

    #[error("Timed out after {after_ms}ms")]
    Timeout { after_ms: u64, output: String },

    #[error("Cancelled")]
    Cancelled { output: String },

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl CapabilityError {
    /// Output captured before the failure, if any.
    pub fn partial_output(&self) -> &str {
        match self {
            CapabilityError::Execution { output, .. }
            | CapabilityError::Timeout { output, .. }
            | CapabilityError::Cancelled { output } => output,
            _ => "",
        }
    }
}

impl From<CapabilityError> for ToolResult {
    fn from(err: CapabilityError) -> Self {
        let output = err.partial_output().trim_end();
        if output.is_empty() {
            ToolResult::error(err.to_string())
        } else {
            ToolResult::error(format!("{err}\n\n{output}"))
        }
    }
}

/// Registry listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityInfo {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub requires_approval: bool,
    pub category: Option<String>,
    pub platforms: Vec<Platform>,
}

impl CapabilityInfo {
    pub fn of(capability: &dyn Capability) -> Self {
        Self {
            name: capability.name().to_string(),
            description: capability.description().to_string(),
            input_schema: capability.input_schema(),
            requires_approval: capability.requires_approval(),
            category: capability.category().map(str::to_string),
            platforms: capability.platforms().to_vec(),
        }
    }
}
