//! The `process` capability: list, poll, log, write, kill, remove, clear.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use super::shell::truncate_middle;
use crate::capability::{Capability, CapabilityError, ToolCall, ToolResult};
use crate::process::{ProcessRegistry, SessionSnapshot, SessionStatus};

const MAX_RESULT_CHARS: usize = 30_000;

pub struct ProcessCapability {
    registry: ProcessRegistry,
}

impl ProcessCapability {
    pub fn new(registry: ProcessRegistry) -> Self {
        Self { registry }
    }

    fn list(&self) -> ToolResult {
        let mut sessions = self.registry.list_running();
        sessions.extend(self.registry.list_finished());
        if sessions.is_empty() {
            return ToolResult::text("No background sessions.");
        }
        let lines: Vec<String> = sessions.iter().map(describe).collect();
        ToolResult::text(lines.join("\n"))
    }

    fn poll(&self, id: &str) -> Result<ToolResult, CapabilityError> {
        let pending = self.registry.drain_pending(id)?;
        let session = self.registry.get(id);

        let mut text = String::new();
        if pending.dropped > 0 {
            text.push_str(&format!(
                "[{} earlier byte(s) dropped since the last poll]\n",
                pending.dropped
            ));
        }
        if pending.is_empty() {
            text.push_str("(no new output)\n");
        } else {
            if !pending.stdout.is_empty() {
                text.push_str(&pending.stdout_text());
            }
            if !pending.stderr.is_empty() {
                text.push_str("[stderr]\n");
                text.push_str(&pending.stderr_text());
            }
            if !text.ends_with('\n') {
                text.push('\n');
            }
        }

        match session.and_then(|s| s.exit_info()) {
            Some(exit) => {
                text.push_str(&format!("Process exited with code {}", exit.code));
                if let Some(signal) = exit.signal {
                    text.push_str(&format!(" ({signal})"));
                }
                text.push('.');
            }
            None => text.push_str("Process still running."),
        }
        Ok(ToolResult::text(truncate_middle(&text, MAX_RESULT_CHARS)))
    }

    fn log(&self, id: &str, tail: Option<usize>) -> Result<ToolResult, CapabilityError> {
        let log = self.registry.read_log(id, tail)?;
        if log.is_empty() {
            return Ok(ToolResult::text("(no output)"));
        }
        Ok(ToolResult::text(truncate_middle(&log, MAX_RESULT_CHARS)))
    }

    async fn write(&self, call: &ToolCall, id: &str) -> Result<ToolResult, CapabilityError> {
        let data = call.args.get("data").and_then(Value::as_str).unwrap_or("");
        let eof = call.bool_arg("eof");
        if data.is_empty() && !eof {
            return Err(CapabilityError::InvalidInput(
                "write needs 'data' or 'eof': true".to_string(),
            ));
        }
        self.registry.write_stdin(id, data.as_bytes(), eof).await?;

        let mut text = format!("Wrote {} bytes to session {id}", data.len());
        if eof {
            text.push_str(" and closed stdin");
        }
        text.push('.');
        Ok(ToolResult::text(text))
    }
}

fn describe(snapshot: &SessionSnapshot) -> String {
    let status = match (snapshot.status, snapshot.exit_code) {
        (SessionStatus::Exited, Some(code)) => format!("exited({code})"),
        (SessionStatus::Exited, None) => "exited".to_string(),
        (SessionStatus::Backgrounded, _) => "running (background)".to_string(),
        (SessionStatus::Running, _) => "running".to_string(),
    };
    let end = snapshot.finished_at.unwrap_or_else(Utc::now);
    let elapsed = (end - snapshot.started_at).num_seconds().max(0);
    format!(
        "{}  {}  {}s  {}",
        snapshot.id, status, elapsed, snapshot.command
    )
}

#[async_trait]
impl Capability for ProcessCapability {
    fn name(&self) -> &str {
        "process"
    }

    fn description(&self) -> &str {
        "Manage background shell sessions: list, poll new output, read the log, \
         write to stdin, kill, remove, or clear finished sessions."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["list", "poll", "log", "write", "kill", "remove", "clear"]
                },
                "sessionId": {"type": "string"},
                "data": {"type": "string", "description": "Text for write"},
                "eof": {"type": "boolean", "description": "Close stdin after write"},
                "tail": {"type": "integer", "description": "Last N lines for log"}
            },
            "required": ["action"]
        })
    }

    fn category(&self) -> Option<&str> {
        Some("system")
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolResult, CapabilityError> {
        let action = call.str_arg("action")?;
        match action {
            "list" => Ok(self.list()),
            "clear" => {
                let cleared = self.registry.clear_finished();
                Ok(ToolResult::text(format!(
                    "Cleared {cleared} finished session(s)."
                )))
            }
            "poll" | "log" | "write" | "kill" | "remove" => {
                let id = call.str_arg("sessionId")?;
                match action {
                    "poll" => self.poll(id),
                    "log" => self.log(id, call.opt_u64_arg("tail").map(|n| n as usize)),
                    "write" => self.write(call, id).await,
                    "kill" => {
                        self.registry.kill(id)?;
                        Ok(ToolResult::text(format!("Killed session {id}.")))
                    }
                    _ => {
                        self.registry.remove(id)?;
                        Ok(ToolResult::text(format!("Removed session {id}.")))
                    }
                }
            }
            other => Err(CapabilityError::InvalidInput(format!(
                "unknown action '{other}'; expected list, poll, log, write, kill, remove or clear"
            ))),
        }
    }
}

pub fn process_capability(registry: &ProcessRegistry) -> Arc<dyn Capability> {
    Arc::new(ProcessCapability::new(registry.clone()))
}

// ============================================================================
// TESTS
// ============================================================================
