//! The `shell` capability.
//!
//! Foreground commands run through the process registry and are waited on
//! up to a timeout; their transient session is removed afterwards.
//! Background commands get a yield window and, if still running, hand the
//! caller a session id to drive through the `process` capability.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::capability::{Capability, CapabilityError, ToolCall, ToolResult};
use crate::process::{ProcessError, ProcessRegistry, Session};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShellConfig {
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    /// Yield window when `background` is set without `yieldMs`.
    pub default_yield_ms: u64,
    /// Longest output handed back in one result.
    pub max_result_chars: usize,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 120_000,
            max_timeout_ms: 600_000,
            default_yield_ms: 10_000,
            max_result_chars: 30_000,
        }
    }
}

const MIN_TIMEOUT_MS: u64 = 1_000;

pub struct ShellCapability {
    registry: ProcessRegistry,
    config: ShellConfig,
}

impl ShellCapability {
    pub fn new(registry: ProcessRegistry, config: ShellConfig) -> Self {
        Self { registry, config }
    }

    async fn run_foreground(
        &self,
        call: &ToolCall,
        command: &str,
        cwd: Option<&str>,
    ) -> Result<ToolResult, CapabilityError> {
        let timeout_ms = call
            .opt_u64_arg("timeoutMs")
            .unwrap_or(self.config.default_timeout_ms)
            .clamp(MIN_TIMEOUT_MS, self.config.max_timeout_ms.max(MIN_TIMEOUT_MS));

        let session = self.registry.spawn(command, cwd, 0).await?;

        enum Outcome {
            Exited,
            TimedOut,
            Cancelled,
        }
        let outcome = tokio::select! {
            _ = session.wait_exit() => Outcome::Exited,
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => Outcome::TimedOut,
            _ = call.cancel.cancelled() => Outcome::Cancelled,
        };

        let output = self.render_output(&session);
        self.discard(&session);

        match outcome {
            Outcome::Exited => {
                let exit = session.exit_info().unwrap_or(crate::shell::ExitInfo {
                    code: -1,
                    signal: None,
                });
                if exit.code == 0 {
                    Ok(ToolResult::text(if output.is_empty() {
                        "(no output)".to_string()
                    } else {
                        output
                    }))
                } else {
                    Err(CapabilityError::Execution {
                        message: exit_message(exit.code, exit.signal.as_deref()),
                        output,
                    })
                }
            }
            Outcome::TimedOut => Err(CapabilityError::Timeout {
                after_ms: timeout_ms,
                output,
            }),
            Outcome::Cancelled => Err(CapabilityError::Cancelled { output }),
        }
    }

    async fn run_background(
        &self,
        call: &ToolCall,
        command: &str,
        cwd: Option<&str>,
    ) -> Result<ToolResult, CapabilityError> {
        let yield_ms = call
            .opt_u64_arg("yieldMs")
            .unwrap_or(self.config.default_yield_ms);
        let session = self.registry.spawn(command, cwd, yield_ms).await?;

        // Whatever the caller sees now must not come back from the next poll.
        let pending = session.drain_pending();

        if let Some(exit) = session.exit_info() {
            let output = self.render_output(&session);
            return if exit.code == 0 {
                Ok(ToolResult::text(if output.is_empty() {
                    "(no output)".to_string()
                } else {
                    output
                }))
            } else {
                Err(CapabilityError::Execution {
                    message: exit_message(exit.code, exit.signal.as_deref()),
                    output,
                })
            };
        }

        // A zero yield window skips the registry's own hand-off.
        if !session.is_backgrounded() {
            self.registry.background(&session);
        }

        let mut so_far = pending.stdout_text();
        so_far.push_str(&pending.stderr_text());
        let so_far = truncate_middle(&so_far, self.config.max_result_chars);

        let id = session.id();
        let mut text = format!(
            "Command is still running in background session {id}{}.\n",
            session
                .pid()
                .map(|pid| format!(" (pid {pid})"))
                .unwrap_or_default()
        );
        if !so_far.is_empty() {
            text.push_str(&format!("Output so far:\n{so_far}\n"));
        }
        text.push_str(&format!(
            "Use the process capability to follow it: \
             {{\"action\": \"poll\", \"sessionId\": \"{id}\"}} for new output, \
             \"log\" for the full log, \"write\" to send input, \"kill\" to stop it."
        ));
        Ok(ToolResult::text(text))
    }

    fn render_output(&self, session: &Session) -> String {
        let mut output = session.aggregated_output();
        if session.is_truncated() {
            output.push_str(&format!(
                "\n[output exceeded {} bytes; only the beginning was kept]",
                self.registry.config().max_output_bytes
            ));
        }
        truncate_middle(&output, self.config.max_result_chars)
    }

    fn discard(&self, session: &Session) {
        match self.registry.remove(&session.id().0) {
            Ok(()) | Err(ProcessError::NotFound(_)) => {}
            Err(err) => log::debug!("shell [{}] cleanup failed: {}", session.id(), err),
        }
    }
}

fn exit_message(code: i32, signal: Option<&str>) -> String {
    match signal {
        Some(signal) => format!("Command terminated by {signal} (exit code {code})"),
        None => format!("Command exited with code {code}"),
    }
}

/// Keep the head and tail of `text` within `max_chars`, marking the cut.
pub fn truncate_middle(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }

    let keep = max_chars / 2;
    let head: String = text.chars().take(keep).collect();
    let tail: String = text.chars().skip(total - keep).collect();
    format!("{head}\n[... {} characters omitted ...]\n{tail}", total - 2 * keep)
}

#[async_trait]
impl Capability for ShellCapability {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a shell command. Long-running commands can be started in the background \
         and followed with the process capability."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Command line to run"},
                "cwd": {"type": "string", "description": "Working directory"},
                "background": {"type": "boolean", "description": "Run as a background session"},
                "yieldMs": {"type": "integer", "description": "Wait this long for early completion before backgrounding"},
                "timeoutMs": {"type": "integer", "description": "Foreground timeout"}
            },
            "required": ["command"]
        })
    }

    fn category(&self) -> Option<&str> {
        Some("system")
    }

    fn requires_approval(&self) -> bool {
        true
    }

    fn command_text(&self, args: &Value) -> Option<String> {
        args.get("command")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolResult, CapabilityError> {
        let command = call.str_arg("command")?;
        let cwd = call.opt_str_arg("cwd");
        let background = call.bool_arg("background") || call.opt_u64_arg("yieldMs").is_some();

        if background {
            self.run_background(call, command, cwd).await
        } else {
            self.run_foreground(call, command, cwd).await
        }
    }
}

/// Convenience constructor for registration.
pub fn shell_capability(registry: &ProcessRegistry, config: &ShellConfig) -> Arc<dyn Capability> {
    Arc::new(ShellCapability::new(registry.clone(), config.clone()))
}

// ============================================================================
// TESTS
// ============================================================================
