//! Approval prompts on the controlling terminal.

use async_trait::async_trait;
use marshal_core::approval::{ApprovalError, ApprovalRequest, Decision, Prompter};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Asks on stderr, reads the answer from stdin. End of input denies.
pub struct TerminalPrompter;

#[async_trait]
impl Prompter for TerminalPrompter {
    async fn prompt(&self, request: &ApprovalRequest) -> Result<Decision, ApprovalError> {
        let transport = |err: std::io::Error| ApprovalError::Transport(err.to_string());

        let mut stderr = tokio::io::stderr();
        stderr
            .write_all(render_question(request).as_bytes())
            .await
            .map_err(transport)?;
        stderr.flush().await.map_err(transport)?;

        let mut line = String::new();
        let read = BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .map_err(transport)?;
        if read == 0 {
            log::info!("no answer on stdin, denying {}", request.capability);
            return Ok(Decision::Deny);
        }

        let decision = parse_answer(&line);
        log::info!("terminal answered {:?} for {}", decision, request.capability);
        Ok(decision)
    }
}

fn render_question(request: &ApprovalRequest) -> String {
    format!(
        "\nApproval required: {} (origin: {})\n  {}\nAllow? [y]es / [a]lways / [N]o: ",
        request.capability, request.origin, request.summary
    )
}

/// `y`/`yes` approve once, `a`/`always` approve and remember, anything else denies.
pub fn parse_answer(answer: &str) -> Decision {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Decision::ApproveOnce,
        "a" | "always" => Decision::ApproveAlways,
        _ => Decision::Deny,
    }
}
