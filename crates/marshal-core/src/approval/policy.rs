//! Approval policy: who must sign off on what.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::allowlist::{Allowlist, DEFAULT_ALLOWLIST};
use super::origin::{Origin, OriginDeny};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("Approval request was cancelled")]
    Cancelled,

    #[error("No approval channel is configured")]
    NoChannel,

    #[error("Approval transport failed: {0}")]
    Transport(String),
}

/// How much runs without sign-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalLevel {
    /// Everything needs approval.
    Deny,
    /// Commands matching the allow-list run; the rest need approval.
    Allowlist,
    /// Nothing needs approval.
    AllowAll,
}

/// When a human is asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskMode {
    /// Never ask; anything needing approval is denied.
    Off,
    /// Ask when the allow-list has no match.
    OnMiss,
    /// Ask even for allow-listed commands.
    Always,
}

/// Outcome of a prompt or remote approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    ApproveOnce,
    /// Approve and add the command text to the allow-list.
    ApproveAlways,
    Deny,
}

impl Decision {
    pub fn is_approved(&self) -> bool {
        !matches!(self, Decision::Deny)
    }
}

/// Persisted policy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyConfig {
    pub level: ApprovalLevel,
    pub ask: AskMode,
    pub allowlist: Vec<String>,
    /// Extra per-origin denials on top of the built-in ones.
    pub origin_deny: HashMap<Origin, Vec<String>>,
    /// Starting value of the live autonomous flag.
    pub autonomous: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            level: ApprovalLevel::Allowlist,
            ask: AskMode::OnMiss,
            allowlist: DEFAULT_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            origin_deny: HashMap::new(),
            autonomous: false,
        }
    }
}

/// What a human or remote approver is shown.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub origin: Origin,
    pub capability: String,
    /// Human-readable rendering of the action.
    pub summary: String,
    pub args: serde_json::Value,
}

/// Approval mediated by something other than the local terminal, e.g. a UI.
#[async_trait]
pub trait RemoteApprover: Send + Sync {
    async fn approve(&self, request: &ApprovalRequest) -> Result<Decision, ApprovalError>;
}

/// Synchronous local prompt.
#[async_trait]
pub trait Prompter: Send + Sync {
    async fn prompt(&self, request: &ApprovalRequest) -> Result<Decision, ApprovalError>;
}

pub type AutonomousProbe = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct Settings {
    level: ApprovalLevel,
    ask: AskMode,
}

/// Decides per call whether an action needs sign-off, and gets it.
pub struct ApprovalPolicy {
    settings: RwLock<Settings>,
    allowlist: RwLock<Allowlist>,
    origin_deny: RwLock<OriginDeny>,
    autonomous: RwLock<Option<AutonomousProbe>>,
    remote: RwLock<Option<Arc<dyn RemoteApprover>>>,
    prompter: RwLock<Option<Arc<dyn Prompter>>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl ApprovalPolicy {
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            settings: RwLock::new(Settings {
                level: config.level,
                ask: config.ask,
            }),
            allowlist: RwLock::new(Allowlist::from_entries(config.allowlist.iter().cloned())),
            origin_deny: RwLock::new(OriginDeny::with_extra(&config.origin_deny)),
            autonomous: RwLock::new(None),
            remote: RwLock::new(None),
            prompter: RwLock::new(None),
        }
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub fn level(&self) -> ApprovalLevel {
        read(&self.settings).level
    }

    pub fn set_level(&self, level: ApprovalLevel) {
        write(&self.settings).level = level;
        log::info!("approval level set to {:?}", level);
    }

    pub fn ask_mode(&self) -> AskMode {
        read(&self.settings).ask
    }

    pub fn set_ask_mode(&self, ask: AskMode) {
        write(&self.settings).ask = ask;
        log::info!("approval ask mode set to {:?}", ask);
    }

    pub fn allow(&self, entry: &str) -> bool {
        write(&self.allowlist).add(entry)
    }

    pub fn disallow(&self, entry: &str) -> bool {
        write(&self.allowlist).remove(entry)
    }

    pub fn allowlist(&self) -> Vec<String> {
        read(&self.allowlist).entries()
    }

    /// Add an origin denial. Denials cannot be lifted.
    pub fn deny_for_origin(&self, origin: Origin, capability: &str) {
        write(&self.origin_deny).deny(origin, capability);
    }

    pub fn origin_denials(&self) -> Vec<(Origin, Vec<String>)> {
        read(&self.origin_deny).entries()
    }

    pub fn set_autonomous_probe(&self, probe: AutonomousProbe) {
        *write(&self.autonomous) = Some(probe);
    }

    pub fn set_remote_approver(&self, remote: Arc<dyn RemoteApprover>) {
        *write(&self.remote) = Some(remote);
    }

    pub fn set_prompter(&self, prompter: Arc<dyn Prompter>) {
        *write(&self.prompter) = Some(prompter);
    }

    /// Evaluated fresh on every call.
    pub fn is_autonomous(&self) -> bool {
        let probe = read(&self.autonomous).clone();
        probe.is_some_and(|probe| probe())
    }

    // ------------------------------------------------------------------
    // Decisions
    // ------------------------------------------------------------------

    /// Whether running `command` needs sign-off under the current settings.
    pub fn requires_approval(&self, command: &str) -> bool {
        if self.is_autonomous() {
            return false;
        }

        let settings = *read(&self.settings);
        match settings.level {
            ApprovalLevel::Deny => true,
            ApprovalLevel::AllowAll => false,
            ApprovalLevel::Allowlist => {
                if read(&self.allowlist).matches(command) {
                    settings.ask == AskMode::Always
                } else {
                    true
                }
            }
        }
    }

    /// True when `origin` may never invoke `capability`. Nothing in the
    /// policy settings overrides this.
    pub fn is_denied_for_origin(&self, origin: Origin, capability: &str) -> bool {
        read(&self.origin_deny).is_denied(origin, capability)
    }

    /// Get a verdict for one call.
    ///
    /// `command_text` is the capability's own rendering of the action (the
    /// command line for `shell`); when absent the raw args are shown and
    /// only an identical remembered payload skips the prompt.
    pub async fn request_approval(
        &self,
        origin: Origin,
        capability: &str,
        args: &serde_json::Value,
        command_text: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<bool, ApprovalError> {
        if origin == Origin::Scheduler {
            log::debug!("approval [{}] auto-approved for scheduler", capability);
            return Ok(true);
        }

        if self.is_autonomous() || self.level() == ApprovalLevel::AllowAll {
            log::debug!("approval [{}] auto-approved (autonomous/allow_all)", capability);
            return Ok(true);
        }

        let summary = match command_text {
            Some(text) => text.to_string(),
            None => args.to_string(),
        };

        let needed = match command_text {
            Some(text) => self.requires_approval(text),
            None => {
                self.level() == ApprovalLevel::Deny
                    || self.ask_mode() == AskMode::Always
                    || !read(&self.allowlist).contains(&summary)
            }
        };
        if !needed {
            log::debug!("approval [{}] allow-listed: {}", capability, summary);
            return Ok(true);
        }

        if self.ask_mode() == AskMode::Off {
            log::info!("approval [{}] denied without asking: {}", capability, summary);
            return Ok(false);
        }

        let request = ApprovalRequest {
            origin,
            capability: capability.to_string(),
            summary,
            args: args.clone(),
        };

        let remote = read(&self.remote).clone();
        let prompter = read(&self.prompter).clone();
        let decision = if let Some(remote) = remote {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ApprovalError::Cancelled),
                decision = remote.approve(&request) => decision?,
            }
        } else if let Some(prompter) = prompter {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ApprovalError::Cancelled),
                decision = prompter.prompt(&request) => decision?,
            }
        } else {
            log::warn!("approval [{}] needed but no approver is configured", capability);
            return Err(ApprovalError::NoChannel);
        };

        if decision == Decision::ApproveAlways {
            self.allow(&request.summary);
        }
        log::info!(
            "approval [{}] {:?} from {}: {}",
            capability,
            decision,
            origin,
            request.summary
        );
        Ok(decision.is_approved())
    }
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self::new(&PolicyConfig::default())
    }
}

// ============================================================================
// TESTS
// ============================================================================
