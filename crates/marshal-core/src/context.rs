//! ControlPlane - the shared state every interface drives.
//!
//! Holds the event bus, approval policy, process registry and capability
//! registry, wired together once at startup and passed explicitly to the
//! HTTP layer and the daemon.
//!
//! ```text
//!                 ┌──────────────────────────┐
//!                 │       ControlPlane       │
//!                 ├──────────────────────────┤
//!                 │  - EventBus              │
//!                 │  - ApprovalPolicy        │
//!                 │  - ProcessRegistry       │
//!                 │  - CapabilityRegistry    │
//!                 └────────────┬─────────────┘
//!                              │
//!               ┌──────────────┴──────────────┐
//!               ▼                             ▼
//!        ┌─────────────┐               ┌─────────────┐
//!        │ HTTP Server │               │  CLI exec   │
//!        └─────────────┘               └─────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::approval::{ApprovalPolicy, AutonomousProbe, Prompter, RemoteApprover};
use crate::capability::{CapabilityRegistry, Platform, ToolCall, ToolResult};
use crate::config::ControlPlaneConfig;
use crate::event_bus::EventBus;
use crate::process::ProcessRegistry;
use crate::tools::register_builtin;

pub struct ControlPlaneBuilder {
    config: ControlPlaneConfig,
    event_bus: Option<Arc<EventBus>>,
    remote_approver: Option<Arc<dyn RemoteApprover>>,
    prompter: Option<Arc<dyn Prompter>>,
    autonomous_probe: Option<AutonomousProbe>,
    platform: Option<Platform>,
    builtin: bool,
}

impl Default for ControlPlaneBuilder {
    fn default() -> Self {
        Self {
            config: ControlPlaneConfig::default(),
            event_bus: None,
            remote_approver: None,
            prompter: None,
            autonomous_probe: None,
            platform: None,
            builtin: true,
        }
    }
}

impl ControlPlaneBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ControlPlaneConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an existing EventBus (for testing or custom configurations).
    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn remote_approver(mut self, approver: Arc<dyn RemoteApprover>) -> Self {
        self.remote_approver = Some(approver);
        self
    }

    pub fn prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = Some(prompter);
        self
    }

    /// External autonomous-mode source, OR-ed with the plane's own flag.
    pub fn autonomous_probe(mut self, probe: AutonomousProbe) -> Self {
        self.autonomous_probe = Some(probe);
        self
    }

    /// Override platform detection (for tests).
    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Skip registering `shell` and `process`.
    pub fn without_builtin(mut self) -> Self {
        self.builtin = false;
        self
    }

    pub fn build(self) -> ControlPlane {
        let event_bus = self.event_bus.unwrap_or_else(|| Arc::new(EventBus::new()));
        let autonomous = Arc::new(AtomicBool::new(self.config.policy.autonomous));

        let policy = Arc::new(ApprovalPolicy::new(&self.config.policy));
        let flag = Arc::clone(&autonomous);
        let external = self.autonomous_probe;
        policy.set_autonomous_probe(Arc::new(move || {
            flag.load(Ordering::SeqCst) || external.as_ref().is_some_and(|probe| probe())
        }));
        if let Some(remote) = self.remote_approver {
            policy.set_remote_approver(remote);
        }
        if let Some(prompter) = self.prompter {
            policy.set_prompter(prompter);
        }

        let processes =
            ProcessRegistry::with_event_bus(self.config.processes.clone(), Arc::clone(&event_bus));

        let mut capabilities = CapabilityRegistry::new(Arc::clone(&policy))
            .with_permissions(self.config.permissions.clone())
            .with_event_bus(Arc::clone(&event_bus));
        if let Some(platform) = self.platform {
            capabilities = capabilities.with_platform(platform);
        }
        let capabilities = Arc::new(capabilities);

        if self.builtin {
            let registered = register_builtin(&capabilities, &processes, &self.config.shell);
            log::debug!("built-in capabilities registered: {:?}", registered);
        }

        ControlPlane {
            event_bus,
            policy,
            processes,
            capabilities,
            autonomous,
            config: Arc::new(self.config),
        }
    }
}

/// Central shared state for the control plane.
///
/// Cloning just clones the pointers.
#[derive(Clone)]
pub struct ControlPlane {
    pub event_bus: Arc<EventBus>,
    pub policy: Arc<ApprovalPolicy>,
    pub processes: ProcessRegistry,
    pub capabilities: Arc<CapabilityRegistry>,
    autonomous: Arc<AtomicBool>,
    config: Arc<ControlPlaneConfig>,
}

impl ControlPlane {
    pub fn builder() -> ControlPlaneBuilder {
        ControlPlaneBuilder::new()
    }

    /// The config the plane was built from.
    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    /// Start background work (the finished-session sweeper).
    pub fn start(&self) {
        self.processes.start_sweeper();
        log::info!(
            "control plane started with capabilities: {}",
            self.capabilities.names().join(", ")
        );
    }

    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        self.capabilities.execute(call).await
    }

    pub fn is_autonomous(&self) -> bool {
        self.policy.is_autonomous()
    }

    pub fn set_autonomous(&self, enabled: bool) {
        self.autonomous.store(enabled, Ordering::SeqCst);
        log::info!("autonomous mode {}", if enabled { "on" } else { "off" });
    }

    /// Stop the sweeper and kill every running session.
    pub async fn shutdown(&self) {
        self.processes.shutdown().await;
    }
}
