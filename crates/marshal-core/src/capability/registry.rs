//! Name → capability map and the per-call routing pipeline.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;

use super::definition::{Capability, CapabilityInfo, ToolCall, ToolResult};
use super::filter::{PermissionFilter, Platform};
use super::{hints, safeguard};
use crate::approval::{ApprovalError, ApprovalPolicy};
use crate::event_bus::{topics, EventBus};

/// Called with `(added, removed)` capability names.
pub type ChangeListener = Arc<dyn Fn(&[String], &[String]) + Send + Sync>;

#[derive(Debug, Serialize)]
struct ChangePayload<'a> {
    added: &'a [String],
    removed: &'a [String],
}

/// Routes calls by name through safeguard, origin denial and approval.
///
/// Registration may happen at any time (hot reload); lookups clone the
/// `Arc` out so no lock is held while a capability runs.
pub struct CapabilityRegistry {
    capabilities: RwLock<HashMap<String, Arc<dyn Capability>>>,
    listeners: RwLock<Vec<ChangeListener>>,
    policy: Arc<ApprovalPolicy>,
    platform: Platform,
    permissions: PermissionFilter,
    exclusive: AsyncMutex<()>,
    event_bus: Option<Arc<EventBus>>,
}

impl CapabilityRegistry {
    pub fn new(policy: Arc<ApprovalPolicy>) -> Self {
        Self {
            capabilities: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            policy,
            platform: Platform::current(),
            permissions: PermissionFilter::default(),
            exclusive: AsyncMutex::new(()),
            event_bus: None,
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_permissions(mut self, permissions: PermissionFilter) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn policy(&self) -> &Arc<ApprovalPolicy> {
        &self.policy
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a capability if it passes the platform and permission
    /// filters. Returns false when it was filtered out.
    ///
    /// An existing capability with the same name is replaced.
    pub fn register(&self, capability: Arc<dyn Capability>) -> bool {
        let name = capability.name().to_string();

        if !self.platform.supports(capability.platforms()) {
            log::debug!(
                "capability [{}] skipped: not supported on {:?}",
                name,
                self.platform
            );
            return false;
        }
        if !self.permissions.allows(capability.category()) {
            log::debug!(
                "capability [{}] skipped: permission for category {:?} not granted",
                name,
                capability.category()
            );
            return false;
        }

        let replaced = {
            let mut map = self
                .capabilities
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            map.insert(name.clone(), capability).is_some()
        };
        if replaced {
            log::warn!("capability [{}] re-registered, previous one replaced", name);
        } else {
            log::debug!("capability [{}] registered", name);
        }

        self.notify(&[name], &[]);
        true
    }

    pub fn unregister(&self, name: &str) -> bool {
        let removed = self
            .capabilities
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if removed {
            log::debug!("capability [{}] unregistered", name);
            self.notify(&[], &[name.to_string()]);
        }
        removed
    }

    /// Subscribe to registration changes. Listeners run after the registry
    /// lock is released and may call back into the registry.
    pub fn on_change(&self, listener: ChangeListener) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn notify(&self, added: &[String], removed: &[String]) {
        let listeners: Vec<ChangeListener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(added, removed);
        }
        if let Some(bus) = &self.event_bus {
            bus.emit(topics::CAPABILITIES_CHANGED, &ChangePayload { added, removed });
        }
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Resolve a call name, stripping a transport namespace (`mcp__name`,
    /// `ext.name`) when the prefixed name itself isn't registered.
    pub fn resolve(&self, name: &str) -> Option<(String, Arc<dyn Capability>)> {
        if let Some(capability) = self.get(name) {
            return Some((name.to_string(), capability));
        }
        let stripped = strip_namespace(name)?;
        self.get(stripped)
            .map(|capability| (stripped.to_string(), capability))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Registered capabilities, sorted by name.
    pub fn list(&self) -> Vec<CapabilityInfo> {
        let capabilities: Vec<Arc<dyn Capability>> = self
            .capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut infos: Vec<CapabilityInfo> = capabilities
            .iter()
            .map(|c| CapabilityInfo::of(c.as_ref()))
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn len(&self) -> usize {
        self.capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Run one call. Every outcome, including denials and unknown names,
    /// comes back as a [`ToolResult`].
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let Some((name, capability)) = self.resolve(&call.name) else {
            log::warn!("capability [{}] not found", call.name);
            return ToolResult::error(hints::unknown_capability_message(
                &call.name,
                &self.names(),
            ));
        };

        let command_text = capability.command_text(&call.args);
        if let Some(reason) = command_text.as_deref().and_then(safeguard::check) {
            log::error!(
                "capability [{}] blocked by safeguard ({}) for {} caller: {:?}",
                name,
                reason,
                call.origin,
                command_text
            );
            return ToolResult::error(format!(
                "Blocked by safeguard: {reason}. This action is never permitted."
            ));
        }

        if self.policy.is_denied_for_origin(call.origin, &name) {
            log::warn!(
                "capability [{}] denied for origin {} (call {})",
                name,
                call.origin,
                call.id
            );
            return ToolResult::error(format!(
                "Denied: '{name}' is not available to {} callers.",
                call.origin
            ));
        }

        if capability.requires_approval() {
            let verdict = self
                .policy
                .request_approval(
                    call.origin,
                    &name,
                    &call.args,
                    command_text.as_deref(),
                    &call.cancel,
                )
                .await;
            match verdict {
                Ok(true) => {}
                Ok(false) => {
                    return ToolResult::error(format!(
                        "Denied: '{name}' was not approved. Do not retry this action."
                    ))
                }
                Err(ApprovalError::Cancelled) => {
                    return ToolResult::error("Cancelled while waiting for approval.")
                }
                Err(err) => {
                    return ToolResult::error(format!("Denied: '{name}' needs approval. {err}."))
                }
            }
        }

        if call.cancel.is_cancelled() {
            return ToolResult::error("Cancelled before execution.");
        }

        let outcome = if capability.requires_exclusive() {
            let _slot = tokio::select! {
                _ = call.cancel.cancelled() => {
                    return ToolResult::error("Cancelled while waiting for exclusive access.");
                }
                slot = self.exclusive.lock() => slot,
            };
            capability.execute(call).await
        } else {
            capability.execute(call).await
        };

        match outcome {
            Ok(result) => result,
            Err(err) => {
                log::debug!("capability [{}] failed: {}", name, err);
                err.into()
            }
        }
    }
}

fn strip_namespace(name: &str) -> Option<&str> {
    let stripped = match name.rfind("__") {
        Some(idx) => &name[idx + 2..],
        None => &name[name.rfind('.')? + 1..],
    };
    (!stripped.is_empty()).then_some(stripped)
}

// ============================================================================
// TESTS
// ============================================================================
