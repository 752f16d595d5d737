//! Remote approval over HTTP.
//!
//! When the policy needs sign-off, [`HttpApprover`] parks the request in a
//! pending table, announces it on the event bus (`approval:requested:{id}`)
//! and waits for `POST /api/approvals/{id}`. A request whose caller goes
//! away (cancellation, client disconnect) is dropped from the table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use marshal_core::approval::{ApprovalError, ApprovalRequest, Decision, RemoteApprover};
use marshal_core::event_bus::{topics, EventBus};
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

/// A request waiting for a verdict.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub id: String,
    pub requested_at_ms: i64,
    #[serde(flatten)]
    pub request: ApprovalRequest,
}

struct Entry {
    pending: PendingApproval,
    reply: oneshot::Sender<Decision>,
}

pub struct HttpApprover {
    pending: Mutex<HashMap<String, Entry>>,
    event_bus: Arc<EventBus>,
}

impl HttpApprover {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            event_bus,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pending requests, oldest first.
    pub fn list(&self) -> Vec<PendingApproval> {
        let mut pending: Vec<PendingApproval> =
            self.lock().values().map(|e| e.pending.clone()).collect();
        pending.sort_by_key(|p| p.requested_at_ms);
        pending
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// Deliver a verdict. Returns false if no such request is pending.
    pub fn resolve(&self, id: &str, decision: Decision) -> bool {
        let Some(entry) = self.lock().remove(id) else {
            return false;
        };
        if entry.reply.send(decision).is_err() {
            log::debug!("approval [{}] resolved after its caller went away", id);
        }
        self.event_bus.emit(
            &topics::approval_resolved(id),
            &serde_json::json!({ "decision": decision }),
        );
        true
    }

    /// Drop every pending request; their callers see a transport error.
    pub fn abandon_all(&self) -> usize {
        let abandoned: Vec<String> = self.lock().drain().map(|(id, _)| id).collect();
        for id in &abandoned {
            log::info!("approval [{}] abandoned at shutdown", id);
        }
        abandoned.len()
    }
}

/// Removes the pending entry when the waiting future is dropped early.
struct PendingGuard<'a> {
    approver: &'a HttpApprover,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.approver.lock().remove(&self.id).is_some() {
            log::debug!("approval [{}] abandoned", self.id);
        }
    }
}

#[async_trait]
impl RemoteApprover for HttpApprover {
    async fn approve(&self, request: &ApprovalRequest) -> Result<Decision, ApprovalError> {
        let id = Uuid::new_v4().to_string();
        let (reply, verdict) = oneshot::channel();
        let pending = PendingApproval {
            id: id.clone(),
            requested_at_ms: Utc::now().timestamp_millis(),
            request: request.clone(),
        };

        self.lock().insert(
            id.clone(),
            Entry {
                pending: pending.clone(),
                reply,
            },
        );
        let _guard = PendingGuard {
            approver: self,
            id: id.clone(),
        };

        let delivered = self
            .event_bus
            .emit(&topics::approval_requested(&id), &pending);
        log::info!(
            "approval [{}] requested for {} ({} listener(s))",
            id,
            request.capability,
            delivered
        );

        verdict
            .await
            .map_err(|_| ApprovalError::Transport("approval request was dropped".to_string()))
    }
}
