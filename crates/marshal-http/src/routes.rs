//! REST handlers over the control plane.
//!
//! Every handler answers with the same envelope:
//! `{"success": bool, "data"?: ..., "error"?: "..."}`.
//! A capability that runs and fails is still a successful dispatch; its
//! `ToolResult` carries `isError`.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use marshal_core::approval::{Decision, Origin};
use marshal_core::process::{ProcessError, SessionSnapshot};
use marshal_core::ToolCall;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::state::SharedState;

#[derive(Serialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

type Reply = (StatusCode, Json<ApiResponse>);

fn ok<T: Serialize>(data: T) -> Reply {
    (
        StatusCode::OK,
        Json(ApiResponse {
            success: true,
            data: Some(serde_json::to_value(data).unwrap_or_default()),
            error: None,
        }),
    )
}

fn fail(status: StatusCode, error: impl Into<String>) -> Reply {
    (
        status,
        Json(ApiResponse {
            success: false,
            data: None,
            error: Some(error.into()),
        }),
    )
}

fn process_failure(err: ProcessError) -> Reply {
    let status = match &err {
        ProcessError::NotFound(_) => StatusCode::NOT_FOUND,
        ProcessError::AlreadyExited(_) | ProcessError::StdinClosed(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    fail(status, err.to_string())
}

// ============================================================================
// DISPATCH
// ============================================================================

#[derive(Deserialize)]
pub struct ExecuteRequest {
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub origin: Origin,
}

/// POST /api/execute
///
/// The call runs on its own task. If the client disconnects first, the
/// call's token is cancelled so approval waits and shell waits unwind.
pub async fn execute_handler(
    State(state): State<Arc<SharedState>>,
    Json(request): Json<ExecuteRequest>,
) -> Reply {
    if request.origin == Origin::Scheduler {
        return fail(
            StatusCode::FORBIDDEN,
            "The scheduler origin is reserved for in-process callers",
        );
    }

    let args = if request.args.is_null() {
        json!({})
    } else {
        request.args
    };
    log::debug!("HTTP execute: {} from {}", request.name, request.origin);

    let cancel = CancellationToken::new();
    let call = ToolCall::new(request.name, args)
        .with_origin(request.origin)
        .with_cancel(cancel.clone());
    let _disconnect = cancel.drop_guard();

    let plane = state.plane.clone();
    match tokio::spawn(async move { plane.execute(&call).await }).await {
        Ok(result) => ok(result),
        Err(err) => fail(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Capability task failed: {err}"),
        ),
    }
}

/// GET /api/capabilities
pub async fn capabilities_handler(State(state): State<Arc<SharedState>>) -> Reply {
    ok(state.plane.capabilities.list())
}

// ============================================================================
// SESSIONS
// ============================================================================

#[derive(Deserialize)]
pub struct SessionsQuery {
    pub state: Option<String>,
}

/// GET /api/sessions?state=running|finished|all
pub async fn list_sessions_handler(
    State(state): State<Arc<SharedState>>,
    Query(query): Query<SessionsQuery>,
) -> Reply {
    let processes = &state.plane.processes;
    let sessions: Vec<SessionSnapshot> = match query.state.as_deref().unwrap_or("all") {
        "running" => processes.list_running(),
        "finished" => processes.list_finished(),
        "all" => {
            let mut all = processes.list_running();
            all.extend(processes.list_finished());
            all
        }
        other => {
            return fail(
                StatusCode::BAD_REQUEST,
                format!("Invalid state '{other}', expected running, finished or all"),
            )
        }
    };
    ok(sessions)
}

/// GET /api/sessions/{id}
pub async fn get_session_handler(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
) -> Reply {
    match state.plane.processes.get(&id) {
        Some(session) => ok(session.snapshot()),
        None => process_failure(ProcessError::NotFound(id)),
    }
}

/// POST /api/sessions/{id}/poll
pub async fn poll_session_handler(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
) -> Reply {
    let Some(session) = state.plane.processes.get(&id) else {
        return process_failure(ProcessError::NotFound(id));
    };
    let pending = session.drain_pending();
    let exit = session.exit_info();
    ok(json!({
        "stdout": pending.stdout_text(),
        "stderr": pending.stderr_text(),
        "droppedBytes": pending.dropped,
        "exited": exit.is_some(),
        "exitCode": exit.as_ref().map(|e| e.code),
        "exitSignal": exit.and_then(|e| e.signal),
    }))
}

#[derive(Deserialize)]
pub struct LogQuery {
    pub tail: Option<usize>,
}

/// GET /api/sessions/{id}/log?tail=N
pub async fn session_log_handler(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Reply {
    match state.plane.processes.read_log(&id, query.tail) {
        Ok(log) => ok(json!({ "log": log })),
        Err(err) => process_failure(err),
    }
}

#[derive(Deserialize)]
pub struct StdinRequest {
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub eof: bool,
}

/// POST /api/sessions/{id}/stdin
pub async fn session_stdin_handler(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
    Json(request): Json<StdinRequest>,
) -> Reply {
    if request.data.is_empty() && !request.eof {
        return fail(StatusCode::BAD_REQUEST, "Provide data, eof, or both");
    }
    match state
        .plane
        .processes
        .write_stdin(&id, request.data.as_bytes(), request.eof)
        .await
    {
        Ok(()) => ok(json!({ "written": request.data.len(), "eof": request.eof })),
        Err(err) => process_failure(err),
    }
}

/// POST /api/sessions/{id}/kill
pub async fn kill_session_handler(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
) -> Reply {
    match state.plane.processes.kill(&id) {
        Ok(()) => ok(json!({ "id": id })),
        Err(err) => process_failure(err),
    }
}

/// DELETE /api/sessions/{id}
pub async fn remove_session_handler(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
) -> Reply {
    match state.plane.processes.remove(&id) {
        Ok(()) => ok(json!({ "id": id })),
        Err(err) => process_failure(err),
    }
}

// ============================================================================
// APPROVALS & MODE
// ============================================================================

/// GET /api/approvals
pub async fn list_approvals_handler(State(state): State<Arc<SharedState>>) -> Reply {
    ok(state.approvals.list())
}

#[derive(Deserialize)]
pub struct ResolveRequest {
    pub decision: Decision,
}

/// POST /api/approvals/{id}
pub async fn resolve_approval_handler(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
    Json(request): Json<ResolveRequest>,
) -> Reply {
    if state.approvals.resolve(&id, request.decision) {
        log::info!("approval [{}] answered over HTTP: {:?}", id, request.decision);
        ok(json!({ "id": id, "decision": request.decision }))
    } else {
        fail(
            StatusCode::NOT_FOUND,
            format!("No pending approval with id {id}"),
        )
    }
}

#[derive(Deserialize)]
pub struct AutonomousRequest {
    pub enabled: bool,
}

/// GET /api/autonomous
pub async fn get_autonomous_handler(State(state): State<Arc<SharedState>>) -> Reply {
    ok(json!({ "enabled": state.plane.is_autonomous() }))
}

/// POST /api/autonomous
///
/// Reports the effective mode afterwards, which stays on if an external
/// probe still says so.
pub async fn set_autonomous_handler(
    State(state): State<Arc<SharedState>>,
    Json(request): Json<AutonomousRequest>,
) -> Reply {
    state.plane.set_autonomous(request.enabled);
    ok(json!({ "enabled": state.plane.is_autonomous() }))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approvals::HttpApprover;
    use crate::router;
    use axum::body::Body;
    use axum::http::Request;
    use axum::Router;
    use marshal_core::{ControlPlane, ControlPlaneConfig, EventBus};
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state(token: Option<&str>) -> Arc<SharedState> {
        let bus = Arc::new(EventBus::new());
        let approvals = Arc::new(HttpApprover::new(Arc::clone(&bus)));
        let mut config = ControlPlaneConfig::default();
        config.processes.shell_prefix = Some("/bin/sh -c".to_string());
        let plane = ControlPlane::builder()
            .config(config)
            .event_bus(bus)
            .remote_approver(approvals.clone())
            .build();
        Arc::new(SharedState::new(plane, approvals).with_auth_token(token.map(String::from)))
    }

    async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[test]
    fn api_response_omits_empty_fields() {
        let (_, Json(success)) = ok(json!({"k": "v"}));
        let json = serde_json::to_string(&success).unwrap();
        assert!(json.contains("\"success\":true"));
        assert!(!json.contains("error"));

        let (status, Json(failure)) = fail(StatusCode::BAD_REQUEST, "nope");
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let json = serde_json::to_string(&failure).unwrap();
        assert!(json.contains("\"success\":false"));
        assert!(!json.contains("data"));
    }

    #[test]
    fn process_errors_map_to_statuses() {
        let (status, _) = process_failure(ProcessError::NotFound("x".into()));
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = process_failure(ProcessError::AlreadyExited("x".into()));
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[test]
    fn execute_request_defaults() {
        let request: ExecuteRequest = serde_json::from_str(r#"{"name": "process"}"#).unwrap();
        assert!(request.args.is_null());
        assert_eq!(request.origin, Origin::Interactive);
    }

    mod dispatch {
        use super::*;

        #[tokio::test]
        async fn lists_capabilities() {
            let (status, body) = send(router(test_state(None)), "GET", "/api/capabilities", None).await;
            assert_eq!(status, StatusCode::OK);
            let names: Vec<&str> = body["data"]
                .as_array()
                .unwrap()
                .iter()
                .map(|c| c["name"].as_str().unwrap())
                .collect();
            assert_eq!(names, vec!["process", "shell"]);
        }

        #[tokio::test]
        async fn executes_by_name() {
            let (status, body) = send(
                router(test_state(None)),
                "POST",
                "/api/execute",
                Some(json!({"name": "process", "args": {"action": "list"}})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["data"]["content"], "No background sessions.");
            assert_eq!(body["data"]["isError"], false);
        }

        #[tokio::test]
        async fn unknown_capability_is_an_error_result() {
            let (status, body) = send(
                router(test_state(None)),
                "POST",
                "/api/execute",
                Some(json!({"name": "bash", "args": {}})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["data"]["isError"], true);
            assert!(body["data"]["content"]
                .as_str()
                .unwrap()
                .contains("Unknown capability 'bash'"));
        }

        #[tokio::test]
        async fn scheduler_origin_is_rejected() {
            let (status, body) = send(
                router(test_state(None)),
                "POST",
                "/api/execute",
                Some(json!({"name": "shell", "args": {"command": "ls"}, "origin": "scheduler"})),
            )
            .await;
            assert_eq!(status, StatusCode::FORBIDDEN);
            assert_eq!(body["success"], false);
        }

        #[tokio::test]
        async fn restricted_origin_is_denied() {
            let (_, body) = send(
                router(test_state(None)),
                "POST",
                "/api/execute",
                Some(json!({"name": "shell", "args": {"command": "ls"}, "origin": "plugin"})),
            )
            .await;
            assert_eq!(body["data"]["isError"], true);
            assert!(body["data"]["content"].as_str().unwrap().contains("plugin"));
        }
    }

    mod approvals {
        use super::*;

        async fn wait_for_pending(state: &SharedState) -> String {
            for _ in 0..200 {
                if let Some(p) = state.approvals.list().into_iter().next() {
                    return p.id;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("approval was never requested");
        }

        #[tokio::test]
        async fn denial_over_http_reaches_the_caller() {
            let state = test_state(None);
            let app = router(Arc::clone(&state));

            let call = tokio::spawn(send(
                app.clone(),
                "POST",
                "/api/execute",
                Some(json!({"name": "shell", "args": {"command": "make deploy"}})),
            ));

            let id = wait_for_pending(&state).await;
            let (status, listed) = send(app.clone(), "GET", "/api/approvals", None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(listed["data"][0]["summary"], "make deploy");

            let (status, _) = send(
                app.clone(),
                "POST",
                &format!("/api/approvals/{id}"),
                Some(json!({"decision": "deny"})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);

            let (_, body) = call.await.unwrap();
            assert_eq!(body["data"]["isError"], true);
            assert!(body["data"]["content"]
                .as_str()
                .unwrap()
                .contains("was not approved"));
        }

        #[tokio::test]
        async fn resolving_unknown_id_is_not_found() {
            let (status, _) = send(
                router(test_state(None)),
                "POST",
                "/api/approvals/missing",
                Some(json!({"decision": "approve_once"})),
            )
            .await;
            assert_eq!(status, StatusCode::NOT_FOUND);
        }

        #[tokio::test]
        async fn autonomous_toggle() {
            let state = test_state(None);
            let app = router(Arc::clone(&state));

            let (_, body) = send(app.clone(), "GET", "/api/autonomous", None).await;
            assert_eq!(body["data"]["enabled"], false);

            let (_, body) = send(
                app.clone(),
                "POST",
                "/api/autonomous",
                Some(json!({"enabled": true})),
            )
            .await;
            assert_eq!(body["data"]["enabled"], true);
            assert!(state.plane.is_autonomous());
        }
    }

    mod sessions {
        use super::*;

        #[tokio::test]
        async fn invalid_state_filter() {
            let (status, _) =
                send(router(test_state(None)), "GET", "/api/sessions?state=zombie", None).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }

        #[tokio::test]
        async fn unknown_session_is_not_found() {
            let app = router(test_state(None));
            for (method, uri) in [
                ("GET", "/api/sessions/nope"),
                ("POST", "/api/sessions/nope/poll"),
                ("GET", "/api/sessions/nope/log"),
                ("POST", "/api/sessions/nope/kill"),
                ("DELETE", "/api/sessions/nope"),
            ] {
                let (status, _) = send(app.clone(), method, uri, None).await;
                assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
            }
        }

        #[cfg(unix)]
        #[tokio::test]
        async fn session_lifecycle() {
            let state = test_state(None);
            let app = router(Arc::clone(&state));
            let session = state
                .plane
                .processes
                .spawn("echo ready; cat", None, 0)
                .await
                .unwrap();
            let id = session.id().to_string();

            let (_, body) = send(app.clone(), "GET", "/api/sessions?state=running", None).await;
            assert_eq!(body["data"][0]["id"], id.as_str());

            let (status, _) = send(
                app.clone(),
                "POST",
                &format!("/api/sessions/{id}/stdin"),
                Some(json!({"data": "ping\n", "eof": true})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);

            state.plane.processes.wait_exit(&id).await.unwrap();

            let (_, body) = send(app.clone(), "POST", &format!("/api/sessions/{id}/poll"), None).await;
            assert_eq!(body["data"]["stdout"], "ready\nping\n");
            assert_eq!(body["data"]["exited"], true);
            assert_eq!(body["data"]["exitCode"], 0);

            let (_, body) = send(app.clone(), "GET", &format!("/api/sessions/{id}/log?tail=1"), None).await;
            assert_eq!(body["data"]["log"], "ping\n");

            let (status, _) = send(app.clone(), "POST", &format!("/api/sessions/{id}/kill"), None).await;
            assert_eq!(status, StatusCode::CONFLICT);

            let (status, _) = send(app.clone(), "DELETE", &format!("/api/sessions/{id}"), None).await;
            assert_eq!(status, StatusCode::OK);
            assert!(state.plane.processes.get(&id).is_none());
        }
    }

    mod auth {
        use super::*;

        #[tokio::test]
        async fn token_is_enforced() {
            let app = router(test_state(Some("s3cret")));

            let (status, _) = send(app.clone(), "GET", "/api/capabilities", None).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);

            let request = Request::builder()
                .uri("/api/capabilities")
                .header("Authorization", "Bearer s3cret")
                .body(Body::empty())
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);

            let (status, _) = send(app, "GET", "/api/capabilities?token=s3cret", None).await;
            assert_eq!(status, StatusCode::OK);
        }

        fn from_origin(method: &str, uri: &str, origin: &str, body: Value) -> Request<Body> {
            Request::builder()
                .method(method)
                .uri(uri)
                .header("Origin", origin)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap()
        }

        #[tokio::test]
        async fn foreign_origin_cannot_enable_autonomous_mode() {
            let state = test_state(None);
            let app = router(Arc::clone(&state));

            let request = from_origin(
                "POST",
                "/api/autonomous",
                "https://evil.example",
                json!({"enabled": true}),
            );
            let response = app.oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
            assert!(response
                .headers()
                .get("access-control-allow-origin")
                .is_none());
            assert!(!state.plane.is_autonomous());
        }

        #[tokio::test]
        async fn foreign_origin_cannot_execute() {
            let state = test_state(None);
            let app = router(Arc::clone(&state));

            let request = from_origin(
                "POST",
                "/api/execute",
                "https://evil.example",
                json!({"name": "shell", "args": {"command": "echo pwned"}}),
            );
            let response = app.oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
            assert_eq!(state.plane.processes.running_count(), 0);
            assert_eq!(state.plane.processes.finished_count(), 0);
        }

        #[tokio::test]
        async fn foreign_origin_refused_even_with_token() {
            let app = router(test_state(Some("s3cret")));
            let mut request = from_origin(
                "POST",
                "/api/autonomous",
                "https://evil.example",
                json!({"enabled": true}),
            );
            request
                .headers_mut()
                .insert("Authorization", "Bearer s3cret".parse().unwrap());
            let response = app.oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
        }

        #[tokio::test]
        async fn allowed_origin_gets_cors_headers() {
            let state = Arc::new(
                (*test_state(None))
                    .clone()
                    .with_allowed_origins(["http://localhost:5173".to_string()]),
            );
            let app = router(Arc::clone(&state));

            let request = from_origin(
                "POST",
                "/api/autonomous",
                "http://localhost:5173",
                json!({"enabled": true}),
            );
            let response = app.oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                response.headers().get("access-control-allow-origin").unwrap(),
                "http://localhost:5173"
            );
            assert!(state.plane.is_autonomous());
        }
    }
}
