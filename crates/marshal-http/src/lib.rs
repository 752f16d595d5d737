//! HTTP and WebSocket surface for marshal.
//!
//! Exposes capability dispatch, session management and remote approvals via
//! REST, and the control plane's event bus via WebSocket.

pub mod approvals;
mod auth;
mod error;
mod routes;
mod state;
mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use axum::http::HeaderValue;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

pub use approvals::{HttpApprover, PendingApproval};
pub use error::HttpError;
pub use routes::ApiResponse;
pub use state::SharedState;

/// Build the full application router.
///
/// CORS is only enabled for the configured origins; any other browser
/// origin is refused before authentication.
pub fn router(state: Arc<SharedState>) -> Router {
    let cors = cors_layer(&state.allowed_origins);
    let app = Router::new()
        .route("/api/execute", post(routes::execute_handler))
        .route("/api/capabilities", get(routes::capabilities_handler))
        .route("/api/sessions", get(routes::list_sessions_handler))
        .route(
            "/api/sessions/{id}",
            get(routes::get_session_handler).delete(routes::remove_session_handler),
        )
        .route("/api/sessions/{id}/poll", post(routes::poll_session_handler))
        .route("/api/sessions/{id}/log", get(routes::session_log_handler))
        .route("/api/sessions/{id}/stdin", post(routes::session_stdin_handler))
        .route("/api/sessions/{id}/kill", post(routes::kill_session_handler))
        .route("/api/approvals", get(routes::list_approvals_handler))
        .route("/api/approvals/{id}", post(routes::resolve_approval_handler))
        .route(
            "/api/autonomous",
            get(routes::get_autonomous_handler).post(routes::set_autonomous_handler),
        )
        .route("/ws/events", get(websocket::ws_handler))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::auth_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::origin_middleware,
        ));
    let app = match cors {
        Some(cors) => app.layer(cors),
        None => app,
    };
    app.with_state(state)
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                log::warn!("ignoring invalid allowed origin: {}", origin);
                None
            }
        })
        .collect();
    if origins.is_empty() {
        return None;
    }
    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

/// Handle to a running HTTP server.
#[derive(Default)]
pub struct HttpServerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl HttpServerHandle {
    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// The bound address (useful when started on port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stop the server gracefully and wait for in-flight requests.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                log::warn!("HTTP server task ended abnormally: {}", err);
            }
        }
    }
}

/// Bind `host:port` and serve on the current runtime.
///
/// Binding happens before this returns, so address and port errors surface
/// here rather than in the background task.
pub async fn start(
    state: Arc<SharedState>,
    host: &str,
    port: u16,
) -> Result<HttpServerHandle, HttpError> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|_| HttpError::InvalidAddress(format!("{}:{}", host, port)))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| HttpError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    let local_addr = listener.local_addr().ok();
    log::info!(
        "HTTP server listening on http://{}",
        local_addr.unwrap_or(addr)
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let app = router(state);
    let task = tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                shutdown_rx.await.ok();
                log::info!("HTTP server shutting down");
            })
            .await;
        if let Err(err) = served {
            log::error!("HTTP server error: {}", err);
        }
    });

    Ok(HttpServerHandle {
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
        local_addr,
    })
}

// ============================================================================
// TESTS
// ============================================================================
