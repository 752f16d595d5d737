//! Shared state for the HTTP server.
//!
//! Wraps the control plane, the remote approval transport, the optional
//! bearer token and the browser origins allowed to call the API.

use std::sync::Arc;

use marshal_core::ControlPlane;

use crate::approvals::HttpApprover;

/// Shared state available to all HTTP handlers.
#[derive(Clone)]
pub struct SharedState {
    pub plane: ControlPlane,
    /// Pending approvals answered through `/api/approvals`.
    pub approvals: Arc<HttpApprover>,
    /// When set, every request must present this token.
    pub auth_token: Option<String>,
    /// Browser origins allowed to call the API, e.g. `http://localhost:5173`.
    /// Requests carrying any other `Origin` header are refused.
    pub allowed_origins: Vec<String>,
}

impl SharedState {
    pub fn new(plane: ControlPlane, approvals: Arc<HttpApprover>) -> Self {
        Self {
            plane,
            approvals,
            auth_token: None,
            allowed_origins: Vec::new(),
        }
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_allowed_origins(mut self, origins: impl IntoIterator<Item = String>) -> Self {
        self.allowed_origins = origins
            .into_iter()
            .map(|o| o.trim_end_matches('/').to_string())
            .filter(|o| !o.is_empty())
            .collect();
        self
    }

    /// Requests without an `Origin` header come from non-browser clients and
    /// are always admitted; browser requests only from a listed origin.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(origin) => self
                .allowed_origins
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(origin)),
        }
    }

    /// True when no token is configured or `token` matches it.
    pub fn validate_token(&self, token: Option<&str>) -> bool {
        match (&self.auth_token, token) {
            (None, _) => true,
            (Some(expected), Some(given)) => constant_time_eq(expected.as_bytes(), given.as_bytes()),
            (Some(_), None) => false,
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use marshal_core::EventBus;

    fn state(token: Option<&str>) -> SharedState {
        let plane = ControlPlane::builder().without_builtin().build();
        let approvals = Arc::new(HttpApprover::new(Arc::new(EventBus::new())));
        SharedState::new(plane, approvals).with_auth_token(token.map(String::from))
    }

    #[test]
    fn no_token_configured_accepts_everything() {
        let state = state(None);
        assert!(state.validate_token(None));
        assert!(state.validate_token(Some("anything")));
    }

    #[test]
    fn configured_token_must_match() {
        let state = state(Some("secret"));
        assert!(state.validate_token(Some("secret")));
        assert!(!state.validate_token(Some("secreT")));
        assert!(!state.validate_token(Some("secret2")));
        assert!(!state.validate_token(None));
    }

    #[test]
    fn empty_token_means_no_auth() {
        assert!(state(Some("")).validate_token(None));
    }

    mod origins {
        use super::*;

        #[test]
        fn non_browser_clients_pass() {
            assert!(state(None).origin_allowed(None));
        }

        #[test]
        fn any_origin_refused_by_default() {
            let state = state(None);
            assert!(!state.origin_allowed(Some("https://evil.example")));
            assert!(!state.origin_allowed(Some("http://localhost:3000")));
            assert!(!state.origin_allowed(Some("null")));
        }

        #[test]
        fn listed_origins_pass() {
            let state = state(None).with_allowed_origins([
                "http://localhost:5173/".to_string(),
                String::new(),
            ]);
            assert_eq!(state.allowed_origins, vec!["http://localhost:5173"]);
            assert!(state.origin_allowed(Some("http://localhost:5173")));
            assert!(state.origin_allowed(Some("HTTP://LOCALHOST:5173")));
            assert!(!state.origin_allowed(Some("http://localhost:5174")));
        }
    }
}
