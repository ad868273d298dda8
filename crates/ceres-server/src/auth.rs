use std::sync::Arc;

use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;

use ceres_core::{Actor, Role};

use crate::dto::ErrorResponse;
use crate::state::AppState;

/// Bearer tokens accepted by the API. The admin token grants `Admin`, the
/// optional viewer token grants read-only `Viewer`.
#[derive(Debug, Clone, Default)]
pub struct AuthTokens {
    pub admin: Option<String>,
    pub viewer: Option<String>,
}

impl AuthTokens {
    /// Reads `ADMIN_TOKEN` and `VIEWER_TOKEN`. Empty values count as unset.
    pub fn from_env() -> Self {
        let read = |name| std::env::var(name).ok().filter(|v: &String| !v.is_empty());
        Self {
            admin: read("ADMIN_TOKEN"),
            viewer: read("VIEWER_TOKEN"),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.admin.is_some() || self.viewer.is_some()
    }

    /// Maps a presented token to the actor it authenticates.
    pub fn resolve(&self, token: &str) -> Option<Actor> {
        let matches = |expected: &Option<String>| {
            expected
                .as_deref()
                .is_some_and(|e| bool::from(token.as_bytes().ct_eq(e.as_bytes())))
        };
        if matches(&self.admin) {
            Some(Actor::new("admin-token", Role::Admin))
        } else if matches(&self.viewer) {
            Some(Actor::new("viewer-token", Role::Viewer))
        } else {
            None
        }
    }
}

fn reject(status: StatusCode, error: &str, message: &str) -> Response {
    let body = ErrorResponse {
        error: error.to_string(),
        message: message.to_string(),
        retry_after_secs: None,
    };
    (status, axum::Json(body)).into_response()
}

/// Middleware that validates `Authorization: Bearer <token>` and stores the
/// resolved [`Actor`] in the request extensions.
pub async fn authenticate(
    State(state): State<Arc<AppState>>,
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if !state.tokens.is_configured() {
        return reject(
            StatusCode::FORBIDDEN,
            "forbidden",
            "API disabled: set ADMIN_TOKEN to enable it",
        );
    }

    let actor = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .and_then(|token| state.tokens.resolve(token.trim()));

    let Some(actor) = actor else {
        return reject(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Missing or invalid Authorization header. Expected: Bearer <token>",
        );
    };

    request.extensions_mut().insert(actor);
    next.run(request).await
}
