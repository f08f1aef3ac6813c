use axum::{extract::State, response::IntoResponse, Extension, Json};
use serde_json::json;
use tracing::error;

use crate::auth::AuthenticatedUser;
use crate::store::audit::{AuditLogEntry, ACTION_REMOTE_HEALTH};
use crate::AppState;

// ── Health ────────────────────────────────────────────────────────────────────

/// Reachability check for remote installations; also confirms their credentials.
pub async fn health(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
) -> impl IntoResponse {
    let user = caller.user;
    let entry = AuditLogEntry::new(
        user.id.clone(),
        user.nickname.clone(),
        ACTION_REMOTE_HEALTH,
        "server",
        caller.ip,
        true,
    );
    let audit = state.audit.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || audit.add_log(entry)).await {
        error!(error = %e, "audit write task failed");
    }

    Json(json!({
        "status": "ok",
        "nickname": user.nickname,
        "permissions": user.permissions,
    }))
}
