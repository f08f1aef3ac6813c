use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{debug, error, warn};

use crate::probe::USER_TOKEN_HEADER;
use crate::store::audit::{AuditLogEntry, ACTION_AUTH_DENIED};
use crate::store::SharedUser;
use crate::AppState;

/// The verified caller, inserted as a request extension.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user: SharedUser,
    pub ip: String,
}

/// Where a request came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOrigin {
    pub ip: String,
    pub https: bool,
}

/// Resolve the client address and scheme of a request.
///
/// `X-Forwarded-For`, `X-Real-IP` and `X-Forwarded-Proto` are only read when
/// the socket peer passes `is_trusted`. Otherwise the socket address is the
/// client and the connection is plain HTTP, since TLS is never terminated here.
pub fn client_origin(
    headers: &HeaderMap,
    peer: Option<&SocketAddr>,
    is_trusted: impl Fn(&str) -> bool,
) -> ClientOrigin {
    let Some(peer) = peer else {
        return ClientOrigin {
            ip: "unknown".into(),
            https: false,
        };
    };
    let socket_ip = peer.ip().to_string();
    if !is_trusted(&socket_ip) {
        return ClientOrigin {
            ip: socket_ip,
            https: false,
        };
    }

    let forwarded = header_str(headers, "x-forwarded-for")
        .and_then(|xff| xff.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let real_ip = header_str(headers, "x-real-ip")
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let https = header_str(headers, "x-forwarded-proto")
        .is_some_and(|p| p.trim().eq_ignore_ascii_case("https"));

    ClientOrigin {
        ip: forwarded.or(real_ip).map_or(socket_ip, str::to_owned),
        https,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

type Denial = (StatusCode, &'static str);

/// Axum middleware gating a route on a valid `(user token, access token)` pair.
///
/// Expects `Authorization: Bearer <access token>` and `X-User-Token: <user token>`.
/// The checks touch the stores, which write to disk, so they run on the
/// blocking pool.
pub async fn require_shared_user(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(a)| *a);
    let headers = request.headers().clone();

    let outcome =
        tokio::task::spawn_blocking(move || authorize(&state, &headers, peer.as_ref())).await;

    match outcome {
        Ok(Ok(caller)) => {
            request.extensions_mut().insert(caller);
            next.run(request).await
        }
        Ok(Err((status, reason))) => reject(status, reason),
        Err(e) => {
            error!(error = %e, "authorization task failed");
            reject(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    peer: Option<&SocketAddr>,
) -> Result<AuthenticatedUser, Denial> {
    let cfg = state.config.get_config();
    if !cfg.is_enabled {
        return Err((StatusCode::SERVICE_UNAVAILABLE, "sharing is disabled"));
    }

    let origin = client_origin(headers, peer, |ip| state.config.is_trusted_proxy(ip));
    let user_token = header_str(headers, USER_TOKEN_HEADER);
    let access_token =
        header_str(headers, "Authorization").and_then(|v| v.strip_prefix("Bearer "));

    let deny = |status: StatusCode, reason: &'static str| -> Denial {
        let claimed = user_token.and_then(|t| state.users.get_user_by_token(t));
        let (id, nickname) = claimed.map(|u| (u.id, u.nickname)).unwrap_or_default();
        warn!(ip = %origin.ip, reason, "remote request denied");
        state.audit.add_log(
            AuditLogEntry::new(
                id,
                nickname,
                ACTION_AUTH_DENIED,
                "server",
                origin.ip.clone(),
                false,
            )
            .with_details(json!({ "reason": reason })),
        );
        (status, reason)
    };

    if !state.config.is_ip_allowed(&origin.ip) {
        return Err(deny(StatusCode::FORBIDDEN, "address not allowed"));
    }
    if cfg.require_https && !origin.https {
        return Err(deny(StatusCode::FORBIDDEN, "https required"));
    }

    let user = match (user_token, access_token) {
        (Some(u), Some(a)) => state.users.verify_token_pair(u, a),
        _ => None,
    };
    let Some(user) = user else {
        return Err(deny(StatusCode::UNAUTHORIZED, "unauthorized"));
    };

    debug!(id = %user.id, ip = %origin.ip, "remote request authenticated");
    state
        .users
        .update_last_access(&user.id, Some(origin.ip.clone()));
    Ok(AuthenticatedUser {
        user,
        ip: origin.ip,
    })
}
