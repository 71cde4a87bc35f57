//! Request authentication.
//!
//! Two schemes, both header-based:
//! - Admin: `X-API-Key: <shared key>` — hashed once at startup, compared in
//!   constant time.
//! - Agent: `X-Agent-Token: <plaintext>` + `X-Server-GUID: <uuid>` — the
//!   credential is looked up by GUID and the token hash verified; revoked
//!   credentials never authenticate.
//!
//! Handlers read the resolved [`Principal`] from request extensions.

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use hlh_domain::Error;
use hlh_store::credentials;

use crate::api::error::ApiError;
use crate::state::AppState;
use crate::tokens::verify_token;

/// Who the request is acting as.
#[derive(Debug, Clone)]
pub enum Principal {
    Admin,
    Agent { server_guid: String },
}

fn unauthorized() -> Response {
    ApiError(Error::Unauthenticated).into_response()
}

fn admin_key_matches(state: &AppState, req: &Request<Body>) -> bool {
    let Some(expected_hash) = &state.admin_key_hash else {
        // No key configured: admin surface is closed, not open.
        return false;
    };
    let provided = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let provided_hash = Sha256::digest(provided.as_bytes());
    bool::from(provided_hash.ct_eq(expected_hash.as_slice()))
}

/// Admin-only routes.
pub async fn require_admin(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    if !admin_key_matches(&state, &req) {
        return unauthorized();
    }
    req.extensions_mut().insert(Principal::Admin);
    next.run(req).await
}

/// Heartbeat route: admin key OR per-agent token + GUID.
pub async fn require_agent_or_admin(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    if admin_key_matches(&state, &req) {
        req.extensions_mut().insert(Principal::Admin);
        return next.run(req).await;
    }

    let token = req
        .headers()
        .get("x-agent-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let guid = req
        .headers()
        .get("x-server-guid")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if token.is_empty() || guid.is_empty() {
        return unauthorized();
    }

    let mut conn = match state.store.acquire().await {
        Ok(conn) => conn,
        Err(e) => return ApiError(e).into_response(),
    };
    let credential = match credentials::active_credential_for_guid(&mut conn, &guid).await {
        Ok(Some(credential)) => credential,
        Ok(None) => return unauthorized(),
        Err(e) => return ApiError(e).into_response(),
    };

    if credential.is_revoked() || !verify_token(&token, &credential.api_token_hash) {
        return unauthorized();
    }

    if let Err(e) = credentials::touch_last_used(&mut conn, credential.id).await {
        tracing::warn!(error = %e, "failed to update credential last_used_at");
    }
    drop(conn);

    req.extensions_mut().insert(Principal::Agent {
        server_guid: guid,
    });
    next.run(req).await
}
