use std::collections::BTreeMap;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{delete, get};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;

use super::extract::{extract_bearer, extract_header};
use super::{Envelope, GatewayHttpState};
use crate::gateway::CallStats;
use crate::gateway::credentials::redact_key;

pub(super) fn router() -> Router<GatewayHttpState> {
    Router::new()
        .route("/admin/keys", get(list_keys).post(issue_key))
        .route("/admin/keys/:key", delete(revoke_key))
        .route("/admin/stats", get(stats_summary))
}

fn ensure_admin(state: &GatewayHttpState, headers: &HeaderMap) -> Result<(), Envelope> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(Envelope::error(404, "admin auth not configured"));
    };

    let provided = extract_bearer(headers)
        .or_else(|| extract_header(headers, "x-admin-token"))
        .unwrap_or_default();
    if provided != expected {
        return Err(Envelope::error(401, "invalid admin token"));
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TokenQuery {
    include_tokens: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IssueKeyRequest {
    ttl_days: Option<u32>,
}

async fn list_keys(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Envelope {
    if let Err(envelope) = ensure_admin(&state, &headers) {
        return envelope;
    }

    let mut keys = state.gateway.credentials().list();
    if !query.include_tokens {
        for record in &mut keys {
            record.key = redact_key(&record.key);
        }
    }
    Envelope::success(json!({ "keys": keys }))
}

async fn issue_key(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Envelope {
    if let Err(envelope) = ensure_admin(&state, &headers) {
        return envelope;
    }

    let request = if body.iter().all(u8::is_ascii_whitespace) {
        IssueKeyRequest::default()
    } else {
        match serde_json::from_slice::<IssueKeyRequest>(&body) {
            Ok(request) => request,
            Err(err) => return Envelope::error(400, format!("invalid request body: {err}")),
        }
    };

    match state.gateway.issue_key(request.ttl_days) {
        Ok(record) => Envelope::success(json!({ "key": record })),
        Err(err) => {
            tracing::error!(error = %err, "failed to persist issued api key");
            Envelope::error(500, format!("failed to persist key: {err}"))
        }
    }
}

async fn revoke_key(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Envelope {
    if let Err(envelope) = ensure_admin(&state, &headers) {
        return envelope;
    }

    match state.gateway.revoke_key(&key) {
        Ok(true) => Envelope::success(json!({ "revoked": true })),
        Ok(false) => Envelope::error(404, "API key not found"),
        Err(err) => {
            tracing::error!(key_id = %redact_key(&key), error = %err, "failed to persist key revocation");
            Envelope::error(500, format!("failed to persist revocation: {err}"))
        }
    }
}

async fn stats_summary(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Envelope {
    if let Err(envelope) = ensure_admin(&state, &headers) {
        return envelope;
    }

    let mut summary = state.gateway.stats().summary(state.gateway.clock().now());
    if !query.include_tokens {
        summary.api_key_stats = redact_stats_keys(std::mem::take(&mut summary.api_key_stats));
    }
    match serde_json::to_value(summary) {
        Ok(data) => Envelope::success(data),
        Err(err) => Envelope::error(500, err.to_string()),
    }
}

/// Redacted prefixes are short enough to collide; colliding entries get a `#n` suffix so
/// none is lost.
fn redact_stats_keys(stats: BTreeMap<String, CallStats>) -> BTreeMap<String, CallStats> {
    let mut redacted = BTreeMap::new();
    for (key, value) in stats {
        let base = redact_key(&key);
        let mut label = base.clone();
        let mut n = 2;
        while redacted.contains_key(&label) {
            label = format!("{base}#{n}");
            n += 1;
        }
        redacted.insert(label, value);
    }
    redacted
}
