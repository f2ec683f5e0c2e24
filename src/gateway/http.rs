mod admin;
mod extract;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::{AuthFailure, Gateway, GatewayConfig, GatewayError};
use extract::InboundRequest;

const MESSAGE_FIELDS: [&str; 2] = ["message", "Message"];
const MODEL_FIELDS: [&str; 2] = ["model", "Model"];

/// Response body for every outcome. The HTTP status mirrors `code`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub code: u16,
    pub message: String,
    pub data: Option<Value>,
}

impl Envelope {
    pub fn success(data: Value) -> Self {
        Self {
            code: 200,
            message: "Success".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl From<&GatewayError> for Envelope {
    fn from(err: &GatewayError) -> Self {
        let message = match err {
            GatewayError::Unauthorized(AuthFailure::MissingKey) => "Missing API Key".to_string(),
            GatewayError::Unauthorized(AuthFailure::UnknownKey | AuthFailure::ExpiredKey) => {
                "Invalid or expired API Key".to_string()
            }
            GatewayError::Unauthorized(AuthFailure::IpBlocked) => "IP address blocked".to_string(),
            GatewayError::Unauthorized(AuthFailure::IpNotAllowed) => {
                "IP address not allowed".to_string()
            }
            GatewayError::RateLimited { .. } => "Too many requests".to_string(),
            GatewayError::OverCapacity => "Too many concurrent requests".to_string(),
            GatewayError::MissingMessage => "Missing message".to_string(),
            GatewayError::Timeout | GatewayError::Cancelled => "Request timeout".to_string(),
            GatewayError::Internal { message } => message.clone(),
            other => other.to_string(),
        };
        Envelope::error(err.code(), message)
    }
}

impl IntoResponse for Envelope {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

#[derive(Clone)]
pub struct GatewayHttpState {
    gateway: Arc<Gateway>,
    admin_token: Option<String>,
}

impl GatewayHttpState {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            admin_token: None,
        }
    }

    /// Enables the `/admin/*` routes, guarded by this token.
    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.admin_token = (!token.trim().is_empty()).then_some(token);
        self
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub fn router(state: GatewayHttpState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/chat", post(handle_chat))
        .route("/api/chat", post(handle_chat))
        .route("/models", get(handle_models))
        .route("/api/models", get(handle_models));

    if state.admin_token.is_some() {
        router = router.merge(admin::router());
    }

    router.with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn metrics(State(state): State<GatewayHttpState>) -> Json<super::observability::ObservabilitySnapshot> {
    Json(state.gateway.observability())
}

/// Network policy and credentials: the part of every keyed route that runs before any
/// per-key accounting. Returns the validated key.
fn authorize(
    state: &GatewayHttpState,
    peer: Option<IpAddr>,
    inbound: &InboundRequest,
) -> Result<String, GatewayError> {
    let gateway = &state.gateway;
    check_peer(gateway.config(), peer).inspect_err(|_| {
        gateway.counters().record_auth_failure();
        tracing::info!(ip = ?peer, "request refused by address policy");
    })?;

    let key = extract::extract_credential(inbound);
    gateway.authenticate(key.as_deref()).map(|record| record.key)
}

/// Denylist first, then the allowlist when one is configured. A connection without a known
/// peer address only passes when no allowlist is set.
fn check_peer(config: &GatewayConfig, peer: Option<IpAddr>) -> Result<(), GatewayError> {
    if peer.is_some_and(|ip| config.ip_denylist.contains(&ip)) {
        return Err(GatewayError::Unauthorized(AuthFailure::IpBlocked));
    }
    if !config.ip_allowlist.is_empty() && !peer.is_some_and(|ip| config.ip_allowlist.contains(&ip)) {
        return Err(GatewayError::Unauthorized(AuthFailure::IpNotAllowed));
    }
    Ok(())
}

async fn handle_chat(
    State(state): State<GatewayHttpState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Envelope {
    let gateway = Arc::clone(&state.gateway);
    gateway.counters().record_request();

    let inbound = InboundRequest::parse(&uri, &headers, &body);
    let peer = connect_info.map(|ConnectInfo(addr)| addr.ip());
    let key = match authorize(&state, peer, &inbound) {
        Ok(key) => key,
        Err(err) => return Envelope::from(&err),
    };

    let permit = match gateway.admit(&key) {
        Ok(permit) => permit,
        Err(err) => return Envelope::from(&err),
    };

    let Some(message) = inbound.field(&MESSAGE_FIELDS) else {
        return Envelope::from(&GatewayError::MissingMessage);
    };
    let model = inbound.field(&MODEL_FIELDS);

    // Cancels the exchange if this handler times out or the client goes away.
    let cancel = CancellationToken::new();
    let _cancel_on_exit = cancel.clone().drop_guard();

    let wait = gateway.config().response_wait();
    let task_gateway = Arc::clone(&gateway);
    let mut task = tokio::spawn(async move {
        task_gateway
            .dispatch(permit, &key, message, model, &cancel)
            .await
    });

    match tokio::time::timeout(wait, &mut task).await {
        Ok(Ok(Ok(reply))) => Envelope::success(json!({ "response": reply.content })),
        Ok(Ok(Err(err))) => Envelope::from(&err),
        Ok(Err(join_err)) => {
            tracing::error!(error = %join_err, "chat task failed");
            gateway.counters().record_backend_error();
            Envelope::from(&GatewayError::Internal {
                message: "chat exchange failed".to_string(),
            })
        }
        Err(_) => {
            tracing::warn!(wait_secs = wait.as_secs(), "chat response wait elapsed; cancelling exchange");
            Envelope::from(&GatewayError::Timeout)
        }
    }
}

async fn handle_models(
    State(state): State<GatewayHttpState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    uri: Uri,
    headers: HeaderMap,
) -> Envelope {
    let gateway = &state.gateway;
    gateway.counters().record_request();

    let inbound = InboundRequest::parse(&uri, &headers, &[]);
    let peer = connect_info.map(|ConnectInfo(addr)| addr.ip());
    let key = match authorize(&state, peer, &inbound) {
        Ok(key) => key,
        Err(err) => return Envelope::from(&err),
    };
    if let Err(err) = gateway.check_rate_limit(&key) {
        return Envelope::from(&err);
    }

    let models = gateway.models().await;
    Envelope::success(json!({ "models": models }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelopes_carry_the_taxonomy_code() {
        let cases = [
            (GatewayError::Unauthorized(AuthFailure::MissingKey), 401, "Missing API Key"),
            (
                GatewayError::Unauthorized(AuthFailure::ExpiredKey),
                401,
                "Invalid or expired API Key",
            ),
            (GatewayError::Unauthorized(AuthFailure::IpBlocked), 403, "IP address blocked"),
            (
                GatewayError::Unauthorized(AuthFailure::IpNotAllowed),
                403,
                "IP address not allowed",
            ),
            (GatewayError::OverCapacity, 429, "Too many concurrent requests"),
            (GatewayError::MissingMessage, 400, "Missing message"),
            (GatewayError::Cancelled, 408, "Request timeout"),
        ];
        for (err, code, message) in cases {
            let envelope = Envelope::from(&err);
            assert_eq!(envelope.code, code);
            assert_eq!(envelope.message, message);
            assert!(envelope.data.is_none());
        }

        let backend = Envelope::from(&GatewayError::BackendRejected { status: 502 });
        assert_eq!(backend.code, 500);
        assert!(backend.message.contains("502"));
    }

    #[test]
    fn envelope_serializes_null_data() {
        let raw = serde_json::to_value(Envelope::error(429, "Too many requests")).unwrap();
        assert_eq!(raw, json!({"code": 429, "message": "Too many requests", "data": null}));
    }

    #[test]
    fn denylist_wins_over_allowlist() {
        let ip: IpAddr = "10.0.0.9".parse().unwrap();
        let config = GatewayConfig {
            ip_denylist: vec![ip],
            ip_allowlist: vec![ip],
            ..GatewayConfig::default()
        };
        assert!(matches!(
            check_peer(&config, Some(ip)),
            Err(GatewayError::Unauthorized(AuthFailure::IpBlocked))
        ));

        let open = GatewayConfig::default();
        assert!(check_peer(&open, None).is_ok());

        let listed = GatewayConfig {
            ip_allowlist: vec![ip],
            ..GatewayConfig::default()
        };
        assert!(matches!(
            check_peer(&listed, None),
            Err(GatewayError::Unauthorized(AuthFailure::IpNotAllowed))
        ));
        assert!(check_peer(&listed, Some(ip)).is_ok());
    }
}
