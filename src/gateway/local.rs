use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

use super::orchestrator::{ChatReply, ChatRequest};
use super::sessions::SessionId;
use super::{ConnectionState, Gateway, GatewayError};

const NOTICE_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub text: String,
    #[serde(with = "super::state_file::timestamp")]
    pub at: OffsetDateTime,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalReply {
    pub reply: Option<String>,
    pub connected: bool,
    pub error_message: Option<String>,
}

/// Entry point for the first-party interactive caller.
///
/// Exchanges run on the gateway's runtime and come back over a oneshot channel, so a UI
/// loop never performs network I/O itself. Local calls use the unkeyed session and skip
/// credentials, rate limiting and admission.
pub struct LocalChannel {
    gateway: Arc<Gateway>,
    runtime: Handle,
    notices: broadcast::Sender<Notice>,
    status: RwLock<ConnectionState>,
    model: RwLock<String>,
    retrieval: AtomicBool,
}

impl LocalChannel {
    pub fn new(gateway: Arc<Gateway>, runtime: Handle) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let model = gateway.config().default_model.clone();
        let retrieval = gateway.config().retrieval.for_local;
        Self {
            gateway,
            runtime,
            notices,
            status: RwLock::new(ConnectionState::Unknown),
            model: RwLock::new(model),
            retrieval: AtomicBool::new(retrieval),
        }
    }

    /// Sends one message on the local session and waits for the outcome.
    pub async fn send_local(&self, text: &str) -> LocalReply {
        match self.start(text) {
            Ok(rx) => self.finish(rx.await.ok()),
            Err(reply) => reply,
        }
    }

    /// Like [`send_local`](Self::send_local) for callers outside any async context.
    /// Must not be called from a runtime worker thread.
    pub fn blocking_send_local(&self, text: &str) -> LocalReply {
        match self.start(text) {
            Ok(rx) => self.finish(rx.blocking_recv().ok()),
            Err(reply) => reply,
        }
    }

    fn start(
        &self,
        text: &str,
    ) -> Result<oneshot::Receiver<Result<ChatReply, GatewayError>>, LocalReply> {
        let text = text.trim();
        if text.is_empty() {
            return Err(LocalReply {
                reply: None,
                connected: self.is_connected(),
                error_message: Some(GatewayError::MissingMessage.to_string()),
            });
        }
        self.notify(NoticeKind::User, text);

        let request = ChatRequest {
            session: SessionId::Local,
            message: text.to_string(),
            model: Some(self.model()),
            augment: self.retrieval.load(Ordering::Relaxed),
        };
        let gateway = Arc::clone(&self.gateway);
        let (tx, rx) = oneshot::channel();
        self.runtime.spawn(async move {
            let result = gateway.chat(request, &CancellationToken::new()).await;
            let _ = tx.send(result);
        });
        Ok(rx)
    }

    fn finish(&self, outcome: Option<Result<ChatReply, GatewayError>>) -> LocalReply {
        let outcome = outcome.unwrap_or_else(|| {
            Err(GatewayError::Internal {
                message: "local exchange task ended without a result".to_string(),
            })
        });
        match outcome {
            Ok(reply) => {
                self.set_status(ConnectionState::Connected);
                self.notify(NoticeKind::Assistant, &reply.content);
                LocalReply {
                    reply: Some(reply.content),
                    connected: true,
                    error_message: None,
                }
            }
            Err(err) => {
                if err.is_backend_failure() {
                    self.set_status(ConnectionState::Disconnected {
                        reason: err.to_string(),
                    });
                }
                self.notify(NoticeKind::System, &format!("request failed: {err}"));
                LocalReply {
                    reply: None,
                    connected: self.is_connected(),
                    error_message: Some(err.to_string()),
                }
            }
        }
    }

    /// Publishes a notice to every subscriber. Having no subscribers is fine.
    pub fn notify(&self, kind: NoticeKind, text: &str) {
        let _ = self.notices.send(Notice {
            kind,
            text: text.to_string(),
            at: self.gateway.clock().now(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn status(&self) -> ConnectionState {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_status(&self, state: ConnectionState) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn is_connected(&self) -> bool {
        matches!(self.status(), ConnectionState::Connected)
    }

    pub fn model(&self) -> String {
        self.model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_model(&self, model: &str) {
        let model = model.trim();
        if model.is_empty() {
            return;
        }
        *self.model.write().unwrap_or_else(PoisonError::into_inner) = model.to_string();
        self.notify(NoticeKind::System, &format!("switched to model: {model}"));
    }

    pub fn set_retrieval(&self, enabled: bool) {
        self.retrieval.store(enabled, Ordering::Relaxed);
    }

    pub fn retrieval_enabled(&self) -> bool {
        self.retrieval.load(Ordering::Relaxed)
    }

    pub fn clear_history(&self) {
        self.gateway.sessions().evict(&SessionId::Local);
        self.notify(NoticeKind::System, "conversation history cleared");
    }

    /// Pings the backend on the gateway's runtime and records the result as the status.
    pub async fn test_connection(&self) -> ConnectionState {
        let gateway = Arc::clone(&self.gateway);
        let state = match self.runtime.spawn(async move { gateway.ping_backend().await }).await {
            Ok(state) => state,
            Err(err) => ConnectionState::Disconnected {
                reason: err.to_string(),
            },
        };
        match &state {
            ConnectionState::Connected => self.notify(NoticeKind::System, "connected to backend"),
            ConnectionState::Disconnected { reason } => {
                self.notify(NoticeKind::System, &format!("cannot reach backend: {reason}"))
            }
            ConnectionState::Unknown => {}
        }
        self.set_status(state.clone());
        state
    }
}
