//! Gateway module (feature-gated).

pub mod admission;
pub mod backend;
pub mod config;
pub mod credentials;
pub mod http;
pub mod limits;
pub mod local;
pub mod memory;
pub mod observability;
pub mod orchestrator;
pub mod retrieval;
pub mod sessions;
pub mod state_file;
pub mod stats;
pub mod telemetry;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::Message;

use admission::AdmissionController;
use credentials::{CredentialStore, KeyValidationError};
use limits::RateLimiter;
use observability::{Observability, ObservabilitySnapshot};
use orchestrator::ChatOrchestrator;
use retrieval::{NoRetrieval, Retriever};
use sessions::SessionStore;
use stats::CallStatsRecorder;

pub use admission::AdmissionPermit;
pub use backend::OllamaBackend;
pub use config::{ConfigError, GatewayConfig, RetrievalConfig};
pub use credentials::ApiKeyRecord;
pub use http::{Envelope, GatewayHttpState};
pub use limits::{RateLimitConfig, RateWindow};
pub use local::{LocalChannel, LocalReply, Notice, NoticeKind};
pub use memory::{MemoryConfig, MemoryGuardian, ReliefReport};
pub use orchestrator::{ChatReply, ChatRequest};
pub use sessions::SessionId;
pub use state_file::StateFileError;
pub use stats::{CallStats, StatsSummary};

pub const KEYS_FILE: &str = "api_keys.json";
pub const STATS_FILE: &str = "api_key_stats.json";
pub const CONFIG_FILE: &str = "config.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailure {
    MissingKey,
    UnknownKey,
    ExpiredKey,
    /// Peer address is on the denylist.
    IpBlocked,
    /// An allowlist is configured and the peer address is not on it.
    IpNotAllowed,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthorized: {0:?}")]
    Unauthorized(AuthFailure),
    #[error("rate limit exceeded: {limit}")]
    RateLimited { limit: String },
    #[error("too many concurrent requests")]
    OverCapacity,
    #[error("missing message")]
    MissingMessage,
    #[error("request timeout")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("backend unavailable: {message}")]
    BackendUnavailable { message: String },
    #[error("backend rejected request with status {status}")]
    BackendRejected { status: u16 },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Envelope code reported to remote callers.
    pub fn code(&self) -> u16 {
        match self {
            GatewayError::Unauthorized(AuthFailure::IpBlocked | AuthFailure::IpNotAllowed) => 403,
            GatewayError::Unauthorized(_) => 401,
            GatewayError::RateLimited { .. } | GatewayError::OverCapacity => 429,
            GatewayError::MissingMessage => 400,
            GatewayError::Timeout | GatewayError::Cancelled => 408,
            GatewayError::BackendUnavailable { .. }
            | GatewayError::BackendRejected { .. }
            | GatewayError::Internal { .. } => 500,
        }
    }

    /// Whether the exchange reached the backend and failed there.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::BackendUnavailable { .. } | GatewayError::BackendRejected { .. }
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Unknown,
    Connected,
    Disconnected {
        reason: String,
    },
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Runs one completion over the full outgoing message list and returns the reply text.
    async fn chat(&self, model: &str, messages: &[Message]) -> Result<String, GatewayError>;

    async fn list_models(&self) -> Vec<String> {
        backend::fallback_models()
    }

    async fn ping(&self) -> ConnectionState {
        ConnectionState::Unknown
    }
}

pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;

    fn now(&self) -> OffsetDateTime {
        let secs = i64::try_from(self.now_epoch_seconds()).unwrap_or(i64::MAX);
        OffsetDateTime::from_unix_timestamp(secs).unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        now.as_secs()
    }
}

/// Clock driven by hand, for exercising windows and expiry.
#[derive(Debug, Default)]
pub struct ManualClock {
    secs: AtomicU64,
}

impl ManualClock {
    pub fn new(start_epoch_seconds: u64) -> Self {
        Self {
            secs: AtomicU64::new(start_epoch_seconds),
        }
    }

    pub fn advance(&self, secs: u64) {
        self.secs.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, epoch_seconds: u64) {
        self.secs.store(epoch_seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch_seconds(&self) -> u64 {
        self.secs.load(Ordering::SeqCst)
    }
}

/// A keyed call as the gateway sees it after extraction.
#[derive(Clone, Debug)]
pub struct KeyedChatRequest {
    pub key: Option<String>,
    pub message: Option<String>,
    pub model: Option<String>,
}

/// Owns every piece of shared per-caller state. Each component synchronizes itself; no
/// method here holds one component's lock while calling into another.
pub struct Gateway {
    config: Arc<GatewayConfig>,
    credentials: CredentialStore,
    limits: RateLimiter,
    stats: CallStatsRecorder,
    sessions: SessionStore,
    admission: AdmissionController,
    orchestrator: ChatOrchestrator,
    observability: Observability,
    backend: Arc<dyn ChatBackend>,
    clock: Arc<dyn Clock>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, backend: impl ChatBackend + 'static) -> Self {
        Self::with_backend(config, Arc::new(backend))
    }

    pub fn with_backend(config: GatewayConfig, backend: Arc<dyn ChatBackend>) -> Self {
        let config = Arc::new(config);
        let orchestrator =
            ChatOrchestrator::new(&config, Arc::clone(&backend), Arc::new(NoRetrieval));
        Self {
            credentials: CredentialStore::default(),
            limits: RateLimiter::new(config.rate_limit),
            stats: CallStatsRecorder::default(),
            sessions: SessionStore::new(config.max_history),
            admission: AdmissionController::new(config.max_concurrent_requests),
            orchestrator,
            observability: Observability::default(),
            backend,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retriever(mut self, retriever: impl Retriever + 'static) -> Self {
        self.orchestrator = self.orchestrator.with_retriever(Arc::new(retriever));
        self
    }

    /// Loads the key set and call statistics from `dir` and persists every later mutation
    /// there. Missing files start empty; malformed ones are logged and replaced by defaults.
    pub fn with_state_dir(mut self, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        self.credentials = CredentialStore::load_or_default(dir.join(KEYS_FILE));
        self.stats = CallStatsRecorder::load_or_default(dir.join(STATS_FILE));
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn limits(&self) -> &RateLimiter {
        &self.limits
    }

    pub fn stats(&self) -> &CallStatsRecorder {
        &self.stats
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn observability(&self) -> ObservabilitySnapshot {
        self.observability.snapshot()
    }

    pub(crate) fn counters(&self) -> &Observability {
        &self.observability
    }

    pub fn issue_key(&self, ttl_days: Option<u32>) -> Result<ApiKeyRecord, StateFileError> {
        let ttl_days = ttl_days.unwrap_or(self.config.key_ttl_days);
        self.credentials.issue(ttl_days, self.clock.now())
    }

    /// Removes the key and its call statistics. Its session and rate window stay behind
    /// until the memory guardian or the window itself clears them.
    pub fn revoke_key(&self, key: &str) -> Result<bool, StateFileError> {
        let removed = self.credentials.revoke(key)?;
        if removed {
            self.stats.remove(key)?;
        }
        Ok(removed)
    }

    pub fn authenticate(&self, key: Option<&str>) -> Result<ApiKeyRecord, GatewayError> {
        let Some(key) = key.map(str::trim).filter(|key| !key.is_empty()) else {
            self.observability.record_auth_failure();
            return Err(GatewayError::Unauthorized(AuthFailure::MissingKey));
        };

        self.credentials
            .validate(key, self.clock.now())
            .map_err(|err| {
                self.observability.record_auth_failure();
                match err {
                    KeyValidationError::NotFound => {
                        GatewayError::Unauthorized(AuthFailure::UnknownKey)
                    }
                    KeyValidationError::Expired { .. } => {
                        GatewayError::Unauthorized(AuthFailure::ExpiredKey)
                    }
                }
            })
    }

    pub fn check_rate_limit(&self, key: &str) -> Result<(), GatewayError> {
        self.limits
            .check_and_consume(key, self.clock.now_epoch_seconds())
            .inspect_err(|_| self.observability.record_rate_limited())
    }

    /// Rate limit then admission. Both are non-blocking so rejection is immediate.
    pub fn admit(&self, key: &str) -> Result<AdmissionPermit, GatewayError> {
        self.check_rate_limit(key)?;
        self.admission
            .try_acquire()
            .inspect_err(|_| self.observability.record_over_capacity())
    }

    /// Runs one exchange on `request.session` through the orchestrator.
    pub async fn chat(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatReply, GatewayError> {
        self.observability.record_backend_call();
        let result = self.orchestrator.run(&self.sessions, request, cancel).await;
        match &result {
            Err(GatewayError::Cancelled) => self.observability.record_timeout(),
            Err(err) if err.is_backend_failure() => self.observability.record_backend_error(),
            _ => {}
        }
        result
    }

    /// Everything after admission for a keyed caller: the exchange itself, then statistics.
    /// The permit is held until the exchange has fully finished, whatever its outcome. A call
    /// that unwinds or is dropped mid-exchange is still counted.
    pub async fn dispatch(
        &self,
        permit: AdmissionPermit,
        key: &str,
        message: String,
        model: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<ChatReply, GatewayError> {
        let request = ChatRequest {
            session: SessionId::Key(key.to_string()),
            message,
            model,
            augment: self.config.retrieval.for_keys,
        };
        let tally = CallTally {
            gateway: self,
            key,
            armed: true,
        };
        let result = self.chat(request, cancel).await;
        drop(permit);

        tally.settle().await;
        result
    }

    /// Full pipeline for an in-process keyed call: credentials, rate limit, admission,
    /// exchange, statistics.
    pub async fn handle(
        &self,
        request: KeyedChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatReply, GatewayError> {
        self.observability.record_request();
        let record = self.authenticate(request.key.as_deref())?;
        let permit = self.admit(&record.key)?;
        let message = request
            .message
            .filter(|message| !message.trim().is_empty())
            .ok_or(GatewayError::MissingMessage)?;
        self.dispatch(permit, &record.key, message, request.model, cancel)
            .await
    }

    pub async fn models(&self) -> Vec<String> {
        self.backend.list_models().await
    }

    pub async fn ping_backend(&self) -> ConnectionState {
        self.backend.ping().await
    }
}

/// Counts an admitted keyed call exactly once: through `settle` on the normal path, or on
/// drop when the exchange unwinds or its future is abandoned.
struct CallTally<'a> {
    gateway: &'a Gateway,
    key: &'a str,
    armed: bool,
}

impl CallTally<'_> {
    async fn settle(mut self) {
        self.armed = false;
        let gateway = self.gateway;
        if let Err(err) = gateway.stats.record(self.key, gateway.clock.now()).await {
            tracing::warn!(
                key_id = %credentials::redact_key(self.key),
                error = %err,
                "failed to persist call statistics"
            );
        }
    }
}

impl Drop for CallTally<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.gateway
                .stats
                .record_detached(self.key, self.gateway.clock.now());
        }
    }
}

