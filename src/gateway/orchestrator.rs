use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::config::GatewayConfig;
use super::retrieval::{self, Retriever};
use super::sessions::{SessionId, SessionSlot, SessionStore};
use super::{ChatBackend, GatewayError};
use crate::Message;
use crate::utils::text::clamp_bytes;

#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub session: SessionId,
    pub message: String,
    /// Falls back to the configured default model when `None` or blank.
    pub model: Option<String>,
    /// Whether to consult the retriever for this call.
    pub augment: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatReply {
    pub content: String,
    pub model: String,
    pub truncated_input: bool,
    pub truncated_output: bool,
    pub snippets: usize,
}

/// Runs one exchange against a session: clamp, augment, append, snapshot, call, then
/// either record the reply or roll the user turn back.
pub struct ChatOrchestrator {
    backend: Arc<dyn ChatBackend>,
    retriever: Arc<dyn Retriever>,
    default_model: String,
    max_message_bytes: usize,
    snapshot_max_messages: usize,
    request_timeout: Duration,
}

impl ChatOrchestrator {
    pub fn new(
        config: &GatewayConfig,
        backend: Arc<dyn ChatBackend>,
        retriever: Arc<dyn Retriever>,
    ) -> Self {
        Self {
            backend,
            retriever,
            default_model: config.default_model.clone(),
            max_message_bytes: config.max_message_bytes,
            snapshot_max_messages: config.snapshot_max_messages.max(1),
            request_timeout: config.request_timeout(),
        }
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = retriever;
        self
    }

    pub async fn run(
        &self,
        sessions: &SessionStore,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatReply, GatewayError> {
        let input = clamp_bytes(&request.message, self.max_message_bytes);
        if input.truncated {
            tracing::info!(session = %request.session, "inbound message truncated");
        }

        let snippets = if request.augment {
            match retrieval::sanitize_query(&input.text) {
                Some(query) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                    found = self.retriever.search(&query) => found,
                },
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };

        let model = request
            .model
            .filter(|model| !model.trim().is_empty())
            .unwrap_or_else(|| self.default_model.clone());

        let slot = sessions.slot(&request.session);
        let _turn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            guard = slot.turn.lock() => guard,
        };

        slot.push(Message::user(input.text), sessions.max_history());
        let pending = PendingTurn::new(Arc::clone(&slot));
        let mut messages = slot.entries();
        if messages.len() > self.snapshot_max_messages {
            messages.drain(..messages.len() - self.snapshot_max_messages);
        }
        if !snippets.is_empty() {
            messages.push(retrieval::augmentation_message(&snippets));
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
            result = tokio::time::timeout(self.request_timeout, self.backend.chat(&model, &messages)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::BackendUnavailable {
                        message: format!(
                            "backend did not answer within {}s",
                            self.request_timeout.as_secs()
                        ),
                    }),
                }
            }
        };

        let content = match outcome {
            Ok(content) => content,
            Err(err) => {
                drop(pending);
                tracing::warn!(session = %request.session, model = %model, error = %err, "chat exchange failed; user turn rolled back");
                return Err(err);
            }
        };

        let output = clamp_bytes(&content, self.max_message_bytes);
        pending.answer(Message::assistant(output.text.clone()), sessions.max_history());
        tracing::debug!(session = %request.session, model = %model, snippets = snippets.len(), "chat exchange completed");

        Ok(ChatReply {
            content: output.text,
            model,
            truncated_input: input.truncated,
            truncated_output: output.truncated,
            snippets: snippets.len(),
        })
    }
}

/// The user turn of an exchange that has not been answered yet. Dropping it unanswered,
/// whether on error, cancellation or unwinding, takes the turn back out of the session.
/// Must be dropped before the slot's `turn` guard is released.
struct PendingTurn {
    slot: Arc<SessionSlot>,
    armed: bool,
}

impl PendingTurn {
    fn new(slot: Arc<SessionSlot>) -> Self {
        Self { slot, armed: true }
    }

    fn answer(mut self, reply: Message, cap: usize) {
        self.slot.push(reply, cap);
        self.armed = false;
    }
}

impl Drop for PendingTurn {
    fn drop(&mut self) {
        if self.armed {
            self.slot.pop_user();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Role;
    use crate::gateway::retrieval::NoRetrieval;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<Vec<Message>>>,
        fail: bool,
    }

    #[async_trait]
    impl ChatBackend for Recording {
        async fn chat(&self, _model: &str, messages: &[Message]) -> Result<String, GatewayError> {
            self.seen.lock().unwrap().push(messages.to_vec());
            if self.fail {
                return Err(GatewayError::BackendRejected { status: 503 });
            }
            Ok(format!("echo {}", messages.len()))
        }
    }

    struct Fixed;

    #[async_trait]
    impl Retriever for Fixed {
        async fn search(&self, _query: &str) -> Vec<String> {
            vec!["fact one".to_string()]
        }
    }

    fn orchestrator(backend: Arc<Recording>, config: &GatewayConfig) -> ChatOrchestrator {
        ChatOrchestrator::new(config, backend, Arc::new(NoRetrieval))
    }

    fn request(text: &str) -> ChatRequest {
        ChatRequest {
            session: SessionId::Key("k".to_string()),
            message: text.to_string(),
            model: None,
            augment: false,
        }
    }

    #[tokio::test]
    async fn success_appends_user_and_assistant_turns() {
        let config = GatewayConfig::default();
        let backend = Arc::new(Recording::default());
        let sessions = SessionStore::new(config.max_history);
        let reply = orchestrator(backend, &config)
            .run(&sessions, request("hello"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reply.content, "echo 1");
        assert_eq!(reply.model, "llama2");
        let history = sessions.snapshot(&SessionId::Key("k".to_string()));
        let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn failure_rolls_back_the_user_turn() {
        let config = GatewayConfig::default();
        let backend = Arc::new(Recording {
            fail: true,
            ..Recording::default()
        });
        let sessions = SessionStore::new(config.max_history);
        let err = orchestrator(backend, &config)
            .run(&sessions, request("hello"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::BackendRejected { status: 503 }));
        assert_eq!(sessions.len(&SessionId::Key("k".to_string())), 0);
    }

    #[tokio::test]
    async fn snapshot_is_capped_and_augmentation_is_not_stored() {
        let config = GatewayConfig {
            snapshot_max_messages: 3,
            ..GatewayConfig::default()
        };
        let backend = Arc::new(Recording::default());
        let sessions = SessionStore::new(config.max_history);
        let orchestrator = orchestrator(Arc::clone(&backend), &config).with_retriever(Arc::new(Fixed));

        for text in ["a", "b", "c"] {
            orchestrator
                .run(&sessions, request(text), &CancellationToken::new())
                .await
                .unwrap();
        }
        let mut augmented = request("what is rust?");
        augmented.augment = true;
        let reply = orchestrator
            .run(&sessions, augmented, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.snippets, 1);

        let seen = backend.seen.lock().unwrap();
        let last = seen.last().unwrap();
        assert_eq!(last.len(), 4);
        assert_eq!(last[2].content, "what is rust?");
        assert_eq!(last[3].role, Role::System);

        let stored = sessions.snapshot(&SessionId::Key("k".to_string()));
        assert!(stored.iter().all(|m| m.role != Role::System));
        assert_eq!(stored.len(), 8);
    }

    struct Panicking;

    #[async_trait]
    impl ChatBackend for Panicking {
        async fn chat(&self, _model: &str, _messages: &[Message]) -> Result<String, GatewayError> {
            panic!("backend blew up");
        }
    }

    struct Stalled;

    #[async_trait]
    impl ChatBackend for Stalled {
        async fn chat(&self, _model: &str, _messages: &[Message]) -> Result<String, GatewayError> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn unwinding_backend_leaves_no_user_turn() {
        let config = GatewayConfig::default();
        let sessions = Arc::new(SessionStore::new(config.max_history));
        let orchestrator = ChatOrchestrator::new(&config, Arc::new(Panicking), Arc::new(NoRetrieval));

        let task = {
            let sessions = Arc::clone(&sessions);
            tokio::spawn(async move {
                orchestrator
                    .run(&sessions, request("hello"), &CancellationToken::new())
                    .await
            })
        };
        assert!(task.await.unwrap_err().is_panic());
        assert_eq!(sessions.len(&SessionId::Key("k".to_string())), 0);

        // The turn lock was released too.
        let slot = sessions.slot(&SessionId::Key("k".to_string()));
        assert!(slot.turn.try_lock().is_ok());
    }

    #[tokio::test]
    async fn aborted_exchange_leaves_no_user_turn() {
        let config = GatewayConfig::default();
        let sessions = Arc::new(SessionStore::new(config.max_history));
        let orchestrator = ChatOrchestrator::new(&config, Arc::new(Stalled), Arc::new(NoRetrieval));

        let task = {
            let sessions = Arc::clone(&sessions);
            tokio::spawn(async move {
                orchestrator
                    .run(&sessions, request("hello"), &CancellationToken::new())
                    .await
            })
        };
        while sessions.len(&SessionId::Key("k".to_string())) == 0 {
            tokio::task::yield_now().await;
        }
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(sessions.len(&SessionId::Key("k".to_string())), 0);
    }

    #[tokio::test]
    async fn cancelled_before_the_call_leaves_the_session_untouched() {
        let config = GatewayConfig::default();
        let backend = Arc::new(Recording::default());
        let sessions = SessionStore::new(config.max_history);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orchestrator(backend, &config)
            .run(&sessions, request("hello"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled));
        assert_eq!(sessions.len(&SessionId::Key("k".to_string())), 0);
    }
}
