use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ChatBackend, ConnectionState, GatewayError};
use crate::Message;
use crate::utils::http::send_checked_json;

const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Model names offered when the backend cannot list its own.
pub fn fallback_models() -> Vec<String> {
    ["llama2", "mistral", "codellama"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Serialize)]
struct ChatPayload<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

/// Client for a local Ollama-style server (`/api/chat`, `/api/tags`).
#[derive(Clone)]
pub struct OllamaBackend {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaBackend {
    /// `timeout` bounds each chat call end to end.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| GatewayError::Internal {
                message: format!("backend http client error: {err}"),
            })?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn fetch_tags(&self, timeout: Option<Duration>) -> crate::Result<Vec<String>> {
        let mut req = self.client.get(self.endpoint("/api/tags"));
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }
        let tags: TagsResponse = send_checked_json(req).await?;
        Ok(tags.models.into_iter().map(|entry| entry.name).collect())
    }
}

fn backend_error(err: crate::Error) -> GatewayError {
    match err {
        crate::Error::Api { status, body } => {
            tracing::warn!(status = status.as_u16(), body = %body, "backend rejected chat request");
            GatewayError::BackendRejected {
                status: status.as_u16(),
            }
        }
        other => GatewayError::BackendUnavailable {
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl ChatBackend for OllamaBackend {
    async fn chat(&self, model: &str, messages: &[Message]) -> Result<String, GatewayError> {
        let payload = ChatPayload {
            model,
            messages,
            stream: false,
        };
        let req = self.client.post(self.endpoint("/api/chat")).json(&payload);
        let response: ChatResponse = send_checked_json(req).await.map_err(backend_error)?;
        Ok(response.message.content)
    }

    async fn list_models(&self) -> Vec<String> {
        match self.fetch_tags(None).await {
            Ok(models) if !models.is_empty() => models,
            Ok(_) => fallback_models(),
            Err(err) => {
                tracing::debug!(error = %err, "model listing failed; using fallback list");
                fallback_models()
            }
        }
    }

    async fn ping(&self) -> ConnectionState {
        match self.fetch_tags(Some(PING_TIMEOUT)).await {
            Ok(_) => ConnectionState::Connected,
            Err(err) => ConnectionState::Disconnected {
                reason: err.to_string(),
            },
        }
    }
}
