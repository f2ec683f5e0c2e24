use std::collections::HashMap;

use axum::http::{HeaderMap, Uri, header};
use serde_json::{Map, Value};

/// Every place a caller may have put its parameters, parsed once per request.
#[derive(Debug, Default)]
pub(crate) struct InboundRequest {
    bearer: Option<String>,
    query: HashMap<String, String>,
    form: HashMap<String, String>,
    json: Option<Map<String, Value>>,
}

impl InboundRequest {
    /// Malformed bodies are treated as absent rather than rejected.
    pub(crate) fn parse(uri: &Uri, headers: &HeaderMap, body: &[u8]) -> Self {
        let query = uri.query().map(parse_urlencoded).unwrap_or_default();

        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_default();

        let mut form = HashMap::new();
        let mut json = None;
        if content_type.starts_with("application/x-www-form-urlencoded") {
            form = parse_urlencoded(&String::from_utf8_lossy(body));
        } else if content_type.starts_with("application/json")
            || (content_type.is_empty() && body.first() == Some(&b'{'))
        {
            json = serde_json::from_slice::<Value>(body)
                .ok()
                .and_then(|value| match value {
                    Value::Object(map) => Some(map),
                    _ => None,
                });
        }

        Self {
            bearer: extract_bearer(headers),
            query,
            form,
            json,
        }
    }

    fn json_str(&self, name: &str) -> Option<String> {
        self.json
            .as_ref()?
            .get(name)?
            .as_str()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    /// Query string first, then form body.
    fn parameter(&self, name: &str) -> Option<String> {
        self.query_str(name).or_else(|| self.form_str(name))
    }

    /// First non-empty value among `names`, looking in the JSON body, then the form body,
    /// then the query string.
    pub(crate) fn field(&self, names: &[&str]) -> Option<String> {
        names
            .iter()
            .find_map(|name| self.json_str(name))
            .or_else(|| names.iter().find_map(|name| self.form_str(name)))
            .or_else(|| names.iter().find_map(|name| self.query_str(name)))
    }

    fn form_str(&self, name: &str) -> Option<String> {
        non_empty(self.form.get(name))
    }

    fn query_str(&self, name: &str) -> Option<String> {
        non_empty(self.query.get(name))
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// One place a credential may be carried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CredentialSource {
    /// `Authorization: Bearer <key>`.
    BearerHeader,
    /// A named query or form parameter.
    Parameter(&'static str),
    /// A top-level string field of a JSON body.
    JsonField(&'static str),
}

/// Credential sources in precedence order.
pub(crate) const CREDENTIAL_SOURCES: [CredentialSource; 3] = [
    CredentialSource::BearerHeader,
    CredentialSource::Parameter("AccessKeyId"),
    CredentialSource::JsonField("AccessKeyId"),
];

impl CredentialSource {
    pub(crate) fn extract(self, request: &InboundRequest) -> Option<String> {
        match self {
            CredentialSource::BearerHeader => request.bearer.clone(),
            CredentialSource::Parameter(name) => request.parameter(name),
            CredentialSource::JsonField(name) => request.json_str(name),
        }
    }
}

/// The credential from the first source that carries one.
pub(crate) fn extract_credential(request: &InboundRequest) -> Option<String> {
    CREDENTIAL_SOURCES
        .iter()
        .find_map(|source| source.extract(request))
}

pub(crate) fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())?
        .trim()
        .to_string();
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn parse_urlencoded(raw: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(raw.as_bytes())
        .into_owned()
        .collect()
}
