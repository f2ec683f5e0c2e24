use async_trait::async_trait;

use crate::Message;

pub const MAX_QUERY_CHARS: usize = 1000;

/// Source of ranked text snippets used to augment a request.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// `query` has already passed [`sanitize_query`]. An empty result means no augmentation.
    async fn search(&self, query: &str) -> Vec<String>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoRetrieval;

#[async_trait]
impl Retriever for NoRetrieval {
    async fn search(&self, _query: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Returns the query reduced to letters, digits, whitespace and `-.,!?`, or `None` when it
/// is empty after trimming or longer than [`MAX_QUERY_CHARS`].
pub fn sanitize_query(query: &str) -> Option<String> {
    let query = query.trim();
    if query.is_empty() || query.chars().count() > MAX_QUERY_CHARS {
        return None;
    }
    let cleaned: String = query
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || matches!(c, '-' | '.' | ',' | '!' | '?'))
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// The request-only system message carrying retrieved snippets.
pub fn augmentation_message(snippets: &[String]) -> Message {
    Message::system(format!(
        "Answer the user's question using the following search results:\n\n{}\n\n\
         Combine the search results with your own knowledge to give a complete, accurate answer.",
        snippets.join("\n")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_markup_and_rejects_oversized_queries() {
        assert_eq!(
            sanitize_query("  what is <b>rust</b>?; drop  ").as_deref(),
            Some("what is brustb? drop")
        );
        assert_eq!(sanitize_query("   "), None);
        assert_eq!(sanitize_query("<>{}"), None);
        assert!(sanitize_query(&"a".repeat(MAX_QUERY_CHARS)).is_some());
        assert_eq!(sanitize_query(&"a".repeat(MAX_QUERY_CHARS + 1)), None);
    }

    #[test]
    fn augmentation_lists_every_snippet() {
        let message = augmentation_message(&["one".to_string(), "two".to_string()]);
        assert_eq!(message.role, crate::Role::System);
        assert!(message.content.contains("one\ntwo"));
    }
}
