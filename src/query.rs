//! Query pipeline: the read path.
//!
//! 1. Embed the question.
//! 2. Retrieve the top-k fragments, scoped to one document when asked.
//! 3. Assemble a grounded prompt from the fragments and the question.
//! 4. Ask the chat model at temperature 0 and return its answer with the
//!    fragments used as evidence.
//!
//! Any failure aborts the whole request; no partial answer is returned.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::chat::{ChatMessage, ChatModel, CompletionOptions};
use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::{PipelineError, Result, Service};
use crate::guard;
use crate::index::VectorIndex;

pub const SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer the question using only the \
provided context. If the context does not contain the answer, say that you do not know.";

/// A question, optionally restricted to one document.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatQuery {
    pub query: String,
    #[serde(default)]
    pub doc_id: Option<String>,
    #[serde(default)]
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub answer: String,
    pub context_chunks: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub default_top_k: usize,
    pub max_top_k: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    pub index_timeout: Duration,
    pub chat_timeout: Duration,
}

impl QueryOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_top_k: config.retrieval.top_k,
            max_top_k: config.retrieval.max_top_k,
            temperature: config.chat.temperature,
            max_tokens: config.chat.max_tokens,
            index_timeout: config.index.timeout(),
            chat_timeout: config.chat.timeout(),
        }
    }
}

pub struct QueryPipeline {
    embedder: Embedder,
    index: Arc<dyn VectorIndex>,
    chat: Arc<dyn ChatModel>,
    options: QueryOptions,
}

impl QueryPipeline {
    pub fn new(
        embedder: Embedder,
        index: Arc<dyn VectorIndex>,
        chat: Arc<dyn ChatModel>,
        options: QueryOptions,
    ) -> Self {
        Self {
            embedder,
            index,
            chat,
            options,
        }
    }

    pub async fn answer(&self, query: &ChatQuery, cancel: &CancellationToken) -> Result<Answer> {
        let question = query.query.trim();
        if question.is_empty() {
            return Err(PipelineError::client_data("query must not be empty"));
        }
        let top_k = query.top_k.unwrap_or(self.options.default_top_k);
        if top_k == 0 || top_k > self.options.max_top_k {
            return Err(PipelineError::client_data(format!(
                "top_k must be between 1 and {}",
                self.options.max_top_k
            )));
        }
        let doc_filter = query.doc_id.as_deref().filter(|d| !d.is_empty());

        let query_vec = self.embedder.embed_one(question, cancel).await;
        if query_vec.is_empty() {
            return Err(PipelineError::transient(
                Service::Embedding,
                "query embedding unavailable",
            ));
        }

        let hits = guard::bounded_typed(
            Service::VectorIndex,
            self.options.index_timeout,
            cancel,
            self.index.search(&query_vec, top_k, doc_filter),
        )
        .await?;
        debug!(hits = hits.len(), doc_filter, "retrieved context");

        let context_chunks: Vec<String> = hits.into_iter().map(|h| h.text).collect();
        let messages = build_messages(question, &context_chunks);

        let answer = guard::bounded(
            Service::Chat,
            self.options.chat_timeout,
            cancel,
            self.chat.complete(
                &messages,
                CompletionOptions {
                    temperature: self.options.temperature,
                    max_tokens: self.options.max_tokens,
                },
            ),
        )
        .await?;

        info!(
            context = context_chunks.len(),
            model = self.chat.model_name(),
            "answered query"
        );
        Ok(Answer {
            answer,
            context_chunks,
        })
    }
}

/// System instruction plus one user message carrying the context
/// fragments (in retrieval order, separated by blank lines) and the question.
pub fn build_messages(question: &str, contexts: &[String]) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "Context:\n{}\n\nQuestion: {}",
            contexts.join("\n\n"),
            question
        )),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::DisabledChat;
    use crate::embedding::DisabledProvider;
    use crate::index::InMemoryVectorIndex;

    fn pipeline() -> QueryPipeline {
        QueryPipeline::new(
            Embedder::new(Arc::new(DisabledProvider), 8, Duration::from_secs(1)),
            Arc::new(InMemoryVectorIndex::new(2)),
            Arc::new(DisabledChat),
            QueryOptions {
                default_top_k: 5,
                max_top_k: 10,
                temperature: 0.0,
                max_tokens: 64,
                index_timeout: Duration::from_secs(1),
                chat_timeout: Duration::from_secs(1),
            },
        )
    }

    fn query(q: &str, top_k: Option<usize>) -> ChatQuery {
        ChatQuery {
            query: q.to_string(),
            doc_id: None,
            top_k,
        }
    }

    #[test]
    fn prompt_orders_context_then_question() {
        let messages = build_messages("What is X?", &["alpha".into(), "beta".into()]);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert!(messages[0].content.contains("only the provided context"));
        assert_eq!(
            messages[1].content,
            "Context:\nalpha\n\nbeta\n\nQuestion: What is X?"
        );
    }

    #[tokio::test]
    async fn empty_query_is_client_error() {
        let err = pipeline()
            .answer(&query("   ", None), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_client_fault());
    }

    #[tokio::test]
    async fn top_k_out_of_range_is_client_error() {
        let p = pipeline();
        for k in [0, 11] {
            let err = p
                .answer(&query("q", Some(k)), &CancellationToken::new())
                .await
                .unwrap_err();
            assert_eq!(err.code(), "bad_request");
        }
    }

    #[tokio::test]
    async fn unavailable_embedding_is_external_error() {
        let err = pipeline()
            .answer(&query("q", None), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "external_service");
        assert!(err.is_retryable());
    }
}
