//! Summarization and embedding backends.
//!
//! Two narrow seams connect the engine to a model provider:
//!
//! - [`SummaryBackend`]: one-shot completion used by the
//!   [`LlmSummary`](crate::compaction::LlmSummary) strategy.
//! - [`EmbeddingBackend`]: batch text embedding used by dense retrieval in
//!   the [`StaticContextCollector`](crate::collectors::static_index::StaticContextCollector).
//!
//! Both are optional. Without a summary backend, LLM summarization falls back
//! to selective compaction; without an embedding backend, retrieval is
//! lexical only. [`OpenRouterClient`] implements both against an
//! OpenAI-compatible HTTP API.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Boxed future returned by backend calls.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Default API base URL.
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Default model for summarization calls.
pub const DEFAULT_SUMMARY_MODEL: &str = "anthropic/claude-3.5-haiku";

/// Default model for embedding calls.
pub const DEFAULT_EMBEDDING_MODEL: &str = "openai/text-embedding-3-small";

/// Maximum tokens requested for a summary response.
const SUMMARY_MAX_TOKENS: u32 = 512;

/// A one-shot text completion backend.
pub trait SummaryBackend: Send + Sync {
    /// Complete a (system, user) prompt pair and return the response text.
    fn complete<'a>(&'a self, system: &'a str, user: &'a str) -> BackendFuture<'a, String>;
}

/// A batch text embedding backend.
pub trait EmbeddingBackend: Send + Sync {
    /// Embed each input text. The output has one vector per input, in order,
    /// all of the same dimension.
    fn embed<'a>(&'a self, texts: &'a [String]) -> BackendFuture<'a, Vec<Vec<f32>>>;
}

// ── Wire types ─────────────────────────────────────────────────────

#[derive(Serialize, Debug)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize, Debug)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
}

#[derive(Serialize, Debug)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize, Debug)]
struct RawEmbeddingResponse {
    data: Option<Vec<RawEmbedding>>,
    error: Option<ApiErrorResponse>,
}

#[derive(Deserialize, Debug)]
struct RawEmbedding {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for an OpenAI-compatible API (OpenRouter by default).
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    summary_model: String,
    embedding_model: String,
}

impl std::fmt::Debug for OpenRouterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterClient")
            .field("base_url", &self.base_url)
            .field("summary_model", &self.summary_model)
            .field("embedding_model", &self.embedding_model)
            .finish()
    }
}

impl OpenRouterClient {
    /// Create a client with the given API key and default models.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("ctxkit/0.1")
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Backend(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: OPENROUTER_BASE_URL.to_string(),
            summary_model: DEFAULT_SUMMARY_MODEL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
        })
    }

    /// Build a client from the `OPENROUTER_KEY` environment variable.
    /// Returns `None` if the variable is unset or empty.
    pub fn from_env() -> Option<Self> {
        let key = std::env::var("OPENROUTER_KEY").ok().filter(|k| !k.is_empty())?;
        Self::new(key).ok()
    }

    /// Point the client at a different OpenAI-compatible base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_summary_model(mut self, model: impl Into<String>) -> Self {
        self.summary_model = model.into();
        self
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<String> {
        let url = format!("{}/{path}", self.base_url);
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );
        let start = Instant::now();

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("request failed: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Error::Backend(format!("failed to read response: {e}")))?;

        debug!(
            "Backend response: {path} HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(Error::Backend(format!("HTTP {status}: {text}")));
        }
        Ok(text)
    }

    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let body = ChatRequest {
            model: &self.summary_model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            max_tokens: SUMMARY_MAX_TOKENS,
            temperature: 0.2,
        };
        let text = self.post_json("chat/completions", &body).await?;
        let parsed: RawChatResponse = serde_json::from_str(&text)?;
        if let Some(err) = parsed.error {
            return Err(Error::Backend(format!("API error: {}", err.message)));
        }
        parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| Error::Backend("empty completion".to_string()))
    }

    async fn embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = EmbeddingRequest {
            model: &self.embedding_model,
            input: texts,
        };
        let text = self.post_json("embeddings", &body).await?;
        let parsed: RawEmbeddingResponse = serde_json::from_str(&text)?;
        if let Some(err) = parsed.error {
            return Err(Error::Backend(format!("API error: {}", err.message)));
        }
        let mut data = parsed.data.unwrap_or_default();
        if data.len() != texts.len() {
            return Err(Error::Backend(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                data.len()
            )));
        }
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

impl SummaryBackend for OpenRouterClient {
    fn complete<'a>(&'a self, system: &'a str, user: &'a str) -> BackendFuture<'a, String> {
        Box::pin(self.chat(system, user))
    }
}

impl EmbeddingBackend for OpenRouterClient {
    fn embed<'a>(&'a self, texts: &'a [String]) -> BackendFuture<'a, Vec<Vec<f32>>> {
        Box::pin(self.embeddings(texts))
    }
}

/// Run a backend future with a deadline, mapping expiry to [`Error::Timeout`].
pub async fn with_timeout<T>(
    what: &'static str,
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(what, timeout.as_millis() as u64)),
    }
}
