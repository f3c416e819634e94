//! Context budgeting, compaction, and retrieval for long-running LLM sessions.
//!
//! `ctxkit` keeps a bounded working context for a multi-turn conversation with
//! a model whose input is capped at a fixed token budget. It decides what
//! stays in the model's immediate view, when to shrink that view, and how to
//! rebuild it from three memory sources so the most useful information lands
//! where the model pays the most attention.
//!
//! # Getting started
//!
//! ```ignore
//! use ctxkit::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> ctxkit::Result<()> {
//!     let config = CtxConfig::load_or_default(".ctxkit/config.json")?;
//!     let store = SessionStore::new(".ctxkit/session.json");
//!
//!     // Static knowledge: index the repository once, then incrementally.
//!     let mut index = StaticContextCollector::new(config.static_index.clone(), Some(store.clone()))?;
//!     let report = index.index(false);
//!     println!("indexed {} files", report.indexed);
//!
//!     // Session memory and environment.
//!     let mut temporal = TemporalContextCollector::new(config.temporal.clone(), Some(store))?;
//!     temporal.add_message(MessageRole::User, "Why does parse_config reject empty files?");
//!     let dynamic = DynamicContextCollector::new(config.dynamic.clone())?;
//!
//!     // Assemble the outbound prompt.
//!     let orchestrator = ContextOrchestrator::new(config.orchestrator.clone())?;
//!     let sources = PromptSources {
//!         static_index: Some(&index),
//!         dynamic: Some(&dynamic),
//!         temporal: Some(&temporal),
//!     };
//!     let prompt = orchestrator
//!         .build("Why does parse_config reject empty files?", sources)
//!         .await;
//!     println!("{} (~{} tokens)", prompt.render(), prompt.estimated_tokens);
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Measure the budget:** [`ContextMonitor`](context::ContextMonitor) over a
//!   [`ConversationContext`](context::ConversationContext). Every component
//!   uses the same [`estimate_tokens`](context::estimate_tokens) heuristic.
//!
//! - **Shrink a conversation:** the four strategies in [`compaction`]
//!   (truncate, selective, rolling window, LLM summary), run through a
//!   [`ContextCompactor`](compaction::ContextCompactor). A
//!   [`CompactionManager`](compaction::CompactionManager) wires monitor,
//!   compactor, and [`hooks`] together and compacts automatically on append.
//!
//! - **Retrieve code:** [`StaticContextCollector`](collectors::static_index::StaticContextCollector)
//!   indexes a file tree into chunks and serves lexical, dense, and hybrid
//!   (reciprocal-rank fusion) search.
//!
//! - **Snapshot the environment:** [`DynamicContextCollector`](collectors::dynamic::DynamicContextCollector).
//!
//! - **Remember the session:** [`TemporalContextCollector`](collectors::temporal::TemporalContextCollector)
//!   keeps a rolling buffer, extractive summaries, task tracking, and
//!   frustration detection, persisted through [`SessionStore`](session::SessionStore).
//!
//! - **Build the prompt:** [`ContextOrchestrator`](orchestrator::ContextOrchestrator)
//!   produces a [`MetaPrompt`](orchestrator::MetaPrompt) laid out as an
//!   attention sandwich.
//!
//! - **Plug in a model:** [`backend`] defines the summarization and embedding
//!   seams; [`OpenRouterClient`](backend::OpenRouterClient) implements both.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`context`] | Messages, conversation context, token estimator, monitor |
//! | [`compaction`] | Strategies, compactor, manager |
//! | [`collectors`] | Static index, dynamic environment, temporal memory |
//! | [`orchestrator`] | MetaPrompt assembly |
//! | [`backend`] | Summarization and embedding backends |
//! | [`hooks`] | Pre-compaction hooks |
//! | [`session`] | Durable session document |
//! | [`config`] | Per-component configuration and JSON loading |
//! | [`worker`] | Cancellable periodic background work |

pub mod backend;
pub mod collectors;
pub mod compaction;
pub mod config;
pub mod context;
pub mod error;
pub mod hooks;
pub mod orchestrator;
pub mod prelude;
pub mod session;
pub mod worker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use error::{Error, Result};

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(MessageRole::System),
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "tool" => Ok(MessageRole::Tool),
            other => Err(Error::InvalidConfig(format!("unknown message role '{other}'"))),
        }
    }
}

/// Metadata attached to a message. Ordered so serialized output is stable.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Metadata key marking a message synthesized during compaction.
pub const METADATA_TYPE: &str = "type";
/// Metadata key recording how many messages a summary replaced.
pub const METADATA_MESSAGE_COUNT: &str = "message_count";

/// A message in the conversation.
///
/// Immutable once appended to a [`ConversationContext`](context::ConversationContext),
/// except for metadata annotations added during compaction.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: Metadata,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            name: None,
            tool_call_id: None,
            metadata: Metadata::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageRole::Tool, content);
        msg.tool_call_id = Some(call_id.into());
        msg
    }

    /// Attach a participant or tool name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add a metadata annotation.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Estimated token count of this message's text.
    pub fn estimated_tokens(&self) -> usize {
        context::estimate_tokens(&self.content)
    }

    /// Whether this message is a summary synthesized during compaction.
    pub fn is_summary(&self) -> bool {
        self.metadata
            .get(METADATA_TYPE)
            .and_then(|v| v.as_str())
            .is_some_and(|t| t == "summary")
    }
}

/// Truncate `text` to at most `max_chars` characters, appending `suffix`
/// when anything was cut. Never splits a UTF-8 code point.
pub fn truncate_chars(text: &str, max_chars: usize, suffix: &str) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str(suffix);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors() {
        let sys = Message::system("hello");
        assert_eq!(sys.role, MessageRole::System);
        assert_eq!(sys.content, "hello");

        let user = Message::user("world");
        assert_eq!(user.role, MessageRole::User);

        let assist = Message::assistant("reply");
        assert_eq!(assist.role, MessageRole::Assistant);

        let tool = Message::tool_result("call-1", "result");
        assert_eq!(tool.role, MessageRole::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("call-1"));
    }

    #[test]
    fn summary_metadata_is_detected() {
        let msg = Message::system("[Context Summary]: ...")
            .with_metadata(METADATA_TYPE, "summary")
            .with_metadata(METADATA_MESSAGE_COUNT, 12);
        assert!(msg.is_summary());
        assert!(!Message::system("plain").is_summary());
    }

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!("Assistant".parse::<MessageRole>().unwrap(), MessageRole::Assistant);
        assert!("narrator".parse::<MessageRole>().is_err());
    }

    #[test]
    fn message_serializes_without_empty_optionals() {
        let json = serde_json::to_value(Message::user("hi")).unwrap();
        assert_eq!(json["role"], "user");
        assert!(json.get("name").is_none());
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn truncate_chars_respects_multibyte() {
        assert_eq!(truncate_chars("héllo wörld", 5, "..."), "héllo...");
        assert_eq!(truncate_chars("short", 10, "..."), "short");
    }
}
