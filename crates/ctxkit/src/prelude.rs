//! Convenience re-exports for common `ctxkit` types.
//!
//! ```ignore
//! use ctxkit::prelude::*;
//! ```
//!
//! Covers configuration, the conversation model, compaction, the three
//! collectors, and prompt assembly. Chunker internals, scoring helpers and
//! backend wire types stay in their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{Error, Message, MessageRole, Result};

// ── Configuration and persistence ───────────────────────────────────
pub use crate::config::CtxConfig;
pub use crate::session::SessionStore;

// ── Context and compaction ──────────────────────────────────────────
pub use crate::compaction::{
    CompactionConfig, CompactionManager, CompactionResult, ContextCompactor, StrategyKind,
};
pub use crate::context::{ContextMonitor, ConversationContext, MonitorConfig, estimate_tokens};
pub use crate::hooks::{CompactionHook, ExternalHookRunner, HookDecision, LoggingHook};

// ── Collectors ──────────────────────────────────────────────────────
pub use crate::collectors::{
    DynamicContextCollector, RetrievalStrategy, SearchResult, StaticContextCollector,
    TemporalContextCollector,
};

// ── Prompt assembly ─────────────────────────────────────────────────
pub use crate::orchestrator::{ContextOrchestrator, MetaPrompt, PromptSources, Zone};

// ── Backends and background work ────────────────────────────────────
pub use crate::backend::{EmbeddingBackend, OpenRouterClient, SummaryBackend};
pub use crate::worker::BackgroundWorker;
