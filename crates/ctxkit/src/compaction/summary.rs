//! LLM summarization: fold the older middle of a conversation into one
//! synthesized summary message.
//!
//! The non-system messages are split into a trailing recent window, kept
//! verbatim, and the leading middle, which is sent to a [`SummaryBackend`] in
//! a single one-shot call. The reply replaces the middle as one system-role
//! message tagged `type = "summary"`.
//!
//! Summarization never fails a compaction: an error or timeout from the
//! backend produces a deterministic placeholder instead. Without a backend
//! the strategy behaves exactly like [`Selective`].

use super::{
    CompactionConfig, CompactionStrategy, Partition, Selective, StrategyFuture, StrategyKind,
    StrategyOutcome,
};
use crate::backend::{SummaryBackend, with_timeout};
use crate::context::ConversationContext;
use crate::{METADATA_MESSAGE_COUNT, METADATA_TYPE, Message, MessageRole, truncate_chars};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Prefix of every synthesized summary message.
pub const SUMMARY_PREFIX: &str = "[Context Summary]: ";

const SUMMARIZATION_PROMPT: &str = "\
Summarize the following conversation messages in 2-4 sentences. Focus on:
- What the user asked for and what was accomplished
- Key findings, decisions, and failed approaches
- File paths and function names mentioned

Rules:
- Only include facts explicitly stated in the messages.
- Preserve file paths, function names, and error messages verbatim.
- Reply with the summary text only.";

/// Summarizing compaction strategy.
pub struct LlmSummary {
    backend: Option<Arc<dyn SummaryBackend>>,
    config: CompactionConfig,
}

impl std::fmt::Debug for LlmSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSummary")
            .field("has_backend", &self.backend.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl LlmSummary {
    pub fn new(config: &CompactionConfig, backend: Option<Arc<dyn SummaryBackend>>) -> Self {
        Self {
            backend,
            config: config.clone(),
        }
    }

    /// Size of the verbatim recent window for `non_system` conversational
    /// messages.
    fn recent_window(&self, non_system: usize) -> usize {
        let fraction = (non_system as f64 * self.config.summary_recent_fraction).ceil() as usize;
        fraction.max(self.config.preserve_recent_count)
    }

    /// Build the (system, user) prompt pair for a span of messages.
    pub fn build_request(&self, span: &[&Message]) -> (String, String) {
        let mut content = String::new();
        for msg in span {
            let text = truncate_chars(&msg.content, self.config.summary_message_chars, "...");
            content.push_str(&format!("[{}]: {text}\n\n", msg.role));
        }
        (SUMMARIZATION_PROMPT.to_string(), content)
    }

    async fn run(&self, backend: &dyn SummaryBackend, ctx: &ConversationContext) -> StrategyOutcome {
        let messages = ctx.messages();
        let non_system = messages.iter().filter(|m| m.role != MessageRole::System).count();
        let partition = Partition::new(messages, self.recent_window(non_system));

        if partition.rest.is_empty() {
            return StrategyOutcome::kept(ctx.clone());
        }

        let span: Vec<&Message> = partition.rest.iter().map(|&i| &messages[i]).collect();
        let (system, user) = self.build_request(&span);
        let timeout = Duration::from_millis(self.config.summary_timeout_ms);

        let text = match with_timeout("summarization", timeout, backend.complete(&system, &user)).await {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                warn!("Summarization failed, using placeholder: {e}");
                placeholder(&span)
            }
        };

        let summary = Message::system(format!("{SUMMARY_PREFIX}{text}"))
            .with_metadata(METADATA_TYPE, "summary")
            .with_metadata(METADATA_MESSAGE_COUNT, span.len());

        let mut dropped = vec![false; messages.len()];
        for &i in &partition.rest {
            dropped[i] = true;
        }
        let anchor = partition.recent.first().copied().unwrap_or(messages.len());

        let mut out = Vec::with_capacity(messages.len() - span.len() + 1);
        let mut summary = Some(summary);
        for (i, msg) in messages.iter().enumerate() {
            if i == anchor
                && let Some(s) = summary.take()
            {
                out.push(s);
            }
            if !dropped[i] {
                out.push(msg.clone());
            }
        }
        if let Some(s) = summary {
            out.push(s);
        }

        let compacted = ctx.derive(out);
        if compacted.estimated_tokens() >= ctx.estimated_tokens() {
            debug!("Summary would not shrink the context, keeping it unchanged");
            return StrategyOutcome::kept(ctx.clone());
        }

        StrategyOutcome {
            context: compacted,
            messages_summarized: span.len(),
            messages_synthesized: 1,
        }
    }
}

/// Deterministic summary used when the backend call fails.
fn placeholder(span: &[&Message]) -> String {
    let counts: Vec<String> = [MessageRole::User, MessageRole::Assistant, MessageRole::Tool]
        .into_iter()
        .filter_map(|role| {
            let n = span.iter().filter(|m| m.role == role).count();
            (n > 0).then(|| format!("{role}: {n}"))
        })
        .collect();
    format!(
        "{} earlier messages compacted ({}).",
        span.len(),
        counts.join(", ")
    )
}

impl CompactionStrategy for LlmSummary {
    fn kind(&self) -> StrategyKind {
        StrategyKind::LlmSummary
    }

    fn compact<'a>(&'a self, ctx: &'a ConversationContext, target_tokens: usize) -> StrategyFuture<'a> {
        Box::pin(async move {
            if ctx.estimated_tokens() <= target_tokens {
                return Ok(StrategyOutcome::kept(ctx.clone()));
            }
            match &self.backend {
                Some(backend) => Ok(self.run(backend.as_ref(), ctx).await),
                None => {
                    debug!("No summary backend configured, compacting selectively");
                    let selective = Selective::new(&self.config);
                    Ok(StrategyOutcome::kept(selective.compact_now(ctx, target_tokens)))
                }
            }
        })
    }
}
