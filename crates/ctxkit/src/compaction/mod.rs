//! Context compaction: strategies, the compactor that runs them, and the
//! manager that decides when to.
//!
//! Every strategy is a transformation from one
//! [`ConversationContext`] to a new, smaller one. The input is never
//! mutated, so a compaction can always be audited against what it replaced.
//!
//! | Strategy | Keeps | LLM call |
//! |----------|-------|----------|
//! | [`Truncate`] | system + recent; drops oldest first | no |
//! | [`Selective`] | system + recent + newest tool results that fit | no |
//! | [`RollingWindow`] | system + longest recent suffix that fits | no |
//! | [`LlmSummary`] | system + recent 20%; the rest becomes one summary | yes |
//!
//! Two rules hold for all of them: every system-role message survives
//! unchanged, and the `preserve_recent_count` newest non-system messages
//! survive. A context already at or under the target is returned as is.
//!
//! Without an explicit target, [`ContextCompactor::compact`] leaves a
//! context at or below `threshold` usage untouched, so repeated calls on a
//! healthy context settle instead of shrinking it every time.

pub mod compactor;
pub mod manager;
pub mod rolling;
pub mod selective;
pub mod summary;
pub mod truncate;

pub use compactor::{CompactionResult, CompactionStats, ContextCompactor};
pub use manager::CompactionManager;
pub use rolling::RollingWindow;
pub use selective::Selective;
pub use summary::LlmSummary;
pub use truncate::Truncate;

use crate::context::{ConversationContext, DEFAULT_COMPACTION_THRESHOLD};
use crate::{Error, Message, MessageRole, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by [`CompactionStrategy::compact`].
pub type StrategyFuture<'a> = Pin<Box<dyn Future<Output = Result<StrategyOutcome>> + Send + 'a>>;

/// A context compaction strategy.
///
/// The three deterministic strategies resolve immediately; [`LlmSummary`]
/// awaits an external summarization call.
pub trait CompactionStrategy: Send + Sync {
    /// Which strategy this is.
    fn kind(&self) -> StrategyKind;

    /// Produce a compacted copy of `ctx` aiming for `target_tokens`.
    fn compact<'a>(&'a self, ctx: &'a ConversationContext, target_tokens: usize) -> StrategyFuture<'a>;
}

/// The output of a single strategy run.
#[derive(Debug, Clone)]
pub struct StrategyOutcome {
    /// The compacted context.
    pub context: ConversationContext,
    /// Number of original messages folded into synthesized summaries.
    pub messages_summarized: usize,
    /// Number of messages the strategy synthesized (not present in the input).
    pub messages_synthesized: usize,
}

impl StrategyOutcome {
    fn kept(context: ConversationContext) -> Self {
        Self {
            context,
            messages_summarized: 0,
            messages_synthesized: 0,
        }
    }
}

/// Named compaction strategies.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Truncate,
    Selective,
    RollingWindow,
    LlmSummary,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Truncate => "truncate",
            StrategyKind::Selective => "selective",
            StrategyKind::RollingWindow => "rolling_window",
            StrategyKind::LlmSummary => "llm_summary",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "truncate" => Ok(StrategyKind::Truncate),
            "selective" => Ok(StrategyKind::Selective),
            "rolling_window" | "rolling" => Ok(StrategyKind::RollingWindow),
            "llm_summary" | "summary" => Ok(StrategyKind::LlmSummary),
            _ => Err(Error::UnknownStrategy(s.to_string())),
        }
    }
}

/// Configuration shared by the compactor and its strategies.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CompactionConfig {
    /// Strategy used when no override is given. Default: `llm_summary`
    /// (which behaves like `selective` when no summary backend is configured).
    pub strategy: StrategyKind,
    /// Default target as a fraction of current tokens. Default: `0.5`.
    pub target_ratio: f64,
    /// Usage ratio at or below which a compaction without an explicit
    /// target returns the context unchanged. Default: `0.75`, the monitor
    /// default.
    pub threshold: f64,
    /// Newest non-system messages every strategy keeps. Default: `10`.
    pub preserve_recent_count: usize,
    /// Allow [`Truncate`] to drop from the recent window (oldest first) when
    /// the target is still exceeded after everything else is gone.
    /// Default: `false`.
    pub trim_recent_as_last_resort: bool,
    /// Fraction of non-system messages [`LlmSummary`] keeps verbatim.
    /// Default: `0.2`.
    pub summary_recent_fraction: f64,
    /// Per-message character cap in the summarization request. Default: `500`.
    pub summary_message_chars: usize,
    /// Summarization call timeout in milliseconds. Default: `30000`.
    pub summary_timeout_ms: u64,
    /// Require the pre-compaction hook to approve before compacting.
    /// Default: `false`.
    pub require_confirmation: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::LlmSummary,
            target_ratio: 0.5,
            threshold: DEFAULT_COMPACTION_THRESHOLD,
            preserve_recent_count: 10,
            trim_recent_as_last_resort: false,
            summary_recent_fraction: 0.2,
            summary_message_chars: 500,
            summary_timeout_ms: 30_000,
            require_confirmation: false,
        }
    }
}

impl CompactionConfig {
    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_target_ratio(mut self, ratio: f64) -> Self {
        self.target_ratio = ratio;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_preserve_recent(mut self, count: usize) -> Self {
        self.preserve_recent_count = count;
        self
    }

    pub fn with_require_confirmation(mut self, required: bool) -> Self {
        self.require_confirmation = required;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.target_ratio > 0.0 && self.target_ratio < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "compaction.target_ratio must be in (0, 1), got {}",
                self.target_ratio
            )));
        }
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "compaction.threshold must be in (0, 1], got {}",
                self.threshold
            )));
        }
        if !(self.summary_recent_fraction > 0.0 && self.summary_recent_fraction < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "compaction.summary_recent_fraction must be in (0, 1), got {}",
                self.summary_recent_fraction
            )));
        }
        if self.summary_message_chars == 0 {
            return Err(Error::InvalidConfig(
                "compaction.summary_message_chars must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Target tokens for a context: the explicit target, or `target_ratio`
    /// of its current size.
    pub fn resolve_target(&self, ctx: &ConversationContext, target: Option<usize>) -> usize {
        target.unwrap_or_else(|| (ctx.estimated_tokens() as f64 * self.target_ratio) as usize)
    }

    /// Whether `ctx` is over `threshold` of its budget.
    pub fn over_threshold(&self, ctx: &ConversationContext) -> bool {
        ctx.estimated_tokens() as f64 > self.threshold * ctx.max_tokens() as f64
    }
}

// ── Shared helpers ─────────────────────────────────────────────────

/// Message indices split by the two preservation rules.
#[derive(Debug, Default)]
pub(crate) struct Partition {
    /// System-role messages.
    pub system: Vec<usize>,
    /// The `preserve_recent_count` newest non-system messages, oldest first.
    pub recent: Vec<usize>,
    /// Everything else, oldest first.
    pub rest: Vec<usize>,
}

impl Partition {
    pub fn new(messages: &[Message], preserve_recent: usize) -> Self {
        let non_system: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role != MessageRole::System)
            .map(|(i, _)| i)
            .collect();
        let split = non_system.len().saturating_sub(preserve_recent);
        Self {
            system: messages
                .iter()
                .enumerate()
                .filter(|(_, m)| m.role == MessageRole::System)
                .map(|(i, _)| i)
                .collect(),
            recent: non_system[split..].to_vec(),
            rest: non_system[..split].to_vec(),
        }
    }

    /// Keep-mask with system and recent messages set.
    pub fn protected_mask(&self, len: usize) -> Vec<bool> {
        let mut keep = vec![false; len];
        for &i in self.system.iter().chain(&self.recent) {
            keep[i] = true;
        }
        keep
    }
}

/// Clone the kept messages, in order, into a context derived from `ctx`.
pub(crate) fn assemble(ctx: &ConversationContext, keep: &[bool]) -> ConversationContext {
    let messages = ctx
        .messages()
        .iter()
        .zip(keep)
        .filter(|(_, k)| **k)
        .map(|(m, _)| m.clone())
        .collect();
    ctx.derive(messages)
}

/// Estimated tokens of the kept messages.
pub(crate) fn kept_tokens(messages: &[Message], keep: &[bool]) -> usize {
    messages
        .iter()
        .zip(keep)
        .filter(|(_, k)| **k)
        .map(|(m, _)| m.estimated_tokens())
        .sum()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_kind_parses_aliases() {
        assert_eq!("truncate".parse::<StrategyKind>().unwrap(), StrategyKind::Truncate);
        assert_eq!("Rolling-Window".parse::<StrategyKind>().unwrap(), StrategyKind::RollingWindow);
        assert_eq!("summary".parse::<StrategyKind>().unwrap(), StrategyKind::LlmSummary);
        let err = "shred".parse::<StrategyKind>().unwrap_err();
        assert!(matches!(err, Error::UnknownStrategy(ref s) if s == "shred"));
    }

    #[test]
    fn strategy_kind_round_trips_display() {
        for kind in [
            StrategyKind::Truncate,
            StrategyKind::Selective,
            StrategyKind::RollingWindow,
            StrategyKind::LlmSummary,
        ] {
            assert_eq!(kind.to_string().parse::<StrategyKind>().unwrap(), kind);
        }
    }

    #[test]
    fn partition_splits_recent_among_non_system() {
        let messages = vec![
            Message::system("s0"),
            Message::user("u1"),
            Message::assistant("a2"),
            Message::system("s3"),
            Message::user("u4"),
        ];
        let p = Partition::new(&messages, 2);
        assert_eq!(p.system, vec![0, 3]);
        assert_eq!(p.recent, vec![2, 4]);
        assert_eq!(p.rest, vec![1]);
    }

    #[test]
    fn partition_with_fewer_messages_than_window() {
        let messages = vec![Message::user("u"), Message::assistant("a")];
        let p = Partition::new(&messages, 10);
        assert_eq!(p.recent, vec![0, 1]);
        assert!(p.rest.is_empty());
    }

    #[test]
    fn default_target_is_ratio_of_current() {
        let ctx = test_support::conversation(0, 2, 193); // 2 x 50 tokens
        let config = CompactionConfig::default();
        assert_eq!(config.resolve_target(&ctx, None), 50);
        assert_eq!(config.resolve_target(&ctx, Some(7)), 7);
    }

    #[test]
    fn config_validation() {
        assert!(CompactionConfig::default().validate().is_ok());
        assert!(CompactionConfig::default().with_target_ratio(1.0).validate().is_err());
        assert!(CompactionConfig::default().with_target_ratio(0.0).validate().is_err());
        assert!(CompactionConfig::default().with_threshold(1.0).validate().is_ok());
        assert!(CompactionConfig::default().with_threshold(0.0).validate().is_err());
    }
}
