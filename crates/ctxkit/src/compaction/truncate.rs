//! Oldest-first truncation.

use super::{
    CompactionConfig, CompactionStrategy, Partition, StrategyFuture, StrategyKind, StrategyOutcome,
    assemble, kept_tokens,
};
use crate::context::ConversationContext;
use tracing::debug;

/// Drops the oldest unprotected messages until the context fits the target.
///
/// System messages and the recent window are never dropped, unless
/// `trim_recent_as_last_resort` is set: then, once nothing else is left to
/// drop, the recent window is trimmed from its oldest end. The newest
/// non-system message always survives.
#[derive(Debug, Clone)]
pub struct Truncate {
    preserve_recent: usize,
    trim_recent: bool,
}

impl Truncate {
    pub fn new(config: &CompactionConfig) -> Self {
        Self {
            preserve_recent: config.preserve_recent_count,
            trim_recent: config.trim_recent_as_last_resort,
        }
    }

    /// Synchronous compaction; the trait method wraps this.
    pub fn compact_now(&self, ctx: &ConversationContext, target_tokens: usize) -> ConversationContext {
        let messages = ctx.messages();
        if ctx.estimated_tokens() <= target_tokens {
            return ctx.clone();
        }

        let partition = Partition::new(messages, self.preserve_recent);
        let mut keep = vec![true; messages.len()];
        let mut tokens = kept_tokens(messages, &keep);

        for &i in &partition.rest {
            if tokens <= target_tokens {
                break;
            }
            keep[i] = false;
            tokens -= messages[i].estimated_tokens();
        }

        if tokens > target_tokens && self.trim_recent {
            let trimmable = partition.recent.len().saturating_sub(1);
            for &i in partition.recent.iter().take(trimmable) {
                if tokens <= target_tokens {
                    break;
                }
                keep[i] = false;
                tokens -= messages[i].estimated_tokens();
            }
            debug!("Truncate trimmed into the recent window to approach {target_tokens} tokens");
        }

        assemble(ctx, &keep)
    }
}

impl CompactionStrategy for Truncate {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Truncate
    }

    fn compact<'a>(&'a self, ctx: &'a ConversationContext, target_tokens: usize) -> StrategyFuture<'a> {
        let context = self.compact_now(ctx, target_tokens);
        Box::pin(async move { Ok(StrategyOutcome::kept(context)) })
    }
}
