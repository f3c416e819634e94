//! Rolling window: system messages plus the longest recent suffix that fits.

use super::{
    CompactionConfig, CompactionStrategy, Partition, StrategyFuture, StrategyKind, StrategyOutcome,
    assemble, kept_tokens,
};
use crate::context::ConversationContext;

/// Keeps every system message and a contiguous suffix of the conversation.
///
/// The suffix starts as the recent window and grows backwards one message at
/// a time until the next older message would exceed the target. Growth stops
/// at the first message that does not fit, so the kept conversation has no
/// gaps.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    preserve_recent: usize,
}

impl RollingWindow {
    pub fn new(config: &CompactionConfig) -> Self {
        Self {
            preserve_recent: config.preserve_recent_count,
        }
    }

    pub fn compact_now(&self, ctx: &ConversationContext, target_tokens: usize) -> ConversationContext {
        let messages = ctx.messages();
        if ctx.estimated_tokens() <= target_tokens {
            return ctx.clone();
        }

        let partition = Partition::new(messages, self.preserve_recent);
        let mut keep = partition.protected_mask(messages.len());
        let mut tokens = kept_tokens(messages, &keep);

        for &i in partition.rest.iter().rev() {
            let cost = messages[i].estimated_tokens();
            if tokens + cost > target_tokens {
                break;
            }
            keep[i] = true;
            tokens += cost;
        }

        assemble(ctx, &keep)
    }
}

impl CompactionStrategy for RollingWindow {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RollingWindow
    }

    fn compact<'a>(&'a self, ctx: &'a ConversationContext, target_tokens: usize) -> StrategyFuture<'a> {
        let context = self.compact_now(ctx, target_tokens);
        Box::pin(async move { Ok(StrategyOutcome::kept(context)) })
    }
}
