//! Selective retention: protected messages plus the newest tool results.

use super::{
    CompactionConfig, CompactionStrategy, Partition, StrategyFuture, StrategyKind, StrategyOutcome,
    assemble, kept_tokens,
};
use crate::MessageRole;
use crate::context::ConversationContext;

/// Keeps system messages and the recent window, then admits older tool
/// results newest-first while they fit the remaining budget. Everything else
/// outside the protected set is discarded.
///
/// A tool result that does not fit is skipped; smaller, older ones may still
/// be admitted after it.
#[derive(Debug, Clone)]
pub struct Selective {
    preserve_recent: usize,
}

impl Selective {
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
            if messages[i].role != MessageRole::Tool {
                continue;
            }
            let cost = messages[i].estimated_tokens();
            if tokens + cost <= target_tokens {
                keep[i] = true;
                tokens += cost;
            }
        }

        assemble(ctx, &keep)
    }
}

impl CompactionStrategy for Selective {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Selective
    }

    fn compact<'a>(&'a self, ctx: &'a ConversationContext, target_tokens: usize) -> StrategyFuture<'a> {
        let context = self.compact_now(ctx, target_tokens);
        Box::pin(async move { Ok(StrategyOutcome::kept(context)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;
    use crate::compaction::test_support::contents;

    fn selective(preserve: usize) -> Selective {
        Selective::new(&CompactionConfig::default().with_preserve_recent(preserve))
    }

    fn tool(label: &str, chars: usize) -> Message {
        Message::tool_result("call", format!("{label} {}", "r".repeat(chars)))
    }

    #[test]
    fn keeps_newest_tool_results_that_fit() {
        let ctx = ConversationContext::with_messages(
            10_000,
            vec![
                Message::system("rules"),
                Message::user("a".repeat(400)),
                tool("t-old", 194),
                Message::assistant("b".repeat(400)),
                tool("t-new", 194),
                Message::user("latest"),
            ],
        );

        let out = selective(1).compact_now(&ctx, 60);
        let texts = contents(&out);
        assert_eq!(texts.len(), 3);
        assert_eq!(texts[0], "rules");
        assert!(texts[1].starts_with("t-new"));
        assert_eq!(texts[2], "latest");
    }

    #[test]
    fn skips_oversized_tool_result_and_continues() {
        let ctx = ConversationContext::with_messages(
            10_000,
            vec![
                tool("small", 34), // 10 tokens
                tool("huge", 995), // 250 tokens
                Message::user("q"),
            ],
        );

        let out = selective(1).compact_now(&ctx, 20);
        let texts = contents(&out);
        assert_eq!(texts.len(), 2);
        assert!(texts[0].starts_with("small"));
        assert_eq!(texts[1], "q");
    }

    #[test]
    fn conversational_order_is_preserved() {
        let ctx = ConversationContext::with_messages(
            10_000,
            vec![
                tool("first", 10),
                Message::user("x".repeat(800)),
                tool("second", 10),
                Message::assistant("answer"),
            ],
        );
        let out = selective(1).compact_now(&ctx, 50);
        let texts = contents(&out);
        assert!(texts[0].starts_with("first"));
        assert!(texts[1].starts_with("second"));
        assert_eq!(texts[2], "answer");
    }

    #[test]
    fn never_grows() {
        let ctx = crate::compaction::test_support::conversation(1, 30, 120);
        let out = selective(5).compact_now(&ctx, 10);
        assert!(out.estimated_tokens() <= ctx.estimated_tokens());
        assert!(out.len() <= ctx.len());
    }
}
