//! Runs a compaction strategy and records what it did.

use super::{
    CompactionConfig, CompactionStrategy, LlmSummary, RollingWindow, Selective, StrategyKind, Truncate,
};
use crate::{Error, Message, Result, truncate_chars};
use crate::backend::SummaryBackend;
use crate::context::ConversationContext;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Outcome of one [`ContextCompactor::compact`] call.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    pub new_context: ConversationContext,
    pub strategy_used: StrategyKind,
    pub original_tokens: usize,
    pub compacted_tokens: usize,
    /// Original messages no longer present verbatim.
    pub messages_removed: usize,
    /// Original messages folded into a synthesized summary.
    pub messages_summarized: usize,
    pub elapsed: Duration,
}

impl CompactionResult {
    fn unchanged(ctx: &ConversationContext, strategy_used: StrategyKind, elapsed: Duration) -> Self {
        let tokens = ctx.estimated_tokens();
        Self {
            new_context: ctx.clone(),
            strategy_used,
            original_tokens: tokens,
            compacted_tokens: tokens,
            messages_removed: 0,
            messages_summarized: 0,
            elapsed,
        }
    }

    pub fn tokens_saved(&self) -> usize {
        self.original_tokens.saturating_sub(self.compacted_tokens)
    }
}

/// Cumulative counters across compactions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub compactions_performed: usize,
    pub total_tokens_saved: usize,
}

/// Reject an outcome that grew the context or lost a system message.
fn check_outcome(kind: StrategyKind, original: &ConversationContext, compacted: &ConversationContext) -> Result<()> {
    let (before, after) = (original.estimated_tokens(), compacted.estimated_tokens());
    if after > before {
        return Err(Error::Compaction(format!(
            "{kind} grew the context from ~{before} to ~{after} tokens"
        )));
    }
    let kept: Vec<&Message> = compacted.system_messages().collect();
    if let Some(lost) = original.system_messages().find(|m| !kept.contains(m)) {
        return Err(Error::Compaction(format!(
            "{kind} dropped system message {:?}",
            truncate_chars(&lost.content, 60, "...")
        )));
    }
    Ok(())
}

/// Selects and runs compaction strategies.
pub struct ContextCompactor {
    config: CompactionConfig,
    backend: Option<Arc<dyn SummaryBackend>>,
    stats: CompactionStats,
}

impl std::fmt::Debug for ContextCompactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextCompactor")
            .field("config", &self.config)
            .field("has_backend", &self.backend.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}

impl ContextCompactor {
    /// Create a compactor, validating the configuration.
    pub fn new(config: CompactionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            backend: None,
            stats: CompactionStats::default(),
        })
    }

    /// Attach a summarization backend for [`LlmSummary`].
    pub fn with_backend(mut self, backend: Arc<dyn SummaryBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    pub fn stats(&self) -> &CompactionStats {
        &self.stats
    }

    fn strategy(&self, kind: StrategyKind) -> Box<dyn CompactionStrategy> {
        match kind {
            StrategyKind::Truncate => Box::new(Truncate::new(&self.config)),
            StrategyKind::Selective => Box::new(Selective::new(&self.config)),
            StrategyKind::RollingWindow => Box::new(RollingWindow::new(&self.config)),
            StrategyKind::LlmSummary => Box::new(LlmSummary::new(&self.config, self.backend.clone())),
        }
    }

    /// Compact `ctx` toward `target` tokens (default: `target_ratio` of its
    /// current size) with the configured strategy or `strategy_override`.
    ///
    /// Without an explicit target, a context at or below the configured
    /// threshold is returned unchanged and not counted in the stats. The
    /// input context is not modified.
    pub async fn compact(
        &mut self,
        ctx: &ConversationContext,
        target: Option<usize>,
        strategy_override: Option<StrategyKind>,
    ) -> Result<CompactionResult> {
        let start = Instant::now();
        let kind = strategy_override.unwrap_or(self.config.strategy);
        if target.is_none() && !self.config.over_threshold(ctx) {
            debug!(
                "Context at ~{}/{} tokens is within the threshold, nothing to compact",
                ctx.estimated_tokens(),
                ctx.max_tokens()
            );
            return Ok(CompactionResult::unchanged(ctx, kind, start.elapsed()));
        }
        let target_tokens = self.config.resolve_target(ctx, target);
        let original_tokens = ctx.estimated_tokens();

        let outcome = self.strategy(kind).compact(ctx, target_tokens).await?;
        check_outcome(kind, ctx, &outcome.context)?;

        let compacted_tokens = outcome.context.estimated_tokens();
        let messages_removed =
            (ctx.len() + outcome.messages_synthesized).saturating_sub(outcome.context.len());

        let result = CompactionResult {
            new_context: outcome.context,
            strategy_used: kind,
            original_tokens,
            compacted_tokens,
            messages_removed,
            messages_summarized: outcome.messages_summarized,
            elapsed: start.elapsed(),
        };

        self.stats.compactions_performed += 1;
        self.stats.total_tokens_saved += result.tokens_saved();

        if compacted_tokens > target_tokens {
            warn!(
                "Compaction with {kind} left ~{compacted_tokens} tokens, over the target of {target_tokens}"
            );
        }
        info!(
            "Compacted with {kind}: ~{original_tokens} -> ~{compacted_tokens} tokens, {} messages removed in {:.1} ms",
            result.messages_removed,
            result.elapsed.as_secs_f64() * 1000.0
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendFuture;
    use crate::compaction::test_support::conversation;

    struct Fixed;

    impl SummaryBackend for Fixed {
        fn complete<'a>(&'a self, _system: &'a str, _user: &'a str) -> BackendFuture<'a, String> {
            Box::pin(async { Ok("short".to_string()) })
        }
    }

    #[tokio::test]
    async fn truncate_result_accounting() {
        let config = CompactionConfig::default()
            .with_strategy(StrategyKind::Truncate)
            .with_preserve_recent(2);
        let mut compactor = ContextCompactor::new(config).unwrap();
        let ctx = conversation(1, 6, 193); // 51 + 6 * 50 = 351 tokens

        let result = compactor.compact(&ctx, Some(200), None).await.unwrap();
        assert_eq!(result.strategy_used, StrategyKind::Truncate);
        assert_eq!(result.original_tokens, 351);
        assert_eq!(result.compacted_tokens, 151);
        assert_eq!(result.messages_removed, 4);
        assert_eq!(result.messages_summarized, 0);
        assert_eq!(compactor.stats().compactions_performed, 1);
        assert_eq!(compactor.stats().total_tokens_saved, 200);
        // Input untouched.
        assert_eq!(ctx.len(), 7);
    }

    #[tokio::test]
    async fn override_wins_over_configured_strategy() {
        let mut compactor = ContextCompactor::new(CompactionConfig::default().with_preserve_recent(2)).unwrap();
        let ctx = ConversationContext::with_messages(400, conversation(0, 8, 193).into_messages());
        let result = compactor
            .compact(&ctx, None, Some(StrategyKind::RollingWindow))
            .await
            .unwrap();
        assert_eq!(result.strategy_used, StrategyKind::RollingWindow);
        assert!(result.compacted_tokens <= 200);
    }

    #[tokio::test]
    async fn summary_counts_synthesized_message() {
        let config = CompactionConfig::default().with_preserve_recent(2);
        let mut compactor = ContextCompactor::new(config).unwrap().with_backend(Arc::new(Fixed));
        let ctx = conversation(1, 20, 193);

        let result = compactor.compact(&ctx, Some(500), None).await.unwrap();
        assert_eq!(result.strategy_used, StrategyKind::LlmSummary);
        // 16 originals folded into one summary.
        assert_eq!(result.messages_summarized, 16);
        assert_eq!(result.messages_removed, 16);
        assert_eq!(result.new_context.len(), 6);
    }

    #[tokio::test]
    async fn compaction_never_increases_tokens() {
        for kind in [
            StrategyKind::Truncate,
            StrategyKind::Selective,
            StrategyKind::RollingWindow,
            StrategyKind::LlmSummary,
        ] {
            let mut compactor =
                ContextCompactor::new(CompactionConfig::default().with_preserve_recent(3)).unwrap();
            let ctx = conversation(2, 15, 77);
            for target in [0, 10, 100, 1_000, 10_000] {
                let result = compactor.compact(&ctx, Some(target), Some(kind)).await.unwrap();
                assert!(result.compacted_tokens <= result.original_tokens, "{kind} at {target}");
                assert!(result.new_context.len() <= ctx.len(), "{kind} at {target}");
                let systems = result.new_context.system_messages().count();
                assert_eq!(systems, 2, "{kind} at {target}");
            }
        }
    }

    #[tokio::test]
    async fn default_target_settles_below_threshold() {
        // 1 system + 30 turns of about 25 tokens in a 10k budget.
        let ctx = ConversationContext::with_messages(10_000, conversation(1, 30, 93).into_messages());
        assert!(ctx.estimated_tokens() < 1_000);

        for kind in [StrategyKind::Truncate, StrategyKind::RollingWindow] {
            let mut compactor = ContextCompactor::new(CompactionConfig::default()).unwrap();
            let once = compactor.compact(&ctx, None, Some(kind)).await.unwrap();
            let twice = compactor.compact(&once.new_context, None, Some(kind)).await.unwrap();
            assert_eq!(once.new_context.messages(), ctx.messages(), "{kind}");
            assert_eq!(twice.new_context.messages(), once.new_context.messages(), "{kind}");
            assert_eq!(twice.strategy_used, kind);
            assert_eq!(twice.messages_removed, 0);
            assert_eq!(compactor.stats().compactions_performed, 0);
        }
    }

    #[tokio::test]
    async fn default_target_applies_over_threshold() {
        let ctx = ConversationContext::with_messages(800, conversation(1, 30, 93).into_messages());
        let mut compactor =
            ContextCompactor::new(CompactionConfig::default().with_strategy(StrategyKind::Truncate)).unwrap();
        let result = compactor.compact(&ctx, None, None).await.unwrap();
        assert!(result.compacted_tokens <= ctx.estimated_tokens() / 2);
        assert_eq!(compactor.stats().compactions_performed, 1);
    }

    #[test]
    fn broken_outcomes_are_compaction_errors() {
        let ctx = conversation(2, 4, 77);
        assert!(check_outcome(StrategyKind::Truncate, &ctx, &ctx).is_ok());

        let without_system = ctx.derive(ctx.messages()[1..].to_vec());
        let err = check_outcome(StrategyKind::Selective, &ctx, &without_system).unwrap_err();
        assert!(matches!(err, Error::Compaction(ref m) if m.starts_with("selective dropped system message")));
        assert!(!err.is_configuration());

        let mut grown = ctx.messages().to_vec();
        grown.push(Message::user("extra"));
        let err = check_outcome(StrategyKind::RollingWindow, &ctx, &ctx.derive(grown)).unwrap_err();
        assert!(matches!(err, Error::Compaction(ref m) if m.contains("grew the context")));
    }

    #[test]
    fn invalid_config_rejected() {
        let err = ContextCompactor::new(CompactionConfig::default().with_target_ratio(2.0)).unwrap_err();
        assert!(err.is_configuration());
    }
}
