//! Owns a conversation and compacts it automatically as it grows.

use super::{CompactionResult, ContextCompactor, StrategyKind};
use crate::context::{ContextMonitor, ConversationContext};
use crate::hooks::{CompactionHook, HookDecision, PreCompactionEvent};
use crate::{Message, Result};
use tracing::{debug, info};

/// Composes a [`ContextMonitor`] and a [`ContextCompactor`] around the
/// conversation it owns.
///
/// Every [`append`](Self::append) checks the monitor and, when the threshold
/// is reached, notifies the pre-compaction hook and compacts. All mutation
/// goes through `&mut self`, so compactions can never overlap and the held
/// context is replaced in one assignment.
///
/// When `require_confirmation` is set, a compaction runs only if a hook is
/// installed and returns [`HookDecision::Proceed`]. Without it, the hook is
/// only notified and an abort is logged but not honored. A skipped compaction
/// is retried on the next threshold check.
pub struct CompactionManager {
    context: ConversationContext,
    monitor: ContextMonitor,
    compactor: ContextCompactor,
    hook: Option<Box<dyn CompactionHook>>,
    require_confirmation: bool,
}

impl std::fmt::Debug for CompactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactionManager")
            .field("messages", &self.context.len())
            .field("monitor", &self.monitor)
            .field("compactor", &self.compactor)
            .field("has_hook", &self.hook.is_some())
            .field("require_confirmation", &self.require_confirmation)
            .finish()
    }
}

impl CompactionManager {
    pub fn new(context: ConversationContext, monitor: ContextMonitor, compactor: ContextCompactor) -> Self {
        let require_confirmation = compactor.config().require_confirmation;
        Self {
            context,
            monitor,
            compactor,
            hook: None,
            require_confirmation,
        }
    }

    pub fn with_hook(mut self, hook: Box<dyn CompactionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn with_require_confirmation(mut self, required: bool) -> Self {
        self.require_confirmation = required;
        self
    }

    pub fn context(&self) -> &ConversationContext {
        &self.context
    }

    pub fn into_context(self) -> ConversationContext {
        self.context
    }

    pub fn monitor(&self) -> &ContextMonitor {
        &self.monitor
    }

    pub fn compactor(&self) -> &ContextCompactor {
        &self.compactor
    }

    /// Append a message, then compact if the threshold has been reached.
    pub async fn append(&mut self, message: Message) -> Result<Option<CompactionResult>> {
        self.context.push(message);
        self.auto_compact_if_needed().await
    }

    /// Compact the held context if the monitor says so and the hook allows.
    ///
    /// Returns the compaction result, or `None` when nothing ran.
    pub async fn auto_compact_if_needed(&mut self) -> Result<Option<CompactionResult>> {
        if !self.monitor.should_compact(&self.context) {
            return Ok(None);
        }

        let event = PreCompactionEvent::new(self.monitor.usage_ratio(&self.context), self.context.max_tokens());
        let decision = match &self.hook {
            Some(hook) => Some(hook.pre_compaction(&event).await),
            None => None,
        };

        match (decision, self.require_confirmation) {
            (None, true) => {
                debug!("Compaction due but confirmation required and no hook installed, skipping");
                return Ok(None);
            }
            (Some(HookDecision::Abort(reason)), true) => {
                info!("Compaction skipped by hook: {reason}");
                return Ok(None);
            }
            (Some(HookDecision::Abort(reason)), false) => {
                debug!("Hook asked to abort but confirmation is not required: {reason}");
            }
            _ => {}
        }

        // The monitor already decided; the compactor must not re-check.
        let target = self.compactor.config().resolve_target(&self.context, None);
        let result = self.compactor.compact(&self.context, Some(target), None).await?;
        self.context = result.new_context.clone();
        Ok(Some(result))
    }

    /// Compact now regardless of the threshold, bypassing the hook.
    pub async fn compact_now(
        &mut self,
        target: Option<usize>,
        strategy: Option<StrategyKind>,
    ) -> Result<CompactionResult> {
        let target = self.compactor.config().resolve_target(&self.context, target);
        let result = self.compactor.compact(&self.context, Some(target), strategy).await?;
        self.context = result.new_context.clone();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::CompactionConfig;
    use crate::context::MonitorConfig;
    use crate::hooks::HookFuture;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Veto {
        calls: Arc<AtomicUsize>,
    }

    impl CompactionHook for Veto {
        fn pre_compaction<'a>(&'a self, event: &'a PreCompactionEvent) -> HookFuture<'a> {
            Box::pin(async move {
                assert_eq!(event.event, "pre_compaction");
                self.calls.fetch_add(1, Ordering::SeqCst);
                HookDecision::Abort("busy".into())
            })
        }
    }

    fn manager(config: CompactionConfig, max_tokens: usize) -> CompactionManager {
        CompactionManager::new(
            ConversationContext::new(max_tokens),
            ContextMonitor::new(MonitorConfig::default()).unwrap(),
            ContextCompactor::new(config).unwrap(),
        )
    }

    fn truncating() -> CompactionConfig {
        CompactionConfig::default()
            .with_strategy(StrategyKind::Truncate)
            .with_preserve_recent(2)
    }

    #[tokio::test]
    async fn append_compacts_at_threshold() {
        let mut m = manager(truncating(), 200);
        // Each message is 50 tokens; the third reaches 150 / 200 = 75%.
        assert!(m.append(Message::user("a".repeat(200))).await.unwrap().is_none());
        assert!(m.append(Message::assistant("b".repeat(200))).await.unwrap().is_none());
        let result = m.append(Message::user("c".repeat(200))).await.unwrap();

        let result = result.expect("compaction should have run");
        assert_eq!(result.strategy_used, StrategyKind::Truncate);
        assert_eq!(m.context().len(), 2);
        assert_eq!(m.context().estimated_tokens(), 100);
        assert_eq!(m.compactor().stats().compactions_performed, 1);
    }

    #[tokio::test]
    async fn compaction_fires_only_at_or_above_threshold() {
        let mut m = manager(truncating(), 1_000);
        let mut fired = 0;
        for i in 0..40 {
            // 25 tokens per message.
            let compacted = m.append(Message::user(format!("{i:03} {}", "x".repeat(96)))).await.unwrap();
            if let Some(result) = compacted {
                fired += 1;
                assert!(result.original_tokens >= 750);
            }
        }
        assert_eq!(fired, 1);
        assert_eq!(m.monitor().stats().threshold_crossings, 1);
    }

    #[tokio::test]
    async fn abort_skips_when_confirmation_required() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut m = manager(truncating().with_require_confirmation(true), 100).with_hook(Box::new(Veto {
            calls: calls.clone(),
        }));

        m.append(Message::user("a".repeat(400))).await.unwrap();
        let skipped = m.append(Message::user("b".repeat(40))).await.unwrap();
        assert!(skipped.is_none());
        assert_eq!(m.context().len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn abort_is_advisory_without_confirmation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut m = manager(truncating().with_preserve_recent(1), 100).with_hook(Box::new(Veto {
            calls: calls.clone(),
        }));
        m.append(Message::user("a".repeat(200))).await.unwrap();
        let result = m.append(Message::user("b".repeat(200))).await.unwrap();
        assert!(result.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(m.context().len(), 1);
    }

    #[tokio::test]
    async fn confirmation_without_hook_skips() {
        let mut m = manager(truncating().with_require_confirmation(true), 10);
        let result = m.append(Message::user("x".repeat(400))).await.unwrap();
        assert!(result.is_none());
        assert_eq!(m.context().len(), 1);
    }

    #[tokio::test]
    async fn compact_now_bypasses_threshold() {
        let mut m = manager(truncating(), 100_000);
        for i in 0..6 {
            m.append(Message::user(format!("{i} {}", "y".repeat(198)))).await.unwrap();
        }
        let result = m.compact_now(Some(100), None).await.unwrap();
        assert_eq!(result.new_context.len(), 2);
        assert_eq!(m.context().len(), 2);
    }

    #[tokio::test]
    async fn compact_now_without_target_uses_ratio() {
        let mut m = manager(truncating(), 100_000);
        for i in 0..6 {
            m.append(Message::user(format!("{i} {}", "y".repeat(198)))).await.unwrap();
        }
        let before = m.context().estimated_tokens();
        let result = m.compact_now(None, None).await.unwrap();
        assert!(result.compacted_tokens <= before / 2);
        assert!(m.context().len() < 6);
    }
}
