//! Context budget monitoring: decides when a conversation has grown large
//! enough to compact.
//!
//! Usage is the estimated token count of the conversation divided by its
//! `max_tokens` budget. Once usage reaches the configured threshold (75% by
//! default), [`ContextMonitor::should_compact`] returns `true` until a
//! compaction brings usage back under it. [`ContextMonitor::can_admit`] lets
//! callers check a large tool result before appending it.

use super::conversation::ConversationContext;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default usage ratio at which compaction is triggered.
pub const DEFAULT_COMPACTION_THRESHOLD: f64 = 0.75;

/// Configuration for [`ContextMonitor`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Usage ratio (0.0, 1.0] at which compaction is triggered. Default: `0.75`.
    pub threshold: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_COMPACTION_THRESHOLD,
        }
    }
}

impl MonitorConfig {
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "monitor.threshold must be in (0, 1], got {}",
                self.threshold
            )));
        }
        Ok(())
    }
}

/// Observability counters kept by the monitor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorStats {
    /// Highest usage ratio observed by `should_compact`.
    pub peak_usage: f64,
    /// Number of below-to-above threshold transitions.
    pub threshold_crossings: usize,
    /// Number of `should_compact` checks performed.
    pub checks: usize,
}

/// Snapshot of context usage at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextUsage {
    /// Estimated tokens consumed.
    pub estimated_tokens: usize,
    /// Token budget of the context.
    pub max_tokens: usize,
    /// Usage as a fraction (0.0 to 1.0+).
    pub usage_pct: f64,
}

impl ContextUsage {
    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "context: ~{} tokens ({:.0}% of {})",
            self.estimated_tokens,
            self.usage_pct * 100.0,
            self.max_tokens,
        )
    }
}

/// Tracks budget consumption of a [`ConversationContext`].
///
/// The monitor holds no reference to the context; callers pass the context
/// they currently hold, which lets a
/// [`CompactionManager`](crate::compaction::CompactionManager) swap its
/// context after compaction without invalidating the monitor.
///
/// # Example
///
/// ```
/// use ctxkit::Message;
/// use ctxkit::context::{ContextMonitor, ConversationContext, MonitorConfig};
///
/// let mut monitor = ContextMonitor::new(MonitorConfig::default()).unwrap();
/// let mut ctx = ConversationContext::new(100);
/// ctx.push(Message::user("x".repeat(400)));
///
/// assert!(monitor.should_compact(&ctx));
/// assert!(!monitor.can_admit(&ctx, 10));
/// ```
#[derive(Debug)]
pub struct ContextMonitor {
    config: MonitorConfig,
    stats: MonitorStats,
    above_threshold: bool,
}

impl ContextMonitor {
    /// Create a monitor, validating the configuration.
    pub fn new(config: MonitorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            stats: MonitorStats::default(),
            above_threshold: false,
        })
    }

    pub fn threshold(&self) -> f64 {
        self.config.threshold
    }

    /// Estimate current usage of the context.
    pub fn usage(&self, ctx: &ConversationContext) -> ContextUsage {
        let estimated_tokens = ctx.estimated_tokens();
        ContextUsage {
            estimated_tokens,
            max_tokens: ctx.max_tokens(),
            usage_pct: ratio(estimated_tokens, ctx.max_tokens()),
        }
    }

    /// Estimated tokens divided by the context's budget.
    pub fn usage_ratio(&self, ctx: &ConversationContext) -> f64 {
        ratio(ctx.estimated_tokens(), ctx.max_tokens())
    }

    /// Whether usage has reached the compaction threshold.
    ///
    /// Records peak usage and counts threshold crossings.
    pub fn should_compact(&mut self, ctx: &ConversationContext) -> bool {
        let usage = self.usage_ratio(ctx);
        let over = usage >= self.config.threshold;

        self.stats.checks += 1;
        if usage > self.stats.peak_usage {
            self.stats.peak_usage = usage;
        }
        if over && !self.above_threshold {
            self.stats.threshold_crossings += 1;
            debug!(
                "Context crossed compaction threshold: {:.0}% >= {:.0}%",
                usage * 100.0,
                self.config.threshold * 100.0
            );
        }
        self.above_threshold = over;
        over
    }

    /// Whether `n_tokens` more can be appended without reaching the threshold.
    pub fn can_admit(&self, ctx: &ConversationContext, n_tokens: usize) -> bool {
        ratio(ctx.estimated_tokens() + n_tokens, ctx.max_tokens()) < self.config.threshold
    }

    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }
}

fn ratio(tokens: usize, max_tokens: usize) -> f64 {
    if max_tokens > 0 {
        tokens as f64 / max_tokens as f64
    } else {
        1.0
    }
}
