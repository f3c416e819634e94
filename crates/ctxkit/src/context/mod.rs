//! The data every other module operates on, and the budget it is measured
//! against.
//!
//! 1. **[`tokens`]**: the one deterministic token estimator
//!    (`ceil(chars / 4)`). The monitor, the compaction strategies, and the
//!    orchestrator all call it, so their budget decisions agree.
//!
//! 2. **[`conversation`]**: [`ConversationContext`] holds ordered messages and a
//!    fixed `max_tokens` budget. Compaction produces a new context rather than
//!    mutating the old one.
//!
//! 3. **[`monitor`]**: [`ContextMonitor`] computes the usage ratio and decides
//!    when the compaction threshold is crossed.

pub mod conversation;
pub mod monitor;
pub mod tokens;

pub use conversation::ConversationContext;
pub use monitor::{ContextMonitor, ContextUsage, DEFAULT_COMPACTION_THRESHOLD, MonitorConfig, MonitorStats};
pub use tokens::{CHARS_PER_TOKEN, estimate_message_tokens, estimate_tokens};
