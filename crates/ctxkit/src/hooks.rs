//! Pre-compaction hooks.
//!
//! A [`CompactionHook`] is consulted by the
//! [`CompactionManager`](crate::compaction::CompactionManager) each time the
//! monitor says a compaction is due. Returning [`HookDecision::Abort`] skips
//! that turn's compaction.
//!
//! Two implementations ship with the crate:
//!
//! - [`LoggingHook`] logs the event and always proceeds.
//! - [`ExternalHookRunner`] runs shell commands configured in a
//!   [`HookConfig`] (loadable from `.ctxkit/hooks.json`).

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;
use tracing::{info, warn};

/// Event name passed to hooks before a compaction.
pub const PRE_COMPACTION_EVENT: &str = "pre_compaction";

/// Default timeout for one external hook command.
const DEFAULT_HOOK_TIMEOUT_MS: u64 = 10_000;

/// Boxed future returned by [`CompactionHook::pre_compaction`].
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = HookDecision> + Send + 'a>>;

/// What a hook decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDecision {
    /// Go ahead with the compaction.
    Proceed,
    /// Skip this compaction, with a reason.
    Abort(String),
}

/// Data handed to a hook before compaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreCompactionEvent {
    pub event: &'static str,
    pub usage_ratio: f64,
    pub max_tokens: usize,
}

impl PreCompactionEvent {
    pub fn new(usage_ratio: f64, max_tokens: usize) -> Self {
        Self {
            event: PRE_COMPACTION_EVENT,
            usage_ratio,
            max_tokens,
        }
    }
}

/// Hook consulted before an automatic compaction.
///
/// The default implementation proceeds.
///
/// # Example
///
/// ```ignore
/// struct NeverDuringDemo;
///
/// impl CompactionHook for NeverDuringDemo {
///     fn pre_compaction<'a>(&'a self, _event: &'a PreCompactionEvent) -> HookFuture<'a> {
///         Box::pin(async { HookDecision::Abort("demo in progress".into()) })
///     }
/// }
/// ```
pub trait CompactionHook: Send + Sync {
    fn pre_compaction<'a>(&'a self, _event: &'a PreCompactionEvent) -> HookFuture<'a> {
        Box::pin(async { HookDecision::Proceed })
    }
}

/// Logs each pre-compaction event and proceeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHook;

impl CompactionHook for LoggingHook {
    fn pre_compaction<'a>(&'a self, event: &'a PreCompactionEvent) -> HookFuture<'a> {
        Box::pin(async move {
            info!(
                "{}: usage {:.0}% of {} tokens",
                event.event,
                event.usage_ratio * 100.0,
                event.max_tokens
            );
            HookDecision::Proceed
        })
    }
}

// ── HookConfig ─────────────────────────────────────────────────────

/// External shell hooks, loadable from JSON.
///
/// ```json
/// {
///   "pre_compaction": [
///     { "command": "./scripts/allow-compaction.sh", "timeout_ms": 2000 }
///   ]
/// }
/// ```
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct HookConfig {
    #[serde(default)]
    pub pre_compaction: Vec<HookEntry>,
}

/// A single shell command.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct HookEntry {
    pub command: String,
    /// Per-command timeout. Default: 10 s.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

// ── ExternalHookRunner ─────────────────────────────────────────────

/// Runs configured shell commands before compaction.
///
/// Commands receive context via environment variables:
/// - `CTXKIT_HOOK_EVENT`: `pre_compaction`
/// - `CTXKIT_USAGE_RATIO`: current usage ratio, e.g. `0.81`
/// - `CTXKIT_MAX_TOKENS`: the context budget
///
/// Exit code 0 proceeds. Any other exit code aborts the compaction, with
/// stdout as the reason. A command that cannot be spawned or times out is
/// logged and treated as proceeding. The first aborting command wins.
#[derive(Debug, Clone)]
pub struct ExternalHookRunner {
    hooks: HookConfig,
    workdir: PathBuf,
}

impl ExternalHookRunner {
    pub fn new(hooks: HookConfig, workdir: impl Into<PathBuf>) -> Self {
        Self {
            hooks,
            workdir: workdir.into(),
        }
    }

    /// Load hook config from a JSON file. Falls back to an empty config if
    /// the file doesn't exist or can't be parsed.
    pub fn load(path: impl AsRef<Path>, workdir: impl Into<PathBuf>) -> Self {
        let hooks = match std::fs::read_to_string(path.as_ref()) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!("Failed to parse hooks config: {e}");
                HookConfig::default()
            }),
            Err(_) => HookConfig::default(),
        };
        Self::new(hooks, workdir)
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.pre_compaction.is_empty()
    }

    async fn run_command(
        &self,
        entry: &HookEntry,
        env_vars: &[(&str, String)],
    ) -> Result<(i32, String), String> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&entry.command)
            .current_dir(&self.workdir)
            .kill_on_drop(true);
        for (key, val) in env_vars {
            cmd.env(key, val);
        }

        let timeout = Duration::from_millis(entry.timeout_ms.unwrap_or(DEFAULT_HOOK_TIMEOUT_MS));
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| format!("timed out after {} ms", timeout.as_millis()))?
            .map_err(|e| format!("failed to execute hook command: {e}"))?;

        let exit_code = output.status.code().unwrap_or(1);
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((exit_code, stdout))
    }
}

impl CompactionHook for ExternalHookRunner {
    fn pre_compaction<'a>(&'a self, event: &'a PreCompactionEvent) -> HookFuture<'a> {
        Box::pin(async move {
            let env_vars = [
                ("CTXKIT_HOOK_EVENT", event.event.to_string()),
                ("CTXKIT_USAGE_RATIO", format!("{:.2}", event.usage_ratio)),
                ("CTXKIT_MAX_TOKENS", event.max_tokens.to_string()),
            ];
            for entry in &self.hooks.pre_compaction {
                match self.run_command(entry, &env_vars).await {
                    Ok((0, _)) => {}
                    Ok((code, reason)) => {
                        let reason = if reason.is_empty() {
                            format!("hook '{}' exited with {code}", entry.command)
                        } else {
                            reason
                        };
                        return HookDecision::Abort(reason);
                    }
                    Err(e) => warn!("pre_compaction hook failed: {e}"),
                }
            }
            HookDecision::Proceed
        })
    }
}
