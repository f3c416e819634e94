//! Cancellable periodic background work, such as re-indexing the tree while
//! a session runs.
//!
//! A [`BackgroundWorker`] owns one tokio task that runs a job on a fixed
//! interval until [`BackgroundWorker::stop`] signals it through a
//! `tokio::sync::watch` channel. A failing run is logged and the schedule
//! continues. Workers never touch a conversation context.

use crate::Result;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Handle to a running periodic job.
#[derive(Debug)]
pub struct BackgroundWorker {
    name: String,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
    runs: Arc<AtomicU64>,
}

impl BackgroundWorker {
    /// Spawn `job` to run every `interval`, starting immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(name: impl Into<String>, interval: Duration, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let (cancel, mut cancelled) = watch::channel(false);
        let runs = Arc::new(AtomicU64::new(0));

        let task_name = name.clone();
        let task_runs = Arc::clone(&runs);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Worker {task_name} started ({}s interval)", interval.as_secs_f64());

            loop {
                tokio::select! {
                    changed = cancelled.changed() => {
                        // A dropped sender also stops the worker.
                        if changed.is_err() || *cancelled.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let run = task_runs.fetch_add(1, Ordering::Relaxed) + 1;
                        debug!("Worker {task_name}: run {run}");
                        if let Err(e) = job().await {
                            warn!("Worker {task_name} run {run} failed: {e}");
                        }
                    }
                }
            }
            info!("Worker {task_name} stopped");
        });

        Self {
            name,
            cancel,
            handle,
            runs,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of runs started so far.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal cancellation and wait for the task to exit. A run in progress
    /// finishes first.
    pub async fn stop(self) {
        let _ = self.cancel.send(true);
        if let Err(e) = self.handle.await {
            warn!("Worker {} ended abnormally: {e}", self.name);
        }
    }
}
