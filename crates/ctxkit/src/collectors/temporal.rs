//! Session memory: a bounded message buffer with extractive summaries of
//! evicted history, task and attempt tracking, and frustration detection.
//!
//! State is persisted to the [`SessionStore`] after every mutation and
//! restored at construction.

use crate::session::SessionStore;
use crate::{Error, Message, MessageRole, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use tracing::{debug, info, warn};

// ── Configuration ──────────────────────────────────────────────────

/// Thresholds for [`detect_frustration`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FrustrationConfig {
    /// Signals required to flag the user as frustrated. Default: `2`.
    pub min_signals: usize,
    /// Lowercase substrings counted as negative phrasing.
    pub negative_keywords: Vec<String>,
    /// Run length of `!`/`?` counted as excessive. Default: `3`.
    pub punctuation_run: usize,
    /// Messages at most this many characters can be "short angry". Default: `40`.
    pub short_message_chars: usize,
    /// Uppercase share of letters that counts as shouting. Default: `0.7`.
    pub shouting_ratio: f64,
    /// Earlier user messages compared for repeats. Default: `5`.
    pub repeat_window: usize,
    /// Earlier identical copies that make a repeat persistent. Default: `2`.
    ///
    /// `PersistentRepeat` is counted from the same copies as `Repeat`, so
    /// with the defaults three identical messages alone reach
    /// `min_signals = 2`. Set to `0` to disable it and require a second,
    /// unrelated signal.
    pub persistent_repeat_count: usize,
    /// Consecutive failures that count as a signal. Default: `3`.
    pub failure_threshold: u32,
}

impl Default for FrustrationConfig {
    fn default() -> Self {
        Self {
            min_signals: 2,
            negative_keywords: [
                "wrong",
                "broken",
                "doesn't work",
                "does not work",
                "not working",
                "still failing",
                "useless",
                "frustrat",
                "annoying",
                "wtf",
                "terrible",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            punctuation_run: 3,
            short_message_chars: 40,
            shouting_ratio: 0.7,
            repeat_window: 5,
            persistent_repeat_count: 2,
            failure_threshold: 3,
        }
    }
}

/// Configuration for [`TemporalContextCollector`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TemporalConfig {
    /// Buffer length above which old messages are summarized. Default: `50`.
    pub auto_summarize_threshold: usize,
    /// Messages kept in the buffer after summarizing. Default: `20`.
    pub preserve_count: usize,
    /// Topic words recorded per summary. Default: `5`.
    pub summary_topics: usize,
    pub frustration: FrustrationConfig,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            auto_summarize_threshold: 50,
            preserve_count: 20,
            summary_topics: 5,
            frustration: FrustrationConfig::default(),
        }
    }
}

impl TemporalConfig {
    pub fn with_threshold(mut self, threshold: usize, preserve: usize) -> Self {
        self.auto_summarize_threshold = threshold;
        self.preserve_count = preserve;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.auto_summarize_threshold == 0 {
            return Err(Error::InvalidConfig(
                "temporal.auto_summarize_threshold must be positive".into(),
            ));
        }
        if self.preserve_count >= self.auto_summarize_threshold {
            return Err(Error::InvalidConfig(format!(
                "temporal.preserve_count ({}) must be below auto_summarize_threshold ({})",
                self.preserve_count, self.auto_summarize_threshold
            )));
        }
        if self.frustration.min_signals == 0 {
            return Err(Error::InvalidConfig(
                "temporal.frustration.min_signals must be positive".into(),
            ));
        }
        Ok(())
    }
}

// ── State ──────────────────────────────────────────────────────────

/// Extractive summary of a contiguous range of evicted messages.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionSummary {
    /// Absolute index of the first summarized message.
    pub start_index: u64,
    /// Absolute index of the last summarized message (inclusive).
    pub end_index: u64,
    pub role_counts: BTreeMap<String, usize>,
    pub topics: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl SessionSummary {
    pub fn message_count(&self) -> u64 {
        self.end_index - self.start_index + 1
    }

    pub fn to_text(&self) -> String {
        let counts: Vec<String> = self
            .role_counts
            .iter()
            .map(|(role, n)| format!("{n} {role}"))
            .collect();
        let mut out = format!(
            "Messages {}-{}: {}.",
            self.start_index,
            self.end_index,
            counts.join(", ")
        );
        if !self.topics.is_empty() {
            let _ = write!(out, " Topics: {}.", self.topics.join(", "));
        }
        out
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Active,
    Completed,
    Abandoned,
}

/// The objective currently being worked on.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskState {
    pub objective: String,
    pub sub_tasks: Vec<String>,
    pub completed_sub_tasks: Vec<String>,
    pub attempts: u32,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskState {
    pub fn new(objective: impl Into<String>, sub_tasks: Vec<String>) -> Self {
        Self {
            objective: objective.into(),
            sub_tasks,
            completed_sub_tasks: Vec::new(),
            attempts: 0,
            status: TaskStatus::Active,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_sub_task_done(&self, name: &str) -> bool {
        self.completed_sub_tasks.iter().any(|s| s == name)
    }

    pub fn to_prompt_text(&self) -> String {
        let mut out = format!("Objective: {}", self.objective);
        if !self.sub_tasks.is_empty() {
            out.push_str("\nSub-tasks:");
            for sub in &self.sub_tasks {
                let mark = if self.is_sub_task_done(sub) { "x" } else { " " };
                let _ = write!(out, "\n- [{mark}] {sub}");
            }
        }
        if self.attempts > 0 {
            let _ = write!(out, "\nAttempts so far: {}", self.attempts);
        }
        out
    }
}

/// One reason a user message looks frustrated.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FrustrationSignal {
    NegativeKeyword,
    ExcessivePunctuation,
    ShortAngry,
    Repeat,
    PersistentRepeat,
    RepeatedFailures,
}

/// Result of [`detect_frustration`] on the latest user message.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct FrustrationState {
    pub user_frustrated: bool,
    pub signals: Vec<FrustrationSignal>,
    pub detected_at: Option<DateTime<Utc>>,
}

impl FrustrationState {
    /// Prompt guidance when the user is frustrated.
    pub fn guidance(&self) -> Option<&'static str> {
        self.user_frustrated.then_some(
            "The user appears frustrated. Acknowledge the problem briefly, avoid repeating \
             approaches that already failed, and state a concrete next step.",
        )
    }
}

/// Everything the temporal collector persists.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct TemporalState {
    pub messages: Vec<Message>,
    pub summaries: Vec<SessionSummary>,
    pub task: Option<TaskState>,
    pub archived_tasks: Vec<TaskState>,
    pub frustration: FrustrationState,
    pub consecutive_failures: u32,
    pub total_messages: u64,
}

// ── Detection and summarizing ──────────────────────────────────────

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn longest_punctuation_run(text: &str) -> usize {
    let mut best = 0;
    let mut run = 0;
    for c in text.chars() {
        if c == '!' || c == '?' {
            run += 1;
            best = best.max(run);
        } else {
            run = 0;
        }
    }
    best
}

fn is_shouting(text: &str, ratio: f64) -> bool {
    let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() < 4 {
        return false;
    }
    let upper = letters.iter().filter(|c| c.is_uppercase()).count();
    upper as f64 / letters.len() as f64 >= ratio
}

/// Check a user message for frustration signals.
///
/// `earlier` holds the previous user messages, oldest first; only the last
/// `repeat_window` are compared.
pub fn detect_frustration(
    text: &str,
    earlier: &[&str],
    consecutive_failures: u32,
    config: &FrustrationConfig,
) -> FrustrationState {
    let mut signals = Vec::new();
    let lower = text.to_lowercase();

    if config
        .negative_keywords
        .iter()
        .any(|k| !k.is_empty() && lower.contains(&k.to_lowercase()))
    {
        signals.push(FrustrationSignal::NegativeKeyword);
    }

    if config.punctuation_run > 0 && longest_punctuation_run(text) >= config.punctuation_run {
        signals.push(FrustrationSignal::ExcessivePunctuation);
    }

    let trimmed = text.trim();
    if !trimmed.is_empty()
        && trimmed.chars().count() <= config.short_message_chars
        && (is_shouting(trimmed, config.shouting_ratio) || trimmed.ends_with('!'))
    {
        signals.push(FrustrationSignal::ShortAngry);
    }

    let needle = normalize(text);
    if !needle.is_empty() {
        let window = earlier.len().saturating_sub(config.repeat_window);
        let copies = earlier
            .get(window..)
            .unwrap_or_default()
            .iter()
            .filter(|e| normalize(e) == needle)
            .count();
        if copies >= 1 {
            signals.push(FrustrationSignal::Repeat);
        }
        if config.persistent_repeat_count > 0 && copies >= config.persistent_repeat_count {
            signals.push(FrustrationSignal::PersistentRepeat);
        }
    }

    if config.failure_threshold > 0 && consecutive_failures >= config.failure_threshold {
        signals.push(FrustrationSignal::RepeatedFailures);
    }

    FrustrationState {
        user_frustrated: signals.len() >= config.min_signals,
        signals,
        detected_at: Some(Utc::now()),
    }
}

/// The `n` longest distinct words in `messages`, ties in first-seen order.
pub fn extract_topics(messages: &[Message], n: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut words: Vec<String> = Vec::new();
    for msg in messages {
        for word in msg
            .content
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|w| !w.is_empty())
        {
            let word = word.to_lowercase();
            if seen.insert(word.clone()) {
                words.push(word);
            }
        }
    }
    words.sort_by_key(|w| std::cmp::Reverse(w.chars().count()));
    words.truncate(n);
    words
}

// ── Collector ──────────────────────────────────────────────────────

/// Session memory for one conversation.
#[derive(Debug)]
pub struct TemporalContextCollector {
    config: TemporalConfig,
    state: TemporalState,
    store: Option<SessionStore>,
}

impl TemporalContextCollector {
    /// Create a collector, restoring state persisted in `store`.
    pub fn new(config: TemporalConfig, store: Option<SessionStore>) -> Result<Self> {
        config.validate()?;
        let state = store.as_ref().map(|s| s.load().temporal).unwrap_or_default();
        if state.total_messages > 0 {
            debug!(
                "Restored session memory: {} buffered of {} messages, {} summaries",
                state.messages.len(),
                state.total_messages,
                state.summaries.len()
            );
        }
        Ok(Self { config, state, store })
    }

    pub fn config(&self) -> &TemporalConfig {
        &self.config
    }

    pub fn state(&self) -> &TemporalState {
        &self.state
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            let state = self.state.clone();
            if let Err(e) = store.update(|doc| doc.temporal = state) {
                warn!("Failed to persist session memory: {e}");
            }
        }
    }

    /// Record a message. User messages are checked for frustration; a buffer
    /// over the threshold is summarized down to `preserve_count`.
    pub fn add_message(&mut self, role: MessageRole, text: impl Into<String>) {
        let message = Message::new(role, text);

        if role == MessageRole::User {
            let earlier: Vec<&str> = self
                .state
                .messages
                .iter()
                .filter(|m| m.role == MessageRole::User)
                .map(|m| m.content.as_str())
                .collect();
            let detected = detect_frustration(
                &message.content,
                &earlier,
                self.state.consecutive_failures,
                &self.config.frustration,
            );
            if detected.user_frustrated && !self.state.frustration.user_frustrated {
                info!("User frustration detected: {:?}", detected.signals);
            }
            self.state.frustration = detected;
        }

        self.state.messages.push(message);
        self.state.total_messages += 1;

        if self.state.messages.len() > self.config.auto_summarize_threshold {
            self.summarize_oldest();
        }
        self.persist();
    }

    fn summarize_oldest(&mut self) {
        let len = self.state.messages.len();
        let evict = len - self.config.preserve_count;
        let start_index = self.state.total_messages - len as u64;
        let evicted: Vec<Message> = self.state.messages.drain(..evict).collect();

        let mut role_counts = BTreeMap::new();
        for msg in &evicted {
            *role_counts.entry(msg.role.to_string()).or_insert(0) += 1;
        }
        let summary = SessionSummary {
            start_index,
            end_index: start_index + evict as u64 - 1,
            role_counts,
            topics: extract_topics(&evicted, self.config.summary_topics),
            created_at: Utc::now(),
        };
        debug!("Summarized session messages: {}", summary.to_text());
        self.state.summaries.push(summary);
    }

    /// Start a new task, archiving any active one as abandoned.
    pub fn start_task(&mut self, objective: impl Into<String>, sub_tasks: Vec<String>) {
        if let Some(mut previous) = self.state.task.take() {
            if previous.status == TaskStatus::Active {
                previous.status = TaskStatus::Abandoned;
                previous.finished_at = Some(Utc::now());
            }
            self.state.archived_tasks.push(previous);
        }
        let task = TaskState::new(objective, sub_tasks);
        info!("Task started: {}", task.objective);
        self.state.task = Some(task);
        self.persist();
    }

    /// Mark a sub-task done. Returns `false` if there is no active task, the
    /// name is unknown, or it was already done.
    pub fn complete_sub_task(&mut self, name: &str) -> bool {
        let Some(task) = self.state.task.as_mut().filter(|t| t.status == TaskStatus::Active) else {
            return false;
        };
        if !task.sub_tasks.iter().any(|s| s == name) || task.is_sub_task_done(name) {
            return false;
        }
        task.completed_sub_tasks.push(name.to_string());
        self.persist();
        true
    }

    /// Complete the active task and archive it. Returns `false` without one.
    pub fn complete_task(&mut self) -> bool {
        let Some(mut task) = self.state.task.take() else {
            return false;
        };
        if task.status != TaskStatus::Active {
            self.state.task = Some(task);
            return false;
        }
        task.status = TaskStatus::Completed;
        task.finished_at = Some(Utc::now());
        info!("Task completed: {} after {} attempts", task.objective, task.attempts);
        self.state.archived_tasks.push(task);
        self.persist();
        true
    }

    /// Count another attempt on the active task; returns the new count.
    pub fn increment_attempt(&mut self) -> u32 {
        let attempts = match self.state.task.as_mut() {
            Some(task) => {
                task.attempts += 1;
                task.attempts
            }
            None => return 0,
        };
        self.persist();
        attempts
    }

    pub fn record_failure(&mut self) -> u32 {
        self.state.consecutive_failures += 1;
        self.persist();
        self.state.consecutive_failures
    }

    pub fn record_success(&mut self) {
        if self.state.consecutive_failures > 0 {
            self.state.consecutive_failures = 0;
            self.persist();
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.consecutive_failures
    }

    /// All summaries of evicted history, one per line.
    pub fn summary_text(&self) -> String {
        self.state
            .summaries
            .iter()
            .map(SessionSummary::to_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The last `n` buffered messages.
    pub fn recent_messages(&self, n: usize) -> &[Message] {
        let len = self.state.messages.len();
        self.state.messages.get(len.saturating_sub(n)..).unwrap_or_default()
    }

    pub fn task(&self) -> Option<&TaskState> {
        self.state.task.as_ref()
    }

    pub fn frustration(&self) -> &FrustrationState {
        &self.state.frustration
    }

    /// Clear all session memory.
    pub fn reset(&mut self) {
        self.state = TemporalState::default();
        self.persist();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> TemporalContextCollector {
        TemporalContextCollector::new(TemporalConfig::default(), None).unwrap()
    }

    #[test]
    fn three_identical_messages_flag_frustration() {
        let mut t = collector();
        t.add_message(MessageRole::User, "run the tests");
        assert!(!t.frustration().user_frustrated);
        t.add_message(MessageRole::Assistant, "Done.");
        t.add_message(MessageRole::User, "run the tests");
        assert_eq!(t.frustration().signals, vec![FrustrationSignal::Repeat]);
        assert!(!t.frustration().user_frustrated);
        t.add_message(MessageRole::User, "Run the  tests");
        assert!(t.frustration().user_frustrated);
        assert!(t.frustration().signals.contains(&FrustrationSignal::PersistentRepeat));
        assert!(t.frustration().guidance().is_some());
    }

    #[test]
    fn repeats_alone_need_persistent_signal() {
        let cfg = FrustrationConfig {
            persistent_repeat_count: 0,
            ..FrustrationConfig::default()
        };
        let earlier = ["run the tests", "run the tests"];
        let state = detect_frustration("run the tests", &earlier, 0, &cfg);
        assert_eq!(state.signals, vec![FrustrationSignal::Repeat]);
        assert!(!state.user_frustrated);

        // A second, unrelated signal still tips it over.
        let state = detect_frustration("run the tests, still broken", &["run the tests, still broken"], 0, &cfg);
        assert!(state.user_frustrated);
    }

    #[test]
    fn single_signal_is_not_enough() {
        let cfg = FrustrationConfig::default();
        let state = detect_frustration("this approach seems wrong to me, can we try another", &[], 0, &cfg);
        assert_eq!(state.signals, vec![FrustrationSignal::NegativeKeyword]);
        assert!(!state.user_frustrated);
    }

    #[test]
    fn angry_message_fires_several_signals() {
        let cfg = FrustrationConfig::default();
        let state = detect_frustration("IT IS STILL BROKEN!!!", &[], 0, &cfg);
        assert!(state.user_frustrated);
        assert!(state.signals.contains(&FrustrationSignal::NegativeKeyword));
        assert!(state.signals.contains(&FrustrationSignal::ExcessivePunctuation));
        assert!(state.signals.contains(&FrustrationSignal::ShortAngry));
    }

    #[test]
    fn failures_count_as_signal() {
        let cfg = FrustrationConfig::default();
        let calm = detect_frustration("please look at the log", &[], 2, &cfg);
        assert!(calm.signals.is_empty());
        let state = detect_frustration("still failing, please look at the log", &[], 3, &cfg);
        assert_eq!(
            state.signals,
            vec![FrustrationSignal::NegativeKeyword, FrustrationSignal::RepeatedFailures]
        );
        assert!(state.user_frustrated);
    }

    #[test]
    fn repeats_outside_window_are_ignored() {
        let cfg = FrustrationConfig {
            repeat_window: 2,
            ..FrustrationConfig::default()
        };
        let earlier = ["fix it", "a", "b"];
        let state = detect_frustration("fix it", &earlier, 0, &cfg);
        assert!(!state.signals.contains(&FrustrationSignal::Repeat));
    }

    #[test]
    fn buffer_is_summarized_past_threshold() {
        let mut t = TemporalContextCollector::new(TemporalConfig::default().with_threshold(10, 4), None).unwrap();
        for i in 0..10 {
            t.add_message(MessageRole::User, format!("question {i} about tokenizer"));
            if i < 9 {
                assert!(t.state().summaries.is_empty());
            }
        }
        assert_eq!(t.state().messages.len(), 10);
        t.add_message(MessageRole::Assistant, "answer about serialization");

        let state = t.state();
        assert_eq!(state.messages.len(), 4);
        assert_eq!(state.total_messages, 11);
        assert_eq!(state.summaries.len(), 1);
        let summary = &state.summaries[0];
        assert_eq!((summary.start_index, summary.end_index), (0, 6));
        assert_eq!(summary.message_count(), 7);
        assert_eq!(summary.role_counts["user"], 7);
        assert_eq!(summary.topics[0], "tokenizer");
        assert!(t.summary_text().starts_with("Messages 0-6: 7 user."));

        // The next eviction continues the absolute numbering.
        for i in 0..7 {
            t.add_message(MessageRole::Assistant, format!("reply {i}"));
        }
        let second = &t.state().summaries[1];
        assert_eq!((second.start_index, second.end_index), (7, 13));
    }

    #[test]
    fn topics_are_longest_distinct_words() {
        let msgs = vec![
            Message::user("the parser rejects Unicode input"),
            Message::assistant("Unicode normalization happens before the parser"),
        ];
        assert_eq!(extract_topics(&msgs, 3), vec!["normalization", "rejects", "unicode"]);
    }

    #[test]
    fn task_lifecycle() {
        let mut t = collector();
        assert!(!t.complete_sub_task("x"));
        assert_eq!(t.increment_attempt(), 0);

        t.start_task("Fix flaky test", vec!["reproduce".into(), "patch".into()]);
        assert!(t.complete_sub_task("reproduce"));
        assert!(!t.complete_sub_task("reproduce"));
        assert!(!t.complete_sub_task("unknown"));
        assert_eq!(t.increment_attempt(), 1);
        assert_eq!(t.increment_attempt(), 2);
        let text = t.task().unwrap().to_prompt_text();
        assert!(text.contains("- [x] reproduce"));
        assert!(text.contains("- [ ] patch"));
        assert!(text.contains("Attempts so far: 2"));

        t.start_task("Write docs", vec![]);
        assert_eq!(t.state().archived_tasks[0].status, TaskStatus::Abandoned);
        assert!(t.complete_task());
        assert!(t.task().is_none());
        assert_eq!(t.state().archived_tasks[1].status, TaskStatus::Completed);
        assert!(!t.complete_task());
    }

    #[test]
    fn failure_counter_resets_on_success() {
        let mut t = collector();
        assert_eq!(t.record_failure(), 1);
        assert_eq!(t.record_failure(), 2);
        t.record_success();
        assert_eq!(t.consecutive_failures(), 0);
    }

    #[test]
    fn recent_messages_and_reset() {
        let mut t = collector();
        for i in 0..5 {
            t.add_message(MessageRole::User, format!("m{i}"));
        }
        let recent: Vec<&str> = t.recent_messages(2).iter().map(|m| m.content.as_str()).collect();
        assert_eq!(recent, vec!["m3", "m4"]);
        assert_eq!(t.recent_messages(100).len(), 5);
        t.reset();
        assert_eq!(t.state(), &TemporalState::default());
    }

    #[test]
    fn state_persists_across_collectors() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("session.json"));
        {
            let mut t = TemporalContextCollector::new(TemporalConfig::default(), Some(store.clone())).unwrap();
            t.add_message(MessageRole::User, "hello");
            t.start_task("Ship it", vec!["test".into()]);
            t.record_failure();
        }
        let t = TemporalContextCollector::new(TemporalConfig::default(), Some(store)).unwrap();
        assert_eq!(t.state().total_messages, 1);
        assert_eq!(t.task().unwrap().objective, "Ship it");
        assert_eq!(t.consecutive_failures(), 1);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = TemporalConfig::default().with_threshold(10, 10);
        assert!(matches!(
            TemporalContextCollector::new(cfg, None),
            Err(Error::InvalidConfig(_))
        ));
    }
}
