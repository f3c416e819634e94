//! Assembles the outbound prompt from the three collectors.
//!
//! The layout is an attention sandwich. Stable instructions go first, bulky
//! background sits in the middle, and the freshest, most relevant material
//! goes last next to the user's query:
//!
//! | Zone | Sections |
//! |------|----------|
//! | primacy | constitution, task objective (+ frustration guidance), architectural rules |
//! | middle | session summary, secondary retrieved chunks |
//! | recency | environment, most relevant chunk, recent messages, user query |
//!
//! Collectors are borrowed per call through [`PromptSources`]. A missing or
//! failing collector leaves its sections out.

pub mod prompt;

pub use prompt::{MetaPrompt, MetaPromptBuilder, PromptSection, Zone};

use crate::collectors::dynamic::DynamicContextCollector;
use crate::collectors::static_index::{RetrievalStrategy, SearchResult, StaticContextCollector};
use crate::collectors::temporal::TemporalContextCollector;
use crate::{Error, Message, MessageRole, Result, truncate_chars};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const SECTION_CONSTITUTION: &str = "constitution";
pub const SECTION_TASK: &str = "task";
pub const SECTION_RULES: &str = "rules";
pub const SECTION_SUMMARY: &str = "session_summary";
pub const SECTION_RELATED_CODE: &str = "related_code";
pub const SECTION_ENVIRONMENT: &str = "environment";
pub const SECTION_PRIMARY_CODE: &str = "primary_code";
pub const SECTION_RECENT: &str = "recent_messages";
pub const SECTION_QUERY: &str = "query";

const DEFAULT_CONSTITUTION: &str = "\
You are a careful software engineering assistant working inside the user's repository.
- Ground answers in the code and environment shown below; say so when information is missing.
- Prefer small, verifiable changes and explain how to check them.
- Never invent file paths, APIs or command output.";

/// Configuration for [`ContextOrchestrator`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Fixed policy text opening every prompt.
    pub constitution: String,
    /// Project rules listed after the task.
    pub architectural_rules: Vec<String>,
    /// Chunks retrieved per query: one primary plus secondaries. Default: `5`.
    pub retrieval_count: usize,
    pub retrieval_strategy: RetrievalStrategy,
    /// Characters kept per secondary chunk. Default: `1500`.
    pub secondary_chunk_chars: usize,
    /// Buffered messages shown in the recency zone. Default: `10`.
    pub recent_messages: usize,
    /// Characters kept per recent message. Default: `1000`.
    pub message_chars: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            constitution: DEFAULT_CONSTITUTION.to_string(),
            architectural_rules: Vec::new(),
            retrieval_count: 5,
            retrieval_strategy: RetrievalStrategy::Hybrid,
            secondary_chunk_chars: 1_500,
            recent_messages: 10,
            message_chars: 1_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_rules(mut self, rules: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.architectural_rules = rules.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retrieval(mut self, count: usize, strategy: RetrievalStrategy) -> Self {
        self.retrieval_count = count;
        self.retrieval_strategy = strategy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.secondary_chunk_chars == 0 || self.message_chars == 0 {
            return Err(Error::InvalidConfig(
                "orchestrator character limits must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Collectors available to one [`ContextOrchestrator::build`] call.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptSources<'a> {
    pub static_index: Option<&'a StaticContextCollector>,
    pub dynamic: Option<&'a DynamicContextCollector>,
    pub temporal: Option<&'a TemporalContextCollector>,
}

fn render_chunk(result: &SearchResult, max_chars: Option<usize>) -> String {
    let chunk = &result.chunk;
    let body = match max_chars {
        Some(n) => truncate_chars(&chunk.text, n, "\n..."),
        None => chunk.text.clone(),
    };
    format!(
        "`{}` lines {}-{} ({} `{}`)\n```\n{}\n```",
        chunk.path,
        chunk.start_line,
        chunk.end_line,
        chunk.kind.as_str(),
        chunk.name,
        body
    )
}

fn render_messages(messages: &[Message], max_chars: usize) -> String {
    messages
        .iter()
        .map(|m| format!("[{}]: {}", m.role, truncate_chars(&m.content, max_chars, "...")))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Drop a trailing user message that repeats `query`, which the prompt
/// already carries as its last section.
fn without_query<'m>(messages: &'m [Message], query: &str) -> &'m [Message] {
    match messages.split_last() {
        Some((last, earlier)) if last.role == MessageRole::User && last.content.trim() == query.trim() => earlier,
        _ => messages,
    }
}

/// Builds [`MetaPrompt`]s.
#[derive(Debug, Clone)]
pub struct ContextOrchestrator {
    config: OrchestratorConfig,
}

impl ContextOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    async fn retrieve(&self, query: &str, index: Option<&StaticContextCollector>) -> Vec<SearchResult> {
        let Some(index) = index else {
            return Vec::new();
        };
        if self.config.retrieval_count == 0 {
            return Vec::new();
        }
        match index
            .retrieve(query, self.config.retrieval_count, self.config.retrieval_strategy)
            .await
        {
            Ok(results) => results,
            Err(e) => {
                warn!("Static retrieval failed, code sections omitted: {e}");
                Vec::new()
            }
        }
    }

    /// Assemble a prompt for `query` from whichever collectors are present.
    pub async fn build(&self, query: &str, sources: PromptSources<'_>) -> MetaPrompt {
        let snapshot = async {
            match sources.dynamic {
                Some(dynamic) => Some(dynamic.snapshot().await),
                None => None,
            }
        };
        let (results, environment) = tokio::join!(self.retrieve(query, sources.static_index), snapshot);

        let mut results = results.into_iter();
        let primary = results.next();
        let secondary: Vec<String> = results
            .map(|r| render_chunk(&r, Some(self.config.secondary_chunk_chars)))
            .collect();

        let temporal = sources.temporal;
        let task = temporal.and_then(|t| {
            let mut text = t.task().map(|task| task.to_prompt_text()).unwrap_or_default();
            if let Some(guidance) = t.frustration().guidance() {
                if !text.is_empty() {
                    text.push_str("\n\n");
                }
                text.push_str(guidance);
            }
            (!text.is_empty()).then_some(text)
        });
        let rules = (!self.config.architectural_rules.is_empty()).then(|| {
            self.config
                .architectural_rules
                .iter()
                .map(|r| format!("- {r}"))
                .collect::<Vec<_>>()
                .join("\n")
        });

        let prompt = MetaPromptBuilder::new()
            .section(Zone::Primacy, SECTION_CONSTITUTION, "Constitution", self.config.constitution.as_str())
            .section_opt(Zone::Primacy, SECTION_TASK, "Current Task", task)
            .section_opt(Zone::Primacy, SECTION_RULES, "Architectural Rules", rules)
            .section_opt(Zone::Middle, SECTION_SUMMARY, "Session Summary", temporal.map(|t| t.summary_text()))
            .section(Zone::Middle, SECTION_RELATED_CODE, "Related Code", secondary.join("\n\n"))
            .section_opt(
                Zone::Recency,
                SECTION_ENVIRONMENT,
                "Environment",
                environment.map(|e| e.to_prompt_text()),
            )
            .section_opt(
                Zone::Recency,
                SECTION_PRIMARY_CODE,
                "Most Relevant Code",
                primary.map(|r| render_chunk(&r, None)),
            )
            .section_opt(
                Zone::Recency,
                SECTION_RECENT,
                "Recent Conversation",
                temporal.map(|t| {
                    let recent = without_query(t.recent_messages(self.config.recent_messages), query);
                    render_messages(recent, self.config.message_chars)
                }),
            )
            .section(Zone::Recency, SECTION_QUERY, "User Query", query)
            .build();

        debug!(
            "Built prompt: {} sections, ~{} tokens",
            prompt.sections.len(),
            prompt.estimated_tokens
        );
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageRole;
    use crate::collectors::dynamic::DynamicConfig;
    use crate::collectors::static_index::StaticIndexConfig;
    use crate::collectors::temporal::TemporalConfig;

    fn orchestrator() -> ContextOrchestrator {
        ContextOrchestrator::new(
            OrchestratorConfig::default()
                .with_rules(["Keep the public API stable."])
                .with_retrieval(3, RetrievalStrategy::Lexical),
        )
        .unwrap()
    }

    fn index(dir: &std::path::Path) -> StaticContextCollector {
        std::fs::write(
            dir.join("config.py"),
            "def parse_config(text):\n    \"\"\"Parse configuration text.\"\"\"\n    return text\n\n\ndef load_config(path):\n    return parse_config(open(path).read())\n",
        )
        .unwrap();
        std::fs::write(dir.join("render.py"), "def render_config(cfg):\n    return str(cfg)\n").unwrap();
        let mut index = StaticContextCollector::new(StaticIndexConfig::default().with_root(dir), None).unwrap();
        index.index(false);
        index
    }

    #[tokio::test]
    async fn query_only_prompt() {
        let prompt = orchestrator().build("hello", PromptSources::default()).await;
        assert_eq!(prompt.section_names(), vec![SECTION_CONSTITUTION, SECTION_RULES, SECTION_QUERY]);
        assert!(prompt.render().ends_with("## User Query\n\nhello"));
    }

    #[tokio::test]
    async fn full_prompt_follows_attention_order() {
        let dir = tempfile::tempdir().unwrap();
        let index = index(dir.path());
        let dynamic = DynamicContextCollector::new(DynamicConfig::default().with_workdir(dir.path())).unwrap();
        let mut temporal = TemporalContextCollector::new(TemporalConfig::default().with_threshold(4, 2), None).unwrap();
        temporal.start_task("Fix config parsing", vec!["reproduce".into()]);
        for i in 0..5 {
            temporal.add_message(MessageRole::User, format!("message number {i}"));
        }

        let sources = PromptSources {
            static_index: Some(&index),
            dynamic: Some(&dynamic),
            temporal: Some(&temporal),
        };
        let prompt = orchestrator().build("parse configuration", sources).await;

        assert_eq!(
            prompt.section_names(),
            vec![
                SECTION_CONSTITUTION,
                SECTION_TASK,
                SECTION_RULES,
                SECTION_SUMMARY,
                SECTION_RELATED_CODE,
                SECTION_ENVIRONMENT,
                SECTION_PRIMARY_CODE,
                SECTION_RECENT,
                SECTION_QUERY,
            ]
        );
        assert!(prompt.section(SECTION_PRIMARY_CODE).unwrap().content.contains("`parse_config`"));
        assert!(prompt.section(SECTION_TASK).unwrap().content.contains("Fix config parsing"));
        assert!(prompt.section(SECTION_ENVIRONMENT).unwrap().content.contains("Git:"));
        let recent = &prompt.section(SECTION_RECENT).unwrap().content;
        assert_eq!(recent, "[user]: message number 3\n[user]: message number 4");
        assert_eq!(prompt.estimated_tokens, crate::context::estimate_tokens(&prompt.render()));
    }

    #[tokio::test]
    async fn recorded_query_is_not_repeated_in_recent_conversation() {
        let mut temporal = TemporalContextCollector::new(TemporalConfig::default(), None).unwrap();
        temporal.add_message(MessageRole::User, "where is parse_config defined");
        temporal.add_message(MessageRole::Assistant, "In config.py.");
        temporal.add_message(MessageRole::User, "why does it reject empty files");
        let sources = PromptSources {
            temporal: Some(&temporal),
            ..PromptSources::default()
        };
        let prompt = orchestrator().build("why does it reject empty files", sources).await;
        let recent = &prompt.section(SECTION_RECENT).unwrap().content;
        assert_eq!(recent, "[user]: where is parse_config defined\n[assistant]: In config.py.");
        assert_eq!(prompt.render().matches("why does it reject empty files").count(), 1);

        // An earlier identical message is kept; only the trailing echo goes.
        let prompt = orchestrator().build("where is parse_config defined", sources).await;
        assert!(prompt.section(SECTION_RECENT).unwrap().content.contains("where is parse_config"));
    }

    #[tokio::test]
    async fn frustration_adds_guidance_without_task() {
        let mut temporal = TemporalContextCollector::new(TemporalConfig::default(), None).unwrap();
        temporal.add_message(MessageRole::User, "THIS IS STILL BROKEN!!!");
        let sources = PromptSources {
            temporal: Some(&temporal),
            ..PromptSources::default()
        };
        let prompt = orchestrator().build("fix it", sources).await;
        let task = prompt.section(SECTION_TASK).unwrap();
        assert!(task.content.starts_with("The user appears frustrated"));
        assert!(prompt.section(SECTION_SUMMARY).is_none());
    }

    #[tokio::test]
    async fn failed_retrieval_degrades_to_no_code() {
        let dir = tempfile::tempdir().unwrap();
        let index = index(dir.path());
        let sources = PromptSources {
            static_index: Some(&index),
            ..PromptSources::default()
        };
        // No searchable terms: retrieval errors, the prompt still builds.
        let prompt = orchestrator().build("?!", sources).await;
        assert!(prompt.section(SECTION_PRIMARY_CODE).is_none());
        assert!(prompt.section(SECTION_RELATED_CODE).is_none());
        assert!(prompt.section(SECTION_QUERY).is_some());
    }
}
