//! End-to-end behavior across the public API.

use ctxkit::collectors::static_index::{RetrievalStrategy, StaticContextCollector, StaticIndexConfig};
use ctxkit::collectors::temporal::{TemporalConfig, TemporalContextCollector};
use ctxkit::compaction::{CompactionConfig, CompactionManager, ContextCompactor, StrategyKind};
use ctxkit::context::{ContextMonitor, ConversationContext, MonitorConfig};
use ctxkit::session::{SessionDocument, SessionStore};
use ctxkit::{Message, MessageRole};
use std::path::Path;

const ALL_STRATEGIES: [StrategyKind; 4] = [
    StrategyKind::Truncate,
    StrategyKind::Selective,
    StrategyKind::RollingWindow,
    StrategyKind::LlmSummary,
];

/// A message of exactly `tokens` estimated tokens.
fn sized(role: MessageRole, tokens: usize, tag: usize) -> Message {
    let prefix = format!("{tag}:");
    let fill = "x".repeat(tokens * 4 - prefix.len());
    Message::new(role, format!("{prefix}{fill}"))
}

fn long_conversation(max_tokens: usize) -> ConversationContext {
    let mut messages = vec![Message::system("You are a careful assistant. ".repeat(8))];
    let roles = [MessageRole::User, MessageRole::Assistant, MessageRole::Tool];
    for i in 0..30 {
        messages.push(sized(roles[i % 3], 40, i));
        if i == 14 {
            messages.push(Message::system("Mid-session rule: keep answers short."));
        }
    }
    ConversationContext::with_messages(max_tokens, messages)
}

fn write_corpus(root: &Path) {
    std::fs::write(
        root.join("config.py"),
        "def parse_config(text):\n    \"\"\"Parse configuration text into a dict.\"\"\"\n    return dict(line.split('=') for line in text.splitlines())\n",
    )
    .unwrap();
    std::fs::write(
        root.join("utils.py"),
        "def format_output(rows):\n    return '\\n'.join(rows)\n\n\ndef slugify(name):\n    return name.lower().replace(' ', '-')\n",
    )
    .unwrap();
    std::fs::write(root.join("main.py"), "def main():\n    print(format_output(['ok']))\n").unwrap();
}

#[tokio::test]
async fn every_strategy_shrinks_and_keeps_system_messages() {
    let ctx = long_conversation(4_000);
    let original = ctx.estimated_tokens();
    let systems: Vec<String> = ctx.system_messages().map(|m| m.content.clone()).collect();

    for kind in ALL_STRATEGIES {
        for target in [50, 300, 800, original] {
            let config = CompactionConfig::default().with_preserve_recent(4);
            let mut compactor = ContextCompactor::new(config).unwrap();
            let result = compactor.compact(&ctx, Some(target), Some(kind)).await.unwrap();

            assert!(
                result.compacted_tokens <= original,
                "{kind} grew the context at target {target}"
            );
            let kept: Vec<&str> = result
                .new_context
                .system_messages()
                .map(|m| m.content.as_str())
                .collect();
            for system in &systems {
                assert!(kept.contains(&system.as_str()), "{kind} lost a system message");
            }
            assert_eq!(result.new_context.max_tokens(), ctx.max_tokens());
        }
    }
}

#[tokio::test]
async fn summary_without_backend_matches_selective() {
    let ctx = long_conversation(4_000);
    let mut compactor = ContextCompactor::new(CompactionConfig::default()).unwrap();
    let summary = compactor
        .compact(&ctx, Some(400), Some(StrategyKind::LlmSummary))
        .await
        .unwrap();
    let selective = compactor
        .compact(&ctx, Some(400), Some(StrategyKind::Selective))
        .await
        .unwrap();
    assert_eq!(summary.new_context.messages(), selective.new_context.messages());
    assert_eq!(compactor.stats().compactions_performed, 2);
}

#[tokio::test]
async fn truncate_keeps_protected_messages_even_over_target() {
    let mut messages = vec![Message::system("rules"), Message::system("more rules")];
    for i in 0..10 {
        messages.push(sized(MessageRole::User, 10, i));
    }
    let ctx = ConversationContext::with_messages(ctx_budget(&messages), messages);

    let config = CompactionConfig::default()
        .with_preserve_recent(10)
        .with_target_ratio(0.5);
    let mut compactor = ContextCompactor::new(config).unwrap();
    let result = compactor
        .compact(&ctx, None, Some(StrategyKind::Truncate))
        .await
        .unwrap();
    assert_eq!(result.new_context.len(), 12);
    assert_eq!(result.messages_removed, 0);
}

#[tokio::test]
async fn rolling_and_truncate_settle_under_threshold() {
    let mut messages = vec![sized(MessageRole::System, 25, 0)];
    for i in 1..=30 {
        let role = if i % 2 == 0 { MessageRole::Assistant } else { MessageRole::User };
        messages.push(sized(role, 25, i));
    }
    let ctx = ConversationContext::with_messages(10_000, messages);

    for kind in [StrategyKind::Truncate, StrategyKind::RollingWindow] {
        let mut compactor = ContextCompactor::new(CompactionConfig::default()).unwrap();
        let once = compactor.compact(&ctx, None, Some(kind)).await.unwrap();
        let twice = compactor.compact(&once.new_context, None, Some(kind)).await.unwrap();
        assert_eq!(twice.new_context.messages(), once.new_context.messages(), "{kind}");
        assert_eq!(once.compacted_tokens, ctx.estimated_tokens(), "{kind}");
    }
}

fn ctx_budget(messages: &[Message]) -> usize {
    messages.iter().map(Message::estimated_tokens).sum()
}

#[tokio::test]
async fn manager_keeps_usage_below_threshold_after_each_compaction() {
    let monitor = ContextMonitor::new(MonitorConfig::default()).unwrap();
    let compactor = ContextCompactor::new(CompactionConfig::default()).unwrap();
    let mut manager = CompactionManager::new(ConversationContext::new(1_000), monitor, compactor);
    manager.append(Message::system("system prompt")).await.unwrap();

    let mut compactions = 0;
    for i in 0..60 {
        let role = if i % 2 == 0 { MessageRole::User } else { MessageRole::Assistant };
        if manager.append(sized(role, 25, i)).await.unwrap().is_some() {
            compactions += 1;
            let ratio = manager.monitor().usage_ratio(manager.context());
            assert!(ratio < manager.monitor().threshold(), "usage {ratio} still over threshold");
        }
    }
    assert!(compactions >= 1);
    assert_eq!(manager.context().messages()[0].content, "system prompt");
    assert!(manager.compactor().stats().total_tokens_saved > 0);
}

#[tokio::test]
async fn lexical_search_finds_parse_config() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path());
    let mut index = StaticContextCollector::new(StaticIndexConfig::default().with_root(dir.path()), None).unwrap();
    let report = index.index(false);
    assert_eq!(report.indexed, 3);

    let results = index
        .retrieve("parse configuration", 1, RetrievalStrategy::Lexical)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk.name, "parse_config");

    // Without an embedder, hybrid reduces to the lexical ranking.
    let hybrid = index
        .retrieve("parse configuration", 1, RetrievalStrategy::Hybrid)
        .await
        .unwrap();
    assert_eq!(hybrid[0].chunk.name, "parse_config");
}

#[test]
fn collectors_share_one_session_document() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path());
    let store = SessionStore::new(dir.path().join(".ctxkit").join("session.json"));

    let mut index =
        StaticContextCollector::new(StaticIndexConfig::default().with_root(dir.path()), Some(store.clone()))
            .unwrap();
    index.index(false);
    let mut temporal = TemporalContextCollector::new(TemporalConfig::default(), Some(store.clone())).unwrap();
    temporal.add_message(MessageRole::User, "where is the config parser?");
    temporal.start_task("Explain parse_config", vec![]);

    let doc = store.load();
    assert_eq!(doc.static_index.file_hashes.len(), 3);
    assert!(!doc.static_index.chunks.is_empty());
    assert_eq!(doc.temporal.total_messages, 1);
    assert!(doc.temporal.task.is_some());

    // A second run restores both and skips unchanged files.
    let mut index =
        StaticContextCollector::new(StaticIndexConfig::default().with_root(dir.path()), Some(store.clone()))
            .unwrap();
    assert_eq!(index.index(false).indexed, 0);
    let temporal = TemporalContextCollector::new(TemporalConfig::default(), Some(store)).unwrap();
    assert_eq!(temporal.task().unwrap().objective, "Explain parse_config");
}

#[test]
fn corrupt_session_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");
    std::fs::write(&path, "\u{0}\u{0}garbage").unwrap();
    let store = SessionStore::new(&path);
    assert_eq!(store.load(), SessionDocument::default());

    let temporal = TemporalContextCollector::new(TemporalConfig::default(), Some(store)).unwrap();
    assert_eq!(temporal.state().total_messages, 0);
}
