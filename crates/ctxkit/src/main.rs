//! Command-line driver for the ctxkit library.
//!
//! Reads optional configuration from `<root>/.ctxkit/config.json` and keeps
//! session state in `<root>/.ctxkit/session.json`. Set `OPENROUTER_KEY` to
//! enable embeddings and LLM summaries.
//!
//! # Examples
//!
//! ```sh
//! # Index the current tree (incremental), then search it
//! ctxkit index
//! ctxkit search "parse configuration" -n 3 --strategy lexical
//!
//! # Show the environment snapshot and a full assembled prompt
//! ctxkit snapshot
//! ctxkit prompt "why does parse_config reject empty files?"
//!
//! # Compact a saved conversation toward 2000 tokens
//! ctxkit compact conversation.json --strategy rolling_window --target 2000
//!
//! # Re-index every 30 seconds until Ctrl-C
//! ctxkit watch --interval 30
//! ```

use clap::{Parser, Subcommand};
use ctxkit::collectors::dynamic::DynamicContextCollector;
use ctxkit::collectors::static_index::{RetrievalStrategy, StaticContextCollector};
use ctxkit::collectors::temporal::TemporalContextCollector;
use ctxkit::compaction::{CompactionManager, ContextCompactor, StrategyKind};
use ctxkit::config::{CtxConfig, DEFAULT_CONFIG_PATH};
use ctxkit::context::{ContextMonitor, ConversationContext};
use ctxkit::hooks::ExternalHookRunner;
use ctxkit::orchestrator::{ContextOrchestrator, PromptSources};
use ctxkit::session::SessionStore;
use ctxkit::worker::BackgroundWorker;
use ctxkit::{Message, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Context budgeting, compaction, and retrieval for LLM sessions.
#[derive(Parser)]
#[command(name = "ctxkit", version)]
struct Cli {
    /// Project root to index and probe.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Session file (default: <root>/.ctxkit/session.json).
    #[arg(long, global = true)]
    session: Option<PathBuf>,

    /// Config file (default: <root>/.ctxkit/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG overrides).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Index source files under the root.
    Index {
        /// Re-extract every file, ignoring stored hashes.
        #[arg(long)]
        force: bool,
        /// Embed chunks that have no vector yet (needs OPENROUTER_KEY).
        #[arg(long)]
        embed: bool,
    },
    /// Search the static index.
    Search {
        query: String,
        /// Number of results.
        #[arg(short, default_value_t = 5)]
        n: usize,
        /// dense, lexical or hybrid.
        #[arg(long)]
        strategy: Option<String>,
    },
    /// Print the current environment snapshot.
    Snapshot {
        /// Print JSON instead of prompt text.
        #[arg(long)]
        json: bool,
    },
    /// Assemble and print the prompt for a query.
    Prompt { query: String },
    /// Compact a conversation file and print the result as JSON.
    Compact {
        /// JSON array of messages, or `{"max_tokens": N, "messages": [...]}`.
        file: PathBuf,
        /// truncate, selective, rolling_window or llm_summary.
        #[arg(long)]
        strategy: Option<String>,
        /// Target token count. Without one, a context within the configured
        /// threshold is left as is; otherwise the configured ratio applies.
        #[arg(long)]
        target: Option<usize>,
        /// Replay messages one by one through the compaction manager
        /// (threshold checks and pre-compaction hooks) instead.
        #[arg(long)]
        replay: bool,
    },
    /// Re-index periodically until interrupted.
    Watch {
        /// Seconds between runs.
        #[arg(long, default_value_t = 60)]
        interval: u64,
    },
}

/// Accepted layouts of a conversation file.
#[derive(Deserialize)]
#[serde(untagged)]
enum ConversationFile {
    Bare(Vec<Message>),
    Full {
        max_tokens: Option<usize>,
        messages: Vec<Message>,
    },
}

fn init_tracing(verbose: u8) {
    let default_level = if verbose > 0 { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(cli: &Cli) -> Result<CtxConfig> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.root.join(DEFAULT_CONFIG_PATH));
    let mut config = CtxConfig::load_or_default(path)?.with_root(&cli.root);
    if let Some(session) = &cli.session {
        config.session_path = session.clone();
    }
    Ok(config)
}

fn static_collector(config: &CtxConfig, store: &SessionStore) -> Result<StaticContextCollector> {
    let collector = StaticContextCollector::new(config.static_index.clone(), Some(store.clone()))?;
    Ok(match config.backend.client() {
        Some(client) => collector.with_embedder(Arc::new(client)),
        None => collector,
    })
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let store = SessionStore::new(&config.session_path);

    match cli.command {
        Command::Index { force, embed } => {
            let mut index = static_collector(&config, &store)?;
            let report = index.index(force);
            println!("{report}");
            if embed {
                let embedded = index.embed_missing().await;
                println!("embedded {embedded} chunks");
            }
        }

        Command::Search { query, n, strategy } => {
            let strategy = match strategy {
                Some(s) => s.parse::<RetrievalStrategy>()?,
                None => config.static_index.default_strategy,
            };
            let index = static_collector(&config, &store)?;
            for result in index.retrieve(&query, n, strategy).await? {
                let chunk = &result.chunk;
                println!(
                    "{:.4}  {:<7}  {}:{}-{}  {}",
                    result.score,
                    result.provenance.as_str(),
                    chunk.path,
                    chunk.start_line,
                    chunk.end_line,
                    chunk.name
                );
            }
        }

        Command::Snapshot { json } => {
            let dynamic = DynamicContextCollector::new(config.dynamic.clone())?;
            let state = dynamic.snapshot().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                println!("{}", state.to_prompt_text());
            }
        }

        Command::Prompt { query } => {
            let index = static_collector(&config, &store)?;
            let dynamic = DynamicContextCollector::new(config.dynamic.clone())?;
            let mut temporal = TemporalContextCollector::new(config.temporal.clone(), Some(store.clone()))?;

            let orchestrator = ContextOrchestrator::new(config.orchestrator.clone())?;
            let sources = PromptSources {
                static_index: Some(&index),
                dynamic: Some(&dynamic),
                temporal: Some(&temporal),
            };
            let prompt = orchestrator.build(&query, sources).await;
            println!("{}", prompt.render());
            eprintln!("~{} tokens", prompt.estimated_tokens);
            temporal.add_message(ctxkit::MessageRole::User, query.as_str());
        }

        Command::Compact {
            file,
            strategy,
            target,
            replay,
        } => {
            let strategy = strategy.map(|s| s.parse::<StrategyKind>()).transpose()?;
            let json = std::fs::read_to_string(&file)?;
            let (max_tokens, messages) = match serde_json::from_str::<ConversationFile>(&json)? {
                ConversationFile::Bare(messages) => (config.max_tokens, messages),
                ConversationFile::Full { max_tokens, messages } => {
                    (max_tokens.unwrap_or(config.max_tokens), messages)
                }
            };

            let mut compaction = config.compaction.clone();
            if let Some(kind) = strategy {
                compaction = compaction.with_strategy(kind);
            }
            let mut compactor = ContextCompactor::new(compaction)?;
            if let Some(client) = config.backend.client() {
                compactor = compactor.with_backend(Arc::new(client));
            }

            let context = if replay {
                let monitor = ContextMonitor::new(config.monitor.clone())?;
                let hooks = ExternalHookRunner::new(config.hooks.clone(), &cli.root);
                let mut manager = CompactionManager::new(ConversationContext::new(max_tokens), monitor, compactor)
                    .with_hook(Box::new(hooks));
                for message in messages {
                    if let Some(result) = manager.append(message).await? {
                        eprintln!(
                            "compacted with {}: {} -> {} tokens",
                            result.strategy_used, result.original_tokens, result.compacted_tokens
                        );
                    }
                }
                manager.into_context()
            } else {
                let context = ConversationContext::with_messages(max_tokens, messages);
                let result = compactor.compact(&context, target, None).await?;
                eprintln!(
                    "{}: {} -> {} tokens, {} messages removed, {} summarized",
                    result.strategy_used,
                    result.original_tokens,
                    result.compacted_tokens,
                    result.messages_removed,
                    result.messages_summarized
                );
                result.new_context
            };
            println!("{}", serde_json::to_string_pretty(context.messages())?);
        }

        Command::Watch { interval } => {
            let index = Arc::new(tokio::sync::Mutex::new(static_collector(&config, &store)?));
            let worker = BackgroundWorker::spawn("reindex", Duration::from_secs(interval.max(1)), move || {
                let index = Arc::clone(&index);
                async move {
                    let mut index = index.lock().await;
                    index.index(false);
                    index.embed_missing().await;
                    Ok(())
                }
            });
            tokio::signal::ctrl_c().await?;
            worker.stop().await;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        process::exit(if e.is_configuration() { 2 } else { 1 });
    }
}
