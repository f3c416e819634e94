//! Static code knowledge: an incremental chunk index over a source tree with
//! dense, lexical and hybrid retrieval.
//!
//! [`StaticContextCollector::index`] walks the root (honoring `.gitignore`
//! and hidden-file rules), hashes each candidate file with SHA-256 and
//! re-extracts chunks only for files whose hash changed. The index is
//! persisted in the session document after every run.
//!
//! Retrieval works without embeddings: lexical search scores query-term
//! coverage. With an [`EmbeddingBackend`] attached,
//! [`embed_missing`](StaticContextCollector::embed_missing) fills in chunk
//! vectors and dense and hybrid retrieval become available.

pub mod chunker;
pub mod search;

pub use chunker::{ChunkKind, CodeChunk, Language, extract_chunks};
pub use search::{DEFAULT_RRF_K, Provenance, RetrievalStrategy, SearchResult};

use crate::backend::{EmbeddingBackend, with_timeout};
use crate::session::SessionStore;
use crate::{Error, Result};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The persisted part of the index.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct StaticIndexState {
    #[serde(default)]
    pub chunks: Vec<CodeChunk>,
    /// Relative path to SHA-256 hex digest of the indexed content.
    #[serde(default)]
    pub file_hashes: BTreeMap<String, String>,
}

/// Configuration for [`StaticContextCollector`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StaticIndexConfig {
    /// Root directory to index. Default: `.`.
    pub root: PathBuf,
    /// File extensions to index, without the dot.
    pub extensions: Vec<String>,
    /// Files larger than this are not indexed. Default: 1 MB.
    pub max_file_bytes: u64,
    /// Index hidden files and directories. Default: `false`.
    pub include_hidden: bool,
    /// Reciprocal-rank-fusion constant. Default: `60`.
    pub rrf_k: f64,
    /// Each ranked list fed to fusion is cut to `n * candidate_multiplier`.
    /// Default: `2`.
    pub candidate_multiplier: usize,
    /// Chunks per embedding request. Default: `64`.
    pub embed_batch_size: usize,
    /// Timeout per embedding request in milliseconds. Default: `30000`.
    pub embed_timeout_ms: u64,
    /// Strategy used when callers don't choose one. Default: `hybrid`.
    pub default_strategy: RetrievalStrategy,
}

impl Default for StaticIndexConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            extensions: ["rs", "py", "js", "jsx", "ts", "tsx", "go"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_file_bytes: 1_000_000,
            include_hidden: false,
            rrf_k: DEFAULT_RRF_K,
            candidate_multiplier: 2,
            embed_batch_size: 64,
            embed_timeout_ms: 30_000,
            default_strategy: RetrievalStrategy::Hybrid,
        }
    }
}

impl StaticIndexConfig {
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_extensions(mut self, extensions: &[&str]) -> Self {
        self.extensions = extensions.iter().map(|e| e.to_string()).collect();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.extensions.is_empty() {
            return Err(Error::InvalidConfig("static_index.extensions must not be empty".into()));
        }
        if !(self.rrf_k > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "static_index.rrf_k must be positive, got {}",
                self.rrf_k
            )));
        }
        if self.candidate_multiplier == 0 || self.embed_batch_size == 0 {
            return Err(Error::InvalidConfig(
                "static_index.candidate_multiplier and embed_batch_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Counts from one [`StaticContextCollector::index`] run.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    /// Files (re-)extracted.
    pub indexed: usize,
    /// Files unchanged since the last run.
    pub skipped: usize,
    /// Previously indexed files that are gone.
    pub removed: usize,
    /// Files that could not be read as UTF-8 text.
    pub errors: usize,
    /// Chunks in the index afterwards.
    pub chunks: usize,
}

impl std::fmt::Display for IndexReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "indexed {}, skipped {}, removed {}, errors {} ({} chunks)",
            self.indexed, self.skipped, self.removed, self.errors, self.chunks
        )
    }
}

fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn relative_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Indexes a source tree and answers retrieval queries over it.
pub struct StaticContextCollector {
    config: StaticIndexConfig,
    state: StaticIndexState,
    store: Option<SessionStore>,
    embedder: Option<Arc<dyn EmbeddingBackend>>,
}

impl std::fmt::Debug for StaticContextCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticContextCollector")
            .field("root", &self.config.root)
            .field("chunks", &self.state.chunks.len())
            .field("files", &self.state.file_hashes.len())
            .field("has_embedder", &self.embedder.is_some())
            .finish()
    }
}

impl StaticContextCollector {
    /// Create a collector, restoring any index persisted in `store`.
    pub fn new(config: StaticIndexConfig, store: Option<SessionStore>) -> Result<Self> {
        config.validate()?;
        let state = store
            .as_ref()
            .map(|s| s.load().static_index)
            .unwrap_or_default();
        if !state.chunks.is_empty() {
            debug!(
                "Restored static index: {} chunks from {} files",
                state.chunks.len(),
                state.file_hashes.len()
            );
        }
        Ok(Self {
            config,
            state,
            store,
            embedder: None,
        })
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingBackend>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn config(&self) -> &StaticIndexConfig {
        &self.config
    }

    pub fn chunks(&self) -> &[CodeChunk] {
        &self.state.chunks
    }

    pub fn len(&self) -> usize {
        self.state.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.chunks.is_empty()
    }

    /// Look up a chunk by its (path, name) key.
    pub fn chunk(&self, path: &str, name: &str) -> Option<&CodeChunk> {
        self.state.chunks.iter().find(|c| c.path == path && c.name == name)
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            let state = self.state.clone();
            if let Err(e) = store.update(|doc| doc.static_index = state) {
                warn!("Failed to persist static index: {e}");
            }
        }
    }

    fn candidate_files(&self) -> Vec<PathBuf> {
        let extensions: BTreeSet<String> = self
            .config
            .extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect();

        let walker = WalkBuilder::new(&self.config.root)
            .hidden(!self.config.include_hidden)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .require_git(false)
            .build();

        let mut files = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable path during indexing: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let path = entry.path();
            let wanted = path
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase())
                .is_some_and(|e| extensions.contains(&e));
            if !wanted {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if size > self.config.max_file_bytes {
                debug!("Skipping large file: {} ({size} bytes)", path.display());
                continue;
            }
            files.push(path.to_path_buf());
        }
        files.sort();
        files
    }

    /// Walk the root and bring the index up to date.
    ///
    /// With `force`, every file is re-extracted regardless of its hash.
    /// Unreadable or non-UTF-8 files are counted as errors, their previous
    /// chunks are dropped, and indexing continues.
    pub fn index(&mut self, force: bool) -> IndexReport {
        let mut report = IndexReport::default();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut failed: BTreeSet<String> = BTreeSet::new();
        let mut fresh: BTreeMap<String, Vec<CodeChunk>> = BTreeMap::new();

        for path in self.candidate_files() {
            let rel = relative_path(&self.config.root, &path);
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to read {rel}: {e}");
                    report.errors += 1;
                    failed.insert(rel);
                    continue;
                }
            };
            let hash = content_hash(&bytes);
            let Ok(source) = String::from_utf8(bytes) else {
                warn!("Skipping non-UTF-8 file: {rel}");
                report.errors += 1;
                failed.insert(rel);
                continue;
            };
            seen.insert(rel.clone());

            if !force && self.state.file_hashes.get(&rel) == Some(&hash) {
                report.skipped += 1;
                continue;
            }
            fresh.insert(rel.clone(), extract_chunks(&rel, &source));
            self.state.file_hashes.insert(rel, hash);
            report.indexed += 1;
        }

        let gone: Vec<String> = self
            .state
            .file_hashes
            .keys()
            .filter(|p| !seen.contains(*p))
            .cloned()
            .collect();
        for path in &gone {
            self.state.file_hashes.remove(path);
        }
        // Errored files are already counted under `errors`.
        report.removed = gone.iter().filter(|p| !failed.contains(*p)).count();

        self.state
            .chunks
            .retain(|c| seen.contains(&c.path) && !fresh.contains_key(&c.path));
        self.state.chunks.extend(fresh.into_values().flatten());
        self.state
            .chunks
            .sort_by(|a, b| (&a.path, a.start_line, &a.name).cmp(&(&b.path, b.start_line, &b.name)));
        report.chunks = self.state.chunks.len();

        info!("Static index: {report}");
        self.persist();
        report
    }

    /// Embed every chunk that has no vector yet. Returns how many were
    /// embedded. A failed batch is logged and stops the run; chunks it did
    /// not reach stay un-embedded.
    pub async fn embed_missing(&mut self) -> usize {
        let Some(embedder) = self.embedder.clone() else {
            debug!("No embedding backend configured, skipping embedding");
            return 0;
        };
        let missing: Vec<usize> = (0..self.state.chunks.len())
            .filter(|&i| self.state.chunks[i].embedding.is_none())
            .collect();
        let timeout = Duration::from_millis(self.config.embed_timeout_ms);

        let mut embedded = 0;
        for batch in missing.chunks(self.config.embed_batch_size) {
            let texts: Vec<String> = batch
                .iter()
                .map(|&i| self.state.chunks[i].embedding_text())
                .collect();
            let vectors = match with_timeout("embedding", timeout, embedder.embed(&texts)).await {
                Ok(v) if v.len() == texts.len() => v,
                Ok(v) => {
                    warn!("Embedding backend returned {} vectors for {} texts", v.len(), texts.len());
                    break;
                }
                Err(e) => {
                    warn!("Embedding failed, leaving {} chunks un-embedded: {e}", missing.len() - embedded);
                    break;
                }
            };
            for (&i, vector) in batch.iter().zip(vectors) {
                self.state.chunks[i].embedding = Some(vector);
            }
            embedded += batch.len();
        }

        if embedded > 0 {
            info!("Embedded {embedded} chunks");
            self.persist();
        }
        embedded
    }

    /// Lexical retrieval: chunks ranked by query-term coverage. Chunks with
    /// no matching term are excluded.
    pub fn lexical_search(&self, query: &str, n: usize) -> Result<Vec<SearchResult>> {
        let ranked = self.lexical_ranking(query)?;
        Ok(ranked
            .into_iter()
            .take(n)
            .map(|(i, score)| self.result(i, score, Provenance::Lexical))
            .collect())
    }

    fn lexical_ranking(&self, query: &str) -> Result<Vec<(usize, f64)>> {
        let terms = search::query_terms(query)?;
        let mut scored: Vec<(usize, f64)> = self
            .state
            .chunks
            .iter()
            .enumerate()
            .map(|(i, c)| (i, search::lexical_score(&terms, c)))
            .filter(|(_, s)| *s > 0.0)
            .collect();
        search::rank_by_score(&mut scored);
        Ok(scored)
    }

    async fn dense_ranking(&self, query: &str) -> Vec<(usize, f64)> {
        let Some(embedder) = &self.embedder else {
            return Vec::new();
        };
        let timeout = Duration::from_millis(self.config.embed_timeout_ms);
        let texts = [query.to_string()];
        let query_vec = match with_timeout("embedding", timeout, embedder.embed(&texts)).await {
            Ok(mut v) if !v.is_empty() => v.swap_remove(0),
            Ok(_) => return Vec::new(),
            Err(e) => {
                warn!("Query embedding failed, dense results empty: {e}");
                return Vec::new();
            }
        };
        let mut scored: Vec<(usize, f64)> = self
            .state
            .chunks
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                let v = c.embedding.as_ref()?;
                Some((i, f64::from(search::cosine_similarity(&query_vec, v))))
            })
            .collect();
        search::rank_by_score(&mut scored);
        scored
    }

    fn result(&self, i: usize, score: f64, provenance: Provenance) -> SearchResult {
        SearchResult {
            chunk: self.state.chunks[i].clone(),
            score,
            provenance,
        }
    }

    /// Retrieve the `n` best chunks for `query`.
    ///
    /// An empty query is a configuration error. Dense retrieval without an
    /// embedding backend, or with a failing one, returns no results.
    pub async fn retrieve(
        &self,
        query: &str,
        n: usize,
        strategy: RetrievalStrategy,
    ) -> Result<Vec<SearchResult>> {
        let lexical = self.lexical_ranking(query)?;
        let results: Vec<SearchResult> = match strategy {
            RetrievalStrategy::Lexical => lexical
                .into_iter()
                .take(n)
                .map(|(i, s)| self.result(i, s, Provenance::Lexical))
                .collect(),
            RetrievalStrategy::Dense => self
                .dense_ranking(query)
                .await
                .into_iter()
                .take(n)
                .map(|(i, s)| self.result(i, s, Provenance::Dense))
                .collect(),
            RetrievalStrategy::Hybrid => {
                let depth = n.saturating_mul(self.config.candidate_multiplier);
                let dense = self.dense_ranking(query).await;
                let lists: Vec<Vec<usize>> = [lexical, dense]
                    .into_iter()
                    .map(|l| l.into_iter().take(depth).map(|(i, _)| i).collect())
                    .collect();
                search::reciprocal_rank_fusion(&lists, self.config.rrf_k)
                    .into_iter()
                    .take(n)
                    .map(|(i, s)| self.result(i, s, Provenance::Fused))
                    .collect()
            }
        };
        debug!("Retrieved {} chunks for {query:?} ({strategy})", results.len());
        Ok(results)
    }
}
