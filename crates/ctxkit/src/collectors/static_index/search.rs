//! Scoring and rank fusion for static retrieval.

use super::chunker::CodeChunk;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Default reciprocal-rank-fusion constant.
pub const DEFAULT_RRF_K: f64 = 60.0;

/// How a query is matched against the index.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalStrategy {
    /// Cosine similarity of embeddings.
    Dense,
    /// Query-term coverage.
    Lexical,
    /// Reciprocal-rank fusion of dense and lexical.
    #[default]
    Hybrid,
}

impl RetrievalStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalStrategy::Dense => "dense",
            RetrievalStrategy::Lexical => "lexical",
            RetrievalStrategy::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for RetrievalStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RetrievalStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dense" => Ok(RetrievalStrategy::Dense),
            "lexical" => Ok(RetrievalStrategy::Lexical),
            "hybrid" => Ok(RetrievalStrategy::Hybrid),
            _ => Err(Error::UnknownRetrieval(s.to_string())),
        }
    }
}

/// Which ranking produced a result.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Dense,
    Lexical,
    Fused,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Dense => "dense",
            Provenance::Lexical => "lexical",
            Provenance::Fused => "fused",
        }
    }
}

/// One retrieved chunk with its score.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub chunk: CodeChunk,
    pub score: f64,
    pub provenance: Provenance,
}

/// Distinct lowercase query terms, split on anything not alphanumeric.
pub fn query_terms(query: &str) -> Result<BTreeSet<String>> {
    let terms: BTreeSet<String> = query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    if terms.is_empty() {
        return Err(Error::InvalidQuery(format!("query has no searchable terms: {query:?}")));
    }
    Ok(terms)
}

/// Fraction of `terms` found in the chunk's lowercased search text.
pub fn lexical_score(terms: &BTreeSet<String>, chunk: &CodeChunk) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let haystack = chunk.search_text();
    let hits = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
    hits as f64 / terms.len() as f64
}

/// Cosine similarity. Mismatched dimensions or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Sort `(item, score)` pairs by descending score, keeping input order among
/// ties.
pub fn rank_by_score<T>(scored: &mut [(T, f64)]) {
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
}

/// Reciprocal-rank fusion of ranked id lists.
///
/// Each id scores `Σ 1 / (rank + k)` over the lists it appears in, with
/// 0-based ranks. The output is sorted by fused score; ties keep the order in
/// which ids were first seen across the lists.
pub fn reciprocal_rank_fusion(lists: &[Vec<usize>], k: f64) -> Vec<(usize, f64)> {
    let mut order: Vec<usize> = Vec::new();
    let mut scores: HashMap<usize, f64> = HashMap::new();
    for list in lists {
        for (rank, &id) in list.iter().enumerate() {
            let entry = scores.entry(id).or_insert_with(|| {
                order.push(id);
                0.0
            });
            *entry += 1.0 / (rank as f64 + k);
        }
    }
    let mut fused: Vec<(usize, f64)> = order
        .into_iter()
        .map(|id| (id, scores.get(&id).copied().unwrap_or(0.0)))
        .collect();
    rank_by_score(&mut fused);
    fused
}
