//! "Find similar items" by exact cosine similarity.
//!
//! Every query is a full scan of the items that carry a vector; there is no
//! cache or index. That is fine for a corpus in the low thousands.

use std::{cmp::Ordering, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    ids::ItemId,
    items::{self, ItemFilter, ItemStore, StoreError, DEFAULT_PAGE_SIZE},
};

/// One ranked candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    pub item_id: ItemId,
    pub similarity: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("item {0} not found")]
    NotFound(ItemId),

    #[error("item {0} has no embedding yet")]
    NoVector(ItemId),

    #[error("k must be at least 1")]
    InvalidK,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Cosine similarity of two vectors.
///
/// Exactly `0.0` when either vector has zero norm or the lengths differ,
/// never NaN. Accumulates in f64 and divides by `sqrt(|a|² · |b|²)`, which
/// makes `similarity(v, v)` exactly 1 and the function symmetric.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    let similarity = dot / (norm_a * norm_b).sqrt();
    if similarity.is_finite() {
        similarity.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Descending similarity, then ascending id.
fn rank(a: &Match, b: &Match) -> Ordering {
    b.similarity
        .total_cmp(&a.similarity)
        .then_with(|| a.item_id.cmp(&b.item_id))
}

pub struct SimilarityMatcher {
    store: Arc<dyn ItemStore>,
    default_k: usize,
    min_similarity: Option<f64>,
}

impl SimilarityMatcher {
    pub fn new(store: Arc<dyn ItemStore>, default_k: usize, min_similarity: Option<f64>) -> Self {
        Self {
            store,
            default_k,
            min_similarity,
        }
    }

    /// Top `k` (default from config) items most similar to `id`.
    ///
    /// Candidates without a vector, or with a vector of another length, are
    /// silently left out; so is `id` itself.
    pub fn find_matches(&self, id: &ItemId, k: Option<usize>) -> Result<Vec<Match>, MatchError> {
        let k = k.unwrap_or(self.default_k);
        if k == 0 {
            return Err(MatchError::InvalidK);
        }

        let source = self
            .store
            .get(id)?
            .ok_or_else(|| MatchError::NotFound(id.clone()))?;
        let source_vector = source
            .embedding
            .map(|e| e.vector)
            .ok_or_else(|| MatchError::NoVector(id.clone()))?;

        let mut scored = Vec::new();
        for item in items::scan(self.store.as_ref(), ItemFilter::WithVector, DEFAULT_PAGE_SIZE) {
            let item = item?;
            if item.id == *id {
                continue;
            }

            let Some(vector) = item.vector() else {
                continue;
            };
            if vector.len() != source_vector.len() {
                continue;
            }

            let similarity = cosine_similarity(&source_vector, vector);
            if self.min_similarity.is_some_and(|min| similarity < min) {
                continue;
            }

            scored.push(Match {
                item_id: item.id,
                similarity,
            });
        }

        scored.sort_by(rank);
        scored.truncate(k);

        log::debug!("find_matches({id}, k={k}): {} results", scored.len());

        Ok(scored)
    }
}
