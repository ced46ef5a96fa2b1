//! Review similarity index service.
//!
//! Keeps three slot-parallel containers in lockstep:
//! - `index`: unit vectors, one per slot, never removed
//! - `ids`: external review id per slot, `None` once removed
//! - `texts`: original review text per slot, empty once removed
//!
//! Every successful mutation rewrites the full snapshot before returning. If
//! the write fails the in-memory change is rolled back, so memory and disk
//! never disagree.
//!
//! The service is not internally synchronized: mutations take `&mut self`
//! and reads take `&self`, so callers share it behind a reader/writer lock.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::semantic::embeddings::{Embedder, EmbeddingError};
use crate::semantic::index::{FlatIndex, IndexError, INDEX_KIND};
use crate::semantic::preprocess::embedding_input;
use crate::semantic::storage::{ArtifactState, SnapshotRef, SnapshotStorage, VectorStorageError};

/// Errors from `add`, `remove` and `clear`. Index state is unchanged when
/// one is returned, except for a `clear` that already deleted part of the
/// snapshot.
#[derive(Debug, thiserror::Error)]
pub enum IndexMutationError {
    #[error("Index mutation failed: got {ids} ids but {texts} texts")]
    LengthMismatch { ids: usize, texts: usize },

    #[error("Index mutation failed: review {0} is already indexed")]
    DuplicateId(i64),

    #[error("Index mutation failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Index mutation failed: {0}")]
    Index(#[from] IndexError),

    #[error("Index mutation failed: snapshot write failed, change rolled back: {0}")]
    Persistence(#[from] VectorStorageError),
}

impl IndexMutationError {
    /// Whether the failure was caused by the request rather than the server.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, IndexMutationError::Persistence(_))
    }
}

/// Errors from `search`.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Search limit must be at least 1")]
    InvalidLimit,

    #[error("Search failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Search failed: {0}")]
    Index(#[from] IndexError),
}

/// Outcome of loading the snapshot at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SnapshotStatus {
    /// No snapshot existed, or the index was cleared
    Fresh,
    /// Snapshot restored with this many slots
    Loaded { slots: usize },
    /// Snapshot was unusable and the index started empty
    Discarded { reason: String },
}

/// A ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: i64,
    /// Cosine similarity in [-1.0, 1.0]
    pub score: f32,
    pub text: String,
}

/// Index statistics for health and readiness reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    /// Slots whose review has not been removed
    pub live_count: usize,
    /// Slots ever allocated, removed ones included
    pub total_slots: usize,
    pub dimension: usize,
    pub kind: String,
    pub model: String,
    pub search_available: bool,
    pub snapshot: SnapshotStatus,
}

/// In-process similarity index over review texts.
pub struct ReviewIndex {
    embedder: Box<dyn Embedder>,
    storage: SnapshotStorage,
    index: FlatIndex,
    ids: Vec<Option<i64>>,
    texts: Vec<String>,
    /// Generation of the snapshot currently on disk
    generation: u64,
    snapshot_status: SnapshotStatus,
}

impl ReviewIndex {
    /// Open the index stored at `<base>.index` / `<base>.meta`.
    ///
    /// A missing, partial or unreadable snapshot never fails construction:
    /// the index starts empty and the reason is kept in
    /// [`IndexStats::snapshot`].
    pub fn open(embedder: Box<dyn Embedder>, base: &Path) -> Self {
        let storage = SnapshotStorage::new(base);
        let dimensions = embedder.dimensions();

        let mut service = Self {
            index: FlatIndex::new(dimensions),
            ids: Vec::new(),
            texts: Vec::new(),
            generation: 0,
            snapshot_status: SnapshotStatus::Fresh,
            embedder,
            storage,
        };

        match service.storage.state() {
            ArtifactState::Missing => {
                log::info!(
                    "No review index at {}, starting fresh",
                    service.storage.index_path().display()
                );
            }
            ArtifactState::Partial => {
                let reason = format!(
                    "only one of {} and {} exists",
                    service.storage.index_path().display(),
                    service.storage.meta_path().display()
                );
                log::warn!("Discarding review index snapshot: {reason}");
                service.snapshot_status = SnapshotStatus::Discarded { reason };
            }
            ArtifactState::Present => {
                let model_id = service.embedder.model_id_hash();
                match service.storage.load(&model_id, dimensions) {
                    Ok(snapshot) => {
                        if snapshot.recovered {
                            log::warn!(
                                "Review index save was interrupted, dropped the unfinished save and kept generation {}",
                                snapshot.generation
                            );
                        }
                        log::info!(
                            "Loaded review index with {} slots (generation {})",
                            snapshot.index.len(),
                            snapshot.generation
                        );
                        service.snapshot_status = SnapshotStatus::Loaded {
                            slots: snapshot.index.len(),
                        };
                        service.generation = snapshot.generation;
                        service.index = snapshot.index;
                        service.ids = snapshot.ids;
                        service.texts = snapshot.texts;
                    }
                    Err(err) => {
                        log::warn!("Discarding review index snapshot, starting empty: {err}");
                        service.snapshot_status = SnapshotStatus::Discarded {
                            reason: err.to_string(),
                        };
                    }
                }
            }
        }

        service
    }

    /// Embed and index a batch of reviews.
    ///
    /// `ids[i]` is the review whose text is `texts[i]`. The batch is all or
    /// nothing: an embedding, normalization, dimension or persistence failure
    /// leaves the index exactly as it was. Empty input is a logged no-op.
    ///
    /// Returns the number of reviews added.
    pub fn add(&mut self, ids: &[i64], texts: &[String]) -> Result<usize, IndexMutationError> {
        if ids.len() != texts.len() {
            return Err(IndexMutationError::LengthMismatch {
                ids: ids.len(),
                texts: texts.len(),
            });
        }

        if ids.is_empty() {
            log::warn!("No reviews to add to the index");
            return Ok(0);
        }

        let mut seen = HashSet::with_capacity(ids.len());
        for &id in ids {
            if !seen.insert(id) || self.slot_of(id).is_some() {
                return Err(IndexMutationError::DuplicateId(id));
            }
        }

        log::info!("Adding {} reviews to the index", ids.len());

        let inputs: Vec<String> = texts.iter().map(|text| embedding_input(text)).collect();
        let embeddings = self.embedder.embed_batch(&inputs)?;
        if embeddings.len() != inputs.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: inputs.len(),
                got: embeddings.len(),
            }
            .into());
        }

        let previous = self.index.len();
        let slots = self.index.add(embeddings)?;
        self.ids.extend(ids.iter().copied().map(Some));
        self.texts.extend_from_slice(texts);

        if let Err(err) = self.persist() {
            log::error!("Failed to save review index, rolling back {} reviews: {err}", ids.len());
            self.index.truncate(previous);
            self.ids.truncate(previous);
            self.texts.truncate(previous);
            return Err(err.into());
        }

        log::info!("Added reviews to slots {}..{}", slots.start, slots.end);
        Ok(slots.len())
    }

    /// Find the `k` live reviews most similar to `query`.
    ///
    /// When `filter_ids` is non-empty only those reviews are eligible. Results
    /// are ordered by score, highest first.
    pub fn search(
        &self,
        query: &str,
        k: usize,
        filter_ids: Option<&[i64]>,
    ) -> Result<Vec<SearchHit>, SearchError> {
        if k == 0 {
            return Err(SearchError::InvalidLimit);
        }

        log::debug!("Searching reviews for: {query}");
        let query_embedding = self.embedder.embed(&embedding_input(query))?;

        let live = self.live_count();
        if live == 0 {
            log::warn!("No reviews in the index");
            return Ok(vec![]);
        }

        let allowed: Option<HashSet<i64>> = filter_ids
            .filter(|ids| !ids.is_empty())
            .map(|ids| ids.iter().copied().collect());

        // Over-fetch 2x for filtering, plus one candidate per removed slot
        // since removed vectors still rank.
        let total = self.index.len();
        let mut fetch = k
            .saturating_mul(2)
            .min(live)
            .saturating_add(total - live)
            .min(total);

        loop {
            let neighbors = self.index.search(&query_embedding, fetch)?;

            let mut hits = Vec::with_capacity(k.min(fetch));
            for neighbor in neighbors {
                let Some(id) = self.ids[neighbor.slot] else {
                    continue;
                };
                if allowed.as_ref().is_some_and(|allowed| !allowed.contains(&id)) {
                    continue;
                }
                hits.push(SearchHit {
                    id,
                    score: neighbor.score,
                    text: self.texts[neighbor.slot].clone(),
                });
                if hits.len() >= k {
                    break;
                }
            }

            if hits.len() >= k || fetch >= total {
                log::debug!("Found {} similar reviews", hits.len());
                return Ok(hits);
            }

            fetch = fetch.saturating_mul(2).min(total);
        }
    }

    /// Mark a review as removed.
    ///
    /// Returns `Ok(false)` if no live slot holds `id`. The vector stays in
    /// the index; the slot is skipped by every later search.
    pub fn remove(&mut self, id: i64) -> Result<bool, IndexMutationError> {
        let Some(slot) = self.slot_of(id) else {
            log::warn!("Review {id} not found in the index");
            return Ok(false);
        };

        let text = std::mem::take(&mut self.texts[slot]);
        self.ids[slot] = None;

        if let Err(err) = self.persist() {
            log::error!("Failed to save review index, restoring review {id}: {err}");
            self.ids[slot] = Some(id);
            self.texts[slot] = text;
            return Err(err.into());
        }

        log::info!("Marked review {id} as removed from the index");
        Ok(true)
    }

    /// Drop every entry and delete the snapshot from disk.
    ///
    /// If deleting fails after one artifact is already gone, the entries are
    /// still dropped from memory: the leftover artifact alone is discarded
    /// on the next open, so keeping them would let memory and disk disagree.
    pub fn clear(&mut self) -> Result<(), IndexMutationError> {
        if let Err(err) = self.storage.delete() {
            if self.storage.state() == ArtifactState::Present {
                return Err(err.into());
            }
            log::error!("Review index cleared, but a snapshot artifact was left behind: {err}");
            self.reset();
            return Err(err.into());
        }

        self.reset();
        log::info!("Review index cleared");
        Ok(())
    }

    fn reset(&mut self) {
        self.index = FlatIndex::new(self.embedder.dimensions());
        self.ids.clear();
        self.texts.clear();
        self.generation = 0;
        self.snapshot_status = SnapshotStatus::Fresh;
    }

    /// Look up the text indexed for a live review.
    pub fn get_review(&self, id: i64) -> Option<(i64, &str)> {
        self.slot_of(id).map(|slot| (id, self.texts[slot].as_str()))
    }

    /// Raw embedding for a single text, without touching the index.
    pub fn review_embedding(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embedder.embed(&embedding_input(text))
    }

    /// Get index statistics.
    pub fn stats(&self) -> IndexStats {
        let live_count = self.live_count();
        IndexStats {
            live_count,
            total_slots: self.index.len(),
            dimension: self.index.dimensions(),
            kind: INDEX_KIND.to_string(),
            model: self.embedder.name().to_string(),
            search_available: live_count > 0,
            snapshot: self.snapshot_status.clone(),
        }
    }

    /// Number of live (not removed) reviews.
    pub fn live_count(&self) -> usize {
        self.ids.iter().filter(|id| id.is_some()).count()
    }

    fn slot_of(&self, id: i64) -> Option<usize> {
        self.ids.iter().position(|slot_id| *slot_id == Some(id))
    }

    /// Write the full snapshot under the next generation.
    fn persist(&mut self) -> Result<(), VectorStorageError> {
        let generation = self.generation + 1;
        let model_id = self.embedder.model_id_hash();

        self.storage.save(&SnapshotRef {
            generation,
            model_name: self.embedder.name(),
            model_id: &model_id,
            index: &self.index,
            ids: &self.ids,
            texts: &self.texts,
        })?;

        self.generation = generation;
        log::debug!("Review index saved (generation {generation})");
        Ok(())
    }
}
