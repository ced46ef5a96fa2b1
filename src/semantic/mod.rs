//! Embedding index for review similarity search.
//!
//! - `embeddings`: embedding backends (fastembed in production)
//! - `preprocess`: shapes review text into model input
//! - `index`: flat exact inner-product index over unit vectors
//! - `storage`: two-artifact snapshot persistence
//! - `service`: the review index tying the above together

pub mod embeddings;
pub mod index;
mod preprocess;
mod service;
mod storage;

pub use embeddings::EmbeddingModel;
pub use service::{
    IndexMutationError, IndexStats, ReviewIndex, SearchError, SearchHit, SnapshotStatus,
};

/// Default embedding model name
pub const DEFAULT_MODEL: &str = "all-MiniLM-L6-v2";
