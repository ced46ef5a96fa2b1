//! Text embedding backends.
//!
//! The index only needs "texts in, fixed-dimension vectors out", captured by
//! the [`Embedder`] trait. [`EmbeddingModel`] is the production backend:
//! - Model download with timeout on first use
//! - Dimension probing at construction
//! - Batch embedding generation

use fastembed::{InitOptions, TextEmbedding};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Sentence models usable for review similarity, by configured name
const SUPPORTED_MODELS: &[(&str, fastembed::EmbeddingModel)] = &[
    ("all-MiniLM-L6-v2", fastembed::EmbeddingModel::AllMiniLML6V2),
    ("all-MiniLM-L6-v2-q", fastembed::EmbeddingModel::AllMiniLML6V2Q),
    (
        "paraphrase-multilingual-MiniLM-L12-v2",
        fastembed::EmbeddingModel::ParaphraseMLMiniLML12V2,
    ),
    ("bge-small-en-v1.5", fastembed::EmbeddingModel::BGESmallENV15),
    ("bge-small-en-v1.5-q", fastembed::EmbeddingModel::BGESmallENV15Q),
    ("bge-base-en-v1.5", fastembed::EmbeddingModel::BGEBaseENV15),
    ("bge-base-en-v1.5-q", fastembed::EmbeddingModel::BGEBaseENV15Q),
];

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Failed to load embedding model: {0}")]
    InitFailed(String),

    #[error("Failed to embed text: {0}")]
    EmbeddingFailed(String),

    #[error("Embedding model was not ready after {0} seconds")]
    DownloadTimeout(u64),

    #[error("Unknown embedding model: {0}")]
    InvalidModel(String),

    #[error("Embedding backend returned {got} vectors for {expected} texts")]
    CountMismatch { expected: usize, got: usize },
}

/// A text embedding backend with a fixed output dimension.
pub trait Embedder: Send + Sync {
    /// Model name, used to tag persisted snapshots.
    fn name(&self) -> &str;

    /// Output vector dimension. Constant for the lifetime of the embedder.
    fn dimensions(&self) -> usize;

    /// Embed a batch of texts. Output order matches input order.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Embed a single text.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_batch(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }

    /// SHA256 of the model name for storage identification.
    fn model_id_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.name().as_bytes());
        hasher.finalize().into()
    }
}

impl<T: Embedder + ?Sized> Embedder for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn dimensions(&self) -> usize {
        (**self).dimensions()
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        (**self).embed_batch(texts)
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        (**self).embed(text)
    }

    fn model_id_hash(&self) -> [u8; 32] {
        (**self).model_id_hash()
    }
}

/// fastembed-backed embedder. fastembed's `embed()` needs `&mut self`,
/// hence the mutex.
pub struct EmbeddingModel {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl EmbeddingModel {
    /// Load the named model, downloading it into `cache_dir/models` if it is
    /// not cached yet.
    ///
    /// Loading runs on a helper thread so a stalled download fails with
    /// [`EmbeddingError::DownloadTimeout`] instead of hanging startup.
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        download_timeout: Option<Duration>,
    ) -> Result<Self, EmbeddingError> {
        let model_enum = Self::parse_model_name(model_name)?;
        let timeout = download_timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT);

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let options = InitOptions::new(model_enum)
                .with_cache_dir(models_dir)
                .with_show_download_progress(true);

            let result = TextEmbedding::try_new(options)
                .map_err(|e| EmbeddingError::InitFailed(e.to_string()))
                .and_then(|mut model| {
                    let dimensions = Self::probe_dimensions(&mut model)?;
                    Ok((model, dimensions))
                });

            // receiver is gone if the caller already timed out
            let _ = tx.send(result);
        });

        let (model, dimensions) = match rx.recv_timeout(timeout) {
            Ok(result) => result?,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                return Err(EmbeddingError::DownloadTimeout(timeout.as_secs()))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(EmbeddingError::InitFailed(
                    "Model loader thread exited unexpectedly".to_string(),
                ))
            }
        };

        log::info!("Loaded embedding model '{model_name}' ({dimensions} dimensions)");

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    /// Look up a model by its case-insensitive name.
    fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
        SUPPORTED_MODELS
            .iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(name))
            .map(|(_, model)| model.clone())
            .ok_or_else(|| {
                let known: Vec<&str> = SUPPORTED_MODELS.iter().map(|(known, _)| *known).collect();
                EmbeddingError::InvalidModel(format!("{name} (supported: {})", known.join(", ")))
            })
    }

    /// Embed a fixed probe text to learn the output dimension.
    fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        model
            .embed(vec!["dimension probe"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("dimension probe failed: {e}")))?
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }
}

impl Embedder for EmbeddingModel {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self
            .model
            .lock()
            .map_err(|_| EmbeddingError::EmbeddingFailed("model lock poisoned".to_string()))?;

        let embeddings = model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        if embeddings.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                got: embeddings.len(),
            });
        }

        Ok(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Embedder for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn dimensions(&self) -> usize {
            2
        }

        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_model_creation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let model =
            EmbeddingModel::new("all-MiniLM-L6-v2", temp_dir.path().to_path_buf(), None).unwrap();

        assert_eq!(model.name(), "all-MiniLM-L6-v2");
        assert_eq!(model.dimensions(), 384);

        let embedding = model.embed("Hello, world!").unwrap();
        assert_eq!(embedding.len(), 384);

        let batch = model
            .embed_batch(&["one".to_string(), "two".to_string()])
            .unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_invalid_model_name() {
        let temp_dir = tempfile::tempdir().unwrap();
        let result = EmbeddingModel::new("nonexistent-model", temp_dir.path().to_path_buf(), None);
        assert!(matches!(result, Err(EmbeddingError::InvalidModel(_))));
    }

    #[test]
    fn test_default_embed_uses_batch() {
        let embedder = Named("fake");
        assert_eq!(embedder.embed("abc").unwrap(), vec![3.0, 1.0]);
    }

    #[test]
    fn test_model_id_hash() {
        let a = Named("all-MiniLM-L6-v2");
        let b = Named("all-MiniLM-L6-v2");
        let c = Named("bge-base-en-v1.5");

        assert_eq!(a.model_id_hash(), b.model_id_hash());
        assert_ne!(a.model_id_hash(), c.model_id_hash());
    }
}
