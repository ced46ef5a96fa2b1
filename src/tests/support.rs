//! Deterministic embedder for tests.
//!
//! Words from three small sentiment lexicons land on fixed axes, every other
//! word is hashed onto the remaining axes with a lower weight. Texts sharing
//! sentiment words therefore score close together, and a text with no words
//! at all embeds to the zero vector.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::semantic::embeddings::{Embedder, EmbeddingError};

const POSITIVE: &[&str] = &[
    "great",
    "loved",
    "love",
    "amazing",
    "excellent",
    "good",
    "buy",
    "recommend",
    "perfect",
];
const NEGATIVE: &[&str] = &[
    "terrible", "broke", "broken", "bad", "awful", "poor", "quality", "refund",
];
const NEUTRAL: &[&str] = &["okay", "ok", "nothing", "special", "fine", "average"];

const LEXICON_WEIGHT: f32 = 1.0;
const HASHED_WEIGHT: f32 = 0.5;

/// Failure injected into the next embedding calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fault {
    /// Return an embedding error
    Fail,
    /// Return vectors one element short
    WrongDimension,
    /// Return one vector fewer than requested
    DropLast,
}

pub struct LexiconEmbedder {
    name: String,
    fault: Mutex<Option<Fault>>,
    calls: AtomicUsize,
}

impl LexiconEmbedder {
    pub const DIMENSIONS: usize = 16;

    pub fn new() -> Self {
        Self::named("lexicon-test")
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fault: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_fault(&self, fault: Option<Fault>) {
        *self.fault.lock().unwrap() = fault;
    }

    /// Number of `embed_batch` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; Self::DIMENSIONS];
        let words = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|word| !word.is_empty())
            .map(|word| word.to_lowercase());

        for word in words {
            let word = word.as_str();
            if POSITIVE.contains(&word) {
                vector[0] += LEXICON_WEIGHT;
            } else if NEGATIVE.contains(&word) {
                vector[1] += LEXICON_WEIGHT;
            } else if NEUTRAL.contains(&word) {
                vector[2] += LEXICON_WEIGHT;
            } else {
                let hash = word
                    .bytes()
                    .fold(7usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
                vector[3 + hash % (Self::DIMENSIONS - 3)] += HASHED_WEIGHT;
            }
        }

        vector
    }
}

impl Embedder for LexiconEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        Self::DIMENSIONS
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let fault = *self.fault.lock().unwrap();
        let mut vectors: Vec<Vec<f32>> = texts.iter().map(|text| Self::vector(text)).collect();

        match fault {
            None => {}
            Some(Fault::Fail) => {
                return Err(EmbeddingError::EmbeddingFailed("injected failure".to_string()))
            }
            Some(Fault::WrongDimension) => {
                for vector in &mut vectors {
                    vector.pop();
                }
            }
            Some(Fault::DropLast) => {
                vectors.pop();
            }
        }

        Ok(vectors)
    }
}
