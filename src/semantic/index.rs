//! Append-only flat vector index with exact inner-product search.
//!
//! Vectors are L2-normalized on the way in, so the inner product of a stored
//! vector and a normalized query is their cosine similarity. Slots are
//! assigned in insertion order and never reused or removed; logical deletion
//! is tracked by the owner of the index, not here.

use std::cmp::Ordering;
use std::ops::Range;

/// Index kind label reported in statistics.
pub const INDEX_KIND: &str = "Flat inner-product (exact)";

/// Norms below this are treated as zero and cannot be normalized.
const MIN_NORM: f32 = f32::EPSILON;

/// Dense store of unit vectors addressed by slot.
#[derive(Debug, Clone)]
pub struct FlatIndex {
    /// Row-major vector data, `dimensions` floats per slot
    data: Vec<f32>,
    /// Fixed vector dimension
    dimensions: usize,
}

/// One candidate returned by [`FlatIndex::search`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Slot of the stored vector
    pub slot: usize,
    /// Inner product with the query, clamped to [-1.0, 1.0]
    pub score: f32,
}

impl FlatIndex {
    /// Create a new empty index for vectors of the given dimension.
    pub fn new(dimensions: usize) -> Self {
        Self {
            data: Vec::new(),
            dimensions,
        }
    }

    /// Create an index with room for `slots` vectors.
    pub fn with_capacity(dimensions: usize, slots: usize) -> Self {
        Self {
            data: Vec::with_capacity(dimensions * slots),
            dimensions,
        }
    }

    /// Get the vector dimension.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Number of slots ever allocated.
    pub fn len(&self) -> usize {
        if self.dimensions == 0 {
            return 0;
        }
        self.data.len() / self.dimensions
    }

    /// Check if the index holds no slots.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Normalize and append a batch of vectors.
    ///
    /// The whole batch is validated before anything is appended, so on error
    /// the index is unchanged. Returns the range of slots assigned.
    pub fn add(&mut self, vectors: Vec<Vec<f32>>) -> Result<Range<usize>, IndexError> {
        let mut normalized = Vec::with_capacity(vectors.len());
        for mut vector in vectors {
            self.check_dimensions(&vector)?;
            normalize(&mut vector)?;
            normalized.push(vector);
        }

        let start = self.len();
        self.data.reserve(normalized.len() * self.dimensions);
        for vector in &normalized {
            self.data.extend_from_slice(vector);
        }

        Ok(start..self.len())
    }

    /// Append vectors that are already unit length, as read back from a
    /// snapshot. Dimension is still checked.
    pub fn push_normalized(&mut self, vector: &[f32]) -> Result<usize, IndexError> {
        self.check_dimensions(vector)?;
        let slot = self.len();
        self.data.extend_from_slice(vector);
        Ok(slot)
    }

    /// Get the stored vector at `slot`.
    #[cfg(test)]
    pub fn get(&self, slot: usize) -> Option<&[f32]> {
        let start = slot.checked_mul(self.dimensions)?;
        self.data.get(start..start + self.dimensions)
    }

    /// Iterate over stored vectors in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dimensions.max(1))
    }

    /// Drop every slot at or after `slots`.
    pub fn truncate(&mut self, slots: usize) {
        self.data.truncate(slots * self.dimensions);
    }

    /// Return the `n` slots with the highest inner product against `query`.
    ///
    /// The query is normalized before scoring. Results are ordered by score
    /// descending; equal scores keep slot order.
    pub fn search(&self, query: &[f32], n: usize) -> Result<Vec<Neighbor>, IndexError> {
        self.check_dimensions(query)?;

        let mut query = query.to_vec();
        normalize(&mut query)?;

        if n == 0 || self.is_empty() {
            return Ok(vec![]);
        }

        let mut neighbors: Vec<Neighbor> = self
            .iter()
            .enumerate()
            .map(|(slot, vector)| Neighbor {
                slot,
                score: dot(&query, vector).clamp(-1.0, 1.0),
            })
            .collect();

        neighbors.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(a.slot.cmp(&b.slot))
        });
        neighbors.truncate(n);

        Ok(neighbors)
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        Ok(())
    }
}

/// Scale `vector` to unit L2 norm in place.
///
/// Rejects zero-norm and non-finite vectors instead of producing NaNs.
pub fn normalize(vector: &mut [f32]) -> Result<(), IndexError> {
    let norm = l2_norm(vector);
    if !norm.is_finite() {
        return Err(IndexError::NonFiniteVector);
    }
    if norm < MIN_NORM {
        return Err(IndexError::ZeroNormVector);
    }

    for value in vector.iter_mut() {
        *value /= norm;
    }
    Ok(())
}

/// Compute L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot store or search with zero-norm vector")]
    ZeroNormVector,

    #[error("Vector contains NaN or infinite values")]
    NonFiniteVector,
}
