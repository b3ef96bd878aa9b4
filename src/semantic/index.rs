//! Exact flat L2 vector index.
//!
//! Vectors live in dense slots `0..len`. Removal is compacting: the last
//! vector is moved into the freed slot, so at most one other vector changes
//! position per removal. Callers that key anything by slot must follow that
//! move (see [`Removal::moved_from`]).

/// A nearest-neighbor hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Slot of the matched vector
    pub slot: usize,
    /// Squared L2 distance to the query
    pub distance: f32,
}

/// Outcome of removing a slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Removal {
    /// The vector that occupied the removed slot
    pub vector: Vec<f32>,
    /// Slot the tail vector was moved from, if the removed slot was not the tail
    pub moved_from: Option<usize>,
}

/// In-memory exact-search index over fixed-dimension vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    vectors: Vec<Vec<f32>>,
    dimensions: usize,
}

impl VectorIndex {
    /// Create a new empty vector index with specified dimensions.
    pub fn new(dimensions: usize) -> Self {
        Self {
            vectors: Vec::new(),
            dimensions,
        }
    }

    /// Create an index with pre-allocated capacity.
    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            vectors: Vec::with_capacity(capacity),
            dimensions,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Get the vector stored at `slot`.
    #[cfg(test)]
    pub fn get(&self, slot: usize) -> Option<&[f32]> {
        self.vectors.get(slot).map(Vec::as_slice)
    }

    /// Iterate over vectors in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &[f32]> {
        self.vectors.iter().map(Vec::as_slice)
    }

    /// Append a vector and return the slot it landed in.
    pub fn push(&mut self, vector: Vec<f32>) -> Result<usize, IndexError> {
        self.check_vector(&vector)?;
        let slot = self.vectors.len();
        self.vectors.push(vector);
        Ok(slot)
    }

    /// Remove the vector at `slot`, moving the tail vector into its place.
    pub fn swap_remove(&mut self, slot: usize) -> Result<Removal, IndexError> {
        let len = self.vectors.len();
        if slot >= len {
            return Err(IndexError::SlotOutOfRange { slot, len });
        }

        let vector = self.vectors.swap_remove(slot);
        let moved_from = (slot != len - 1).then_some(len - 1);

        Ok(Removal { vector, moved_from })
    }

    /// Undo a [`swap_remove`](Self::swap_remove) of `slot`.
    ///
    /// The vector currently at `slot` (if any) goes back to the tail and
    /// `vector` takes its place again.
    pub fn reinsert(&mut self, slot: usize, vector: Vec<f32>) -> Result<(), IndexError> {
        let len = self.vectors.len();
        if slot > len {
            return Err(IndexError::SlotOutOfRange { slot, len });
        }
        self.check_vector(&vector)?;

        if slot == len {
            self.vectors.push(vector);
        } else {
            let displaced = std::mem::replace(&mut self.vectors[slot], vector);
            self.vectors.push(displaced);
        }

        Ok(())
    }

    /// Drop the tail vector. Used to undo a [`push`](Self::push).
    pub fn pop(&mut self) -> Option<Vec<f32>> {
        self.vectors.pop()
    }

    /// Find the `k` nearest vectors to `query` by squared L2 distance.
    ///
    /// Results are ordered by ascending distance, ties by ascending slot.
    /// Never returns more than `min(k, len)` hits.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, IndexError> {
        self.check_vector(query)?;

        if k == 0 || self.vectors.is_empty() {
            return Ok(vec![]);
        }

        let mut results: Vec<Neighbor> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(slot, vector)| Neighbor {
                slot,
                distance: Self::squared_l2(query, vector),
            })
            .collect();

        results.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.slot.cmp(&b.slot))
        });
        results.truncate(k);

        Ok(results)
    }

    fn check_vector(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }

        if vector.iter().any(|x| !x.is_finite()) {
            return Err(IndexError::NonFinite);
        }

        Ok(())
    }

    fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
    }
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Vector contains NaN or infinite components")]
    NonFinite,

    #[error("Slot {slot} out of range for index of length {len}")]
    SlotOutOfRange { slot: usize, len: usize },
}
