//! Exact nearest-neighbour storage over fixed-dimension vectors.
//!
//! `FlatVectorStore` keeps every vector in one contiguous buffer and answers
//! queries by brute force: O(len × dimension) per search. That is fine for
//! tens of thousands of chunks; an approximate index can replace it by
//! implementing [`VectorIndex`].

use std::cmp::Ordering;

use crate::error::IndexError;

/// A search hit: insertion position plus squared Euclidean distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub position: usize,
    pub distance: f32,
}

/// Storage and k-NN contract the retrieval index relies on.
///
/// Implementations must keep positions stable (0-based insertion order) and
/// must expose their vectors as one row-major buffer for persistence.
pub trait VectorIndex: Send + Sync {
    /// Create an empty index for vectors of `dimension` components.
    fn with_dimension(dimension: usize) -> Self
    where
        Self: Sized;

    /// Rebuild from a row-major buffer, as read back from disk.
    fn from_raw(dimension: usize, data: Vec<f32>) -> Result<Self, IndexError>
    where
        Self: Sized;

    fn dimension(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append vectors in order. Either every vector is added or none is.
    fn add(&mut self, vectors: &[Vec<f32>]) -> Result<(), IndexError>;

    /// Up to `k` neighbours, ascending by distance, ties by position.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, IndexError>;

    fn vector(&self, position: usize) -> Option<&[f32]>;

    /// Row-major view of every stored vector.
    fn as_raw(&self) -> &[f32];
}

/// Brute-force exact index.
#[derive(Debug, Clone)]
pub struct FlatVectorStore {
    dimension: usize,
    data: Vec<f32>,
}

impl VectorIndex for FlatVectorStore {
    fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    fn from_raw(dimension: usize, data: Vec<f32>) -> Result<Self, IndexError> {
        if dimension == 0 && !data.is_empty() {
            return Err(IndexError::CorruptIndex(
                "vector data present for a zero-dimension index".to_string(),
            ));
        }
        if dimension > 0 && data.len() % dimension != 0 {
            return Err(IndexError::CorruptIndex(format!(
                "{} floats is not a multiple of dimension {}",
                data.len(),
                dimension
            )));
        }
        Ok(Self { dimension, data })
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    fn add(&mut self, vectors: &[Vec<f32>]) -> Result<(), IndexError> {
        // Validate everything first so a bad vector midway never leaves a partial append.
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimension) {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: bad.len(),
            });
        }

        self.data.reserve(vectors.len() * self.dimension);
        for vector in vectors {
            self.data.extend_from_slice(vector);
        }
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, IndexError> {
        if query.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<Neighbor> = self
            .data
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(position, row)| Neighbor {
                position,
                distance: squared_l2(query, row),
            })
            .collect();

        if hits.len() > k {
            hits.select_nth_unstable_by(k - 1, compare_neighbors);
            hits.truncate(k);
        }
        hits.sort_by(compare_neighbors);
        Ok(hits)
    }

    fn vector(&self, position: usize) -> Option<&[f32]> {
        if position >= self.len() {
            return None;
        }
        let start = position * self.dimension;
        Some(&self.data[start..start + self.dimension])
    }

    fn as_raw(&self) -> &[f32] {
        &self.data
    }
}

fn compare_neighbors(a: &Neighbor, b: &Neighbor) -> Ordering {
    a.distance
        .total_cmp(&b.distance)
        .then(a.position.cmp(&b.position))
}

/// Squared Euclidean distance; callers guarantee equal lengths.
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(rows: &[[f32; 2]]) -> FlatVectorStore {
        let mut store = FlatVectorStore::with_dimension(2);
        let vectors: Vec<Vec<f32>> = rows.iter().map(|r| r.to_vec()).collect();
        store.add(&vectors).unwrap();
        store
    }

    #[test]
    fn test_search_empty_store_returns_nothing() {
        let store = FlatVectorStore::with_dimension(3);
        let hits = store.search(&[0.0, 0.0, 0.0], 5).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_search_orders_by_distance() {
        let store = store_with(&[[5.0, 5.0], [1.0, 0.0], [0.0, 0.0], [2.0, 2.0]]);
        let hits = store.search(&[0.0, 0.0], 3).unwrap();

        let positions: Vec<usize> = hits.iter().map(|h| h.position).collect();
        assert_eq!(positions, vec![2, 1, 3]);
        assert_eq!(hits[0].distance, 0.0);
        assert_eq!(hits[1].distance, 1.0);
        assert_eq!(hits[2].distance, 8.0);
    }

    #[test]
    fn test_ties_break_by_position() {
        let store = store_with(&[[1.0, 0.0], [0.0, 1.0], [-1.0, 0.0], [0.0, -1.0]]);
        let hits = store.search(&[0.0, 0.0], 4).unwrap();
        let positions: Vec<usize> = hits.iter().map(|h| h.position).collect();
        assert_eq!(positions, vec![0, 1, 2, 3]);

        let top_two = store.search(&[0.0, 0.0], 2).unwrap();
        let positions: Vec<usize> = top_two.iter().map(|h| h.position).collect();
        assert_eq!(positions, vec![0, 1]);
    }

    #[test]
    fn test_k_larger_than_store_returns_all_distinct() {
        let store = store_with(&[[0.0, 1.0], [0.0, 2.0]]);
        let hits = store.search(&[0.0, 0.0], 10).unwrap();
        assert_eq!(hits.len(), 2);
        assert_ne!(hits[0].position, hits[1].position);
        assert!(hits[0].distance <= hits[1].distance);
    }

    #[test]
    fn test_add_rejects_wrong_dimension_without_partial_append() {
        let mut store = store_with(&[[0.0, 1.0]]);
        let err = store
            .add(&[vec![1.0, 1.0], vec![1.0, 1.0, 1.0]])
            .unwrap_err();
        assert!(matches!(
            err,
            IndexError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_query_dimension_checked() {
        let store = store_with(&[[0.0, 1.0]]);
        assert!(matches!(
            store.search(&[0.0], 1),
            Err(IndexError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_from_raw_round_trips_rows() {
        let store = store_with(&[[1.0, 2.0], [3.0, 4.0]]);
        let rebuilt = FlatVectorStore::from_raw(2, store.as_raw().to_vec()).unwrap();
        assert_eq!(rebuilt.len(), 2);
        assert_eq!(rebuilt.vector(1), Some(&[3.0, 4.0][..]));
        assert!(rebuilt.vector(2).is_none());
    }

    #[test]
    fn test_from_raw_rejects_ragged_buffer() {
        assert!(matches!(
            FlatVectorStore::from_raw(3, vec![1.0; 4]),
            Err(IndexError::CorruptIndex(_))
        ));
    }
}
