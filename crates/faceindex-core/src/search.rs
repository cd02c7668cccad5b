//! Vector similarity and nearest-neighbor search over cached embeddings.
//!
//! Scores are inner products of unit vectors. Index results report cosine
//! distance (`1 - dot`) in ascending order.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

/// Result sizes tried in turn by [`EmbeddingIndex::search_within_similarity`]
/// before falling back to the whole index.
const WITHIN_SEARCH_STEPS: [usize; 5] = [200, 500, 2000, 5000, 10000];

const INITIAL_CAPACITY: usize = 1000;

#[derive(Error, Debug, PartialEq)]
pub enum SearchError {
    #[error("vector for key {key} has dimension {got}, expected {expected}")]
    Dimension { key: u64, expected: usize, got: usize },
    #[error("query {index} has dimension {got}, expected {expected}")]
    QueryDimension { index: usize, expected: usize, got: usize },
    #[error("vector for key {0} is empty")]
    EmptyVector(u64),
    #[error("vector index: {0}")]
    Index(String),
}

fn index_error(e: impl std::fmt::Display) -> SearchError {
    SearchError::Index(e.to_string())
}

/// One stored embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: u64,
    pub vector: Vec<f32>,
}

/// Query vector with its minimum accepted score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityQuery {
    pub vector: Vec<f32>,
    pub threshold: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityHit {
    pub id: u64,
    pub score: f32,
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Scale to unit length in place. Near-zero vectors are left unchanged.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = dot(v, v).sqrt();
    if norm <= f32::EPSILON {
        return;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
}

/// Score every candidate against every query.
///
/// Per query, keeps candidates with `score >= threshold`, sorted by score
/// descending. Equal scores keep candidate order.
pub fn bulk_similarity(
    candidates: &[EmbeddingRecord],
    queries: &[SimilarityQuery],
) -> Result<Vec<Vec<SimilarityHit>>, SearchError> {
    queries
        .iter()
        .enumerate()
        .map(|(index, query)| {
            let mut hits = Vec::new();
            for candidate in candidates {
                if candidate.vector.len() != query.vector.len() {
                    return Err(SearchError::QueryDimension {
                        index,
                        expected: candidate.vector.len(),
                        got: query.vector.len(),
                    });
                }
                let score = dot(&query.vector, &candidate.vector);
                if score >= query.threshold {
                    hits.push(SimilarityHit { id: candidate.id, score });
                }
            }
            hits.sort_by(|a, b| b.score.total_cmp(&a.score));
            Ok(hits)
        })
        .collect()
}

/// Neighbors of one query: parallel key and distance lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchMatches {
    pub keys: Vec<u64>,
    pub distances: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkSearchMatches {
    pub keys: Vec<Vec<u64>>,
    pub distances: Vec<Vec<f32>>,
}

/// Neighbors of stored vectors looked up by key.
///
/// `keys` lists only the requested keys present in the index; the neighbor
/// lists are aligned with it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySearchMatches {
    pub keys: Vec<u64>,
    pub neighbor_keys: Vec<Vec<u64>>,
    pub distances: Vec<Vec<f32>>,
}

/// Nearest-neighbor index over integer keys.
pub trait VectorIndex {
    /// Up to `count` nearest keys to `query`. `exact` forces brute force;
    /// otherwise the index may answer approximately.
    fn search(&self, query: &[f32], count: usize, exact: bool) -> Result<SearchMatches, SearchError>;

    /// Stored vector for `key`, if present.
    fn get(&self, key: u64) -> Result<Option<Vec<f32>>, SearchError>;

    fn bulk_search(
        &self,
        queries: &[Vec<f32>],
        count: usize,
        exact: bool,
    ) -> Result<BulkSearchMatches, SearchError> {
        let mut out = BulkSearchMatches::default();
        for query in queries {
            let matches = self.search(query, count, exact)?;
            out.keys.push(matches.keys);
            out.distances.push(matches.distances);
        }
        Ok(out)
    }
}

/// HNSW index over unit vectors with inner-product distance.
///
/// The dimension is fixed by the first inserted vector. Keys are unique:
/// inserting an existing key replaces its vector and keeps its position in
/// [`EmbeddingIndex::records`].
#[derive(Default)]
pub struct EmbeddingIndex {
    index: Option<Index>,
    keys: Vec<u64>,
}

impl EmbeddingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from records. A repeated key replaces the earlier vector.
    pub fn from_records(records: &[EmbeddingRecord]) -> Result<Self, SearchError> {
        let mut index = Self::new();
        for record in records {
            index.insert(record.id, &record.vector)?;
        }
        Ok(index)
    }

    pub fn insert(&mut self, key: u64, vector: &[f32]) -> Result<(), SearchError> {
        if vector.is_empty() {
            return Err(SearchError::EmptyVector(key));
        }
        let index = match self.index.take() {
            Some(index) => index,
            None => new_index(vector.len())?,
        };
        let index = self.index.insert(index);
        if vector.len() != index.dimensions() {
            return Err(SearchError::Dimension {
                key,
                expected: index.dimensions(),
                got: vector.len(),
            });
        }

        if index.contains(key) {
            index.remove(key).map_err(index_error)?;
        } else {
            self.keys.push(key);
        }
        let needed = index.size() + 1;
        if needed > index.capacity() {
            index
                .reserve(needed.max(index.capacity() * 2))
                .map_err(index_error)?;
        }
        index.add(key, vector).map_err(index_error)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Vector dimension, or 0 before the first insert.
    pub fn dimensions(&self) -> usize {
        self.index.as_ref().map_or(0, Index::dimensions)
    }

    /// Every stored vector in first-insertion key order.
    pub fn records(&self) -> Result<Vec<EmbeddingRecord>, SearchError> {
        let mut records = Vec::with_capacity(self.keys.len());
        for &id in &self.keys {
            if let Some(vector) = self.get(id)? {
                records.push(EmbeddingRecord { id, vector });
            }
        }
        Ok(records)
    }

    /// Approximate neighbors with `1 - dot <= 1 - minimum_similarity`.
    ///
    /// Widens the result size step by step while the farthest hit is still
    /// inside the radius, so small radii stay cheap on large indexes.
    pub fn search_within_similarity(
        &self,
        query: &[f32],
        minimum_similarity: f32,
    ) -> Result<SearchMatches, SearchError> {
        let max_distance = 1.0 - minimum_similarity;
        let Some(index) = self.searchable(query, max_distance)? else {
            return Ok(SearchMatches::default());
        };

        let size = self.len();
        let mut previous = 0;
        for step in WITHIN_SEARCH_STEPS.into_iter().chain([size]) {
            let count = step.min(size);
            if count <= previous {
                continue;
            }
            previous = count;
            let matches = index.search(query, count).map_err(index_error)?;
            let saturated = matches.distances.last().is_some_and(|&d| d <= max_distance);
            if count < size && saturated {
                continue;
            }
            return Ok(within_distance(matches.keys, matches.distances, max_distance));
        }
        Ok(SearchMatches::default())
    }

    /// Up to `count` neighbors among `allowed_keys` within `max_distance`.
    pub fn filtered_search_within_distance(
        &self,
        query: &[f32],
        allowed_keys: &[u64],
        count: usize,
        max_distance: f32,
    ) -> Result<SearchMatches, SearchError> {
        let allowed: HashSet<u64> = allowed_keys.iter().copied().collect();
        self.filtered_search(query, &allowed, count, max_distance)
    }

    /// [`Self::filtered_search_within_distance`] for each query, aligned with `queries`.
    pub fn bulk_filtered_search_within_distance(
        &self,
        queries: &[Vec<f32>],
        allowed_keys: &[u64],
        count: usize,
        max_distance: f32,
    ) -> Result<BulkSearchMatches, SearchError> {
        let allowed: HashSet<u64> = allowed_keys.iter().copied().collect();
        let mut out = BulkSearchMatches::default();
        for query in queries {
            let matches = self.filtered_search(query, &allowed, count, max_distance)?;
            out.keys.push(matches.keys);
            out.distances.push(matches.distances);
        }
        Ok(out)
    }

    fn filtered_search(
        &self,
        query: &[f32],
        allowed: &HashSet<u64>,
        count: usize,
        max_distance: f32,
    ) -> Result<SearchMatches, SearchError> {
        let Some(index) = self.searchable(query, max_distance)? else {
            return Ok(SearchMatches::default());
        };
        let count = count.min(allowed.len()).min(self.len());
        if count == 0 {
            return Ok(SearchMatches::default());
        }
        let matches = index
            .filtered_search(query, count, |key| allowed.contains(&key))
            .map_err(index_error)?;
        Ok(within_distance(matches.keys, matches.distances, max_distance))
    }

    /// The backing index when a radius search can return anything.
    fn searchable(&self, query: &[f32], max_distance: f32) -> Result<Option<&Index>, SearchError> {
        if !max_distance.is_finite() || max_distance < 0.0 || self.is_empty() {
            return Ok(None);
        }
        let Some(index) = &self.index else {
            return Ok(None);
        };
        check_query(index, query)?;
        Ok(Some(index))
    }
}

fn new_index(dimensions: usize) -> Result<Index, SearchError> {
    let options = IndexOptions {
        dimensions,
        metric: MetricKind::IP,
        quantization: ScalarKind::F32,
        ..Default::default()
    };
    let index = Index::new(&options).map_err(index_error)?;
    index.reserve(INITIAL_CAPACITY).map_err(index_error)?;
    Ok(index)
}

fn check_query(index: &Index, query: &[f32]) -> Result<(), SearchError> {
    if query.len() != index.dimensions() {
        return Err(SearchError::QueryDimension {
            index: 0,
            expected: index.dimensions(),
            got: query.len(),
        });
    }
    Ok(())
}

/// Cut ascending matches at the first distance beyond `max_distance`.
fn within_distance(mut keys: Vec<u64>, mut distances: Vec<f32>, max_distance: f32) -> SearchMatches {
    let len = keys.len().min(distances.len());
    let keep = distances[..len].partition_point(|&d| d <= max_distance);
    keys.truncate(keep);
    distances.truncate(keep);
    SearchMatches { keys, distances }
}

impl VectorIndex for EmbeddingIndex {
    fn search(&self, query: &[f32], count: usize, exact: bool) -> Result<SearchMatches, SearchError> {
        let Some(index) = &self.index else {
            return Ok(SearchMatches::default());
        };
        let count = count.min(self.len());
        if count == 0 {
            return Ok(SearchMatches::default());
        }
        check_query(index, query)?;

        let matches = if exact {
            index.exact_search(query, count)
        } else {
            index.search(query, count)
        }
        .map_err(index_error)?;
        Ok(SearchMatches {
            keys: matches.keys,
            distances: matches.distances,
        })
    }

    fn get(&self, key: u64) -> Result<Option<Vec<f32>>, SearchError> {
        let Some(index) = &self.index else {
            return Ok(None);
        };
        if !index.contains(key) {
            return Ok(None);
        }
        let mut vector = vec![0.0; index.dimensions()];
        index.get(key, &mut vector).map_err(index_error)?;
        Ok(Some(vector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, vector: &[f32]) -> EmbeddingRecord {
        EmbeddingRecord { id, vector: vector.to_vec() }
    }

    #[test]
    fn test_bulk_similarity_threshold_and_order() {
        // Candidate scores against the query are 0.5 (id 2) and 0.9 (id 1).
        let candidates = vec![record(2, &[0.5, 0.0]), record(1, &[0.9, 0.0])];
        let queries = vec![SimilarityQuery { vector: vec![1.0, 0.0], threshold: 0.6 }];
        let hits = bulk_similarity(&candidates, &queries).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0], vec![SimilarityHit { id: 1, score: 0.9 }]);
    }

    #[test]
    fn test_bulk_similarity_sorted_descending_and_inclusive() {
        let candidates = vec![record(1, &[0.6]), record(2, &[0.8]), record(3, &[0.7])];
        let queries = vec![SimilarityQuery { vector: vec![1.0], threshold: 0.6 }];
        let hits = bulk_similarity(&candidates, &queries).unwrap();
        let ids: Vec<u64> = hits[0].iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn test_bulk_similarity_ties_keep_candidate_order() {
        let candidates = vec![record(5, &[1.0]), record(4, &[1.0])];
        let queries = vec![SimilarityQuery { vector: vec![1.0], threshold: 0.0 }];
        let hits = bulk_similarity(&candidates, &queries).unwrap();
        assert_eq!(hits[0][0].id, 5);
        assert_eq!(hits[0][1].id, 4);
    }

    #[test]
    fn test_bulk_similarity_dimension_mismatch() {
        let candidates = vec![record(1, &[1.0, 0.0])];
        let queries = vec![SimilarityQuery { vector: vec![1.0], threshold: 0.0 }];
        assert!(matches!(
            bulk_similarity(&candidates, &queries),
            Err(SearchError::QueryDimension { index: 0, expected: 2, got: 1 })
        ));
    }

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.6, 0.8]);
        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    fn index() -> EmbeddingIndex {
        EmbeddingIndex::from_records(&[
            record(10, &[1.0, 0.0]),
            record(20, &[0.0, 1.0]),
            record(30, &[0.6, 0.8]),
        ])
        .unwrap()
    }

    /// Deterministic unit vectors from a linear congruential generator.
    fn scattered(n: usize, dims: usize) -> Vec<EmbeddingRecord> {
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 33) as f32 / (1u64 << 31) as f32) - 0.5
        };
        (0..n)
            .map(|i| {
                let mut vector: Vec<f32> = (0..dims).map(|_| next()).collect();
                l2_normalize(&mut vector);
                EmbeddingRecord { id: i as u64 + 1, vector }
            })
            .collect()
    }

    fn brute_force(records: &[EmbeddingRecord], query: &[f32], count: usize) -> Vec<u64> {
        let mut scored: Vec<(u64, f32)> =
            records.iter().map(|r| (r.id, 1.0 - dot(query, &r.vector))).collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.into_iter().take(count).map(|(id, _)| id).collect()
    }

    /// Records which search mode each lookup asked for.
    struct ModeLog {
        inner: EmbeddingIndex,
        modes: std::cell::RefCell<Vec<bool>>,
    }

    impl VectorIndex for ModeLog {
        fn search(&self, query: &[f32], count: usize, exact: bool) -> Result<SearchMatches, SearchError> {
            self.modes.borrow_mut().push(exact);
            self.inner.search(query, count, exact)
        }

        fn get(&self, key: u64) -> Result<Option<Vec<f32>>, SearchError> {
            self.inner.get(key)
        }
    }

    #[test]
    fn test_search_ascending_distance() {
        let m = index().search(&[1.0, 0.0], 2, true).unwrap();
        assert_eq!(m.keys, vec![10, 30]);
        assert!(m.distances[0].abs() < 1e-6);
        assert!((m.distances[1] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_exact_search_matches_brute_force() {
        let records = scattered(300, 16);
        let idx = EmbeddingIndex::from_records(&records).unwrap();
        for query in records.iter().step_by(37) {
            let m = idx.search(&query.vector, 10, true).unwrap();
            assert_eq!(m.keys, brute_force(&records, &query.vector, 10));
            assert_eq!(m.keys[0], query.id);
        }
    }

    #[test]
    fn test_approximate_search_reports_true_distances() {
        let records = scattered(300, 16);
        let idx = EmbeddingIndex::from_records(&records).unwrap();
        let query = &records[5].vector;
        let m = idx.search(query, 10, false).unwrap();
        assert_eq!(m.keys.len(), 10);
        assert!(m.distances.windows(2).all(|w| w[0] <= w[1]), "{:?}", m.distances);
        for (key, distance) in m.keys.iter().zip(&m.distances) {
            let stored = idx.get(*key).unwrap().unwrap();
            assert!((distance - (1.0 - dot(query, &stored))).abs() < 1e-4);
        }
    }

    #[test]
    fn test_bulk_operations_forward_search_mode() {
        let logged = ModeLog { inner: index(), modes: Default::default() };
        logged.bulk_search(&[vec![1.0, 0.0], vec![0.0, 1.0]], 1, true).unwrap();
        logged.search_by_key(&[10, 99], 1, false).unwrap();
        assert_eq!(*logged.modes.borrow(), vec![true, true, false]);
    }

    #[test]
    fn test_bulk_search() {
        let m = index().bulk_search(&[vec![1.0, 0.0], vec![0.0, 1.0]], 1, true).unwrap();
        assert_eq!(m.keys, vec![vec![10], vec![20]]);
    }

    #[test]
    fn test_search_by_key_skips_missing() {
        let m = index().search_by_key(&[20, 99, 10], 1, true).unwrap();
        assert_eq!(m.keys, vec![20, 10]);
        assert_eq!(m.neighbor_keys, vec![vec![20], vec![10]]);
        assert_eq!(m.distances.len(), 2);
    }

    #[test]
    fn test_insert_replaces_key_and_checks_dimension() {
        let mut idx = index();
        idx.insert(10, &[0.0, 1.0]).unwrap();
        assert_eq!(idx.len(), 3);
        assert_eq!(idx.get(10).unwrap(), Some(vec![0.0, 1.0]));
        let ids: Vec<u64> = idx.records().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![10, 20, 30]);
        assert!(matches!(
            idx.insert(40, &[1.0]),
            Err(SearchError::Dimension { key: 40, .. })
        ));
        assert!(matches!(idx.insert(41, &[]), Err(SearchError::EmptyVector(41))));
    }

    #[test]
    fn test_grows_past_initial_capacity() {
        let records = scattered(INITIAL_CAPACITY + 50, 4);
        let idx = EmbeddingIndex::from_records(&records).unwrap();
        assert_eq!(idx.len(), INITIAL_CAPACITY + 50);
        assert_eq!(idx.dimensions(), 4);
    }

    #[test]
    fn test_empty_index_and_zero_count() {
        let empty = EmbeddingIndex::new();
        assert_eq!(empty.search(&[1.0], 5, true).unwrap(), SearchMatches::default());
        assert_eq!(empty.get(1).unwrap(), None);
        assert!(index().search(&[1.0, 0.0], 0, true).unwrap().keys.is_empty());
        assert!(matches!(
            index().search(&[1.0], 1, true),
            Err(SearchError::QueryDimension { expected: 2, got: 1, .. })
        ));
    }

    #[test]
    fn test_search_within_similarity() {
        let m = index().search_within_similarity(&[1.0, 0.0], 0.5).unwrap();
        assert_eq!(m.keys, vec![10, 30]);
        assert!(index().search_within_similarity(&[1.0, 0.0], 1.5).unwrap().keys.is_empty());
        assert!(index().search_within_similarity(&[1.0, 0.0], f32::NAN).unwrap().keys.is_empty());
    }

    #[test]
    fn test_within_similarity_widens_past_first_step() {
        // Every vector is within the radius, so the search must cover the whole index.
        let records = scattered(250, 4);
        let idx = EmbeddingIndex::from_records(&records).unwrap();
        let m = idx.search_within_similarity(&records[0].vector, -1.5).unwrap();
        assert!(m.keys.len() > 200, "stopped at {} matches", m.keys.len());
        assert_eq!(m.keys[0], records[0].id);
    }

    #[test]
    fn test_filtered_search_within_distance() {
        let idx = index();
        let m = idx.filtered_search_within_distance(&[1.0, 0.0], &[20, 30], 5, 0.5).unwrap();
        assert_eq!(m.keys, vec![30]);
        assert!(idx
            .filtered_search_within_distance(&[1.0, 0.0], &[], 5, 0.5)
            .unwrap()
            .keys
            .is_empty());

        let bulk = idx
            .bulk_filtered_search_within_distance(&[vec![1.0, 0.0], vec![0.0, 1.0]], &[10, 20], 1, 2.0)
            .unwrap();
        assert_eq!(bulk.keys, vec![vec![10], vec![20]]);
        let none = idx
            .bulk_filtered_search_within_distance(&[vec![1.0, 0.0]], &[10], 1, -1.0)
            .unwrap();
        assert_eq!(none.keys, vec![Vec::<u64>::new()]);
    }
}
