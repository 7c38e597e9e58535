//! Fixed-capacity approximate nearest neighbour index over passage embeddings.
//!
//! A thin wrapper around [`hnsw_rs`]. The graph is built once from a finalized
//! embedding array and is read-only afterwards: no insert, delete or resize
//! after [`HnswIndex::build`]. Labels are the positions of the vectors in the
//! build array.
//!
//! Similarity is the inner product. Results only match cosine ranking when
//! the stored vectors are normalized.

use std::{fmt, time::Instant};

use common::{error::AppError, utils::config::AppConfig};
use hnsw_rs::prelude::*;
use tracing::{debug, info};

use crate::scoring::score_desc;

// hnsw_rs caps both of these internally.
const MAX_LAYERS: usize = 16;
const MAX_CONNECTIVITY: usize = 256;

/// Construction and search parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HnswParams {
    /// Max connections per node (`M`).
    pub connectivity: usize,
    /// Beam width while building.
    pub ef_construction: usize,
    /// Beam width while querying; raised to `k` when smaller.
    pub ef_search: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            connectivity: 64,
            ef_construction: 512,
            ef_search: 64,
        }
    }
}

impl HnswParams {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            connectivity: config.hnsw_connectivity,
            ef_construction: config.hnsw_ef_construction,
            ef_search: config.hnsw_ef_search,
        }
    }

    fn validate(&self) -> Result<(), AppError> {
        if !(2..=MAX_CONNECTIVITY).contains(&self.connectivity) {
            return Err(AppError::Validation(format!(
                "HNSW connectivity must be between 2 and {MAX_CONNECTIVITY}, got {}",
                self.connectivity
            )));
        }
        if self.ef_construction == 0 {
            return Err(AppError::Validation(
                "HNSW construction breadth must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// `1 - <a, b>`: the same distance as `DistDot`, without requiring unit
/// vectors. Smaller means more similar.
#[derive(Debug, Default, Clone, Copy)]
pub struct InnerProductDistance;

impl Distance<f32> for InnerProductDistance {
    fn eval(&self, va: &[f32], vb: &[f32]) -> f32 {
        let dot: f32 = va.iter().zip(vb.iter()).map(|(a, b)| a * b).sum();
        1.0 - dot
    }
}

/// One query hit: the label and its inner-product similarity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: usize,
    pub score: f32,
}

pub struct HnswIndex {
    params: HnswParams,
    capacity: usize,
    dimension: usize,
    len: usize,
    /// `None` for an empty index; hnsw_rs needs at least one point to search.
    graph: Option<Hnsw<'static, f32, InnerProductDistance>>,
}

impl fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HnswIndex")
            .field("params", &self.params)
            .field("capacity", &self.capacity)
            .field("dimension", &self.dimension)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl HnswIndex {
    /// Builds an index over `vectors`, labelled by position.
    ///
    /// Fails when there are more vectors than `capacity`, when dimensions are
    /// inconsistent, or when a vector contains non-finite values.
    pub fn build(
        vectors: Vec<Vec<f32>>,
        capacity: usize,
        params: HnswParams,
    ) -> Result<Self, AppError> {
        params.validate()?;
        if vectors.len() > capacity {
            return Err(AppError::Validation(format!(
                "cannot index {} vectors into an index with capacity {capacity}",
                vectors.len()
            )));
        }

        let dimension = vectors.first().map_or(0, Vec::len);
        for (label, vector) in vectors.iter().enumerate() {
            if vector.len() != dimension || dimension == 0 {
                return Err(AppError::Validation(format!(
                    "vector {label} has dimension {}, expected {dimension}",
                    vector.len()
                )));
            }
            if vector.iter().any(|value| !value.is_finite()) {
                return Err(AppError::Validation(format!(
                    "vector {label} contains non-finite values"
                )));
            }
        }

        let started = Instant::now();
        let graph = if vectors.is_empty() {
            None
        } else {
            let graph = Hnsw::new(
                params.connectivity,
                capacity,
                MAX_LAYERS,
                params.ef_construction,
                InnerProductDistance,
            );
            let labelled: Vec<(&Vec<f32>, usize)> =
                vectors.iter().enumerate().map(|(label, v)| (v, label)).collect();
            graph.parallel_insert(&labelled);
            Some(graph)
        };

        info!(
            count = vectors.len(),
            capacity,
            dimension,
            elapsed_ms = started.elapsed().as_millis(),
            "Built HNSW index"
        );
        Ok(Self {
            params,
            capacity,
            dimension,
            len: vectors.len(),
            graph,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Returns up to `k` labels ordered by descending inner product, lower
    /// label first on ties.
    ///
    /// `k` larger than the number of indexed items is clamped to that number.
    /// A query whose dimension differs from the index is a validation error.
    pub fn query(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbor>, AppError> {
        let Some(graph) = &self.graph else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }
        if vector.len() != self.dimension {
            return Err(AppError::Validation(format!(
                "query vector has dimension {}, index expects {}",
                vector.len(),
                self.dimension
            )));
        }

        let k_effective = k.min(self.len);
        if k_effective < k {
            debug!(
                requested = k,
                available = k_effective,
                "Clamping neighbor count to indexed items"
            );
        }

        // Fetch the whole beam so ties at the cut-off resolve by label.
        let ef = self.params.ef_search.max(k_effective);
        let mut neighbors: Vec<Neighbor> = graph
            .search(vector, ef.min(self.len), ef)
            .into_iter()
            .map(|hit| Neighbor {
                id: hit.d_id,
                score: 1.0 - hit.distance,
            })
            .collect();
        neighbors.sort_by(|a, b| score_desc(a.score, b.score).then_with(|| a.id.cmp(&b.id)));
        neighbors.truncate(k_effective);

        Ok(neighbors)
    }
}
