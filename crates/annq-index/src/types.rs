//! The polymorphic `Index` contract and its shared error type.
//!
//! Every concrete index (`Flat`, `Lsh`, the additive-quantizer family,
//! `Ivf`) implements this trait rather than a shared base class: optional
//! capabilities live as default methods that fail at call time with
//! `ErrorCode::UnsupportedOp` rather than at compile time, so an `Ivf` can
//! hold any fine quantizer behind `&dyn Index`.

use annq_error::{AnnError, ErrorCode};
use annq_distance::Metric;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common configuration header every concrete index's config embeds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    pub dimensionality: usize,
    pub metric: Metric,
}

impl IndexConfig {
    pub fn new(dimensionality: usize, metric: Metric) -> Self {
        IndexConfig {
            dimensionality,
            metric,
        }
    }
}

/// Errors shared by every index in this crate.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index is not trained")]
    NotTrained,
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("capacity exceeded: limit {limit}")]
    CapacityExceeded { limit: usize },
    #[error("operation `{0}` is not supported by this index")]
    UnsupportedOp(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("training produced non-finite values")]
    NumericalFailure,
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl AnnError for IndexError {
    fn code(&self) -> ErrorCode {
        match self {
            IndexError::NotTrained => ErrorCode::NotTrained,
            IndexError::DimensionMismatch { .. } => ErrorCode::DimensionMismatch,
            IndexError::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            IndexError::UnsupportedOp(_) => ErrorCode::UnsupportedOp,
            IndexError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            IndexError::NumericalFailure => ErrorCode::NumericalFailure,
            IndexError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
        }
    }
}

impl IndexError {
    pub fn boxed(self) -> Box<dyn AnnError> {
        Box::new(self)
    }
}

/// Result of a `range_search`: one unordered `(id, distance)` list per query,
/// with no ordering guarantee among hits within a single query.
#[derive(Clone, Debug, Default)]
pub struct RangeSearchResult {
    pub hits: Vec<Vec<(i64, f32)>>,
}

/// The polymorphic index contract. See module docs for the shared
/// default-method pattern every concrete index type builds on.
pub trait Index: Send + Sync {
    /// Vector dimensionality.
    fn d(&self) -> usize;
    /// Number of live vectors.
    fn ntotal(&self) -> usize;
    fn is_trained(&self) -> bool;
    fn metric(&self) -> Metric;

    /// Consumes a representative batch of `x.len() / d()` vectors. May be a
    /// no-op for index kinds that need no training.
    fn train(&mut self, x: &[f32]) -> Result<(), Box<dyn AnnError>>;

    /// Appends `x.len() / d()` vectors, assigning ids `ntotal..ntotal+n`.
    fn add(&mut self, x: &[f32]) -> Result<(), Box<dyn AnnError>>;

    /// Appends vectors under caller-supplied ids. Fails with
    /// `UnsupportedOp` for indexes that cannot store external ids.
    fn add_with_ids(&mut self, _x: &[f32], _ids: &[i64]) -> Result<(), Box<dyn AnnError>> {
        Err(IndexError::UnsupportedOp("add_with_ids").boxed())
    }

    /// Fills `out_ids`/`out_dist` (each `n * k` long, `n = out_ids.len() / k`)
    /// with the top-k matches per query, sentinel-padded past however many
    /// candidates were actually found.
    fn search(
        &self,
        x: &[f32],
        k: usize,
        out_dist: &mut [f32],
        out_ids: &mut [i64],
    ) -> Result<(), Box<dyn AnnError>>;

    /// All points within `radius` of each query. Optional.
    fn range_search(
        &self,
        _x: &[f32],
        _radius: f32,
    ) -> Result<RangeSearchResult, Box<dyn AnnError>> {
        Err(IndexError::UnsupportedOp("range_search").boxed())
    }

    /// Reconstructs the (possibly lossy) vector stored under `key`. Optional.
    fn reconstruct(&self, _key: i64, _out: &mut [f32]) -> Result<(), Box<dyn AnnError>> {
        Err(IndexError::UnsupportedOp("reconstruct").boxed())
    }

    /// Reconstructs `ni` consecutive ids starting at `i0`. Default
    /// implementation calls `reconstruct` in a loop.
    fn reconstruct_n(&self, i0: i64, ni: usize, out: &mut [f32]) -> Result<(), Box<dyn AnnError>> {
        let d = self.d();
        for i in 0..ni {
            self.reconstruct(i0 + i as i64, &mut out[i * d..(i + 1) * d])?;
        }
        Ok(())
    }

    /// Equivalent to `search` discarding distances.
    fn assign(&self, x: &[f32], out_ids: &mut [i64], k: usize) -> Result<(), Box<dyn AnnError>> {
        let n = out_ids.len() / k.max(1);
        let mut scratch_dist = vec![0.0f32; n * k];
        self.search(x, k, &mut scratch_dist, out_ids)
    }

    /// `out = x - reconstruct(key)`.
    fn compute_residual(
        &self,
        x: &[f32],
        out: &mut [f32],
        key: i64,
    ) -> Result<(), Box<dyn AnnError>> {
        let d = self.d();
        self.reconstruct(key, out)?;
        for i in 0..d {
            out[i] = x[i] - out[i];
        }
        Ok(())
    }

    /// Removes the given ids, returning the count actually removed. Optional.
    fn remove_ids(&mut self, _ids: &[i64]) -> Result<usize, Box<dyn AnnError>> {
        Err(IndexError::UnsupportedOp("remove_ids").boxed())
    }

    /// Clears `ntotal` to 0 and all stored codes; preserves training state.
    fn reset(&mut self);
}
