//! Exact flat (brute-force) index.
//!
//! For L2 it scores candidates as `||x||² + ||y||² - 2⟨x, y⟩` against a
//! cached per-row norm vector recomputed on `add`, decomposing Euclidean
//! distance the same way the additive-quantizer search path does. For every
//! other metric it falls back to the scalar reference implementation
//! directly; Flat is the one index kind where an exact, un-approximated
//! answer is the point.

use annq_distance::Metric;
use annq_error::AnnError;
use tracing::instrument;

use crate::parallel::parallel_map;
use crate::topk::TopK;
use crate::types::{Index, IndexConfig, IndexError, RangeSearchResult};

/// A flat store: contiguous row-major vectors with exact k-NN and range
/// search. Born trained.
pub struct FlatIndex {
    config: IndexConfig,
    /// Row-major `ntotal * d` stored vectors, insertion order preserved.
    codes: Vec<f32>,
    ids: Vec<i64>,
    /// `||y||²` per stored row, recomputed incrementally on `add`.
    norms: Vec<f32>,
    next_id: i64,
}

impl FlatIndex {
    pub fn new(config: IndexConfig) -> Self {
        FlatIndex {
            config,
            codes: Vec::new(),
            ids: Vec::new(),
            norms: Vec::new(),
            next_id: 0,
        }
    }

    fn check_dim(&self, x_len: usize) -> Result<usize, Box<dyn AnnError>> {
        let d = self.config.dimensionality;
        if d == 0 || x_len % d != 0 {
            return Err(IndexError::DimensionMismatch {
                expected: d,
                got: x_len,
            }
            .boxed());
        }
        Ok(x_len / d)
    }

    fn append_row(&mut self, id: i64, row: &[f32]) {
        let norm = row.iter().map(|v| v * v).sum::<f32>();
        self.codes.extend_from_slice(row);
        self.ids.push(id);
        self.norms.push(norm);
    }

    fn score_row(&self, query: &[f32], q_norm: f32, row_idx: usize) -> f32 {
        let d = self.config.dimensionality;
        let row = &self.codes[row_idx * d..(row_idx + 1) * d];
        match self.config.metric {
            Metric::L2 => {
                let dot: f32 = query.iter().zip(row).map(|(a, b)| a * b).sum();
                q_norm + self.norms[row_idx] - 2.0 * dot
            }
            Metric::InnerProduct => query.iter().zip(row).map(|(a, b)| a * b).sum(),
            other => other.distance(query, row),
        }
    }

    /// Row position of `id` in insertion order, or `None`.
    fn row_of(&self, id: i64) -> Option<usize> {
        self.ids.iter().position(|&stored| stored == id)
    }
}

impl Index for FlatIndex {
    fn d(&self) -> usize {
        self.config.dimensionality
    }

    fn ntotal(&self) -> usize {
        self.ids.len()
    }

    fn is_trained(&self) -> bool {
        true
    }

    fn metric(&self) -> Metric {
        self.config.metric
    }

    fn train(&mut self, _x: &[f32]) -> Result<(), Box<dyn AnnError>> {
        Ok(())
    }

    #[instrument(skip(self, x))]
    fn add(&mut self, x: &[f32]) -> Result<(), Box<dyn AnnError>> {
        let n = self.check_dim(x.len())?;
        let d = self.config.dimensionality;
        for i in 0..n {
            let id = self.next_id;
            self.append_row(id, &x[i * d..(i + 1) * d]);
            self.next_id += 1;
        }
        Ok(())
    }

    fn add_with_ids(&mut self, x: &[f32], ids: &[i64]) -> Result<(), Box<dyn AnnError>> {
        let n = self.check_dim(x.len())?;
        if ids.len() != n {
            return Err(IndexError::InvalidArgument(format!(
                "expected {n} ids, got {}",
                ids.len()
            ))
            .boxed());
        }
        let d = self.config.dimensionality;
        for i in 0..n {
            self.append_row(ids[i], &x[i * d..(i + 1) * d]);
        }
        Ok(())
    }

    #[instrument(skip(self, x, out_dist, out_ids))]
    fn search(
        &self,
        x: &[f32],
        k: usize,
        out_dist: &mut [f32],
        out_ids: &mut [i64],
    ) -> Result<(), Box<dyn AnnError>> {
        let n = self.check_dim(x.len())?;
        let d = self.config.dimensionality;
        let metric = self.config.metric;
        let sentinel = metric.sentinel_score();

        let results = parallel_map(n, 1, |qi| {
            let query = &x[qi * d..(qi + 1) * d];
            let q_norm = query.iter().map(|v| v * v).sum::<f32>();
            let mut topk = TopK::new(k, metric.direction());
            for row_idx in 0..self.ids.len() {
                let score = self.score_row(query, q_norm, row_idx);
                topk.push(self.ids[row_idx], score);
            }
            topk.into_sorted()
        });

        for (qi, (ids, scores)) in results.into_iter().enumerate() {
            for slot in 0..k {
                let (id, dist) = if slot < ids.len() {
                    (ids[slot], scores[slot])
                } else {
                    (-1, sentinel)
                };
                out_ids[qi * k + slot] = id;
                out_dist[qi * k + slot] = dist;
            }
        }
        Ok(())
    }

    fn range_search(
        &self,
        x: &[f32],
        radius: f32,
    ) -> Result<RangeSearchResult, Box<dyn AnnError>> {
        let n = self.check_dim(x.len())?;
        let d = self.config.dimensionality;
        let metric = self.config.metric;

        let hits = parallel_map(n, 1, |qi| {
            let query = &x[qi * d..(qi + 1) * d];
            let q_norm = query.iter().map(|v| v * v).sum::<f32>();
            let mut row_hits = Vec::new();
            for row_idx in 0..self.ids.len() {
                let score = self.score_row(query, q_norm, row_idx);
                if metric.within_radius(score, radius) {
                    row_hits.push((self.ids[row_idx], score));
                }
            }
            row_hits
        });
        Ok(RangeSearchResult { hits })
    }

    fn reconstruct(&self, key: i64, out: &mut [f32]) -> Result<(), Box<dyn AnnError>> {
        let d = self.config.dimensionality;
        let row = self.row_of(key).ok_or_else(|| {
            IndexError::InvalidArgument(format!("unknown id {key}")).boxed()
        })?;
        out.copy_from_slice(&self.codes[row * d..(row + 1) * d]);
        Ok(())
    }

    fn remove_ids(&mut self, ids: &[i64]) -> Result<usize, Box<dyn AnnError>> {
        let mut removed = 0;
        for &id in ids {
            if let Some(row) = self.row_of(id) {
                let d = self.config.dimensionality;
                let last = self.ids.len() - 1;
                for j in 0..d {
                    self.codes.swap(row * d + j, last * d + j);
                }
                self.ids.swap(row, last);
                self.norms.swap(row, last);
                self.codes.truncate(last * d);
                self.ids.truncate(last);
                self.norms.truncate(last);
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn reset(&mut self) {
        self.codes.clear();
        self.ids.clear();
        self.norms.clear();
        self.next_id = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(metric: Metric, d: usize) -> FlatIndex {
        FlatIndex::new(IndexConfig::new(d, metric))
    }

    #[test]
    fn l2_search_ranks_by_squared_distance() {
        let mut idx = flat(Metric::L2, 4);
        idx.add(&[
            0.0, 0.0, 0.0, 0.0, //
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            2.0, 2.0, 2.0, 2.0,
        ])
        .unwrap();

        let mut dist = [0.0f32; 2];
        let mut ids = [0i64; 2];
        idx.search(&[0.0, 0.0, 0.0, 0.0], 2, &mut dist, &mut ids)
            .unwrap();
        assert_eq!(ids, [0, 1]);
        assert_eq!(dist, [0.0, 1.0]);
    }

    #[test]
    fn inner_product_search_ties_break_on_smaller_id() {
        let mut idx = flat(Metric::InnerProduct, 4);
        idx.add(&[
            0.0, 0.0, 0.0, 0.0, //
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            2.0, 2.0, 2.0, 2.0,
        ])
        .unwrap();

        let mut dist = [0.0f32; 3];
        let mut ids = [0i64; 3];
        idx.search(&[1.0, 0.0, 0.0, 0.0], 3, &mut dist, &mut ids)
            .unwrap();
        assert_eq!(ids, [3, 1, 0]);
        assert_eq!(dist, [2.0, 1.0, 0.0]);
    }

    #[test]
    fn search_k_equal_ntotal_returns_exact_order() {
        let mut idx = flat(Metric::L2, 2);
        idx.add(&[5.0, 5.0, 0.0, 0.0, 1.0, 1.0]).unwrap();
        let mut dist = [0.0f32; 3];
        let mut ids = [0i64; 3];
        idx.search(&[0.0, 0.0], 3, &mut dist, &mut ids).unwrap();
        assert_eq!(ids, [1, 2, 0]);
        assert!(dist[0] <= dist[1] && dist[1] <= dist[2]);
    }

    #[test]
    fn search_pads_short_results_with_sentinels() {
        let mut idx = flat(Metric::L2, 2);
        idx.add(&[0.0, 0.0]).unwrap();
        let mut dist = [0.0f32; 3];
        let mut ids = [0i64; 3];
        idx.search(&[0.0, 0.0], 3, &mut dist, &mut ids).unwrap();
        assert_eq!(ids[0], 0);
        assert_eq!(ids[1], -1);
        assert_eq!(ids[2], -1);
        assert!(dist[1].is_infinite() && dist[1] > 0.0);
    }

    #[test]
    fn reset_clears_ntotal_and_restarts_ids_from_zero() {
        let mut idx = flat(Metric::L2, 2);
        idx.add(&[0.0, 0.0, 1.0, 1.0]).unwrap();
        idx.reset();
        assert_eq!(idx.ntotal(), 0);
        assert!(idx.is_trained());
        idx.add(&[2.0, 2.0]).unwrap();
        let mut dist = [0.0f32; 1];
        let mut ids = [0i64; 1];
        idx.search(&[2.0, 2.0], 1, &mut dist, &mut ids).unwrap();
        assert_eq!(ids, [0]);
    }

    #[test]
    fn reconstruct_returns_stored_vector_exactly() {
        let mut idx = flat(Metric::L2, 3);
        idx.add(&[1.0, 2.0, 3.0]).unwrap();
        let mut out = [0.0f32; 3];
        idx.reconstruct(0, &mut out).unwrap();
        assert_eq!(out, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn remove_ids_shrinks_ntotal_and_drops_vector() {
        let mut idx = flat(Metric::L2, 2);
        idx.add(&[0.0, 0.0, 5.0, 5.0, 9.0, 9.0]).unwrap();
        let removed = idx.remove_ids(&[1]).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(idx.ntotal(), 2);
        let mut out = [0.0f32; 2];
        assert!(idx.reconstruct(1, &mut out).is_err());
    }

    #[test]
    fn range_search_uses_strict_inequality() {
        let mut idx = flat(Metric::L2, 1);
        idx.add(&[0.0, 1.0, 2.0]).unwrap();
        let result = idx.range_search(&[0.0], 1.0).unwrap();
        let hit_ids: Vec<i64> = result.hits[0].iter().map(|&(id, _)| id).collect();
        assert_eq!(hit_ids, vec![0]);
    }
}
