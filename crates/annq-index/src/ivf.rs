//! Inverted file index: a coarse quantizer partitions the
//! space into `nlist` cells, each vector is stored only in its assigned
//! cell's list, and search probes the `nprobe` cells closest to the query
//! instead of scanning every stored vector.
//!
//! List population mirrors the rest of this crate's parallel-compute,
//! serial-merge shape (`flat.rs`, `aq/mod.rs`): coarse assignment and fine
//! encoding run through `parallel_map`, then each vector's id/code is
//! appended to its list on the calling thread, so there is never a shared
//! mutable list visible to more than one thread at a time.

use annq_distance::Metric;
use annq_error::AnnError;
use tracing::instrument;

use crate::aq::{build_lut, decode as aq_decode, pack_code, score_from_lut, unpack_code, AdditiveQuantizer};
use crate::kmeans::kmeans;
use crate::parallel::parallel_map;
use crate::topk::TopK;
use crate::types::{Index, IndexError, RangeSearchResult};

#[derive(Clone, Debug)]
pub struct IvfConfig {
    pub dimensionality: usize,
    pub metric: Metric,
    pub nlist: usize,
    pub nprobe: usize,
    /// Encode the residual against the assigned centroid instead of the raw
    /// vector, letting the fine coder spend its bits on the
    /// harder-to-predict part of each vector.
    pub by_residual: bool,
    pub kmeans_iters: usize,
    pub seed: u64,
}

struct CoarseQuantizer {
    centroids: Vec<f32>,
    d: usize,
    nlist: usize,
}

impl CoarseQuantizer {
    fn nearest(&self, x: &[f32]) -> usize {
        let mut best = 0usize;
        let mut best_dist = f32::INFINITY;
        for c in 0..self.nlist {
            let row = &self.centroids[c * self.d..(c + 1) * self.d];
            let dist: f32 = x.iter().zip(row).map(|(a, b)| (a - b).powi(2)).sum();
            if dist < best_dist {
                best_dist = dist;
                best = c;
            }
        }
        best
    }

    fn row(&self, list: usize) -> &[f32] {
        &self.centroids[list * self.d..(list + 1) * self.d]
    }
}

/// IVF with raw (unquantized) fine storage: every vector keeps its exact
/// coordinates, or its exact residual under `by_residual`, in its
/// assigned list.
pub struct IvfFlat {
    config: IvfConfig,
    coarse: Option<CoarseQuantizer>,
    lists: Vec<Vec<f32>>,
    list_ids: Vec<Vec<i64>>,
    next_id: i64,
}

impl IvfFlat {
    pub fn new(config: IvfConfig) -> Self {
        let nlist = config.nlist;
        IvfFlat {
            config,
            coarse: None,
            lists: (0..nlist).map(|_| Vec::new()).collect(),
            list_ids: (0..nlist).map(|_| Vec::new()).collect(),
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

    fn coarse(&self) -> Result<&CoarseQuantizer, Box<dyn AnnError>> {
        self.coarse.as_ref().ok_or_else(|| IndexError::NotTrained.boxed())
    }

    /// Closest `nprobe` lists to `query`, nearest first.
    fn probe_lists(&self, query: &[f32]) -> Vec<usize> {
        let coarse = self.coarse.as_ref().expect("checked by caller");
        let mut ranked: Vec<(usize, f32)> = (0..coarse.nlist)
            .map(|c| {
                let row = coarse.row(c);
                let dist: f32 = query.iter().zip(row).map(|(a, b)| (a - b).powi(2)).sum();
                (c, dist)
            })
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        ranked
            .into_iter()
            .take(self.config.nprobe.min(coarse.nlist))
            .map(|(c, _)| c)
            .collect()
    }
}

impl Index for IvfFlat {
    fn d(&self) -> usize {
        self.config.dimensionality
    }

    fn ntotal(&self) -> usize {
        self.list_ids.iter().map(|l| l.len()).sum()
    }

    fn is_trained(&self) -> bool {
        self.coarse.is_some()
    }

    fn metric(&self) -> Metric {
        self.config.metric
    }

    #[instrument(skip(self, x))]
    fn train(&mut self, x: &[f32]) -> Result<(), Box<dyn AnnError>> {
        let n = self.check_dim(x.len())?;
        let d = self.config.dimensionality;
        if self.config.nlist == 0 || self.config.nlist > n {
            return Err(IndexError::InvalidArgument(
                "nlist must be in 1..=training set size".to_string(),
            )
            .boxed());
        }
        let result = kmeans(x, n, d, self.config.nlist, self.config.kmeans_iters, self.config.seed);
        self.coarse = Some(CoarseQuantizer {
            centroids: result.centroids,
            d,
            nlist: self.config.nlist,
        });
        Ok(())
    }

    #[instrument(skip(self, x))]
    fn add(&mut self, x: &[f32]) -> Result<(), Box<dyn AnnError>> {
        self.coarse()?;
        let n = self.check_dim(x.len())?;
        let d = self.config.dimensionality;
        let coarse = self.coarse.as_ref().unwrap();

        let assignments = parallel_map(n, 16, |i| coarse.nearest(&x[i * d..(i + 1) * d]));

        for i in 0..n {
            let list = assignments[i];
            let row = &x[i * d..(i + 1) * d];
            if self.config.by_residual {
                let centroid = coarse.row(list);
                self.lists[list].extend(row.iter().zip(centroid).map(|(a, b)| a - b));
            } else {
                self.lists[list].extend_from_slice(row);
            }
            self.list_ids[list].push(self.next_id);
            self.next_id += 1;
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
        self.coarse()?;
        let n = self.check_dim(x.len())?;
        let d = self.config.dimensionality;
        let metric = self.config.metric;
        let sentinel = metric.sentinel_score();
        let coarse = self.coarse.as_ref().unwrap();

        let results = parallel_map(n, 1, |qi| {
            let query = &x[qi * d..(qi + 1) * d];
            let lists = self.probe_lists(query);
            let mut topk = TopK::new(k, metric.direction());
            for &list in &lists {
                let centroid = coarse.row(list);
                let stored = &self.lists[list];
                let n_list = self.list_ids[list].len();
                for row_idx in 0..n_list {
                    let stored_row = &stored[row_idx * d..(row_idx + 1) * d];
                    let score = if self.config.by_residual {
                        let full: Vec<f32> = stored_row.iter().zip(centroid).map(|(a, b)| a + b).collect();
                        metric.distance(query, &full)
                    } else {
                        metric.distance(query, stored_row)
                    };
                    topk.push(self.list_ids[list][row_idx], score);
                }
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

    fn range_search(&self, x: &[f32], radius: f32) -> Result<RangeSearchResult, Box<dyn AnnError>> {
        self.coarse()?;
        let n = self.check_dim(x.len())?;
        let d = self.config.dimensionality;
        let metric = self.config.metric;
        let coarse = self.coarse.as_ref().unwrap();

        let hits = parallel_map(n, 1, |qi| {
            let query = &x[qi * d..(qi + 1) * d];
            let lists = self.probe_lists(query);
            let mut row_hits = Vec::new();
            for &list in &lists {
                let centroid = coarse.row(list);
                let stored = &self.lists[list];
                let n_list = self.list_ids[list].len();
                for row_idx in 0..n_list {
                    let stored_row = &stored[row_idx * d..(row_idx + 1) * d];
                    let score = if self.config.by_residual {
                        let full: Vec<f32> = stored_row.iter().zip(centroid).map(|(a, b)| a + b).collect();
                        metric.distance(query, &full)
                    } else {
                        metric.distance(query, stored_row)
                    };
                    if metric.within_radius(score, radius) {
                        row_hits.push((self.list_ids[list][row_idx], score));
                    }
                }
            }
            row_hits
        });
        Ok(RangeSearchResult { hits })
    }

    fn reconstruct(&self, key: i64, out: &mut [f32]) -> Result<(), Box<dyn AnnError>> {
        let d = self.config.dimensionality;
        let coarse = self.coarse()?;
        for (list, ids) in self.list_ids.iter().enumerate() {
            if let Some(row_idx) = ids.iter().position(|&id| id == key) {
                let stored_row = &self.lists[list][row_idx * d..(row_idx + 1) * d];
                if self.config.by_residual {
                    let centroid = coarse.row(list);
                    for j in 0..d {
                        out[j] = stored_row[j] + centroid[j];
                    }
                } else {
                    out.copy_from_slice(stored_row);
                }
                return Ok(());
            }
        }
        Err(IndexError::InvalidArgument(format!("unknown id {key}")).boxed())
    }

    fn reset(&mut self) {
        for list in &mut self.lists {
            list.clear();
        }
        for ids in &mut self.list_ids {
            ids.clear();
        }
        self.next_id = 0;
    }
}

/// IVF with an additive quantizer as the fine coder: each list stores
/// packed codes instead of raw coordinates.
pub struct Ivf<Q: AdditiveQuantizer> {
    config: IvfConfig,
    coarse: Option<CoarseQuantizer>,
    quantizer: Q,
    lists: Vec<Vec<u8>>,
    list_ids: Vec<Vec<i64>>,
    next_id: i64,
}

impl<Q: AdditiveQuantizer> Ivf<Q> {
    pub fn new(config: IvfConfig, quantizer: Q) -> Self {
        let nlist = config.nlist;
        Ivf {
            config,
            coarse: None,
            quantizer,
            lists: (0..nlist).map(|_| Vec::new()).collect(),
            list_ids: (0..nlist).map(|_| Vec::new()).collect(),
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

    fn coarse(&self) -> Result<&CoarseQuantizer, Box<dyn AnnError>> {
        self.coarse.as_ref().ok_or_else(|| IndexError::NotTrained.boxed())
    }

    fn probe_lists(&self, query: &[f32]) -> Vec<usize> {
        let coarse = self.coarse.as_ref().expect("checked by caller");
        let mut ranked: Vec<(usize, f32)> = (0..coarse.nlist)
            .map(|c| {
                let row = coarse.row(c);
                let dist: f32 = query.iter().zip(row).map(|(a, b)| (a - b).powi(2)).sum();
                (c, dist)
            })
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        ranked
            .into_iter()
            .take(self.config.nprobe.min(coarse.nlist))
            .map(|(c, _)| c)
            .collect()
    }

    pub fn quantizer(&self) -> &Q {
        &self.quantizer
    }
}

impl<Q: AdditiveQuantizer> Index for Ivf<Q> {
    fn d(&self) -> usize {
        self.config.dimensionality
    }

    fn ntotal(&self) -> usize {
        self.list_ids.iter().map(|l| l.len()).sum()
    }

    fn is_trained(&self) -> bool {
        self.coarse.is_some() && self.quantizer.is_trained()
    }

    fn metric(&self) -> Metric {
        self.config.metric
    }

    #[instrument(skip(self, x))]
    fn train(&mut self, x: &[f32]) -> Result<(), Box<dyn AnnError>> {
        let n = self.check_dim(x.len())?;
        let d = self.config.dimensionality;
        if self.config.nlist == 0 || self.config.nlist > n {
            return Err(IndexError::InvalidArgument(
                "nlist must be in 1..=training set size".to_string(),
            )
            .boxed());
        }
        let result = kmeans(x, n, d, self.config.nlist, self.config.kmeans_iters, self.config.seed);
        let coarse = CoarseQuantizer {
            centroids: result.centroids,
            d,
            nlist: self.config.nlist,
        };

        let fine_input: Vec<f32> = if self.config.by_residual {
            (0..n)
                .flat_map(|i| {
                    let row = &x[i * d..(i + 1) * d];
                    let centroid = coarse.row(result.assignments[i]);
                    row.iter().zip(centroid).map(|(a, b)| a - b).collect::<Vec<_>>()
                })
                .collect()
        } else {
            x.to_vec()
        };
        self.quantizer.train(&fine_input, n)?;
        self.coarse = Some(coarse);
        Ok(())
    }

    #[instrument(skip(self, x))]
    fn add(&mut self, x: &[f32]) -> Result<(), Box<dyn AnnError>> {
        self.coarse()?;
        if !self.quantizer.is_trained() {
            return Err(IndexError::NotTrained.boxed());
        }
        let n = self.check_dim(x.len())?;
        let d = self.config.dimensionality;
        let coarse = self.coarse.as_ref().unwrap();
        let nbits = self.quantizer.codebooks().nbits().to_vec();

        let assignments = parallel_map(n, 16, |i| coarse.nearest(&x[i * d..(i + 1) * d]));
        let encoded = parallel_map(n, 4, |i| {
            let row = &x[i * d..(i + 1) * d];
            let list = assignments[i];
            if self.config.by_residual {
                let centroid = coarse.row(list);
                let residual: Vec<f32> = row.iter().zip(centroid).map(|(a, b)| a - b).collect();
                self.quantizer.encode_one(&residual)
            } else {
                self.quantizer.encode_one(row)
            }
        });

        for i in 0..n {
            let list = assignments[i];
            self.lists[list].extend(pack_code(&encoded[i], &nbits));
            self.list_ids[list].push(self.next_id);
            self.next_id += 1;
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
        self.coarse()?;
        if !self.quantizer.is_trained() {
            return Err(IndexError::NotTrained.boxed());
        }
        let n = self.check_dim(x.len())?;
        let d = self.config.dimensionality;
        let metric = self.config.metric;
        let sentinel = metric.sentinel_score();
        let coarse = self.coarse.as_ref().unwrap();
        let codebooks = self.quantizer.codebooks();
        let cb_bytes = codebooks.code_bytes();
        let nbits = codebooks.nbits();

        let results = parallel_map(n, 1, |qi| {
            let query = &x[qi * d..(qi + 1) * d];
            let lists = self.probe_lists(query);
            let mut topk = TopK::new(k, metric.direction());
            for &list in &lists {
                let centroid = coarse.row(list);
                let local_query: Vec<f32> = if self.config.by_residual {
                    query.iter().zip(centroid).map(|(a, b)| a - b).collect()
                } else {
                    query.to_vec()
                };
                let q_norm: f32 = local_query.iter().map(|v| v * v).sum();
                let lut = build_lut(codebooks, &local_query);
                let stored = &self.lists[list];
                let n_list = self.list_ids[list].len();
                for row_idx in 0..n_list {
                    let bytes = &stored[row_idx * cb_bytes..(row_idx + 1) * cb_bytes];
                    let codes = unpack_code(bytes, nbits);
                    let dot = score_from_lut(codebooks, &lut, &codes);
                    let score = match metric {
                        Metric::InnerProduct => dot,
                        _ => {
                            let x_hat = aq_decode(codebooks, &codes);
                            let norm: f32 = x_hat.iter().map(|v| v * v).sum();
                            q_norm + norm - 2.0 * dot
                        }
                    };
                    topk.push(self.list_ids[list][row_idx], score);
                }
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

    fn reset(&mut self) {
        for list in &mut self.lists {
            list.clear();
        }
        for ids in &mut self.list_ids {
            ids.clear();
        }
        self.next_id = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_cluster_data() -> Vec<f32> {
        let mut data = Vec::new();
        for i in 0..20 {
            data.push((i % 3) as f32 * 0.01);
            data.push(0.0);
        }
        for i in 0..20 {
            data.push(10.0 + (i % 3) as f32 * 0.01);
            data.push(10.0);
        }
        data
    }

    fn flat_config(nprobe: usize, by_residual: bool) -> IvfConfig {
        IvfConfig {
            dimensionality: 2,
            metric: Metric::L2,
            nlist: 2,
            nprobe,
            by_residual,
            kmeans_iters: 25,
            seed: 1,
        }
    }

    #[test]
    fn nprobe_one_still_finds_exact_nearest_within_its_own_cluster() {
        let data = two_cluster_data();
        let mut idx = IvfFlat::new(flat_config(1, false));
        idx.train(&data).unwrap();
        idx.add(&data).unwrap();

        let mut dist = [0.0f32; 1];
        let mut ids = [0i64; 1];
        idx.search(&[0.0, 0.0], 1, &mut dist, &mut ids).unwrap();
        assert!(ids[0] < 20, "query near the low cluster should match a low-cluster id");
    }

    #[test]
    fn nprobe_equal_to_nlist_matches_exhaustive_search() {
        let data = two_cluster_data();
        let mut idx = IvfFlat::new(flat_config(2, false));
        idx.train(&data).unwrap();
        idx.add(&data).unwrap();

        let mut dist = [0.0f32; 3];
        let mut ids = [0i64; 3];
        idx.search(&[5.0, 5.0], 3, &mut dist, &mut ids).unwrap();
        assert!(dist[0] <= dist[1] && dist[1] <= dist[2]);
    }

    #[test]
    fn by_residual_reconstruct_matches_original_vector() {
        let data = two_cluster_data();
        let mut idx = IvfFlat::new(flat_config(2, true));
        idx.train(&data).unwrap();
        idx.add(&data[0..2]).unwrap();
        let mut out = [0.0f32; 2];
        idx.reconstruct(0, &mut out).unwrap();
        assert!((out[0] - data[0]).abs() < 1e-4);
        assert!((out[1] - data[1]).abs() < 1e-4);
    }

    #[test]
    fn train_rejects_nlist_exceeding_training_set_size() {
        let mut idx = IvfFlat::new(IvfConfig {
            dimensionality: 2,
            metric: Metric::L2,
            nlist: 100,
            nprobe: 1,
            by_residual: false,
            kmeans_iters: 5,
            seed: 1,
        });
        let err = idx.train(&[0.0, 0.0, 1.0, 1.0]).unwrap_err();
        assert_eq!(err.code(), annq_error::ErrorCode::InvalidArgument);
    }

    #[test]
    fn search_before_train_fails_not_trained() {
        let idx = IvfFlat::new(flat_config(1, false));
        let mut dist = [0.0f32; 1];
        let mut ids = [0i64; 1];
        let err = idx.search(&[0.0, 0.0], 1, &mut dist, &mut ids).unwrap_err();
        assert_eq!(err.code(), annq_error::ErrorCode::NotTrained);
    }
}
