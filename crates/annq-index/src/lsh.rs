//! Sign-bit LSH index.
//!
//! Packs `sign(R·x - thresholds)` into bytes and ranks candidates by
//! Hamming distance: the same sign-quantize-then-Hamming-rank shape
//! `binary.rs` uses, generalized with an optional learned rotation
//! (`annq_distance::RandomRotation`) and per-dimension median thresholds
//! instead of a fixed center.

use annq_distance::{Direction, Metric, RandomRotation};
use annq_error::AnnError;
use tracing::instrument;

use crate::parallel::parallel_map;
use crate::topk::TopK;
use crate::types::{Index, IndexError, RangeSearchResult};

#[derive(Clone, Debug)]
pub struct LshConfig {
    pub dimensionality: usize,
    pub nbits: usize,
    pub rotate_data: bool,
    pub train_thresholds: bool,
    pub seed: u64,
}

fn code_bytes(nbits: usize) -> usize {
    nbits.div_ceil(8)
}

pub struct LshIndex {
    config: LshConfig,
    rotation: RandomRotation,
    thresholds: Vec<f32>,
    trained: bool,
    codes: Vec<u8>,
    ids: Vec<i64>,
    next_id: i64,
}

impl LshIndex {
    pub fn new(config: LshConfig) -> Self {
        let d = config.dimensionality;
        let rotation = RandomRotation::identity(d);
        let thresholds = vec![0.0; config.nbits];
        LshIndex {
            config,
            rotation,
            thresholds,
            trained: false,
            codes: Vec::new(),
            ids: Vec::new(),
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

    /// `sign(R.x - thresholds)` packed little-endian, bit `j` in byte
    /// `j / 8` at position `j % 8`.
    fn encode(&self, x: &[f32]) -> Vec<u8> {
        let rotated = if self.config.rotate_data {
            self.rotation.apply(x)
        } else {
            x.to_vec()
        };
        let nbits = self.config.nbits;
        let mut code = vec![0u8; code_bytes(nbits)];
        for j in 0..nbits {
            let v = rotated[j] - self.thresholds[j];
            if v >= 0.0 {
                code[j / 8] |= 1 << (j % 8);
            }
        }
        code
    }

    fn hamming(a: &[u8], b: &[u8]) -> u32 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x ^ y).count_ones())
            .sum()
    }
}

impl Index for LshIndex {
    fn d(&self) -> usize {
        self.config.dimensionality
    }

    fn ntotal(&self) -> usize {
        self.ids.len()
    }

    fn is_trained(&self) -> bool {
        self.trained
    }

    fn metric(&self) -> Metric {
        Metric::L1
    }

    #[instrument(skip(self, x))]
    fn train(&mut self, x: &[f32]) -> Result<(), Box<dyn AnnError>> {
        let n = self.check_dim(x.len())?;
        let d = self.config.dimensionality;
        let nbits = self.config.nbits;
        if nbits > d {
            return Err(IndexError::InvalidArgument(
                "nbits must not exceed dimensionality".to_string(),
            )
            .boxed());
        }

        self.rotation = if self.config.rotate_data {
            RandomRotation::sample(d, self.config.seed)
        } else {
            RandomRotation::identity(d)
        };

        let rotated: Vec<f32> = if self.config.rotate_data {
            self.rotation.apply_batch(x, n)
        } else {
            x.to_vec()
        };

        self.thresholds = if self.config.train_thresholds {
            if n == 0 {
                self.trained = false;
                return Err(IndexError::InvalidArgument(
                    "train_thresholds requires a non-empty training batch".to_string(),
                )
                .boxed());
            }
            (0..nbits)
                .map(|j| {
                    let mut column: Vec<f32> = (0..n).map(|i| rotated[i * d + j]).collect();
                    column.sort_by(|a, b| a.total_cmp(b));
                    let mid = column.len() / 2;
                    if column.len() % 2 == 0 {
                        0.5 * (column[mid - 1] + column[mid])
                    } else {
                        column[mid]
                    }
                })
                .collect()
        } else {
            vec![0.0; nbits]
        };

        self.trained = true;
        Ok(())
    }

    fn add(&mut self, x: &[f32]) -> Result<(), Box<dyn AnnError>> {
        if !self.trained {
            return Err(IndexError::NotTrained.boxed());
        }
        let n = self.check_dim(x.len())?;
        let d = self.config.dimensionality;
        for i in 0..n {
            let row = &x[i * d..(i + 1) * d];
            self.codes.extend(self.encode(row));
            self.ids.push(self.next_id);
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
        if !self.trained {
            return Err(IndexError::NotTrained.boxed());
        }
        let n = self.check_dim(x.len())?;
        let d = self.config.dimensionality;
        let cb = code_bytes(self.config.nbits);
        let sentinel = Metric::L1.sentinel_score();

        let results = parallel_map(n, 1, |qi| {
            let query_code = self.encode(&x[qi * d..(qi + 1) * d]);
            let mut topk = TopK::new(k, Direction::Minimize);
            for (row, &id) in self.ids.iter().enumerate() {
                let stored = &self.codes[row * cb..(row + 1) * cb];
                let dist = Self::hamming(&query_code, stored) as f32;
                topk.push(id, dist);
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
        if !self.trained {
            return Err(IndexError::NotTrained.boxed());
        }
        let n = self.check_dim(x.len())?;
        let d = self.config.dimensionality;
        let cb = code_bytes(self.config.nbits);

        let hits = parallel_map(n, 1, |qi| {
            let query_code = self.encode(&x[qi * d..(qi + 1) * d]);
            let mut row_hits = Vec::new();
            for (row, &id) in self.ids.iter().enumerate() {
                let stored = &self.codes[row * cb..(row + 1) * cb];
                let dist = Self::hamming(&query_code, stored) as f32;
                if dist < radius {
                    row_hits.push((id, dist));
                }
            }
            row_hits
        });
        Ok(RangeSearchResult { hits })
    }

    fn reset(&mut self) {
        self.codes.clear();
        self.ids.clear();
        self.next_id = 0;
    }
}

/// Packs a bit-level code into bytes, independent of any index instance.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; bits.len().div_ceil(8)];
    for (j, &bit) in bits.iter().enumerate() {
        if bit {
            bytes[j / 8] |= 1 << (j % 8);
        }
    }
    bytes
}

pub fn unpack_bits(bytes: &[u8], nbits: usize) -> Vec<bool> {
    (0..nbits).map(|j| (bytes[j / 8] >> (j % 8)) & 1 == 1).collect()
}
