//! Residual Quantizer: each step's codebook is trained by k-means on the
//! residual left by the previous steps, and a vector is re-encoded against
//! every trained step with beam search so earlier steps can correct for
//! codewords chosen by later ones.

use annq_error::AnnError;
use tracing::instrument;

use crate::kmeans::kmeans;
use crate::parallel::parallel_map;
use crate::types::IndexError;

use super::{AdditiveQuantizer, Codebooks};

#[derive(Clone, Debug)]
pub struct RqConfig {
    pub dimensionality: usize,
    pub nbits: Vec<usize>,
    /// Beam width used both while training (to pick each step's residual
    /// population) and while re-encoding trained vectors.
    pub max_beam_size: usize,
    pub kmeans_iters: usize,
    pub seed: u64,
}

pub struct ResidualQuantizer {
    config: RqConfig,
    codebooks: Codebooks,
    trained: bool,
}

/// One beam candidate: the running code prefix, its residual, and its
/// accumulated squared error.
#[derive(Clone)]
struct Candidate {
    codes: Vec<u32>,
    residual: Vec<f32>,
    error: f32,
}

impl ResidualQuantizer {
    pub fn new(config: RqConfig) -> Self {
        let codebooks = Codebooks::new(config.dimensionality, &config.nbits);
        ResidualQuantizer {
            config,
            codebooks,
            trained: false,
        }
    }

    fn beam_search(&self, x: &[f32], beam_size: usize, steps: usize) -> Vec<Candidate> {
        let d = self.config.dimensionality;
        let mut beam = vec![Candidate {
            codes: Vec::new(),
            residual: x.to_vec(),
            error: x.iter().map(|v| v * v).sum(),
        }];

        for m in 0..steps {
            let k_m = self.codebooks.k(m);
            let mut expanded: Vec<Candidate> = Vec::with_capacity(beam.len() * k_m);
            for cand in &beam {
                for k in 0..k_m {
                    let row = self.codebooks.row(m, k);
                    let mut residual = vec![0.0f32; d];
                    let mut error = 0.0f32;
                    for j in 0..d {
                        let r = cand.residual[j] - row[j];
                        residual[j] = r;
                        error += r * r;
                    }
                    let mut codes = cand.codes.clone();
                    codes.push(k as u32);
                    expanded.push(Candidate {
                        codes,
                        residual,
                        error,
                    });
                }
            }
            expanded.sort_by(|a, b| a.error.total_cmp(&b.error));
            expanded.truncate(beam_size);
            beam = expanded;
        }
        beam
    }
}

impl AdditiveQuantizer for ResidualQuantizer {
    fn codebooks(&self) -> &Codebooks {
        &self.codebooks
    }

    fn is_trained(&self) -> bool {
        self.trained
    }

    #[instrument(skip(self, x))]
    fn train(&mut self, x: &[f32], n: usize) -> Result<(), Box<dyn AnnError>> {
        let d = self.config.dimensionality;
        let m = self.config.nbits.len();
        if n == 0 {
            return Err(IndexError::InvalidArgument(
                "residual quantizer training requires at least one vector".to_string(),
            )
            .boxed());
        }
        for (step, &bits) in self.config.nbits.iter().enumerate() {
            let k = 1usize << bits;
            if k > n {
                return Err(IndexError::InvalidArgument(format!(
                    "step {step} needs at least {k} training vectors, got {n}"
                ))
                .boxed());
            }
        }

        // Each step is trained on the beam-search residual population left
        // by the steps already trained, keeping only the single best beam
        // per input vector to bound training cost.
        let mut residuals = x.to_vec();
        for step in 0..m {
            let result = kmeans(
                &residuals,
                n,
                d,
                1usize << self.config.nbits[step],
                self.config.kmeans_iters,
                self.config.seed.wrapping_add(step as u64),
            );
            self.codebooks
                .step_mut(step)
                .copy_from_slice(&result.centroids);

            let k_m = self.codebooks.k(step);
            let updated = parallel_map(n, 16, |i| {
                let point = &residuals[i * d..(i + 1) * d];
                let mut best = 0usize;
                let mut best_dist = f32::INFINITY;
                for k in 0..k_m {
                    let row = self.codebooks.row(step, k);
                    let dist: f32 = point
                        .iter()
                        .zip(row)
                        .map(|(a, b)| (a - b).powi(2))
                        .sum();
                    if dist < best_dist {
                        best_dist = dist;
                        best = k;
                    }
                }
                let row = self.codebooks.row(step, best);
                point.iter().zip(row).map(|(a, b)| a - b).collect::<Vec<f32>>()
            });
            for i in 0..n {
                residuals[i * d..(i + 1) * d].copy_from_slice(&updated[i]);
            }
        }

        self.trained = true;
        Ok(())
    }

    fn encode_one(&self, x: &[f32]) -> Vec<u32> {
        let beam_size = self.config.max_beam_size.max(1);
        let steps = self.codebooks.m();
        let beam = self.beam_search(x, beam_size, steps);
        beam.into_iter().next().expect("beam search always produces a candidate").codes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aq::{gaussian_fixture, AqIndex, SearchType};
    use crate::types::{Index, IndexConfig};
    use annq_distance::Metric;

    fn config(d: usize, nbits: Vec<usize>) -> RqConfig {
        RqConfig {
            dimensionality: d,
            nbits,
            max_beam_size: 4,
            kmeans_iters: 10,
            seed: 3,
        }
    }

    #[test]
    fn train_requires_enough_vectors_per_step() {
        let mut rq = ResidualQuantizer::new(config(4, vec![4]));
        let x = gaussian_fixture(4, 4, 1);
        let err = rq.train(&x, 4).unwrap_err();
        assert_eq!(err.code(), annq_error::ErrorCode::InvalidArgument);
    }

    #[test]
    fn additional_steps_reduce_reconstruction_error() {
        let n = 256;
        let d = 8;
        let x = gaussian_fixture(n, d, 11);

        let mut rq1 = ResidualQuantizer::new(config(d, vec![6]));
        rq1.train(&x, n).unwrap();
        let mut rq2 = ResidualQuantizer::new(config(d, vec![6, 6]));
        rq2.train(&x, n).unwrap();

        let mut err1 = 0.0f32;
        let mut err2 = 0.0f32;
        for i in 0..n {
            let row = &x[i * d..(i + 1) * d];
            let c1 = rq1.encode_one(row);
            let c2 = rq2.encode_one(row);
            let r1 = rq1.decode_one(&c1);
            let r2 = rq2.decode_one(&c2);
            err1 += row.iter().zip(&r1).map(|(a, b)| (a - b).powi(2)).sum::<f32>();
            err2 += row.iter().zip(&r2).map(|(a, b)| (a - b).powi(2)).sum::<f32>();
        }
        assert!(err2 < err1, "two-step error {err2} should beat one-step error {err1}");
    }

    #[test]
    fn wider_beam_never_increases_encoding_error() {
        let n = 64;
        let d = 6;
        let x = gaussian_fixture(n, d, 5);
        let mut narrow = ResidualQuantizer::new(config(d, vec![4, 4]));
        narrow.config.max_beam_size = 1;
        narrow.train(&x, n).unwrap();
        let mut wide = ResidualQuantizer::new(config(d, vec![4, 4]));
        wide.config.max_beam_size = 8;
        wide.codebooks = narrow.codebooks.clone();
        wide.trained = true;

        for i in 0..n {
            let row = &x[i * d..(i + 1) * d];
            let narrow_err = {
                let c = narrow.encode_one(row);
                let r = narrow.decode_one(&c);
                row.iter().zip(&r).map(|(a, b)| (a - b).powi(2)).sum::<f32>()
            };
            let wide_err = {
                let c = wide.encode_one(row);
                let r = wide.decode_one(&c);
                row.iter().zip(&r).map(|(a, b)| (a - b).powi(2)).sum::<f32>()
            };
            assert!(wide_err <= narrow_err + 1e-4);
        }
    }

    #[test]
    fn standalone_aq_index_round_trips_through_search() {
        let n = 128;
        let d = 4;
        let x = gaussian_fixture(n, d, 9);
        let mut rq = ResidualQuantizer::new(config(d, vec![5, 5]));
        rq.train(&x, n).unwrap();

        let mut idx = AqIndex::new(IndexConfig::new(d, Metric::L2), rq, SearchType::NormFloat, 9);
        idx.train(&x).unwrap();
        idx.add(&x).unwrap();
        assert_eq!(idx.ntotal(), n);

        let query = &x[0..d];
        let mut dist = [0.0f32; 1];
        let mut ids = [0i64; 1];
        idx.search(query, 1, &mut dist, &mut ids).unwrap();
        assert!(dist[0] >= 0.0);
    }
}
