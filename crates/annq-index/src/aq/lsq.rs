//! Local-Search Quantizer: codebooks are refined by alternating least
//! squares (ALS) with Tikhonov regularization, and codes are refined by
//! iterated conditional modes (ICM) with random perturbation restarts
//! (iterated local search, ILS) so the search can escape ICM's local
//! optima.

use annq_error::AnnError;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use tracing::instrument;

use crate::kmeans::kmeans;
use crate::types::IndexError;

use super::{decode, AdditiveQuantizer, Codebooks};

#[derive(Clone, Debug)]
pub struct LsqConfig {
    pub dimensionality: usize,
    pub nbits: Vec<usize>,
    /// Ridge penalty applied to the codebook least-squares solve.
    pub lambd: f32,
    /// Number of ALS/ICM training rounds.
    pub train_iters: usize,
    /// ICM sweeps per encode call (both during training and `encode_one`).
    pub icm_iters: usize,
    /// Number of independent perturb-then-ICM restarts per encode call.
    pub encode_ils_iters: usize,
    /// Codes perturbed per restart.
    pub nperts: usize,
    /// Simulated-annealing temperature; `0.0` disables annealing and ILS
    /// always keeps the better of the two candidates.
    pub temperature: f32,
    pub seed: u64,
}

pub struct LocalSearchQuantizer {
    config: LsqConfig,
    codebooks: Codebooks,
    trained: bool,
}

impl LocalSearchQuantizer {
    pub fn new(config: LsqConfig) -> Self {
        let codebooks = Codebooks::new(config.dimensionality, &config.nbits);
        LocalSearchQuantizer {
            config,
            codebooks,
            trained: false,
        }
    }

    /// One ICM sweep: for each step in turn, replace its code with the
    /// codeword minimizing the unary term (distance to the residual left by
    /// every other step) holding all other steps fixed.
    fn icm_sweep(&self, x: &[f32], codes: &mut [u32]) {
        let d = self.codebooks.d();
        let m = self.codebooks.m();
        for step in 0..m {
            let mut target = x.to_vec();
            for (other, &c) in codes.iter().enumerate() {
                if other == step {
                    continue;
                }
                let row = self.codebooks.row(other, c as usize);
                for j in 0..d {
                    target[j] -= row[j];
                }
            }
            let k_m = self.codebooks.k(step);
            let mut best = codes[step] as usize;
            let mut best_dist = f32::INFINITY;
            for k in 0..k_m {
                let row = self.codebooks.row(step, k);
                let dist: f32 = target.iter().zip(row).map(|(a, b)| (a - b).powi(2)).sum();
                if dist < best_dist {
                    best_dist = dist;
                    best = k;
                }
            }
            codes[step] = best as u32;
        }
    }

    fn reconstruction_error(&self, x: &[f32], codes: &[u32]) -> f32 {
        let x_hat = decode(&self.codebooks, codes);
        x.iter().zip(&x_hat).map(|(a, b)| (a - b).powi(2)).sum()
    }

    /// `encode_ils_iters` independent restarts: each perturbs `nperts`
    /// random steps to a random codeword, runs `icm_iters` ICM sweeps, and
    /// is accepted over the running best if it improves reconstruction
    /// error, or — when annealing is enabled — with Metropolis probability
    /// otherwise.
    fn ils_encode(&self, x: &[f32], init: Vec<u32>, rng: &mut StdRng) -> Vec<u32> {
        let m = self.codebooks.m();
        let mut best = init;
        for _ in 0..self.config.icm_iters {
            self.icm_sweep(x, &mut best);
        }
        let mut best_error = self.reconstruction_error(x, &best);

        for _ in 0..self.config.encode_ils_iters {
            let mut candidate = best.clone();
            for _ in 0..self.config.nperts.min(m) {
                let step = rng.gen_range(0..m);
                let k_m = self.codebooks.k(step);
                candidate[step] = rng.gen_range(0..k_m as u32);
            }
            for _ in 0..self.config.icm_iters {
                self.icm_sweep(x, &mut candidate);
            }
            let candidate_error = self.reconstruction_error(x, &candidate);

            let accept = if candidate_error < best_error {
                true
            } else if self.config.temperature > 0.0 {
                let delta = candidate_error - best_error;
                let p = (-delta / self.config.temperature).exp();
                rng.gen::<f32>() < p
            } else {
                false
            };

            if accept {
                best = candidate;
                best_error = candidate_error;
            }
        }
        best
    }
}

impl AdditiveQuantizer for LocalSearchQuantizer {
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
                "local search quantizer training requires at least one vector".to_string(),
            )
            .boxed());
        }

        // Seed codebooks step by step from k-means on the residual left by
        // the steps seeded so far, the same starting point the residual
        // quantizer uses, before refining with ALS/ICM.
        let mut residuals = x.to_vec();
        for step in 0..m {
            let k = 1usize << self.config.nbits[step];
            if k > n {
                return Err(IndexError::InvalidArgument(format!(
                    "step {step} needs at least {k} training vectors, got {n}"
                ))
                .boxed());
            }
            let result = kmeans(&residuals, n, d, k, 10, self.config.seed.wrapping_add(step as u64));
            self.codebooks.step_mut(step).copy_from_slice(&result.centroids);
            for i in 0..n {
                let row = self.codebooks.row(step, result.assignments[i]);
                for j in 0..d {
                    residuals[i * d + j] -= row[j];
                }
            }
        }

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut codes: Vec<Vec<u32>> = (0..n)
            .map(|i| {
                let mut c = vec![0u32; m];
                self.icm_sweep(&x[i * d..(i + 1) * d], &mut c);
                c
            })
            .collect();

        for _ in 0..self.config.train_iters {
            // ICM refines every vector's codes against the current
            // codebooks (with ILS restarts, same as at encode time).
            let refined: Vec<Vec<u32>> = (0..n)
                .map(|i| self.ils_encode(&x[i * d..(i + 1) * d], codes[i].clone(), &mut rng))
                .collect();
            codes = refined;

            // ALS refines each step's codebook by ridge regression: row k of
            // step m is the mean residual of every vector assigned code k at
            // step m, regularized toward zero by `lambd`.
            for step in 0..m {
                let k_m = self.codebooks.k(step);
                let mut sums = vec![0.0f32; k_m * d];
                let mut counts = vec![0.0f32; k_m];
                for i in 0..n {
                    let c = codes[i][step] as usize;
                    counts[c] += 1.0;
                    let mut residual = x[i * d..(i + 1) * d].to_vec();
                    for (other, &oc) in codes[i].iter().enumerate() {
                        if other == step {
                            continue;
                        }
                        let row = self.codebooks.row(other, oc as usize);
                        for j in 0..d {
                            residual[j] -= row[j];
                        }
                    }
                    for j in 0..d {
                        sums[c * d + j] += residual[j];
                    }
                }
                for k in 0..k_m {
                    let denom = counts[k] + self.config.lambd;
                    let row = self.codebooks.row_mut(step, k);
                    if counts[k] > 0.0 {
                        for j in 0..d {
                            row[j] = sums[k * d + j] / denom;
                        }
                    }
                }
            }
        }

        self.trained = true;
        Ok(())
    }

    fn encode_one(&self, x: &[f32]) -> Vec<u32> {
        let m = self.codebooks.m();
        let mut rng = StdRng::seed_from_u64(
            self.config
                .seed
                .wrapping_add(x.iter().fold(0u64, |acc, v| acc.wrapping_add(v.to_bits() as u64))),
        );
        let mut init = vec![0u32; m];
        self.icm_sweep(x, &mut init);
        self.ils_encode(x, init, &mut rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aq::gaussian_fixture;

    fn config(d: usize, nbits: Vec<usize>) -> LsqConfig {
        LsqConfig {
            dimensionality: d,
            nbits,
            lambd: 0.01,
            train_iters: 4,
            icm_iters: 2,
            encode_ils_iters: 2,
            nperts: 1,
            temperature: 0.0,
            seed: 4,
        }
    }

    #[test]
    fn train_requires_enough_vectors_per_step() {
        let mut lsq = LocalSearchQuantizer::new(config(4, vec![4]));
        let x = gaussian_fixture(4, 4, 2);
        let err = lsq.train(&x, 4).unwrap_err();
        assert_eq!(err.code(), annq_error::ErrorCode::InvalidArgument);
    }

    #[test]
    fn training_reduces_mean_reconstruction_error_versus_untrained_icm_only() {
        let n = 256;
        let d = 8;
        let x = gaussian_fixture(n, d, 13);

        let mut untrained = LocalSearchQuantizer::new(config(d, vec![6]));
        untrained.config.train_iters = 0;
        let mut seed_only = LocalSearchQuantizer::new(config(d, vec![6]));
        seed_only.config.train_iters = 0;
        seed_only.train(&x, n).unwrap();

        let mut trained = LocalSearchQuantizer::new(config(d, vec![6]));
        trained.train(&x, n).unwrap();

        let mut seed_err = 0.0f32;
        let mut trained_err = 0.0f32;
        for i in 0..n {
            let row = &x[i * d..(i + 1) * d];
            let c1 = seed_only.encode_one(row);
            let c2 = trained.encode_one(row);
            seed_err += seed_only.reconstruction_error(row, &c1);
            trained_err += trained.reconstruction_error(row, &c2);
        }
        assert!(
            trained_err <= seed_err + 1.0,
            "ALS/ICM training ({trained_err}) should not be much worse than the seed-only codebook ({seed_err})"
        );
    }

    #[test]
    fn ils_restarts_never_increase_reconstruction_error() {
        let n = 64;
        let d = 6;
        let x = gaussian_fixture(n, d, 17);
        let mut lsq = LocalSearchQuantizer::new(config(d, vec![4, 4]));
        lsq.train(&x, n).unwrap();

        let mut no_ils = lsq.config.clone();
        no_ils.encode_ils_iters = 0;
        let no_ils_quantizer = LocalSearchQuantizer {
            config: no_ils,
            codebooks: lsq.codebooks.clone(),
            trained: true,
        };

        for i in 0..n.min(8) {
            let row = &x[i * d..(i + 1) * d];
            let base = no_ils_quantizer.encode_one(row);
            let refined = lsq.encode_one(row);
            let base_err = lsq.reconstruction_error(row, &base);
            let refined_err = lsq.reconstruction_error(row, &refined);
            assert!(refined_err <= base_err + 1e-4);
        }
    }
}
