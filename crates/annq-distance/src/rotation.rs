//! Random orthonormal rotation, used by LSH and by the additive-quantizer
//! family's optional pre-rotation step.
//!
//! Grounded on the QR-based orthonormal-matrix construction in the pack's
//! product-quantizer reference (`habedi-vq`'s `opq.rs`, which derives a
//! rotation from an SVD of a cross-covariance matrix); here we instead draw
//! a Gaussian matrix and take the `Q` factor of its QR decomposition, which
//! is the standard way to sample a Haar-uniform orthonormal matrix.

use nalgebra::DMatrix;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

/// A `d x d` orthonormal rotation matrix, stored row-major.
#[derive(Clone, Debug)]
pub struct RandomRotation {
    d: usize,
    /// Row-major `d * d` matrix.
    matrix: Vec<f32>,
}

impl RandomRotation {
    /// The `d x d` identity rotation.
    pub fn identity(d: usize) -> Self {
        let mut matrix = vec![0.0; d * d];
        for i in 0..d {
            matrix[i * d + i] = 1.0;
        }
        RandomRotation { d, matrix }
    }

    /// Samples a random orthonormal rotation via QR decomposition of a
    /// Gaussian random matrix, seeded deterministically.
    pub fn sample(d: usize, seed: u64) -> Self {
        if d == 0 {
            return RandomRotation { d, matrix: vec![] };
        }
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let normal = StandardNormal;
        let data: Vec<f64> = (0..d * d).map(|_| normal.sample(&mut rng)).collect();
        let gaussian = DMatrix::<f64>::from_row_slice(d, d, &data);
        let qr = gaussian.qr();
        let q = qr.q();

        // Canonicalize the sign of Q's diagonal so the same seed always
        // yields the same rotation regardless of QR implementation detail.
        let r = qr.r();
        let mut q = q;
        for i in 0..d {
            if r[(i, i)] < 0.0 {
                for row in 0..d {
                    q[(row, i)] = -q[(row, i)];
                }
            }
        }

        let mut row_major = vec![0.0f32; d * d];
        for row in 0..d {
            for col in 0..d {
                row_major[row * d + col] = q[(row, col)] as f32;
            }
        }
        RandomRotation { d, matrix: row_major }
    }

    pub fn dim(&self) -> usize {
        self.d
    }

    /// Applies the rotation to a single vector: `R . x`.
    pub fn apply(&self, x: &[f32]) -> Vec<f32> {
        assert_eq!(x.len(), self.d, "rotation dimensionality mismatch");
        let mut out = vec![0.0f32; self.d];
        for row in 0..self.d {
            let mut sum = 0.0f32;
            let base = row * self.d;
            for col in 0..self.d {
                sum += self.matrix[base + col] * x[col];
            }
            out[row] = sum;
        }
        out
    }

    /// Applies the rotation to each row of a row-major batch of `n` vectors.
    pub fn apply_batch(&self, xs: &[f32], n: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; n * self.d];
        for i in 0..n {
            let row = self.apply(&xs[i * self.d..(i + 1) * self.d]);
            out[i * self.d..(i + 1) * self.d].copy_from_slice(&row);
        }
        out
    }
}
