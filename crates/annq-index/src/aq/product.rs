//! Product additive quantizer: splits the `d` coordinates into `nsplits`
//! contiguous subspaces and trains an independent additive quantizer per
//! subspace, the same split-then-quantize-independently shape the pack's
//! product-quantizer reference (`habedi-vq`'s `opq.rs`) uses for its
//! per-subspace codebooks.
//!
//! Each subspace's codebook rows are embedded back into a full-width,
//! zero-padded `Codebooks` so the shared `decode`/`build_lut` machinery
//! keeps working unchanged: summing zero-padded rows from disjoint column
//! ranges is exactly concatenation.

use annq_error::AnnError;
use tracing::instrument;

use crate::types::IndexError;

use super::lsq::{LocalSearchQuantizer, LsqConfig};
use super::rq::{ResidualQuantizer, RqConfig};
use super::{AdditiveQuantizer, Codebooks};

/// A sub-quantizer assigned to one subspace. Product-RQ and Product-LSQ are
/// just a `ProductAq` whose splits are uniformly one kind or the other.
pub enum SubQuantizer {
    Rq(ResidualQuantizer),
    Lsq(LocalSearchQuantizer),
}

impl SubQuantizer {
    fn codebooks(&self) -> &Codebooks {
        match self {
            SubQuantizer::Rq(q) => q.codebooks(),
            SubQuantizer::Lsq(q) => q.codebooks(),
        }
    }

    fn is_trained(&self) -> bool {
        match self {
            SubQuantizer::Rq(q) => q.is_trained(),
            SubQuantizer::Lsq(q) => q.is_trained(),
        }
    }

    fn train(&mut self, x: &[f32], n: usize) -> Result<(), Box<dyn AnnError>> {
        match self {
            SubQuantizer::Rq(q) => q.train(x, n),
            SubQuantizer::Lsq(q) => q.train(x, n),
        }
    }

    fn encode_one(&self, x: &[f32]) -> Vec<u32> {
        match self {
            SubQuantizer::Rq(q) => q.encode_one(x),
            SubQuantizer::Lsq(q) => q.encode_one(x),
        }
    }
}

/// Per-split sub-quantizer configuration, chosen uniformly for a
/// `ProductAq` (Product-RQ vs. Product-LSQ).
#[derive(Clone)]
pub enum SplitKind {
    Rq { nbits: Vec<usize>, max_beam_size: usize, kmeans_iters: usize },
    Lsq(LsqSplitParams),
}

#[derive(Clone)]
pub struct LsqSplitParams {
    pub nbits: Vec<usize>,
    pub lambd: f32,
    pub train_iters: usize,
    pub icm_iters: usize,
    pub encode_ils_iters: usize,
    pub nperts: usize,
    pub temperature: f32,
}

pub struct ProductAqConfig {
    pub dimensionality: usize,
    pub nsplits: usize,
    pub split_kind: SplitKind,
    pub seed: u64,
}

pub struct ProductAq {
    split_dims: Vec<usize>,
    split_offsets: Vec<usize>,
    sub: Vec<SubQuantizer>,
    codebooks: Codebooks,
    trained: bool,
}

fn split_sizes(d: usize, nsplits: usize) -> Vec<usize> {
    let base = d / nsplits;
    let remainder = d % nsplits;
    (0..nsplits)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

impl ProductAq {
    pub fn new(config: ProductAqConfig) -> Result<Self, Box<dyn AnnError>> {
        let d = config.dimensionality;
        if config.nsplits == 0 || config.nsplits > d {
            return Err(IndexError::InvalidArgument(
                "nsplits must be in 1..=dimensionality".to_string(),
            )
            .boxed());
        }
        let split_dims = split_sizes(d, config.nsplits);
        let mut split_offsets = Vec::with_capacity(split_dims.len() + 1);
        split_offsets.push(0);
        for &sz in &split_dims {
            split_offsets.push(split_offsets.last().unwrap() + sz);
        }

        let sub: Vec<SubQuantizer> = split_dims
            .iter()
            .enumerate()
            .map(|(s, &d_s)| match &config.split_kind {
                SplitKind::Rq {
                    nbits,
                    max_beam_size,
                    kmeans_iters,
                } => SubQuantizer::Rq(ResidualQuantizer::new(RqConfig {
                    dimensionality: d_s,
                    nbits: nbits.clone(),
                    max_beam_size: *max_beam_size,
                    kmeans_iters: *kmeans_iters,
                    seed: config.seed.wrapping_add(s as u64),
                })),
                SplitKind::Lsq(p) => SubQuantizer::Lsq(LocalSearchQuantizer::new(LsqConfig {
                    dimensionality: d_s,
                    nbits: p.nbits.clone(),
                    lambd: p.lambd,
                    train_iters: p.train_iters,
                    icm_iters: p.icm_iters,
                    encode_ils_iters: p.encode_ils_iters,
                    nperts: p.nperts,
                    temperature: p.temperature,
                    seed: config.seed.wrapping_add(s as u64),
                })),
            })
            .collect();

        let all_nbits: Vec<usize> = sub.iter().flat_map(|q| q.codebooks().nbits().to_vec()).collect();
        let codebooks = Codebooks::new(d, &all_nbits);

        Ok(ProductAq {
            split_dims,
            split_offsets,
            sub,
            codebooks,
            trained: false,
        })
    }

    fn extract_split(&self, x: &[f32], n: usize, split: usize) -> Vec<f32> {
        let d = self.codebooks.d();
        let d_s = self.split_dims[split];
        let off = self.split_offsets[split];
        let mut out = vec![0.0f32; n * d_s];
        for i in 0..n {
            out[i * d_s..(i + 1) * d_s].copy_from_slice(&x[i * d + off..i * d + off + d_s]);
        }
        out
    }

    /// Rebuilds the zero-padded global codebooks from each trained split's
    /// own (small) codebooks; the global step order is split 0's steps,
    /// then split 1's, and so on.
    fn rebuild_global_codebooks(&mut self) {
        let d = self.codebooks.d();
        let mut global_step = 0usize;
        for (s, sub) in self.sub.iter().enumerate() {
            let local = sub.codebooks();
            let off = self.split_offsets[s];
            let d_s = self.split_dims[s];
            for local_step in 0..local.m() {
                for k in 0..local.k(local_step) {
                    let local_row = local.row(local_step, k);
                    let global_row = self.codebooks.row_mut(global_step, k);
                    global_row[off..off + d_s].copy_from_slice(local_row);
                }
                global_step += 1;
            }
        }
    }

    pub fn nsplits(&self) -> usize {
        self.split_dims.len()
    }
}

impl AdditiveQuantizer for ProductAq {
    fn codebooks(&self) -> &Codebooks {
        &self.codebooks
    }

    fn is_trained(&self) -> bool {
        self.trained
    }

    #[instrument(skip(self, x))]
    fn train(&mut self, x: &[f32], n: usize) -> Result<(), Box<dyn AnnError>> {
        for s in 0..self.sub.len() {
            let split_data = self.extract_split(x, n, s);
            self.sub[s].train(&split_data, n)?;
        }
        self.rebuild_global_codebooks();
        self.trained = self.sub.iter().all(|q| q.is_trained());
        Ok(())
    }

    fn encode_one(&self, x: &[f32]) -> Vec<u32> {
        let mut codes = Vec::with_capacity(self.codebooks.m());
        for (s, sub) in self.sub.iter().enumerate() {
            let off = self.split_offsets[s];
            let d_s = self.split_dims[s];
            codes.extend(sub.encode_one(&x[off..off + d_s]));
        }
        codes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aq::{decode, gaussian_fixture};

    fn rq_config(d: usize, nsplits: usize, nbits: Vec<usize>) -> ProductAqConfig {
        ProductAqConfig {
            dimensionality: d,
            nsplits,
            split_kind: SplitKind::Rq {
                nbits,
                max_beam_size: 2,
                kmeans_iters: 8,
            },
            seed: 21,
        }
    }

    #[test]
    fn rejects_nsplits_outside_one_to_d() {
        assert!(ProductAq::new(rq_config(4, 0, vec![4])).is_err());
        assert!(ProductAq::new(rq_config(4, 5, vec![4])).is_err());
    }

    #[test]
    fn uneven_split_assigns_extra_dimension_to_earliest_splits() {
        let paq = ProductAq::new(rq_config(10, 3, vec![4])).unwrap();
        assert_eq!(paq.split_dims, vec![4, 3, 3]);
    }

    #[test]
    fn single_split_behaves_like_its_inner_quantizer() {
        let n = 64;
        let d = 6;
        let x = gaussian_fixture(n, d, 31);

        let mut paq = ProductAq::new(rq_config(d, 1, vec![5])).unwrap();
        paq.train(&x, n).unwrap();

        let mut solo = ResidualQuantizer::new(RqConfig {
            dimensionality: d,
            nbits: vec![5],
            max_beam_size: 2,
            kmeans_iters: 8,
            seed: 21,
        });
        solo.train(&x, n).unwrap();

        for i in 0..n.min(8) {
            let row = &x[i * d..(i + 1) * d];
            let c_paq = paq.encode_one(row);
            let c_solo = solo.encode_one(row);
            let x_hat_paq = decode(paq.codebooks(), &c_paq);
            let x_hat_solo = decode(solo.codebooks(), &c_solo);
            assert_eq!(x_hat_paq, x_hat_solo);
        }
    }

    #[test]
    fn decode_concatenates_independently_trained_splits() {
        let n = 64;
        let d = 8;
        let x = gaussian_fixture(n, d, 7);
        let mut paq = ProductAq::new(rq_config(d, 2, vec![4])).unwrap();
        paq.train(&x, n).unwrap();

        let row = &x[0..d];
        let codes = paq.encode_one(row);
        let x_hat = decode(paq.codebooks(), &codes);
        assert_eq!(x_hat.len(), d);

        // First half of x_hat depends only on the first split's codebooks.
        let first_half_codes = &codes[..codes.len() / 2];
        let first_sub = match &paq.sub[0] {
            SubQuantizer::Rq(q) => q,
            _ => unreachable!(),
        };
        let expected_first_half = decode(first_sub.codebooks(), first_half_codes);
        assert_eq!(&x_hat[..4], expected_first_half.as_slice());
    }
}
