//! Additive Quantizer base contract: represents a vector as a sum of `M`
//! codebook entries, `x̂ = Σ_m C_m[c_m]`.
//!
//! `Codebooks` flattens every per-step matrix into one contiguous buffer
//! with an offset table, so the LUT kernel becomes a single scan over a
//! concatenated table rather than `M` separate lookups into `M` separate
//! allocations. The bit-field packing (`pack_code`/`unpack_code`) follows
//! a concatenated, most-significant-bit-first layout.
//!
//! `RQ` (`rq.rs`), `LSQ` (`lsq.rs`), and `ProductAq` (`product.rs`) each
//! implement `AdditiveQuantizer`, differing only in how they train
//! codebooks and encode; decode, LUT construction, and norm storage are
//! shared here.
pub mod lsq;
pub mod product;
pub mod rq;

use annq_distance::Metric;
use annq_error::AnnError;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::kmeans::kmeans;
use crate::parallel::parallel_map;
use crate::topk::TopK;
use crate::types::{Index, IndexConfig, IndexError, RangeSearchResult};

/// How the reconstruction norm `||x̂||²` is made available at search time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchType {
    /// Recompute `||x̂||²` by fully decoding the code every time.
    Decompress,
    /// Skip the norm term entirely (only sound for `InnerProduct`).
    LutNonorm,
    /// Store the exact norm as `f32`.
    NormFloat,
    /// Store the norm uniformly quantized to 8 bits over the training range.
    NormQint8,
    /// Store the norm uniformly quantized to 4 bits over the training range.
    NormQint4,
    /// Store the norm as an index into a small (256-entry) 1-D codebook
    /// trained on the scalar norm values themselves.
    NormCq,
}

/// Per-codebook matrices flattened into one buffer, with an offset table
/// `[0, K_0, K_0+K_1, ...]` in units of rows (each row is `d` floats).
#[derive(Clone, Debug)]
pub struct Codebooks {
    d: usize,
    nbits: Vec<usize>,
    /// Row offsets, length `m + 1`.
    offsets: Vec<usize>,
    /// Row-major, `offsets[m] total_rows * d` floats.
    data: Vec<f32>,
}

impl Codebooks {
    pub fn new(d: usize, nbits: &[usize]) -> Self {
        let mut offsets = Vec::with_capacity(nbits.len() + 1);
        offsets.push(0);
        for &b in nbits {
            let k = 1usize << b;
            offsets.push(offsets.last().unwrap() + k);
        }
        let total_rows = *offsets.last().unwrap();
        Codebooks {
            d,
            nbits: nbits.to_vec(),
            offsets,
            data: vec![0.0; total_rows * d],
        }
    }

    pub fn d(&self) -> usize {
        self.d
    }

    pub fn m(&self) -> usize {
        self.nbits.len()
    }

    pub fn nbits(&self) -> &[usize] {
        &self.nbits
    }

    pub fn k(&self, m: usize) -> usize {
        1usize << self.nbits[m]
    }

    pub fn code_bits(&self) -> usize {
        self.nbits.iter().sum()
    }

    pub fn code_bytes(&self) -> usize {
        self.code_bits().div_ceil(8)
    }

    /// The `K_m * d` rows of codebook `m`.
    pub fn step(&self, m: usize) -> &[f32] {
        let lo = self.offsets[m] * self.d;
        let hi = self.offsets[m + 1] * self.d;
        &self.data[lo..hi]
    }

    pub fn step_mut(&mut self, m: usize) -> &mut [f32] {
        let lo = self.offsets[m] * self.d;
        let hi = self.offsets[m + 1] * self.d;
        &mut self.data[lo..hi]
    }

    /// Row `k` (a `d`-vector) of codebook `m`.
    pub fn row(&self, m: usize, k: usize) -> &[f32] {
        let d = self.d;
        &self.step(m)[k * d..(k + 1) * d]
    }

    pub fn row_mut(&mut self, m: usize, k: usize) -> &mut [f32] {
        let d = self.d;
        &mut self.step_mut(m)[k * d..(k + 1) * d]
    }

    pub fn total_rows(&self) -> usize {
        *self.offsets.last().unwrap()
    }

    pub fn offset(&self, m: usize) -> usize {
        self.offsets[m]
    }
}

/// Reconstructs `x̂ = Σ_m C_m[c_m]`.
pub fn decode(codebooks: &Codebooks, codes: &[u32]) -> Vec<f32> {
    let d = codebooks.d();
    let mut out = vec![0.0f32; d];
    for (m, &c) in codes.iter().enumerate() {
        let row = codebooks.row(m, c as usize);
        for j in 0..d {
            out[j] += row[j];
        }
    }
    out
}

/// Builds the LUT `L_m[k] = ⟨q, C_m[k]⟩` for every step, flattened using
/// the same offset table as `Codebooks`, so `⟨q, x̂⟩ = Σ_m lut[offset(m) +
/// c_m]`.
pub fn build_lut(codebooks: &Codebooks, query: &[f32]) -> Vec<f32> {
    let d = codebooks.d();
    let total = codebooks.total_rows();
    let mut lut = vec![0.0f32; total];
    for m in 0..codebooks.m() {
        let base = codebooks.offset(m);
        let k_m = codebooks.k(m);
        for k in 0..k_m {
            let row = codebooks.row(m, k);
            let mut sum = 0.0f32;
            for j in 0..d {
                sum += query[j] * row[j];
            }
            lut[base + k] = sum;
        }
    }
    lut
}

/// `⟨q, x̂⟩` from a LUT built by `build_lut` and a code tuple.
pub fn score_from_lut(codebooks: &Codebooks, lut: &[f32], codes: &[u32]) -> f32 {
    let mut sum = 0.0f32;
    for (m, &c) in codes.iter().enumerate() {
        sum += lut[codebooks.offset(m) + c as usize];
    }
    sum
}

/// Packs a code tuple into bytes: fields concatenated MSB-first, widths per
/// `nbits[m]`.
pub fn pack_code(codes: &[u32], nbits: &[usize]) -> Vec<u8> {
    let total_bits: usize = nbits.iter().sum();
    let mut bytes = vec![0u8; total_bits.div_ceil(8)];
    let mut bit_pos = 0usize;
    for (&code, &width) in codes.iter().zip(nbits) {
        for b in (0..width).rev() {
            let bit = (code >> b) & 1;
            if bit == 1 {
                let byte_idx = bit_pos / 8;
                let bit_in_byte = 7 - (bit_pos % 8);
                bytes[byte_idx] |= 1 << bit_in_byte;
            }
            bit_pos += 1;
        }
    }
    bytes
}

pub fn unpack_code(bytes: &[u8], nbits: &[usize]) -> Vec<u32> {
    let mut bit_pos = 0usize;
    let mut codes = Vec::with_capacity(nbits.len());
    for &width in nbits {
        let mut code = 0u32;
        for _ in 0..width {
            let byte_idx = bit_pos / 8;
            let bit_in_byte = 7 - (bit_pos % 8);
            let bit = (bytes[byte_idx] >> bit_in_byte) & 1;
            code = (code << 1) | bit as u32;
            bit_pos += 1;
        }
        codes.push(code);
    }
    codes
}

/// How reconstruction norms are stored, per `SearchType`.
#[derive(Clone, Debug)]
pub enum StoredNorms {
    /// No norm stored; recomputed by decoding, or not needed.
    None,
    Float(Vec<f32>),
    QInt8 {
        codes: Vec<u8>,
        min: f32,
        scale: f32,
    },
    /// Two 4-bit values packed per byte.
    QInt4 {
        codes: Vec<u8>,
        min: f32,
        scale: f32,
    },
    CodebookQuantized {
        assignments: Vec<u8>,
        centroids: Vec<f32>,
    },
}

impl StoredNorms {
    pub fn build(search_type: SearchType, norms: &[f32], seed: u64) -> Self {
        match search_type {
            SearchType::Decompress | SearchType::LutNonorm => StoredNorms::None,
            SearchType::NormFloat => StoredNorms::Float(norms.to_vec()),
            SearchType::NormQint8 => {
                let (min, scale) = Self::range(norms, 255.0);
                let codes = norms
                    .iter()
                    .map(|&n| (((n - min) / scale).round().clamp(0.0, 255.0)) as u8)
                    .collect();
                StoredNorms::QInt8 { codes, min, scale }
            }
            SearchType::NormQint4 => {
                let (min, scale) = Self::range(norms, 15.0);
                let quantized: Vec<u8> = norms
                    .iter()
                    .map(|&n| (((n - min) / scale).round().clamp(0.0, 15.0)) as u8)
                    .collect();
                let mut packed = vec![0u8; norms.len().div_ceil(2)];
                for (i, &q) in quantized.iter().enumerate() {
                    if i % 2 == 0 {
                        packed[i / 2] |= q;
                    } else {
                        packed[i / 2] |= q << 4;
                    }
                }
                StoredNorms::QInt4 {
                    codes: packed,
                    min,
                    scale,
                }
            }
            SearchType::NormCq => {
                if norms.is_empty() {
                    return StoredNorms::CodebookQuantized {
                        assignments: Vec::new(),
                        centroids: Vec::new(),
                    };
                }
                let k = norms.len().min(256);
                let data: Vec<f32> = norms.to_vec();
                let result = kmeans(&data, norms.len(), 1, k, 25, seed);
                StoredNorms::CodebookQuantized {
                    assignments: result.assignments.iter().map(|&a| a as u8).collect(),
                    centroids: result.centroids,
                }
            }
        }
    }

    fn range(norms: &[f32], max_level: f32) -> (f32, f32) {
        let min = norms.iter().copied().fold(f32::INFINITY, f32::min);
        let max = norms.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let span = (max - min).max(f32::EPSILON);
        (min, span / max_level)
    }

    pub fn get(&self, i: usize) -> Option<f32> {
        match self {
            StoredNorms::None => None,
            StoredNorms::Float(v) => Some(v[i]),
            StoredNorms::QInt8 { codes, min, scale } => Some(min + codes[i] as f32 * scale),
            StoredNorms::QInt4 { codes, min, scale } => {
                let byte = codes[i / 2];
                let nibble = if i % 2 == 0 { byte & 0x0F } else { byte >> 4 };
                Some(min + nibble as f32 * scale)
            }
            StoredNorms::CodebookQuantized {
                assignments,
                centroids,
            } => Some(centroids[assignments[i] as usize]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            StoredNorms::None => 0,
            StoredNorms::Float(v) => v.len(),
            StoredNorms::QInt8 { codes, .. } => codes.len(),
            StoredNorms::QInt4 { codes, .. } => codes.len() * 2,
            StoredNorms::CodebookQuantized { assignments, .. } => assignments.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared contract for the additive-quantizer family.
pub trait AdditiveQuantizer: Send + Sync {
    fn codebooks(&self) -> &Codebooks;
    fn is_trained(&self) -> bool;

    /// Consumes `n` training vectors (row-major, `n * d` floats).
    fn train(&mut self, x: &[f32], n: usize) -> Result<(), Box<dyn AnnError>>;

    /// Returns the code tuple minimizing `||x - Σ C_m[c_m]||²` under this
    /// implementation's chosen optimization strategy.
    fn encode_one(&self, x: &[f32]) -> Vec<u32>;

    fn decode_one(&self, codes: &[u32]) -> Vec<f32> {
        decode(self.codebooks(), codes)
    }

    fn d(&self) -> usize {
        self.codebooks().d()
    }
}

/// A standalone `Index` over any `AdditiveQuantizer`: every vector is
/// stored purely as its packed code plus (depending on `SearchType`) a
/// reconstruction norm, and search scores candidates through the AQ's LUT.
pub struct AqIndex<Q: AdditiveQuantizer> {
    config: IndexConfig,
    quantizer: Q,
    search_type: SearchType,
    codes: Vec<u8>,
    ids: Vec<i64>,
    norms: StoredNorms,
    seed: u64,
    next_id: i64,
}

impl<Q: AdditiveQuantizer> AqIndex<Q> {
    pub fn new(config: IndexConfig, quantizer: Q, search_type: SearchType, seed: u64) -> Self {
        AqIndex {
            config,
            quantizer,
            search_type,
            codes: Vec::new(),
            ids: Vec::new(),
            norms: StoredNorms::None,
            seed,
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

    fn code_at(&self, row: usize) -> Vec<u32> {
        let cb = self.quantizer.codebooks().code_bytes();
        unpack_code(
            &self.codes[row * cb..(row + 1) * cb],
            self.quantizer.codebooks().nbits(),
        )
    }

    fn squared_norm(&self, row: usize, codes: &[u32]) -> f32 {
        match self.norms.get(row) {
            Some(n) => n,
            None => {
                let x_hat = decode(self.quantizer.codebooks(), codes);
                x_hat.iter().map(|v| v * v).sum()
            }
        }
    }

    pub fn quantizer(&self) -> &Q {
        &self.quantizer
    }
}

impl<Q: AdditiveQuantizer> Index for AqIndex<Q> {
    fn d(&self) -> usize {
        self.config.dimensionality
    }

    fn ntotal(&self) -> usize {
        self.ids.len()
    }

    fn is_trained(&self) -> bool {
        self.quantizer.is_trained()
    }

    fn metric(&self) -> Metric {
        self.config.metric
    }

    #[instrument(skip(self, x))]
    fn train(&mut self, x: &[f32]) -> Result<(), Box<dyn AnnError>> {
        let n = self.check_dim(x.len())?;
        self.quantizer.train(x, n)
    }

    #[instrument(skip(self, x))]
    fn add(&mut self, x: &[f32]) -> Result<(), Box<dyn AnnError>> {
        if !self.quantizer.is_trained() {
            return Err(IndexError::NotTrained.boxed());
        }
        let n = self.check_dim(x.len())?;
        let d = self.config.dimensionality;
        let cb = self.quantizer.codebooks();
        let nbits = cb.nbits().to_vec();

        let encoded = parallel_map(n, 4, |i| {
            self.quantizer.encode_one(&x[i * d..(i + 1) * d])
        });

        for codes in &encoded {
            self.codes.extend(pack_code(codes, &nbits));
            self.ids.push(self.next_id);
            self.next_id += 1;
        }

        // Re-derive the norm table over the whole (old + new) population so
        // quantized-norm ranges stay calibrated; cheap relative to training.
        if !matches!(self.search_type, SearchType::Decompress | SearchType::LutNonorm) {
            let all_norms: Vec<f32> = (0..self.ids.len())
                .map(|row| {
                    let codes = self.code_at(row);
                    decode(self.quantizer.codebooks(), &codes)
                        .iter()
                        .map(|v| v * v)
                        .sum()
                })
                .collect();
            self.norms = StoredNorms::build(self.search_type, &all_norms, self.seed);
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
        if !self.quantizer.is_trained() {
            return Err(IndexError::NotTrained.boxed());
        }
        let n = self.check_dim(x.len())?;
        let d = self.config.dimensionality;
        let metric = self.config.metric;
        let sentinel = metric.sentinel_score();
        let codebooks = self.quantizer.codebooks();

        let results = parallel_map(n, 1, |qi| {
            let query = &x[qi * d..(qi + 1) * d];
            let q_norm: f32 = query.iter().map(|v| v * v).sum();
            let lut = build_lut(codebooks, query);
            let mut topk = TopK::new(k, metric.direction());
            for row in 0..self.ids.len() {
                let codes = self.code_at(row);
                let dot = score_from_lut(codebooks, &lut, &codes);
                let score = match metric {
                    Metric::InnerProduct => dot,
                    _ => q_norm + self.squared_norm(row, &codes) - 2.0 * dot,
                };
                topk.push(self.ids[row], score);
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
        if !self.quantizer.is_trained() {
            return Err(IndexError::NotTrained.boxed());
        }
        let n = self.check_dim(x.len())?;
        let d = self.config.dimensionality;
        let metric = self.config.metric;
        let codebooks = self.quantizer.codebooks();

        let hits = parallel_map(n, 1, |qi| {
            let query = &x[qi * d..(qi + 1) * d];
            let q_norm: f32 = query.iter().map(|v| v * v).sum();
            let lut = build_lut(codebooks, query);
            let mut row_hits = Vec::new();
            for row in 0..self.ids.len() {
                let codes = self.code_at(row);
                let dot = score_from_lut(codebooks, &lut, &codes);
                let score = match metric {
                    Metric::InnerProduct => dot,
                    _ => q_norm + self.squared_norm(row, &codes) - 2.0 * dot,
                };
                if metric.within_radius(score, radius) {
                    row_hits.push((self.ids[row], score));
                }
            }
            row_hits
        });
        Ok(RangeSearchResult { hits })
    }

    fn reconstruct(&self, key: i64, out: &mut [f32]) -> Result<(), Box<dyn AnnError>> {
        let row = self
            .ids
            .iter()
            .position(|&id| id == key)
            .ok_or_else(|| IndexError::InvalidArgument(format!("unknown id {key}")).boxed())?;
        let codes = self.code_at(row);
        out.copy_from_slice(&self.quantizer.decode_one(&codes));
        Ok(())
    }

    fn reset(&mut self) {
        self.codes.clear();
        self.ids.clear();
        self.norms = StoredNorms::None;
        self.next_id = 0;
    }
}

/// Shared test fixtures for the AQ family.
#[cfg(test)]
pub(crate) fn gaussian_fixture(n: usize, d: usize, seed: u64) -> Vec<f32> {
    use rand_distr::{Distribution, StandardNormal};
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n * d)
        .map(|_| StandardNormal.sample(&mut rng))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_code_round_trips() {
        let nbits = vec![3usize, 5, 8];
        let codes = vec![5u32, 17, 200];
        let bytes = pack_code(&codes, &nbits);
        assert_eq!(bytes.len(), (3 + 5 + 8_usize).div_ceil(8));
        let decoded = unpack_code(&bytes, &nbits);
        assert_eq!(decoded, codes);
    }

    #[test]
    fn pack_unpack_handles_max_values_per_field() {
        let nbits = vec![4usize, 4];
        for a in 0..16u32 {
            for b in 0..16u32 {
                let bytes = pack_code(&[a, b], &nbits);
                assert_eq!(unpack_code(&bytes, &nbits), vec![a, b]);
            }
        }
    }

    #[test]
    fn codebooks_offsets_match_sizes() {
        let cb = Codebooks::new(8, &[4, 4, 2]);
        assert_eq!(cb.k(0), 16);
        assert_eq!(cb.k(1), 16);
        assert_eq!(cb.k(2), 4);
        assert_eq!(cb.total_rows(), 36);
        assert_eq!(cb.code_bits(), 10);
        assert_eq!(cb.code_bytes(), 2);
    }

    #[test]
    fn decode_sums_selected_rows() {
        let mut cb = Codebooks::new(2, &[1, 1]);
        cb.row_mut(0, 0).copy_from_slice(&[1.0, 0.0]);
        cb.row_mut(0, 1).copy_from_slice(&[0.0, 1.0]);
        cb.row_mut(1, 0).copy_from_slice(&[10.0, 10.0]);
        cb.row_mut(1, 1).copy_from_slice(&[20.0, 20.0]);
        let x_hat = decode(&cb, &[1, 0]);
        assert_eq!(x_hat, vec![10.0, 11.0]);
    }

    #[test]
    fn lut_matches_direct_inner_product() {
        let mut cb = Codebooks::new(3, &[2]);
        for k in 0..4 {
            cb.row_mut(0, k).copy_from_slice(&[k as f32, 1.0, -1.0]);
        }
        let q = [1.0, 2.0, 3.0];
        let lut = build_lut(&cb, &q);
        for k in 0..4 {
            let expected: f32 = q.iter().zip(cb.row(0, k)).map(|(a, b)| a * b).sum();
            assert!((lut[k] - expected).abs() < 1e-5);
            assert!((score_from_lut(&cb, &lut, &[k as u32]) - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn stored_norms_qint8_round_trips_within_tolerance() {
        let norms = vec![0.1f32, 1.0, 2.5, 9.9, 5.0];
        let stored = StoredNorms::build(SearchType::NormQint8, &norms, 0);
        for (i, &n) in norms.iter().enumerate() {
            let got = stored.get(i).unwrap();
            assert!((got - n).abs() < 0.1, "norm {i}: {got} vs {n}");
        }
    }

    #[test]
    fn stored_norms_qint4_round_trips_within_coarser_tolerance() {
        let norms = vec![0.0f32, 2.0, 4.0, 6.0, 8.0];
        let stored = StoredNorms::build(SearchType::NormQint4, &norms, 0);
        for (i, &n) in norms.iter().enumerate() {
            let got = stored.get(i).unwrap();
            assert!((got - n).abs() < 1.0, "norm {i}: {got} vs {n}");
        }
    }

    #[test]
    fn stored_norms_none_for_decompress_and_lutnonorm() {
        let norms = vec![1.0, 2.0];
        assert!(StoredNorms::build(SearchType::Decompress, &norms, 0).is_empty());
        assert!(StoredNorms::build(SearchType::LutNonorm, &norms, 0).is_empty());
    }
}
