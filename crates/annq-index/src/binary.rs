//! Binary index: stores already-binary codes (packed
//! bit-vectors, one bit per byte-aligned dimension) and ranks candidates
//! by Hamming distance. Unlike `LshIndex`, there is no projection step —
//! callers are expected to have already turned their data into bits
//! (a hash, a fingerprint, a binarized embedding). It shares its
//! sign-quantize-then-rank lineage with `LshIndex`, minus the quantization
//! step: this index only ranks, it never derives bits from floats.

use annq_distance::{Direction, Metric};
use annq_error::AnnError;
use tracing::instrument;

use crate::parallel::parallel_map;
use crate::topk::TopK;
use crate::types::{Index, IndexError, RangeSearchResult};

#[derive(Clone, Debug)]
pub struct BinaryIndexConfig {
    /// Number of bits per stored code. Must be a multiple of 8 — codes are
    /// always byte-aligned.
    pub code_bits: usize,
}

fn code_bytes(code_bits: usize) -> usize {
    code_bits / 8
}

pub struct BinaryIndex {
    config: BinaryIndexConfig,
    codes: Vec<u8>,
    ids: Vec<i64>,
    next_id: i64,
}

impl BinaryIndex {
    pub fn new(config: BinaryIndexConfig) -> Result<Self, Box<dyn AnnError>> {
        if config.code_bits == 0 || config.code_bits % 8 != 0 {
            return Err(
                IndexError::InvalidArgument("code_bits must be a positive multiple of 8".to_string())
                    .boxed(),
            );
        }
        Ok(BinaryIndex {
            config,
            codes: Vec::new(),
            ids: Vec::new(),
            next_id: 0,
        })
    }

    fn bytes_per_code(&self) -> usize {
        code_bytes(self.config.code_bits)
    }

    fn check_len(&self, x_len: usize) -> Result<usize, Box<dyn AnnError>> {
        let cb = self.bytes_per_code();
        if cb == 0 || x_len % cb != 0 {
            return Err(IndexError::DimensionMismatch {
                expected: cb,
                got: x_len,
            }
            .boxed());
        }
        Ok(x_len / cb)
    }

    fn hamming(a: &[u8], b: &[u8]) -> u32 {
        a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
    }

    fn row_of(&self, id: i64) -> Option<usize> {
        self.ids.iter().position(|&stored| stored == id)
    }
}

impl Index for BinaryIndex {
    fn d(&self) -> usize {
        self.config.code_bits
    }

    fn ntotal(&self) -> usize {
        self.ids.len()
    }

    fn is_trained(&self) -> bool {
        true
    }

    fn metric(&self) -> Metric {
        Metric::L1
    }

    fn train(&mut self, _x: &[f32]) -> Result<(), Box<dyn AnnError>> {
        Ok(())
    }

    fn add(&mut self, _x: &[f32]) -> Result<(), Box<dyn AnnError>> {
        Err(IndexError::UnsupportedOp("add (use add_bytes)").boxed())
    }

    fn search(
        &self,
        _x: &[f32],
        _k: usize,
        _out_dist: &mut [f32],
        _out_ids: &mut [i64],
    ) -> Result<(), Box<dyn AnnError>> {
        Err(IndexError::UnsupportedOp("search (use search_bytes)").boxed())
    }

    fn reconstruct(&self, _key: i64, _out: &mut [f32]) -> Result<(), Box<dyn AnnError>> {
        Err(IndexError::UnsupportedOp("reconstruct (use reconstruct_bytes)").boxed())
    }

    fn remove_ids(&mut self, ids: &[i64]) -> Result<usize, Box<dyn AnnError>> {
        let mut removed = 0;
        let cb = self.bytes_per_code();
        for &id in ids {
            if let Some(row) = self.row_of(id) {
                let last = self.ids.len() - 1;
                for j in 0..cb {
                    self.codes.swap(row * cb + j, last * cb + j);
                }
                self.ids.swap(row, last);
                self.codes.truncate(last * cb);
                self.ids.truncate(last);
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn reset(&mut self) {
        self.codes.clear();
        self.ids.clear();
        self.next_id = 0;
    }
}

impl BinaryIndex {
    /// Appends `n = bytes.len() / bytes_per_code()` packed codes, assigning
    /// sequential ids.
    #[instrument(skip(self, bytes))]
    pub fn add_bytes(&mut self, bytes: &[u8]) -> Result<(), Box<dyn AnnError>> {
        let n = self.check_len(bytes.len())?;
        let cb = self.bytes_per_code();
        for i in 0..n {
            self.codes.extend_from_slice(&bytes[i * cb..(i + 1) * cb]);
            self.ids.push(self.next_id);
            self.next_id += 1;
        }
        Ok(())
    }

    pub fn reconstruct_bytes(&self, key: i64, out: &mut [u8]) -> Result<(), Box<dyn AnnError>> {
        let cb = self.bytes_per_code();
        let row = self
            .row_of(key)
            .ok_or_else(|| IndexError::InvalidArgument(format!("unknown id {key}")).boxed())?;
        out.copy_from_slice(&self.codes[row * cb..(row + 1) * cb]);
        Ok(())
    }

    /// Hamming k-NN over packed query codes. `out_dist` receives bit
    /// distances; unfilled slots are padded with `u32::MAX`-as-`f32` and id
    /// `-1`, matching Flat/LSH's sentinel-padding convention for `search`.
    #[instrument(skip(self, bytes, out_dist, out_ids))]
    pub fn search_bytes(
        &self,
        bytes: &[u8],
        k: usize,
        out_dist: &mut [f32],
        out_ids: &mut [i64],
    ) -> Result<(), Box<dyn AnnError>> {
        let n = self.check_len(bytes.len())?;
        let cb = self.bytes_per_code();
        let sentinel = Metric::L1.sentinel_score();

        let results = parallel_map(n, 1, |qi| {
            let query = &bytes[qi * cb..(qi + 1) * cb];
            let mut topk = TopK::new(k, Direction::Minimize);
            for (row, &id) in self.ids.iter().enumerate() {
                let stored = &self.codes[row * cb..(row + 1) * cb];
                topk.push(id, Self::hamming(query, stored) as f32);
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

    /// Like `search_bytes`, but also fills `out_recon` with the reconstructed
    /// codes for each hit, writing all-`0xFF` bytes for unfilled slots past
    /// the end of the available results.
    pub fn search_and_reconstruct(
        &self,
        bytes: &[u8],
        k: usize,
        out_dist: &mut [f32],
        out_ids: &mut [i64],
        out_recon: &mut [u8],
    ) -> Result<(), Box<dyn AnnError>> {
        self.search_bytes(bytes, k, out_dist, out_ids)?;
        let cb = self.bytes_per_code();
        let n = out_ids.len() / k;
        for qi in 0..n {
            for slot in 0..k {
                let id = out_ids[qi * k + slot];
                let dst = &mut out_recon[(qi * k + slot) * cb..(qi * k + slot + 1) * cb];
                if id >= 0 {
                    self.reconstruct_bytes(id, dst)?;
                } else {
                    dst.fill(0xFF);
                }
            }
        }
        Ok(())
    }

    pub fn range_search_bytes(&self, bytes: &[u8], radius: f32) -> Result<RangeSearchResult, Box<dyn AnnError>> {
        let n = self.check_len(bytes.len())?;
        let cb = self.bytes_per_code();

        let hits = parallel_map(n, 1, |qi| {
            let query = &bytes[qi * cb..(qi + 1) * cb];
            let mut row_hits = Vec::new();
            for (row, &id) in self.ids.iter().enumerate() {
                let stored = &self.codes[row * cb..(row + 1) * cb];
                let dist = Self::hamming(query, stored) as f32;
                if dist < radius {
                    row_hits.push((id, dist));
                }
            }
            row_hits
        });
        Ok(RangeSearchResult { hits })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx(code_bits: usize) -> BinaryIndex {
        BinaryIndex::new(BinaryIndexConfig { code_bits }).unwrap()
    }

    #[test]
    fn rejects_code_bits_not_multiple_of_eight() {
        assert!(BinaryIndex::new(BinaryIndexConfig { code_bits: 12 }).is_err());
    }

    #[test]
    fn hamming_distance_of_identical_codes_is_zero() {
        let mut idx = idx(16);
        idx.add_bytes(&[0b1010_1010, 0b0000_1111]).unwrap();
        let mut dist = [0.0f32; 1];
        let mut ids = [0i64; 1];
        idx.search_bytes(&[0b1010_1010, 0b0000_1111], 1, &mut dist, &mut ids)
            .unwrap();
        assert_eq!(ids, [0]);
        assert_eq!(dist, [0.0]);
    }

    #[test]
    fn hamming_distance_counts_differing_bits() {
        let mut idx = idx(8);
        idx.add_bytes(&[0b0000_0000]).unwrap();
        let mut dist = [0.0f32; 1];
        let mut ids = [0i64; 1];
        idx.search_bytes(&[0b1111_0000], 1, &mut dist, &mut ids).unwrap();
        assert_eq!(dist, [4.0]);
    }

    #[test]
    fn search_and_reconstruct_fills_missing_slots_with_0xff() {
        let mut idx = idx(8);
        idx.add_bytes(&[0b0000_0000]).unwrap();
        let mut dist = [0.0f32; 2];
        let mut ids = [0i64; 2];
        let mut recon = [0u8; 2];
        idx.search_and_reconstruct(&[0b0000_0000], 2, &mut dist, &mut ids, &mut recon)
            .unwrap();
        assert_eq!(recon[0], 0x00);
        assert_eq!(recon[1], 0xFF);
        assert_eq!(ids[1], -1);
    }

    #[test]
    fn remove_ids_shrinks_ntotal() {
        let mut idx = idx(8);
        idx.add_bytes(&[0b0000_0000, 0b1111_1111]).unwrap();
        let removed = idx.remove_ids(&[0]).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(idx.ntotal(), 1);
        let mut out = [0u8; 1];
        assert!(idx.reconstruct_bytes(0, &mut out).is_err());
        idx.reconstruct_bytes(1, &mut out).unwrap();
        assert_eq!(out, [0b1111_1111]);
    }

    #[test]
    fn range_search_uses_strict_inequality() {
        let mut idx = idx(8);
        idx.add_bytes(&[0b0000_0000, 0b0000_0001, 0b0000_0011]).unwrap();
        let result = idx.range_search_bytes(&[0b0000_0000], 2.0).unwrap();
        let hit_ids: Vec<i64> = result.hits[0].iter().map(|&(id, _)| id).collect();
        assert_eq!(hit_ids, vec![0, 1]);
    }

    #[test]
    fn float_add_and_search_are_unsupported() {
        let mut idx = idx(8);
        assert!(idx.add(&[0.0]).is_err());
        let mut dist = [0.0f32; 1];
        let mut ids = [0i64; 1];
        assert!(idx.search(&[0.0], 1, &mut dist, &mut ids).is_err());
    }
}
