//! An explicit `parallel_map`/`parallel_for_each` whose implementation
//! doesn't affect correctness, backed by `rayon` the way a per-subspace
//! codebook trainer parallelizes independent subspaces with
//! `into_par_iter()`.
//!
//! Results are always collected back into input order (an
//! `IndexedParallelIterator::collect` never reorders), so chunked
//! reductions stay shard-index-stable regardless of which worker finished
//! first, keeping every caller deterministic for a fixed seed.

use rayon::prelude::*;

/// Applies `body` to every index in `0..n`, returning results in index
/// order. `min_chunk` is a scheduling hint only; it does not affect the
/// result.
pub fn parallel_map<T, F>(n: usize, min_chunk: usize, body: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync,
{
    (0..n)
        .into_par_iter()
        .with_min_len(min_chunk.max(1))
        .map(body)
        .collect()
}

/// Runs `body` over every index in `0..n` for side effects only.
pub fn parallel_for_each<F>(n: usize, min_chunk: usize, body: F)
where
    F: Fn(usize) + Sync,
{
    (0..n)
        .into_par_iter()
        .with_min_len(min_chunk.max(1))
        .for_each(body);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallel_map_preserves_index_order() {
        let out = parallel_map(1000, 16, |i| i * 2);
        for (i, v) in out.iter().enumerate() {
            assert_eq!(*v, i * 2);
        }
    }

    #[test]
    fn repeated_runs_are_byte_identical() {
        let a = parallel_map(500, 8, |i| (i as f32).sqrt());
        let b = parallel_map(500, 8, |i| (i as f32).sqrt());
        assert_eq!(a, b);
    }
}
