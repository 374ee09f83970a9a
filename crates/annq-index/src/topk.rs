//! The top-k selector: every search path funnels through this.
//!
//! A small-k binary-heap selector, the same partial-selection shape
//! `select_nth_unstable_by_key` + `sort_by_key` gives you in one shot, but
//! streaming, so callers never need to materialize the full candidate
//! list, and with a deterministic smaller-id-wins tie-break.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use annq_distance::Direction;

#[derive(Clone, Copy, Debug, PartialEq)]
struct HeapItem {
    /// Score normalized so that "smaller is worse" regardless of the
    /// underlying metric's direction: `score` for minimizing metrics,
    /// `-score` for maximizing ones.
    badness: f32,
    id: i64,
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.badness.total_cmp(&other.badness) {
            Ordering::Equal => self.id.cmp(&other.id),
            ord => ord,
        }
    }
}

/// Maintains the best `k` `(id, score)` pairs seen so far from a stream.
pub struct TopK {
    k: usize,
    direction: Direction,
    heap: BinaryHeap<HeapItem>,
}

impl TopK {
    pub fn new(k: usize, direction: Direction) -> Self {
        TopK {
            k,
            direction,
            heap: BinaryHeap::with_capacity(k),
        }
    }

    fn badness(&self, score: f32) -> f32 {
        match self.direction {
            Direction::Minimize => score,
            Direction::Maximize => -score,
        }
    }

    /// Offers a candidate. Kept if the selector isn't yet full, or if it
    /// is strictly better than the worst item currently held (ties broken
    /// by smaller id, which is never evicted in favor of a larger one).
    pub fn push(&mut self, id: i64, score: f32) {
        if self.k == 0 {
            return;
        }
        let item = HeapItem {
            badness: self.badness(score),
            id,
        };
        if self.heap.len() < self.k {
            self.heap.push(item);
        } else if let Some(&worst) = self.heap.peek() {
            if item < worst {
                self.heap.pop();
                self.heap.push(item);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drains the selector into ascending-by-preference order: best match
    /// first, ties broken by smaller id.
    pub fn into_sorted(self) -> (Vec<i64>, Vec<f32>) {
        let direction = self.direction;
        let items = self.heap.into_sorted_vec();
        let ids = items.iter().map(|it| it.id).collect();
        let scores = items
            .iter()
            .map(|it| match direction {
                Direction::Minimize => it.badness,
                Direction::Maximize => -it.badness,
            })
            .collect();
        (ids, scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_smallest_k_for_minimize() {
        let mut topk = TopK::new(2, Direction::Minimize);
        for (id, score) in [(0i64, 5.0f32), (1, 1.0), (2, 3.0), (3, 0.5)] {
            topk.push(id, score);
        }
        let (ids, scores) = topk.into_sorted();
        assert_eq!(ids, vec![3, 1]);
        assert_eq!(scores, vec![0.5, 1.0]);
    }

    #[test]
    fn keeps_largest_k_for_maximize() {
        let mut topk = TopK::new(2, Direction::Maximize);
        for (id, score) in [(0i64, 5.0f32), (1, 1.0), (2, 3.0), (3, 9.0)] {
            topk.push(id, score);
        }
        let (ids, scores) = topk.into_sorted();
        assert_eq!(ids, vec![3, 0]);
        assert_eq!(scores, vec![9.0, 5.0]);
    }

    #[test]
    fn ties_broken_by_smaller_id() {
        let mut topk = TopK::new(1, Direction::Minimize);
        topk.push(5, 1.0);
        topk.push(2, 1.0);
        let (ids, _) = topk.into_sorted();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn fewer_candidates_than_k_returns_all() {
        let mut topk = TopK::new(5, Direction::Minimize);
        topk.push(0, 1.0);
        topk.push(1, 2.0);
        let (ids, scores) = topk.into_sorted();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(scores, vec![1.0, 2.0]);
    }

    #[test]
    fn k_zero_yields_nothing() {
        let mut topk = TopK::new(0, Direction::Minimize);
        topk.push(0, 1.0);
        let (ids, _) = topk.into_sorted();
        assert!(ids.is_empty());
    }
}
