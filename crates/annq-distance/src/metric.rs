use serde::{Deserialize, Serialize};

use crate::scalar;

/// Whether a metric's search order prefers the smallest or the largest
/// scored value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Smaller is closer (L2, Lp, ...).
    Minimize,
    /// Larger is closer (inner product, correlation).
    Maximize,
}

/// The distance/similarity kinds the search core supports.
///
/// `Lp` carries its own exponent since `p` is a continuous parameter rather
/// than a separate variant per value.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum Metric {
    L2,
    InnerProduct,
    L1,
    Linf,
    Lp(f32),
    Canberra,
    BrayCurtis,
    JensenShannon,
    Jaccard,
}

impl Metric {
    /// Whether `search` under this metric ranks by smallest or largest score.
    pub fn direction(&self) -> Direction {
        match self {
            Metric::InnerProduct => Direction::Maximize,
            _ => Direction::Minimize,
        }
    }

    /// The sentinel score used to pad short search results: `+∞` for
    /// minimizing metrics, `−∞` for maximizing ones.
    pub fn sentinel_score(&self) -> f32 {
        match self.direction() {
            Direction::Minimize => f32::INFINITY,
            Direction::Maximize => f32::NEG_INFINITY,
        }
    }

    /// Returns `true` if `candidate` is strictly closer than `incumbent`
    /// under this metric's direction, with no tie-break (callers needing
    /// deterministic ties should compare ids on equality — see `topk`).
    pub fn is_better(&self, candidate: f32, incumbent: f32) -> bool {
        match self.direction() {
            Direction::Minimize => candidate < incumbent,
            Direction::Maximize => candidate > incumbent,
        }
    }

    /// `true` if `score` is within `radius` under this metric's range-search
    /// convention: strict `<` for minimizing metrics, strict `>` for
    /// maximizing ones.
    pub fn within_radius(&self, score: f32, radius: f32) -> bool {
        match self.direction() {
            Direction::Minimize => score < radius,
            Direction::Maximize => score > radius,
        }
    }

    /// Computes the scalar distance/similarity between two same-length
    /// vectors under this metric.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len());
        match self {
            Metric::L2 => scalar::l2_sq(a, b),
            Metric::InnerProduct => scalar::inner_product(a, b),
            Metric::L1 => scalar::l1(a, b),
            Metric::Linf => scalar::linf(a, b),
            Metric::Lp(p) => scalar::lp(a, b, *p),
            Metric::Canberra => scalar::canberra(a, b),
            Metric::BrayCurtis => scalar::bray_curtis(a, b),
            Metric::JensenShannon => scalar::jensen_shannon(a, b),
            Metric::Jaccard => scalar::jaccard(a, b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inner_product_maximizes() {
        assert_eq!(Metric::InnerProduct.direction(), Direction::Maximize);
        assert_eq!(Metric::L2.direction(), Direction::Minimize);
    }

    #[test]
    fn sentinel_matches_direction() {
        assert!(Metric::L2.sentinel_score().is_infinite() && Metric::L2.sentinel_score() > 0.0);
        assert!(Metric::InnerProduct.sentinel_score() < 0.0);
    }

    #[test]
    fn is_better_respects_direction() {
        assert!(Metric::L2.is_better(1.0, 2.0));
        assert!(!Metric::L2.is_better(2.0, 1.0));
        assert!(Metric::InnerProduct.is_better(2.0, 1.0));
        assert!(!Metric::InnerProduct.is_better(1.0, 2.0));
    }

    #[test]
    fn within_radius_strictness() {
        assert!(Metric::L2.within_radius(0.5, 1.0));
        assert!(!Metric::L2.within_radius(1.0, 1.0));
        assert!(Metric::InnerProduct.within_radius(1.0, 0.5));
        assert!(!Metric::InnerProduct.within_radius(0.5, 0.5));
    }
}
