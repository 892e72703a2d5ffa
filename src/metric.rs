//! Distance metrics for nearest-neighbor search.
//!
//! The five supported metrics form a closed set, selected once at index
//! construction time and never changed afterwards. Dispatch happens through
//! a single `match` at the index boundary so the per-item kernels stay
//! monomorphic on the hot path.
//!
//! Each metric defines an *internal* distance used for ranking (cheap to
//! compute, monotonic in the true distance) and a *normalized* distance
//! reported to callers: Euclidean ranks by squared L2 and reports the L2
//! norm, Angular ranks by `2 - 2cos` and reports its square root, Dot ranks
//! and reports the negated inner product, Manhattan and Hamming report the
//! internal value unchanged.

pub(crate) mod angular;
pub(crate) mod dot;
pub(crate) mod euclidean;
pub(crate) mod hamming;
pub(crate) mod manhattan;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TaxusError;

/// Distance metric used by an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// L2 distance.
    Euclidean,
    /// L1 distance.
    Manhattan,
    /// Angular (cosine) distance.
    Angular,
    /// Inner-product similarity, negated so that smaller means closer.
    Dot,
    /// Bit mismatch count over packed binary vectors.
    Hamming,
}

impl Metric {
    /// The canonical lowercase name of the metric.
    pub fn name(&self) -> &'static str {
        match self {
            Metric::Euclidean => "euclidean",
            Metric::Manhattan => "manhattan",
            Metric::Angular => "angular",
            Metric::Dot => "dot",
            Metric::Hamming => "hamming",
        }
    }

    /// Numeric code stored in the index header.
    pub(crate) fn code(&self) -> u32 {
        match self {
            Metric::Euclidean => 0,
            Metric::Manhattan => 1,
            Metric::Angular => 2,
            Metric::Dot => 3,
            Metric::Hamming => 4,
        }
    }

    /// Inverse of [`Metric::code`]; `None` for unknown codes.
    pub(crate) fn from_code(code: u32) -> Option<Metric> {
        match code {
            0 => Some(Metric::Euclidean),
            1 => Some(Metric::Manhattan),
            2 => Some(Metric::Angular),
            3 => Some(Metric::Dot),
            4 => Some(Metric::Hamming),
            _ => None,
        }
    }

    /// Whether items of this metric are stored as packed `u64` bit words
    /// rather than `f32` components.
    pub(crate) fn is_binary(&self) -> bool {
        matches!(self, Metric::Hamming)
    }

    /// Whether the index keeps a per-item norm cache for this metric.
    pub(crate) fn needs_norms(&self) -> bool {
        matches!(self, Metric::Angular)
    }

    /// Internal ranking distance between two dense vectors.
    ///
    /// Not defined for [`Metric::Hamming`], whose items live in packed
    /// words; the hamming kernel is invoked directly where it applies.
    pub(crate) fn internal_distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Euclidean => euclidean::distance(a, b.iter().copied()),
            Metric::Manhattan => manhattan::distance(a, b.iter().copied()),
            Metric::Angular => angular::distance(a, b),
            Metric::Dot => dot::distance(a, b.iter().copied()),
            Metric::Hamming => 0.0,
        }
    }

    /// Convert an internal ranking distance into the reported distance.
    pub(crate) fn normalized_distance(&self, d: f32) -> f32 {
        match self {
            Metric::Euclidean => euclidean::normalized(d),
            Metric::Angular => angular::normalized(d),
            Metric::Manhattan | Metric::Dot | Metric::Hamming => d,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = TaxusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "euclidean" => Ok(Metric::Euclidean),
            "manhattan" => Ok(Metric::Manhattan),
            "angular" => Ok(Metric::Angular),
            "dot" => Ok(Metric::Dot),
            "hamming" => Ok(Metric::Hamming),
            other => Err(TaxusError::invalid_argument(format!(
                "unrecognized metric '{other}'"
            ))),
        }
    }
}

/// Inner product of a dense vector with a lazily decoded one.
pub(crate) fn dot_product(a: &[f32], b: impl IntoIterator<Item = f32>) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// L2 norm of a dense vector.
pub(crate) fn norm(a: &[f32]) -> f32 {
    dot_product(a, a.iter().copied()).sqrt()
}

/// Scale a vector to unit length. Zero vectors are left untouched.
pub(crate) fn normalize(a: &mut [f32]) {
    let n = norm(a);
    if n > 0.0 {
        for v in a.iter_mut() {
            *v /= n;
        }
    }
}

/// Signed distance from a query point to a separating hyperplane.
///
/// A zero normal (the balanced-split fallback) yields margin 0, which keeps
/// both children equally explorable at query time.
pub(crate) fn plane_margin(offset: f32, normal: impl IntoIterator<Item = f32>, query: &[f32]) -> f32 {
    offset + dot_product(query, normal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_roundtrip() {
        for metric in [
            Metric::Euclidean,
            Metric::Manhattan,
            Metric::Angular,
            Metric::Dot,
            Metric::Hamming,
        ] {
            assert_eq!(metric.name().parse::<Metric>().unwrap(), metric);
            assert_eq!(Metric::from_code(metric.code()), Some(metric));
        }
    }

    #[test]
    fn test_unknown_metric_name() {
        assert!("cosine".parse::<Metric>().is_err());
    }

    #[test]
    fn test_euclidean_distance() {
        let a = [0.0, 0.0, 0.0];
        let b = [3.0, 4.0, 0.0];
        let d = Metric::Euclidean.internal_distance(&a, &b);
        assert_eq!(d, 25.0);
        assert_eq!(Metric::Euclidean.normalized_distance(d), 5.0);
    }

    #[test]
    fn test_manhattan_distance() {
        let a = [1.0, -2.0];
        let b = [-1.0, 1.0];
        assert_eq!(Metric::Manhattan.internal_distance(&a, &b), 5.0);
    }

    #[test]
    fn test_angular_distance_extremes() {
        let a = [1.0, 0.0];
        let b = [2.0, 0.0];
        let c = [-1.0, 0.0];
        let same = Metric::Angular.internal_distance(&a, &b);
        let opposite = Metric::Angular.internal_distance(&a, &c);
        assert!(same.abs() < 1e-6);
        assert!((opposite - 4.0).abs() < 1e-6);
        // Reported distance for identical directions is 0, for opposite 2.
        assert!(Metric::Angular.normalized_distance(same) < 1e-3);
        assert!((Metric::Angular.normalized_distance(opposite) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_angular_zero_vector() {
        let a = [0.0, 0.0];
        let b = [1.0, 0.0];
        assert_eq!(Metric::Angular.internal_distance(&a, &b), 2.0);
    }

    #[test]
    fn test_dot_distance_orders_by_similarity() {
        let q = [1.0, 1.0];
        let near = [2.0, 2.0];
        let far = [-1.0, 0.0];
        assert!(Metric::Dot.internal_distance(&q, &near) < Metric::Dot.internal_distance(&q, &far));
    }

    #[test]
    fn test_plane_margin_sides() {
        // Plane x = 1: normal (1, 0), offset -1.
        let normal = [1.0f32, 0.0];
        assert!(plane_margin(-1.0, normal.iter().copied(), &[2.0, 5.0]) > 0.0);
        assert!(plane_margin(-1.0, normal.iter().copied(), &[0.0, 5.0]) < 0.0);
        assert_eq!(plane_margin(-1.0, normal.iter().copied(), &[1.0, 5.0]), 0.0);
    }

    #[test]
    fn test_normalize() {
        let mut v = [3.0, 4.0];
        normalize(&mut v);
        assert!((norm(&v) - 1.0).abs() < 1e-6);
        let mut zero = [0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, [0.0, 0.0]);
    }
}
