//! Euclidean (L2) distance kernels.

/// Squared L2 distance; the ranking-internal form.
pub(crate) fn distance(a: &[f32], b: impl IntoIterator<Item = f32>) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Reported distance: the L2 norm of the difference.
pub(crate) fn normalized(d: f32) -> f32 {
    d.max(0.0).sqrt()
}
