//! Manhattan (L1) distance kernel.

pub(crate) fn distance(a: &[f32], b: impl IntoIterator<Item = f32>) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum()
}
