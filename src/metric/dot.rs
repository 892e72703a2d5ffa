//! Dot-product distance kernel.
//!
//! "Closest" means "highest inner product", so the stored distance is the
//! negated dot product and ascending order means most similar first. The
//! reported distance keeps the same sign convention.

use crate::metric::dot_product;

pub(crate) fn distance(a: &[f32], b: impl IntoIterator<Item = f32>) -> f32 {
    -dot_product(a, b)
}
