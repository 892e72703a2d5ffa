//! Arena tree nodes produced by the builder.

/// Sentinel bit index marking a balanced-fallback split in a binary tree;
/// its query-time margin is 0 so both children stay equally explorable.
pub(crate) const FALLBACK_BIT: u32 = u32::MAX;

/// Metric-dependent split descriptor.
#[derive(Debug, Clone)]
pub(crate) enum SplitPlane {
    /// Separating hyperplane for dense metrics. A zero normal marks the
    /// balanced-fallback split.
    Plane { normal: Vec<f32>, offset: f32 },
    /// Bit-position split for the Hamming metric.
    Bit { index: u32 },
}

/// A node in a partition tree. Split nodes always have two children.
#[derive(Debug, Clone)]
pub(crate) enum TreeNode {
    Split {
        plane: SplitPlane,
        left: u32,
        right: u32,
    },
    Leaf {
        items: Vec<u32>,
    },
}

/// One finished tree: an arena of nodes plus the root's arena index.
#[derive(Debug)]
pub(crate) struct TreeArena {
    pub(crate) nodes: Vec<TreeNode>,
    pub(crate) root: u32,
}

/// Leaf capacity for the given metric and dimensionality.
///
/// Chosen so that every leaf's item list fits inline in one fixed-size
/// node record of the binary layout.
pub(crate) fn leaf_capacity(binary: bool, dimension: usize) -> usize {
    if binary { 16 } else { (dimension + 2).max(8) }
}
