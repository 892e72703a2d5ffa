//! Recursive tree construction over the frozen store.
//!
//! Each tree is built from a private random stream seeded by the build
//! seed plus the tree index, so a fixed seed reproduces the same forest
//! regardless of how many workers participate. Workers only read the
//! frozen store and write their own arenas; the forest list is collected
//! into pre-sized slots with no locking.

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::error::{Result, TaxusError};
use crate::metric::{self, Metric, hamming};
use crate::store::FrozenStore;
use crate::tree::node::{FALLBACK_BIT, SplitPlane, TreeArena, TreeNode, leaf_capacity};

/// Centroid-refinement iterations when sampling a split.
const TWO_MEANS_ITERATIONS: usize = 200;

/// Re-sampling attempts before falling back to a balanced median split.
const MAX_SPLIT_ATTEMPTS: usize = 3;

/// A split is degenerate when one side holds more than this fraction.
const MAX_SIDE_FRACTION: f64 = 0.98;

/// Start a rayon pool for the requested worker count, or `None` for the
/// single-threaded path.
pub(crate) fn create_worker_pool(workers: usize) -> Result<Option<rayon::ThreadPool>> {
    if workers <= 1 {
        return Ok(None);
    }
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("taxus-build-{i}"))
        .build()
        .map(Some)
        .map_err(|e| TaxusError::build(format!("failed to start {workers} build workers: {e}")))
}

/// Build `trees` independent trees over the frozen store.
pub(crate) fn build_forest(
    store: &FrozenStore,
    trees: usize,
    base_seed: u64,
    pool: Option<&rayon::ThreadPool>,
) -> Vec<TreeArena> {
    let builder = TreeBuilder::new(store);
    match pool {
        Some(pool) => pool.install(|| {
            (0..trees)
                .into_par_iter()
                .map(|t| builder.build_tree(t, base_seed))
                .collect()
        }),
        None => (0..trees).map(|t| builder.build_tree(t, base_seed)).collect(),
    }
}

/// Builds one tree at a time from a read-only store snapshot.
pub(crate) struct TreeBuilder<'a> {
    store: &'a FrozenStore,
    metric: Metric,
    leaf_cap: usize,
}

impl<'a> TreeBuilder<'a> {
    pub(crate) fn new(store: &'a FrozenStore) -> Self {
        Self {
            store,
            metric: store.metric,
            leaf_cap: leaf_capacity(store.metric.is_binary(), store.dimension),
        }
    }

    pub(crate) fn build_tree(&self, tree_index: usize, base_seed: u64) -> TreeArena {
        let mut rng = StdRng::seed_from_u64(base_seed.wrapping_add(tree_index as u64));
        let mut nodes = Vec::new();
        let items: Vec<u32> = (0..self.store.len() as u32).collect();
        let root = self.build_subtree(items, &mut nodes, &mut rng);
        debug!("built tree {tree_index}: {} nodes", nodes.len());
        TreeArena { nodes, root }
    }

    fn build_subtree(&self, items: Vec<u32>, nodes: &mut Vec<TreeNode>, rng: &mut StdRng) -> u32 {
        if items.len() <= self.leaf_cap {
            nodes.push(TreeNode::Leaf { items });
            return (nodes.len() - 1) as u32;
        }
        let (plane, left_items, right_items) = self.split(&items, rng);
        let left = self.build_subtree(left_items, nodes, rng);
        let right = self.build_subtree(right_items, nodes, rng);
        nodes.push(TreeNode::Split { plane, left, right });
        (nodes.len() - 1) as u32
    }

    fn split(&self, items: &[u32], rng: &mut StdRng) -> (SplitPlane, Vec<u32>, Vec<u32>) {
        for _ in 0..MAX_SPLIT_ATTEMPTS {
            if let Some(split) = self.try_split(items, rng) {
                return split;
            }
        }
        self.balanced_fallback(items, rng)
    }

    /// Sample a split and partition `items`; `None` when the partition is
    /// degenerate and a fresh sample should be tried.
    fn try_split(
        &self,
        items: &[u32],
        rng: &mut StdRng,
    ) -> Option<(SplitPlane, Vec<u32>, Vec<u32>)> {
        let plane = match self.metric {
            Metric::Hamming => SplitPlane::Bit {
                index: rng.random_range(0..self.store.dimension) as u32,
            },
            _ => self.plane_split(items, rng)?,
        };
        let mut left = Vec::new();
        let mut right = Vec::new();
        for &slot in items {
            if self.side(&plane, slot, rng) {
                right.push(slot);
            } else {
                left.push(slot);
            }
        }
        if split_is_degenerate(left.len(), right.len()) {
            None
        } else {
            Some((plane, left, right))
        }
    }

    /// Which side of the split an item falls on; `true` is the right child.
    fn side(&self, plane: &SplitPlane, slot: u32, rng: &mut StdRng) -> bool {
        match plane {
            SplitPlane::Bit { index } => hamming::bit(self.store.words(slot), *index as usize),
            SplitPlane::Plane { normal, offset } => {
                let m =
                    metric::plane_margin(*offset, normal.iter().copied(), self.store.real(slot));
                if m != 0.0 { m > 0.0 } else { rng.random() }
            }
        }
    }

    /// Perpendicular bisector of two sampled cluster centroids.
    fn plane_split(&self, items: &[u32], rng: &mut StdRng) -> Option<SplitPlane> {
        let (u, v) = self.two_means(items, rng);
        let mut normal: Vec<f32> = u.iter().zip(&v).map(|(a, b)| a - b).collect();
        if metric::norm(&normal) == 0.0 {
            // Coincident centroids; re-sample.
            return None;
        }
        metric::normalize(&mut normal);
        let offset = match self.metric {
            Metric::Angular => 0.0,
            _ => {
                let midpoint = u.iter().zip(&v).map(|(a, b)| (a + b) / 2.0);
                -metric::dot_product(&normal, midpoint)
            }
        };
        Some(SplitPlane::Plane { normal, offset })
    }

    /// Pick two pivot items and refine them into cluster centroids with a
    /// bounded number of running-mean updates.
    fn two_means(&self, items: &[u32], rng: &mut StdRng) -> (Vec<f32>, Vec<f32>) {
        let n = items.len();
        let first = rng.random_range(0..n);
        let mut second = rng.random_range(0..n - 1);
        if second >= first {
            second += 1;
        }
        let mut u = self.store.real(items[first]).to_vec();
        let mut v = self.store.real(items[second]).to_vec();
        let normalize_means = self.metric == Metric::Angular;
        if normalize_means {
            metric::normalize(&mut u);
            metric::normalize(&mut v);
        }
        let mut u_count = 1.0f32;
        let mut v_count = 1.0f32;
        for _ in 0..TWO_MEANS_ITERATIONS {
            let sample = self.store.real(items[rng.random_range(0..n)]);
            let du = u_count * self.split_proximity(&u, sample);
            let dv = v_count * self.split_proximity(&v, sample);
            if du < dv {
                update_mean(&mut u, u_count, sample, normalize_means);
                u_count += 1.0;
            } else {
                update_mean(&mut v, v_count, sample, normalize_means);
                v_count += 1.0;
            }
        }
        (u, v)
    }

    /// Centroid-to-item proximity used inside two-means. Dot shares the
    /// Euclidean bisector construction, so it clusters by Euclidean
    /// proximity as well.
    fn split_proximity(&self, centroid: &[f32], item: &[f32]) -> f32 {
        match self.metric {
            Metric::Dot => Metric::Euclidean.internal_distance(centroid, item),
            m => m.internal_distance(centroid, item),
        }
    }

    /// Order items along a random projection and cut at the median. The
    /// stored split carries a zero margin so queries explore both sides.
    fn balanced_fallback(
        &self,
        items: &[u32],
        rng: &mut StdRng,
    ) -> (SplitPlane, Vec<u32>, Vec<u32>) {
        let mut keyed: Vec<(f32, u32)> = match self.metric {
            Metric::Hamming => {
                let pivot = self.store.words(items[rng.random_range(0..items.len())]).to_vec();
                items
                    .iter()
                    .map(|&s| {
                        (
                            hamming::distance(&pivot, self.store.words(s).iter().copied()),
                            s,
                        )
                    })
                    .collect()
            }
            _ => {
                let direction: Vec<f32> = (0..self.store.dimension)
                    .map(|_| rng.random_range(-1.0f32..1.0))
                    .collect();
                items
                    .iter()
                    .map(|&s| {
                        (
                            metric::dot_product(&direction, self.store.real(s).iter().copied()),
                            s,
                        )
                    })
                    .collect()
            }
        };
        keyed.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        let mid = keyed.len() / 2;
        let left = keyed[..mid].iter().map(|&(_, s)| s).collect();
        let right = keyed[mid..].iter().map(|&(_, s)| s).collect();
        let plane = match self.metric {
            Metric::Hamming => SplitPlane::Bit {
                index: FALLBACK_BIT,
            },
            _ => SplitPlane::Plane {
                normal: vec![0.0; self.store.dimension],
                offset: 0.0,
            },
        };
        (plane, left, right)
    }
}

fn split_is_degenerate(left: usize, right: usize) -> bool {
    if left == 0 || right == 0 {
        return true;
    }
    let total = (left + right) as f64;
    (left as f64 / total).max(right as f64 / total) > MAX_SIDE_FRACTION
}

fn update_mean(mean: &mut [f32], count: f32, item: &[f32], renormalize: bool) {
    // Angular centroids accumulate directions, not magnitudes.
    let scale = if renormalize {
        let n = metric::norm(item);
        if n > 0.0 { 1.0 / n } else { 0.0 }
    } else {
        1.0
    };
    for (m, x) in mean.iter_mut().zip(item) {
        *m = (*m * count + x * scale) / (count + 1.0);
    }
    if renormalize {
        metric::normalize(mean);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::VectorStore;

    fn frozen_store(metric: Metric, dimension: usize, items: usize, seed: u64) -> FrozenStore {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut store = VectorStore::new(dimension, metric);
        for id in 0..items {
            let v: Vec<f32> = (0..dimension)
                .map(|_| {
                    if metric.is_binary() {
                        if rng.random::<bool>() { 1.0 } else { 0.0 }
                    } else {
                        rng.random_range(-1.0f32..1.0)
                    }
                })
                .collect();
            store.add(id as i64, &v).unwrap();
        }
        store.freeze()
    }

    fn leaf_items(arena: &TreeArena) -> Vec<u32> {
        let mut collected = Vec::new();
        for node in &arena.nodes {
            if let TreeNode::Leaf { items } = node {
                collected.extend_from_slice(items);
            }
        }
        collected
    }

    #[test]
    fn test_every_item_lands_in_a_leaf() {
        for metric in [Metric::Euclidean, Metric::Angular, Metric::Hamming] {
            let store = frozen_store(metric, 8, 300, 42);
            let builder = TreeBuilder::new(&store);
            let arena = builder.build_tree(0, 7);
            let mut slots = leaf_items(&arena);
            slots.sort_unstable();
            slots.dedup();
            assert_eq!(slots.len(), 300, "metric {metric} lost items");
        }
    }

    #[test]
    fn test_leaves_respect_capacity() {
        let store = frozen_store(Metric::Euclidean, 8, 500, 1);
        let builder = TreeBuilder::new(&store);
        let arena = builder.build_tree(0, 1);
        let cap = leaf_capacity(false, 8);
        for node in &arena.nodes {
            if let TreeNode::Leaf { items } = node {
                assert!(items.len() <= cap);
            }
        }
    }

    #[test]
    fn test_identical_vectors_terminate_via_fallback() {
        let mut store = VectorStore::new(4, Metric::Euclidean);
        for id in 0..100 {
            store.add(id, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        }
        let frozen = store.freeze();
        let builder = TreeBuilder::new(&frozen);
        let arena = builder.build_tree(0, 9);
        let mut slots = leaf_items(&arena);
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots.len(), 100);
    }

    #[test]
    fn test_same_seed_same_tree() {
        let store = frozen_store(Metric::Angular, 6, 200, 3);
        let builder = TreeBuilder::new(&store);
        let a = builder.build_tree(5, 99);
        let b = builder.build_tree(5, 99);
        assert_eq!(a.root, b.root);
        assert_eq!(a.nodes.len(), b.nodes.len());
        assert_eq!(leaf_items(&a), leaf_items(&b));
    }

    #[test]
    fn test_forest_order_is_stable_across_workers() {
        let store = frozen_store(Metric::Euclidean, 8, 200, 11);
        let serial = build_forest(&store, 4, 123, None);
        let pool = create_worker_pool(4).unwrap();
        let parallel = build_forest(&store, 4, 123, pool.as_ref());
        for (a, b) in serial.iter().zip(&parallel) {
            assert_eq!(a.nodes.len(), b.nodes.len());
            assert_eq!(leaf_items(a), leaf_items(b));
        }
    }
}
