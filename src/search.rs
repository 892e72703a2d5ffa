//! Best-first forest search and exact re-ranking.
//!
//! All trees share one max-priority queue keyed by branch "optimism": the
//! bound on how close an item beyond that branch could still be, carried
//! down as the running minimum of the margins along the path. Roots enter
//! at +inf so every tree is explored at least once; the far side of each
//! split is pushed rather than discarded, which is what lets the search
//! backtrack across trees. Collected candidates are deduplicated and then
//! re-ranked with the exact metric distance against the stored vectors.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use ahash::AHashSet;

use crate::error::Result;
use crate::metric::{self, Metric, angular, dot, euclidean, hamming, manhattan};
use crate::storage::layout::{IndexView, NodeView, SplitPayload};
use crate::tree::node::FALLBACK_BIT;

/// A query point in the metric's native representation.
#[derive(Debug, Clone)]
pub(crate) enum QueryVector {
    Real { values: Vec<f32>, norm: f32 },
    Bits(Vec<u64>),
}

impl QueryVector {
    /// Build a query from caller-supplied components. The index layer has
    /// already checked dimensionality and finiteness.
    pub(crate) fn from_components(metric: Metric, vector: &[f32]) -> Self {
        if metric.is_binary() {
            QueryVector::Bits(hamming::pack(vector))
        } else {
            let values = vector.to_vec();
            let norm = if metric.needs_norms() {
                metric::norm(&values)
            } else {
                0.0
            };
            QueryVector::Real { values, norm }
        }
    }

    /// Build a query from a stored item.
    pub(crate) fn from_slot(view: &IndexView<'_>, metric: Metric, slot: u32) -> Self {
        if metric.is_binary() {
            QueryVector::Bits(view.word_vector(slot).iter().collect())
        } else {
            QueryVector::Real {
                values: view.real_vector(slot).to_vec(),
                norm: if metric.needs_norms() {
                    view.norm(slot)
                } else {
                    0.0
                },
            }
        }
    }
}

/// Internal (ranking) distance from the query to a stored item.
pub(crate) fn item_distance(
    view: &IndexView<'_>,
    metric: Metric,
    query: &QueryVector,
    slot: u32,
) -> f32 {
    match query {
        QueryVector::Bits(words) => hamming::distance(words, view.word_vector(slot).iter()),
        QueryVector::Real { values, norm } => {
            let item = view.real_vector(slot);
            match metric {
                Metric::Angular => angular::from_parts(
                    metric::dot_product(values, item.iter()),
                    *norm,
                    view.norm(slot),
                ),
                Metric::Manhattan => manhattan::distance(values, item.iter()),
                Metric::Dot => dot::distance(values, item.iter()),
                // Euclidean; Hamming queries are always packed.
                _ => euclidean::distance(values, item.iter()),
            }
        }
    }
}

/// Signed margin of the query against a stored split.
fn query_margin(query: &QueryVector, payload: &SplitPayload<'_>) -> f32 {
    match (payload, query) {
        (SplitPayload::Plane { offset, normal }, QueryVector::Real { values, .. }) => {
            metric::plane_margin(*offset, normal.iter(), values)
        }
        (SplitPayload::Bit { index }, QueryVector::Bits(words)) => {
            if *index == FALLBACK_BIT {
                0.0
            } else if hamming::bit(words, *index as usize) {
                1.0
            } else {
                -1.0
            }
        }
        // Split payload and query representation are keyed by the same
        // metric, so mixed arms are unreachable on a validated index.
        _ => 0.0,
    }
}

/// An unexplored branch in the shared priority queue. Ordered by priority
/// alone; the heap is a max-heap, so the most optimistic branch pops first.
#[derive(Debug, Clone, Copy)]
struct BranchEntry {
    priority: f32,
    tree: u32,
    node: u32,
}

impl PartialEq for BranchEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for BranchEntry {}

impl PartialOrd for BranchEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BranchEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.total_cmp(&other.priority)
    }
}

/// Best-first traversal across all trees followed by exact re-ranking.
///
/// Returns up to `k` `(slot, internal_distance)` pairs sorted ascending by
/// distance, ties broken by ascending external id.
pub(crate) fn search(
    view: &IndexView<'_>,
    metric: Metric,
    query: &QueryVector,
    k: usize,
    search_k: Option<usize>,
    exclude: Option<u32>,
) -> Result<Vec<(u32, f32)>> {
    let tree_count = view.tree_count();
    let search_k = search_k
        .unwrap_or_else(|| k.saturating_mul(tree_count as usize))
        .max(k);

    let mut queue: BinaryHeap<BranchEntry> = (0..tree_count)
        .map(|t| BranchEntry {
            priority: f32::INFINITY,
            tree: t,
            node: view.tree(t).root,
        })
        .collect();

    let mut seen: AHashSet<u32> = AHashSet::new();
    let mut candidates: Vec<u32> =
        Vec::with_capacity(search_k.min(view.item_count() as usize));
    while candidates.len() < search_k {
        let Some(entry) = queue.pop() else { break };
        match view.tree(entry.tree).node(entry.node)? {
            NodeView::Leaf { items } => {
                for slot in items.iter() {
                    if seen.insert(slot) {
                        candidates.push(slot);
                    }
                }
            }
            NodeView::Split {
                left,
                right,
                payload,
            } => {
                let margin = query_margin(query, &payload);
                queue.push(BranchEntry {
                    priority: entry.priority.min(margin),
                    tree: entry.tree,
                    node: right,
                });
                queue.push(BranchEntry {
                    priority: entry.priority.min(-margin),
                    tree: entry.tree,
                    node: left,
                });
            }
        }
    }

    let mut ranked: Vec<(u32, f32)> = candidates
        .into_iter()
        .filter(|slot| Some(*slot) != exclude)
        .map(|slot| (slot, item_distance(view, metric, query, slot)))
        .collect();
    ranked.sort_unstable_by(|a, b| {
        a.1.total_cmp(&b.1)
            .then_with(|| view.external_id(a.0).cmp(&view.external_id(b.0)))
    });
    ranked.truncate(k);
    Ok(ranked)
}
