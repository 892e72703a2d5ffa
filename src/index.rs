//! The public index type: lifecycle, build orchestration, and queries.
//!
//! An index moves through four states: *building* (mutable, accepts
//! items), *built* (immutable and queryable, backed by the encoded heap
//! blob), *loaded* (same content backed by a read-only file mapping), and
//! *unloaded* (backing storage released, every query fails). A built
//! index never reverts to building.
//!
//! Queries take `&self` and touch no shared mutable state, so a built or
//! loaded index can serve any number of threads concurrently; `unload`
//! takes `&mut self`, which makes "no queries in flight at unmap time" a
//! compile-time guarantee rather than a documented precondition.

use std::path::Path;

use ahash::AHashMap;
use log::info;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TaxusError};
use crate::metric::{Metric, hamming};
use crate::search::{self, QueryVector};
use crate::storage::header::Header;
use crate::storage::layout::{self, IndexView};
use crate::storage::{self, IndexData};
use crate::store::VectorStore;
use crate::tree::builder;

/// Parameters for [`TaxusIndex::build`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildParams {
    /// Number of trees in the forest. More trees raise recall at the cost
    /// of a larger index and slower build.
    pub trees: usize,
    /// Worker threads for the build phase.
    pub workers: usize,
    /// Fixed seed for reproducible forests. Without one, each build draws
    /// a fresh seed.
    pub seed: Option<u64>,
}

impl BuildParams {
    /// Build `trees` trees on a single worker.
    pub fn new(trees: usize) -> Self {
        Self {
            trees,
            workers: 1,
            seed: None,
        }
    }

    /// Set the worker thread count.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Use one worker per available CPU core.
    pub fn all_workers(mut self) -> Self {
        self.workers = num_cpus::get();
        self
    }

    /// Fix the random seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.trees == 0 {
            return Err(TaxusError::invalid_argument("tree count must be positive"));
        }
        if self.workers == 0 {
            return Err(TaxusError::invalid_argument(
                "worker count must be positive",
            ));
        }
        Ok(())
    }
}

/// Parameters for nearest-neighbor queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchParams {
    /// Number of candidates to gather before exact re-ranking. Larger
    /// values trade speed for accuracy. Defaults to `k * n_trees`.
    pub search_k: Option<usize>,
    /// Whether [`TaxusIndex::nns_by_item`] may return the query item
    /// itself. Defaults to true.
    pub include_self: bool,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            search_k: None,
            include_self: true,
        }
    }
}

/// One query result: an item id and its distance to the query point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub id: i64,
    pub distance: f32,
}

/// An approximate nearest-neighbor index over fixed-dimensionality
/// vectors.
///
/// # Example
///
/// ```
/// use taxus::{BuildParams, Metric, SearchParams, TaxusIndex};
///
/// # fn example() -> taxus::Result<()> {
/// let mut index = TaxusIndex::new(3, Metric::Euclidean)?;
/// index.add_item(0, &[1.0, 0.0, 0.0])?;
/// index.add_item(1, &[0.0, 1.0, 0.0])?;
/// index.add_item(2, &[0.9, 0.1, 0.0])?;
/// index.build(BuildParams::new(4).seed(42))?;
///
/// let neighbors = index.nns_by_item(0, 2, &SearchParams::default())?;
/// assert_eq!(neighbors[0].id, 0);
/// # Ok(())
/// # }
/// # example().unwrap();
/// ```
#[derive(Debug)]
pub struct TaxusIndex {
    dimension: usize,
    metric: Metric,
    state: State,
}

#[derive(Debug)]
enum State {
    Building(VectorStore),
    Ready(Forest),
    Unloaded,
}

/// A built or loaded forest: the encoded bytes plus the id lookup.
#[derive(Debug)]
struct Forest {
    data: IndexData,
    header: Header,
    lookup: IdLookup,
}

#[derive(Debug)]
enum IdLookup {
    /// External ids are exactly `0..item_count`.
    Identity,
    Map(AHashMap<i64, u32>),
}

impl Forest {
    fn new(data: IndexData, header: Header) -> Self {
        let lookup = if header.contiguous_ids() {
            IdLookup::Identity
        } else {
            let view = IndexView::new(data.bytes(), &header);
            let mut map = AHashMap::with_capacity(header.item_count as usize);
            for slot in 0..header.item_count as u32 {
                map.insert(view.external_id(slot), slot);
            }
            IdLookup::Map(map)
        };
        Self {
            data,
            header,
            lookup,
        }
    }

    fn view(&self) -> IndexView<'_> {
        IndexView::new(self.data.bytes(), &self.header)
    }

    fn slot_of(&self, id: i64) -> Result<u32> {
        if id < 0 {
            return Err(TaxusError::InvalidId(id));
        }
        match &self.lookup {
            IdLookup::Identity if (id as u64) < self.header.item_count => Ok(id as u32),
            IdLookup::Identity => Err(TaxusError::NotFound(id)),
            IdLookup::Map(map) => map.get(&id).copied().ok_or(TaxusError::NotFound(id)),
        }
    }
}

impl TaxusIndex {
    /// Create an empty, unbuilt index for `dimension`-element vectors.
    pub fn new(dimension: usize, metric: Metric) -> Result<Self> {
        if dimension == 0 {
            return Err(TaxusError::invalid_argument(
                "dimensionality must be positive",
            ));
        }
        Ok(Self {
            dimension,
            metric,
            state: State::Building(VectorStore::new(dimension, metric)),
        })
    }

    /// The fixed vector dimensionality.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// The metric fixed at construction time.
    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Number of items currently stored.
    pub fn n_items(&self) -> usize {
        match &self.state {
            State::Building(store) => store.len(),
            State::Ready(forest) => forest.header.item_count as usize,
            State::Unloaded => 0,
        }
    }

    /// Number of trees in the built forest, 0 before `build`.
    pub fn n_trees(&self) -> usize {
        match &self.state {
            State::Ready(forest) => forest.header.tree_count as usize,
            _ => 0,
        }
    }

    /// Whether the index is built (or loaded) and queryable.
    pub fn is_built(&self) -> bool {
        matches!(self.state, State::Ready(_))
    }

    /// Store `vector` under `id`, growing storage as needed. Re-adding an
    /// existing id overwrites its vector.
    pub fn add_item(&mut self, id: i64, vector: &[f32]) -> Result<()> {
        match &mut self.state {
            State::Building(store) => store.add(id, vector),
            State::Ready(_) => Err(TaxusError::invalid_state(
                "items cannot be added to a built index",
            )),
            State::Unloaded => Err(TaxusError::Unloaded),
        }
    }

    /// Freeze the store and build the forest. After this call the index
    /// is immutable and queryable; building twice fails.
    pub fn build(&mut self, params: BuildParams) -> Result<()> {
        params.validate()?;
        let pool = builder::create_worker_pool(params.workers)?;
        let store = match std::mem::replace(&mut self.state, State::Unloaded) {
            State::Building(store) => store,
            State::Ready(forest) => {
                self.state = State::Ready(forest);
                return Err(TaxusError::build("index is already built"));
            }
            State::Unloaded => return Err(TaxusError::Unloaded),
        };
        if store.is_empty() {
            self.state = State::Building(store);
            return Err(TaxusError::build("cannot build an index with no items"));
        }

        let base_seed = params.seed.unwrap_or_else(|| rand::rng().random());
        info!(
            "building {} trees over {} items (f={}, metric={}, workers={})",
            params.trees,
            store.len(),
            self.dimension,
            self.metric,
            params.workers,
        );
        let frozen = store.freeze();
        let trees = builder::build_forest(&frozen, params.trees, base_seed, pool.as_ref());
        let bytes = layout::encode_index(&frozen, &trees);
        // The encoder's output passes the loader's validation; checking it
        // here means heap-backed and mapped indexes share one entry path.
        let header = layout::validate(&bytes)?;
        self.state = State::Ready(Forest::new(IndexData::Heap(bytes), header));
        Ok(())
    }

    /// Write the built index to `path` as one contiguous binary blob. The
    /// index stays queryable.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let forest = self.forest()?;
        storage::write_index(path.as_ref(), forest.data.bytes())
    }

    /// Memory-map an index file written by [`TaxusIndex::save`].
    ///
    /// With `prefault` set, the mapping is populated eagerly instead of
    /// faulting pages in on first access.
    pub fn load(path: impl AsRef<Path>, prefault: bool) -> Result<Self> {
        let (data, header) = storage::read_index(path.as_ref(), prefault)?;
        let dimension = header.dimension as usize;
        let metric = header.metric;
        Ok(Self {
            dimension,
            metric,
            state: State::Ready(Forest::new(data, header)),
        })
    }

    /// Release the backing storage (heap blob or file mapping). Every
    /// subsequent query on this handle fails with
    /// [`TaxusError::Unloaded`].
    pub fn unload(&mut self) {
        if self.is_built() {
            info!("unloading index ({} items)", self.n_items());
        }
        self.state = State::Unloaded;
    }

    /// The `k` nearest stored items to the stored item `id`.
    pub fn nns_by_item(&self, id: i64, k: usize, params: &SearchParams) -> Result<Vec<Neighbor>> {
        let forest = self.forest()?;
        let slot = forest.slot_of(id)?;
        let view = forest.view();
        let query = QueryVector::from_slot(&view, self.metric, slot);
        let exclude = if params.include_self { None } else { Some(slot) };
        self.ranked_neighbors(&view, &query, k, params.search_k, exclude)
    }

    /// The `k` nearest stored items to an arbitrary query point.
    pub fn nns_by_vector(
        &self,
        vector: &[f32],
        k: usize,
        params: &SearchParams,
    ) -> Result<Vec<Neighbor>> {
        let forest = self.forest()?;
        self.check_query_vector(vector)?;
        let view = forest.view();
        let query = QueryVector::from_components(self.metric, vector);
        self.ranked_neighbors(&view, &query, k, params.search_k, None)
    }

    /// A copy of the vector stored under `id`.
    pub fn item_vector(&self, id: i64) -> Result<Vec<f32>> {
        let forest = self.forest()?;
        let slot = forest.slot_of(id)?;
        let view = forest.view();
        if self.metric.is_binary() {
            Ok(hamming::unpack(view.word_vector(slot).iter(), self.dimension))
        } else {
            Ok(view.real_vector(slot).to_vec())
        }
    }

    /// The metric distance between two stored items.
    pub fn distance(&self, i: i64, j: i64) -> Result<f32> {
        let forest = self.forest()?;
        let a = forest.slot_of(i)?;
        let b = forest.slot_of(j)?;
        let view = forest.view();
        let query = QueryVector::from_slot(&view, self.metric, a);
        let d = search::item_distance(&view, self.metric, &query, b);
        Ok(self.metric.normalized_distance(d))
    }

    fn forest(&self) -> Result<&Forest> {
        match &self.state {
            State::Ready(forest) => Ok(forest),
            State::Building(_) => Err(TaxusError::NotBuilt),
            State::Unloaded => Err(TaxusError::Unloaded),
        }
    }

    fn check_query_vector(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(TaxusError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        if let Some(bad) = vector.iter().find(|v| !v.is_finite()) {
            return Err(TaxusError::invalid_argument(format!(
                "query vector contains non-finite component {bad}"
            )));
        }
        Ok(())
    }

    fn ranked_neighbors(
        &self,
        view: &IndexView<'_>,
        query: &QueryVector,
        k: usize,
        search_k: Option<usize>,
        exclude: Option<u32>,
    ) -> Result<Vec<Neighbor>> {
        let ranked = search::search(view, self.metric, query, k, search_k, exclude)?;
        Ok(ranked
            .into_iter()
            .map(|(slot, d)| Neighbor {
                id: view.external_id(slot),
                distance: self.metric.normalized_distance(d),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_built_index() -> TaxusIndex {
        let mut index = TaxusIndex::new(2, Metric::Euclidean).unwrap();
        index.add_item(0, &[0.0, 0.0]).unwrap();
        index.add_item(1, &[1.0, 0.0]).unwrap();
        index.add_item(2, &[5.0, 0.0]).unwrap();
        index.build(BuildParams::new(2).seed(1)).unwrap();
        index
    }

    #[test]
    fn test_zero_dimension_rejected() {
        assert!(matches!(
            TaxusIndex::new(0, Metric::Euclidean),
            Err(TaxusError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_lifecycle_counts() {
        let index = small_built_index();
        assert_eq!(index.n_items(), 3);
        assert_eq!(index.n_trees(), 2);
        assert!(index.is_built());
    }

    #[test]
    fn test_add_after_build_is_invalid_state() {
        let mut index = small_built_index();
        assert!(matches!(
            index.add_item(9, &[0.0, 0.0]),
            Err(TaxusError::InvalidState(_))
        ));
    }

    #[test]
    fn test_query_before_build_is_not_built() {
        let mut index = TaxusIndex::new(2, Metric::Euclidean).unwrap();
        index.add_item(0, &[0.0, 0.0]).unwrap();
        assert!(matches!(
            index.nns_by_item(0, 1, &SearchParams::default()),
            Err(TaxusError::NotBuilt)
        ));
        assert!(matches!(
            index.item_vector(0),
            Err(TaxusError::NotBuilt)
        ));
        assert!(matches!(
            index.distance(0, 0),
            Err(TaxusError::NotBuilt)
        ));
    }

    #[test]
    fn test_unloaded_queries_fail() {
        let mut index = small_built_index();
        index.unload();
        assert!(matches!(
            index.nns_by_item(0, 1, &SearchParams::default()),
            Err(TaxusError::Unloaded)
        ));
        assert!(matches!(
            index.add_item(9, &[0.0, 0.0]),
            Err(TaxusError::Unloaded)
        ));
        assert_eq!(index.n_items(), 0);
    }

    #[test]
    fn test_invalid_build_params() {
        let mut index = TaxusIndex::new(2, Metric::Euclidean).unwrap();
        index.add_item(0, &[0.0, 0.0]).unwrap();
        assert!(matches!(
            index.build(BuildParams::new(0)),
            Err(TaxusError::InvalidArgument(_))
        ));
        assert!(matches!(
            index.build(BuildParams::new(1).workers(0)),
            Err(TaxusError::InvalidArgument(_))
        ));
        // The failed attempts must not have consumed the store.
        index.build(BuildParams::new(1)).unwrap();
    }

    #[test]
    fn test_empty_build_fails_and_store_survives() {
        let mut index = TaxusIndex::new(2, Metric::Euclidean).unwrap();
        assert!(matches!(
            index.build(BuildParams::new(1)),
            Err(TaxusError::Build(_))
        ));
        index.add_item(0, &[1.0, 1.0]).unwrap();
        index.build(BuildParams::new(1)).unwrap();
    }
}
