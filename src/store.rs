//! Mutable pre-build vector storage.
//!
//! The store accepts items until `build()` freezes it. External ids are
//! stable `i64` values supplied by the caller; internally every item lives
//! in a dense `u32` slot so the tree builder and the binary layout can
//! address vectors by `slot * item_stride`. The external-id ↔ slot mapping
//! is frozen together with the vectors; the common contiguous-from-zero
//! case is detected at freeze time and needs no mapping table at all.

use ahash::AHashMap;

use crate::error::{Result, TaxusError};
use crate::metric::{self, Metric, hamming};

/// Raw vector components, either dense floats or packed bit words.
#[derive(Debug, Clone)]
pub(crate) enum VectorData {
    Real(Vec<f32>),
    Bits(Vec<u64>),
}

/// Append/overwrite-capable vector storage used before `build()`.
#[derive(Debug)]
pub(crate) struct VectorStore {
    dimension: usize,
    metric: Metric,
    /// Words per item for binary metrics, components per item otherwise.
    item_stride: usize,
    data: VectorData,
    /// Slot-ordered external ids.
    ids: Vec<i64>,
    slots: AHashMap<i64, u32>,
}

impl VectorStore {
    pub(crate) fn new(dimension: usize, metric: Metric) -> Self {
        let (item_stride, data) = if metric.is_binary() {
            (hamming::words_per_item(dimension), VectorData::Bits(Vec::new()))
        } else {
            (dimension, VectorData::Real(Vec::new()))
        };
        Self {
            dimension,
            metric,
            item_stride,
            data,
            ids: Vec::new(),
            slots: AHashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Store `vector` under `id`, growing storage as needed.
    ///
    /// Re-adding an existing id overwrites the previous vector.
    pub(crate) fn add(&mut self, id: i64, vector: &[f32]) -> Result<()> {
        if id < 0 {
            return Err(TaxusError::InvalidId(id));
        }
        if vector.len() != self.dimension {
            return Err(TaxusError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        if let Some(bad) = vector.iter().find(|v| !v.is_finite()) {
            return Err(TaxusError::invalid_argument(format!(
                "vector for item {id} contains non-finite component {bad}"
            )));
        }

        let slot = match self.slots.get(&id) {
            Some(slot) => *slot as usize,
            None => {
                if self.ids.len() == u32::MAX as usize {
                    return Err(TaxusError::invalid_argument(
                        "index is full: slot capacity exhausted",
                    ));
                }
                let slot = self.ids.len();
                self.slots.insert(id, slot as u32);
                self.ids.push(id);
                match &mut self.data {
                    VectorData::Real(values) => values.resize(values.len() + self.item_stride, 0.0),
                    VectorData::Bits(words) => words.resize(words.len() + self.item_stride, 0),
                }
                slot
            }
        };

        let start = slot * self.item_stride;
        match &mut self.data {
            VectorData::Real(values) => {
                values[start..start + self.item_stride].copy_from_slice(vector);
            }
            VectorData::Bits(words) => {
                words[start..start + self.item_stride].copy_from_slice(&hamming::pack(vector));
            }
        }
        Ok(())
    }

    /// Freeze the store into its immutable build-time form.
    pub(crate) fn freeze(self) -> FrozenStore {
        let norms = match (&self.data, self.metric.needs_norms()) {
            (VectorData::Real(values), true) => values
                .chunks_exact(self.item_stride)
                .map(metric::norm)
                .collect(),
            _ => Vec::new(),
        };
        let contiguous = self
            .ids
            .iter()
            .enumerate()
            .all(|(slot, id)| *id == slot as i64);
        FrozenStore {
            dimension: self.dimension,
            metric: self.metric,
            item_stride: self.item_stride,
            data: self.data,
            norms,
            contiguous,
            ids: self.ids,
        }
    }
}

/// Immutable snapshot of the store consumed by the tree builder and the
/// layout encoder.
#[derive(Debug)]
pub(crate) struct FrozenStore {
    pub(crate) dimension: usize,
    pub(crate) metric: Metric,
    pub(crate) item_stride: usize,
    pub(crate) data: VectorData,
    /// Per-item L2 norms; empty unless the metric caches them.
    pub(crate) norms: Vec<f32>,
    /// True when external ids are exactly `0..len`.
    pub(crate) contiguous: bool,
    pub(crate) ids: Vec<i64>,
}

impl FrozenStore {
    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }

    /// Dense components of the item in `slot`. Panics for binary metrics.
    pub(crate) fn real(&self, slot: u32) -> &[f32] {
        let start = slot as usize * self.item_stride;
        match &self.data {
            VectorData::Real(values) => &values[start..start + self.item_stride],
            VectorData::Bits(_) => unreachable!("real() on a binary store"),
        }
    }

    /// Packed words of the item in `slot`. Panics for dense metrics.
    pub(crate) fn words(&self, slot: u32) -> &[u64] {
        let start = slot as usize * self.item_stride;
        match &self.data {
            VectorData::Bits(words) => &words[start..start + self.item_stride],
            VectorData::Real(_) => unreachable!("words() on a dense store"),
        }
    }
}
