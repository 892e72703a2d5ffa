//! Flat binary layout of a built forest and zero-copy views over it.
//!
//! The encoded blob is the index: a freshly built forest is encoded once
//! into heap bytes, `save` writes those bytes verbatim, and `load` maps
//! them back read-only. Every accessor resolves integer offsets into the
//! byte region, so a mapped file is queryable without a deserialization
//! pass and the same search code serves heap-backed and mapped indexes.
//!
//! Node records are fixed-size. Split records store the hyperplane (or a
//! bit index for binary metrics) plus two child indices into the tree's
//! own node array; leaf records store the item-slot list inline. Child
//! references are array indices rather than pointers, which keeps every
//! tree relocatable as-is.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Result, TaxusError};
use crate::metric::hamming;
use crate::storage::header::{FLAG_CONTIGUOUS_IDS, HEADER_LEN, Header};
use crate::store::{FrozenStore, VectorData};
use crate::tree::node::{FALLBACK_BIT, SplitPlane, TreeArena, TreeNode, leaf_capacity};

/// Node record tags.
const NODE_SPLIT: u32 = 0;
const NODE_LEAF: u32 = 1;

/// Tree table entry: node region offset (u64), node count (u32), root (u32).
pub(crate) const TREE_TABLE_ENTRY_LEN: usize = 16;

/// Round up to the next multiple of 8.
fn pad8(len: usize) -> usize {
    len.div_ceil(8) * 8
}

/// Fixed node record size for the given metric shape.
///
/// The record must hold the larger of a split (tag, children, hyperplane
/// payload) and a full inline leaf (tag, count, `leaf_capacity` slot ids).
pub(crate) fn node_record_size(binary: bool, dimension: usize) -> usize {
    let split = if binary { 16 } else { 16 + 4 * dimension };
    let leaf = 8 + 4 * leaf_capacity(binary, dimension);
    pad8(split.max(leaf))
}

/// Bytes occupied by one item's vector.
fn item_stride_bytes(binary: bool, dimension: usize) -> usize {
    if binary {
        hamming::words_per_item(dimension) * 8
    } else {
        dimension * 4
    }
}

/// Encode a frozen store and its finished trees into the flat layout.
pub(crate) fn encode_index(store: &FrozenStore, trees: &[TreeArena]) -> Vec<u8> {
    let binary = store.metric.is_binary();
    let node_size = node_record_size(binary, store.dimension);
    let n = store.len();

    let id_block_len = if store.contiguous { 0 } else { n * 8 };
    let vector_block_len = pad8(n * item_stride_bytes(binary, store.dimension));
    let aux_block_len = pad8(store.norms.len() * 4);
    let flags = if store.contiguous { FLAG_CONTIGUOUS_IDS } else { 0 };

    let header = Header {
        dimension: store.dimension as u32,
        metric: store.metric,
        item_count: n as u64,
        tree_count: trees.len() as u32,
        node_size: node_size as u32,
        vector_block_len: vector_block_len as u64,
        aux_block_len: aux_block_len as u64,
        id_block_len: id_block_len as u64,
        flags,
    };

    let tree_table_offset = header.tree_table_offset();
    let nodes_offset = tree_table_offset + trees.len() * TREE_TABLE_ENTRY_LEN;
    let total_nodes: usize = trees.iter().map(|t| t.nodes.len()).sum();
    let mut buf = Vec::with_capacity(nodes_offset + total_nodes * node_size);

    buf.extend_from_slice(&header.encode());

    if !store.contiguous {
        for id in &store.ids {
            buf.extend_from_slice(&id.to_le_bytes());
        }
    }

    match &store.data {
        VectorData::Real(values) => {
            for v in values {
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }
        VectorData::Bits(words) => {
            for w in words {
                buf.extend_from_slice(&w.to_le_bytes());
            }
        }
    }
    buf.resize(header.aux_block_offset(), 0);

    for norm in &store.norms {
        buf.extend_from_slice(&norm.to_le_bytes());
    }
    buf.resize(tree_table_offset, 0);

    let mut region = nodes_offset as u64;
    for tree in trees {
        buf.extend_from_slice(&region.to_le_bytes());
        buf.extend_from_slice(&(tree.nodes.len() as u32).to_le_bytes());
        buf.extend_from_slice(&tree.root.to_le_bytes());
        region += (tree.nodes.len() * node_size) as u64;
    }

    for tree in trees {
        for node in &tree.nodes {
            let start = buf.len();
            match node {
                TreeNode::Split { plane, left, right } => {
                    buf.extend_from_slice(&NODE_SPLIT.to_le_bytes());
                    buf.extend_from_slice(&left.to_le_bytes());
                    buf.extend_from_slice(&right.to_le_bytes());
                    match plane {
                        SplitPlane::Plane { normal, offset } => {
                            buf.extend_from_slice(&offset.to_le_bytes());
                            for x in normal {
                                buf.extend_from_slice(&x.to_le_bytes());
                            }
                        }
                        SplitPlane::Bit { index } => {
                            buf.extend_from_slice(&index.to_le_bytes());
                        }
                    }
                }
                TreeNode::Leaf { items } => {
                    buf.extend_from_slice(&NODE_LEAF.to_le_bytes());
                    buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
                    for slot in items {
                        buf.extend_from_slice(&slot.to_le_bytes());
                    }
                }
            }
            buf.resize(start + node_size, 0);
        }
    }
    buf
}

/// Structural validation of an encoded index. After this returns, every
/// view accessor with an in-range slot, tree, and node index stays inside
/// the byte region.
pub(crate) fn validate(bytes: &[u8]) -> Result<Header> {
    let header = Header::decode(bytes)?;
    let len = bytes.len() as u64;

    let n = header.item_count;
    if n == 0 {
        return Err(TaxusError::corrupt("empty item set"));
    }
    if n > u32::MAX as u64 {
        return Err(TaxusError::corrupt(format!("item count {n} out of range")));
    }
    if header.tree_count == 0 {
        return Err(TaxusError::corrupt("empty forest"));
    }

    let binary = header.metric.is_binary();
    let dimension = header.dimension as usize;
    let expected_vectors = n
        .checked_mul(item_stride_bytes(binary, dimension) as u64)
        .and_then(|b| b.checked_next_multiple_of(8));
    if expected_vectors != Some(header.vector_block_len) {
        return Err(TaxusError::corrupt("vector block length mismatch"));
    }
    let expected_aux = if header.metric.needs_norms() {
        pad8(n as usize * 4) as u64
    } else {
        0
    };
    if header.aux_block_len != expected_aux {
        return Err(TaxusError::corrupt("aux block length mismatch"));
    }
    let expected_ids = if header.contiguous_ids() { 0 } else { n * 8 };
    if header.id_block_len != expected_ids {
        return Err(TaxusError::corrupt("id table length mismatch"));
    }
    if header.node_size as usize != node_record_size(binary, dimension) {
        return Err(TaxusError::corrupt("node record size mismatch"));
    }

    let tree_table_end = (HEADER_LEN as u64)
        .checked_add(header.id_block_len)
        .and_then(|v| v.checked_add(header.vector_block_len))
        .and_then(|v| v.checked_add(header.aux_block_len))
        .and_then(|v| v.checked_add(header.tree_count as u64 * TREE_TABLE_ENTRY_LEN as u64))
        .ok_or_else(|| TaxusError::corrupt("block lengths overflow"))?;
    if tree_table_end > len {
        return Err(TaxusError::corrupt("truncated tree table"));
    }

    for t in 0..header.tree_count {
        let entry = header.tree_table_offset() + t as usize * TREE_TABLE_ENTRY_LEN;
        let region = LittleEndian::read_u64(&bytes[entry..]);
        let node_count = LittleEndian::read_u32(&bytes[entry + 8..]);
        let root = LittleEndian::read_u32(&bytes[entry + 12..]);
        if node_count == 0 || root >= node_count {
            return Err(TaxusError::corrupt(format!("tree {t} has invalid root")));
        }
        let region_end = region
            .checked_add(node_count as u64 * header.node_size as u64)
            .ok_or_else(|| TaxusError::corrupt(format!("tree {t} region overflow")))?;
        if region < tree_table_end || region_end > len {
            return Err(TaxusError::corrupt(format!("tree {t} region out of bounds")));
        }
    }
    Ok(header)
}

/// Zero-copy accessors over an encoded (heap or mapped) index.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IndexView<'a> {
    bytes: &'a [u8],
    header: &'a Header,
}

impl<'a> IndexView<'a> {
    pub(crate) fn new(bytes: &'a [u8], header: &'a Header) -> Self {
        Self { bytes, header }
    }

    pub(crate) fn item_count(&self) -> u32 {
        self.header.item_count as u32
    }

    pub(crate) fn tree_count(&self) -> u32 {
        self.header.tree_count
    }

    /// External id stored for a slot.
    pub(crate) fn external_id(&self, slot: u32) -> i64 {
        if self.header.contiguous_ids() {
            slot as i64
        } else {
            let off = self.header.id_table_offset() + slot as usize * 8;
            LittleEndian::read_i64(&self.bytes[off..])
        }
    }

    /// Dense components of the item in `slot`.
    pub(crate) fn real_vector(&self, slot: u32) -> FloatSlice<'a> {
        let stride = self.header.dimension as usize * 4;
        let off = self.header.vector_block_offset() + slot as usize * stride;
        FloatSlice(&self.bytes[off..off + stride])
    }

    /// Packed bit words of the item in `slot`.
    pub(crate) fn word_vector(&self, slot: u32) -> WordSlice<'a> {
        let stride = hamming::words_per_item(self.header.dimension as usize) * 8;
        let off = self.header.vector_block_offset() + slot as usize * stride;
        WordSlice(&self.bytes[off..off + stride])
    }

    /// Cached L2 norm of the item in `slot`.
    pub(crate) fn norm(&self, slot: u32) -> f32 {
        let off = self.header.aux_block_offset() + slot as usize * 4;
        LittleEndian::read_f32(&self.bytes[off..])
    }

    pub(crate) fn tree(&self, tree: u32) -> TreeView<'a> {
        let entry = self.header.tree_table_offset() + tree as usize * TREE_TABLE_ENTRY_LEN;
        TreeView {
            bytes: self.bytes,
            header: self.header,
            region: LittleEndian::read_u64(&self.bytes[entry..]) as usize,
            node_count: LittleEndian::read_u32(&self.bytes[entry + 8..]),
            root: LittleEndian::read_u32(&self.bytes[entry + 12..]),
        }
    }
}

/// One tree's node region.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TreeView<'a> {
    bytes: &'a [u8],
    header: &'a Header,
    region: usize,
    node_count: u32,
    pub(crate) root: u32,
}

impl<'a> TreeView<'a> {
    /// Decode the node record at `index`, validating its references.
    pub(crate) fn node(&self, index: u32) -> Result<NodeView<'a>> {
        if index >= self.node_count {
            return Err(TaxusError::corrupt(format!(
                "node index {index} out of range"
            )));
        }
        let node_size = self.header.node_size as usize;
        let off = self.region + index as usize * node_size;
        let record = &self.bytes[off..off + node_size];
        match LittleEndian::read_u32(record) {
            NODE_SPLIT => {
                let left = LittleEndian::read_u32(&record[4..]);
                let right = LittleEndian::read_u32(&record[8..]);
                if left >= self.node_count || right >= self.node_count {
                    return Err(TaxusError::corrupt("split child out of range"));
                }
                let payload = if self.header.metric.is_binary() {
                    let bit = LittleEndian::read_u32(&record[12..]);
                    if bit != FALLBACK_BIT && bit >= self.header.dimension {
                        return Err(TaxusError::corrupt("split bit out of range"));
                    }
                    SplitPayload::Bit { index: bit }
                } else {
                    let dim = self.header.dimension as usize;
                    SplitPayload::Plane {
                        offset: LittleEndian::read_f32(&record[12..]),
                        normal: FloatSlice(&record[16..16 + dim * 4]),
                    }
                };
                Ok(NodeView::Split {
                    left,
                    right,
                    payload,
                })
            }
            NODE_LEAF => {
                let count = LittleEndian::read_u32(&record[4..]) as usize;
                if 8 + count * 4 > node_size {
                    return Err(TaxusError::corrupt("leaf item list overflows record"));
                }
                let items = IdSlice(&record[8..8 + count * 4]);
                if items.iter().any(|slot| slot as u64 >= self.header.item_count) {
                    return Err(TaxusError::corrupt("leaf item slot out of range"));
                }
                Ok(NodeView::Leaf { items })
            }
            tag => Err(TaxusError::corrupt(format!("unknown node tag {tag}"))),
        }
    }
}

/// Decoded node record.
#[derive(Debug, Clone, Copy)]
pub(crate) enum NodeView<'a> {
    Split {
        left: u32,
        right: u32,
        payload: SplitPayload<'a>,
    },
    Leaf {
        items: IdSlice<'a>,
    },
}

/// Split payload: a hyperplane for dense metrics, a bit index for binary
/// ones. `FALLBACK_BIT` (and the zero normal) mark balanced fallback
/// splits whose margin is 0.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SplitPayload<'a> {
    Plane { offset: f32, normal: FloatSlice<'a> },
    Bit { index: u32 },
}

/// Little-endian `f32` array view.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FloatSlice<'a>(&'a [u8]);

impl<'a> FloatSlice<'a> {
    pub(crate) fn iter(self) -> impl Iterator<Item = f32> + 'a {
        self.0.chunks_exact(4).map(LittleEndian::read_f32)
    }

    pub(crate) fn to_vec(self) -> Vec<f32> {
        self.iter().collect()
    }
}

/// Little-endian `u64` array view.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WordSlice<'a>(&'a [u8]);

impl<'a> WordSlice<'a> {
    pub(crate) fn iter(self) -> impl Iterator<Item = u64> + 'a {
        self.0.chunks_exact(8).map(LittleEndian::read_u64)
    }
}

/// Little-endian `u32` array view.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IdSlice<'a>(&'a [u8]);

impl<'a> IdSlice<'a> {
    pub(crate) fn iter(self) -> impl Iterator<Item = u32> + 'a {
        self.0.chunks_exact(4).map(LittleEndian::read_u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Metric;
    use crate::store::VectorStore;
    use crate::tree::builder::TreeBuilder;

    fn encoded_sample() -> (Vec<u8>, Header) {
        let mut store = VectorStore::new(4, Metric::Euclidean);
        for id in 0..50i64 {
            let x = id as f32;
            store.add(id, &[x, -x, x * 0.5, 1.0]).unwrap();
        }
        let frozen = store.freeze();
        let builder = TreeBuilder::new(&frozen);
        let trees = vec![builder.build_tree(0, 42), builder.build_tree(1, 42)];
        let bytes = encode_index(&frozen, &trees);
        let header = validate(&bytes).unwrap();
        (bytes, header)
    }

    #[test]
    fn test_encode_validate_roundtrip() {
        let (bytes, header) = encoded_sample();
        assert_eq!(header.item_count, 50);
        assert_eq!(header.tree_count, 2);
        assert!(header.contiguous_ids());
        assert_eq!(header.id_block_len, 0);
        assert!(bytes.len() > HEADER_LEN);
    }

    #[test]
    fn test_vector_view_matches_input() {
        let (bytes, header) = encoded_sample();
        let view = IndexView::new(&bytes, &header);
        assert_eq!(view.real_vector(3).to_vec(), vec![3.0, -3.0, 1.5, 1.0]);
        assert_eq!(view.external_id(3), 3);
    }

    #[test]
    fn test_tree_walk_reaches_all_items() {
        let (bytes, header) = encoded_sample();
        let view = IndexView::new(&bytes, &header);
        let tree = view.tree(0);
        let mut stack = vec![tree.root];
        let mut slots = Vec::new();
        while let Some(index) = stack.pop() {
            match tree.node(index).unwrap() {
                NodeView::Split { left, right, .. } => {
                    stack.push(left);
                    stack.push(right);
                }
                NodeView::Leaf { items } => slots.extend(items.iter()),
            }
        }
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots.len(), 50);
    }

    #[test]
    fn test_sparse_ids_round_trip_through_table() {
        let mut store = VectorStore::new(2, Metric::Euclidean);
        store.add(100, &[1.0, 0.0]).unwrap();
        store.add(7, &[0.0, 1.0]).unwrap();
        let frozen = store.freeze();
        let builder = TreeBuilder::new(&frozen);
        let trees = vec![builder.build_tree(0, 1)];
        let bytes = encode_index(&frozen, &trees);
        let header = validate(&bytes).unwrap();
        assert!(!header.contiguous_ids());
        let view = IndexView::new(&bytes, &header);
        assert_eq!(view.external_id(0), 100);
        assert_eq!(view.external_id(1), 7);
    }

    #[test]
    fn test_truncated_file_rejected() {
        let (bytes, _) = encoded_sample();
        assert!(matches!(
            validate(&bytes[..bytes.len() - 16]),
            Err(TaxusError::CorruptFile(_))
        ));
    }

    #[test]
    fn test_norm_cache_present_for_angular() {
        let mut store = VectorStore::new(2, Metric::Angular);
        store.add(0, &[3.0, 4.0]).unwrap();
        store.add(1, &[1.0, 0.0]).unwrap();
        let frozen = store.freeze();
        let builder = TreeBuilder::new(&frozen);
        let trees = vec![builder.build_tree(0, 5)];
        let bytes = encode_index(&frozen, &trees);
        let header = validate(&bytes).unwrap();
        let view = IndexView::new(&bytes, &header);
        assert!((view.norm(0) - 5.0).abs() < 1e-6);
        assert!((view.norm(1) - 1.0).abs() < 1e-6);
    }
}
