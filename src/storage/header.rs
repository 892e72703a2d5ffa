//! Fixed-width index file header.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Result, TaxusError};
use crate::metric::Metric;

/// Magic marker at offset 0 of every index file.
pub(crate) const MAGIC: u32 = u32::from_le_bytes(*b"TAXS");

/// On-disk format version.
pub(crate) const FORMAT_VERSION: u32 = 1;

/// Total header size in bytes.
pub(crate) const HEADER_LEN: usize = 64;

/// Set when external ids are exactly `0..item_count`; the id table block
/// is omitted and lookups are the identity.
pub(crate) const FLAG_CONTIGUOUS_IDS: u32 = 1;

const CRC_OFFSET: usize = 60;

/// Decoded header fields. Block offsets are derived, in file order:
/// header, id table, vector block, aux block, tree table, node regions.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    pub(crate) dimension: u32,
    pub(crate) metric: Metric,
    pub(crate) item_count: u64,
    pub(crate) tree_count: u32,
    pub(crate) node_size: u32,
    pub(crate) vector_block_len: u64,
    pub(crate) aux_block_len: u64,
    pub(crate) id_block_len: u64,
    pub(crate) flags: u32,
}

impl Header {
    pub(crate) fn contiguous_ids(&self) -> bool {
        self.flags & FLAG_CONTIGUOUS_IDS != 0
    }

    pub(crate) fn id_table_offset(&self) -> usize {
        HEADER_LEN
    }

    pub(crate) fn vector_block_offset(&self) -> usize {
        HEADER_LEN + self.id_block_len as usize
    }

    pub(crate) fn aux_block_offset(&self) -> usize {
        self.vector_block_offset() + self.vector_block_len as usize
    }

    pub(crate) fn tree_table_offset(&self) -> usize {
        self.aux_block_offset() + self.aux_block_len as usize
    }

    pub(crate) fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        LittleEndian::write_u32(&mut buf[0..], MAGIC);
        LittleEndian::write_u32(&mut buf[4..], FORMAT_VERSION);
        LittleEndian::write_u32(&mut buf[8..], self.dimension);
        LittleEndian::write_u32(&mut buf[12..], self.metric.code());
        LittleEndian::write_u64(&mut buf[16..], self.item_count);
        LittleEndian::write_u32(&mut buf[24..], self.tree_count);
        LittleEndian::write_u32(&mut buf[28..], self.node_size);
        LittleEndian::write_u64(&mut buf[32..], self.vector_block_len);
        LittleEndian::write_u64(&mut buf[40..], self.aux_block_len);
        LittleEndian::write_u64(&mut buf[48..], self.id_block_len);
        LittleEndian::write_u32(&mut buf[56..], self.flags);
        let crc = crc32fast::hash(&buf[..CRC_OFFSET]);
        LittleEndian::write_u32(&mut buf[CRC_OFFSET..], crc);
        buf
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Header> {
        if bytes.len() < HEADER_LEN {
            return Err(TaxusError::corrupt(format!(
                "file too small for header: {} bytes",
                bytes.len()
            )));
        }
        let magic = LittleEndian::read_u32(&bytes[0..]);
        if magic != MAGIC {
            return Err(TaxusError::corrupt(format!("bad magic marker 0x{magic:08x}")));
        }
        let version = LittleEndian::read_u32(&bytes[4..]);
        if version != FORMAT_VERSION {
            return Err(TaxusError::corrupt(format!(
                "unsupported format version {version}"
            )));
        }
        let stored_crc = LittleEndian::read_u32(&bytes[CRC_OFFSET..]);
        let crc = crc32fast::hash(&bytes[..CRC_OFFSET]);
        if stored_crc != crc {
            return Err(TaxusError::corrupt("header checksum mismatch"));
        }
        let dimension = LittleEndian::read_u32(&bytes[8..]);
        if dimension == 0 {
            return Err(TaxusError::corrupt("zero dimensionality"));
        }
        let metric_code = LittleEndian::read_u32(&bytes[12..]);
        let metric = Metric::from_code(metric_code).ok_or_else(|| {
            TaxusError::corrupt(format!("unknown metric code {metric_code}"))
        })?;
        Ok(Header {
            dimension,
            metric,
            item_count: LittleEndian::read_u64(&bytes[16..]),
            tree_count: LittleEndian::read_u32(&bytes[24..]),
            node_size: LittleEndian::read_u32(&bytes[28..]),
            vector_block_len: LittleEndian::read_u64(&bytes[32..]),
            aux_block_len: LittleEndian::read_u64(&bytes[40..]),
            id_block_len: LittleEndian::read_u64(&bytes[48..]),
            flags: LittleEndian::read_u32(&bytes[56..]),
        })
    }
}
