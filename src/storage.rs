//! Binary index persistence and memory mapping.
//!
//! A built index is one contiguous little-endian blob (see [`layout`]).
//! `save` writes the blob verbatim; `load` validates and memory-maps it
//! read-only, so unrelated processes can share one index file through the
//! page cache without deserializing it.

pub(crate) mod header;
pub(crate) mod layout;

use std::fs::{self, File};
use std::path::Path;

use log::info;
use memmap2::{Mmap, MmapOptions};

use crate::error::Result;
use crate::storage::header::Header;

/// Backing bytes of a built index: freshly encoded heap memory, or a
/// read-only file mapping.
#[derive(Debug)]
pub(crate) enum IndexData {
    Heap(Vec<u8>),
    Mapped(Mmap),
}

impl IndexData {
    pub(crate) fn bytes(&self) -> &[u8] {
        match self {
            IndexData::Heap(bytes) => bytes,
            IndexData::Mapped(mmap) => mmap,
        }
    }
}

/// Write an encoded index to `path`.
pub(crate) fn write_index(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes)?;
    info!("saved index: {} bytes to {}", bytes.len(), path.display());
    Ok(())
}

/// Map an index file read-only and validate its layout.
pub(crate) fn read_index(path: &Path, prefault: bool) -> Result<(IndexData, Header)> {
    let file = File::open(path)?;
    let mut options = MmapOptions::new();
    if prefault {
        options.populate();
    }
    // Safety: the mapping is read-only and this crate never writes to an
    // index file while it is mapped; external mutation of a mapped file
    // is the caller's documented precondition.
    let mmap = unsafe { options.map(&file)? };
    let header = layout::validate(&mmap)?;
    info!(
        "loaded index from {}: {} items, {} trees, f={}, metric={}",
        path.display(),
        header.item_count,
        header.tree_count,
        header.dimension,
        header.metric,
    );
    Ok((IndexData::Mapped(mmap), header))
}
