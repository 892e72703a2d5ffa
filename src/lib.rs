//! # Taxus
//!
//! An approximate nearest-neighbor (ANN) search library for Rust, built
//! on a forest of random-projection trees with memory-mappable indexes.
//!
//! ## Features
//!
//! - Euclidean, Manhattan, Angular, Dot-product, and Hamming metrics
//! - Forest of independently randomized partition trees
//! - Best-first forest search with exact re-ranking
//! - Parallel builds across a configurable worker pool
//! - Single-blob binary index format, shareable across processes via mmap
//!
//! ## Example
//!
//! ```
//! use taxus::{BuildParams, Metric, SearchParams, TaxusIndex};
//!
//! # fn example() -> taxus::Result<()> {
//! let mut index = TaxusIndex::new(4, Metric::Angular)?;
//! index.add_item(0, &[1.0, 0.0, 0.0, 0.0])?;
//! index.add_item(1, &[0.0, 1.0, 0.0, 0.0])?;
//! index.add_item(2, &[1.0, 0.1, 0.0, 0.0])?;
//! index.build(BuildParams::new(8).seed(7))?;
//!
//! let neighbors = index.nns_by_vector(&[1.0, 0.0, 0.0, 0.0], 2, &SearchParams::default())?;
//! assert_eq!(neighbors[0].id, 0);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

// Core modules
mod error;
mod index;
mod metric;
mod search;
mod storage;
mod store;
mod tree;

// Re-exports for the public API
pub use error::{Result, TaxusError};
pub use index::{BuildParams, Neighbor, SearchParams, TaxusIndex};
pub use metric::Metric;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
