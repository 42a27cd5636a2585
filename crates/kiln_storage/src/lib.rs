//! Kiln Storage
//!
//! Content-addressed blob cache plus an index mapping input digests
//! ("pointers") to output digests. The compute engine consumes it through
//! the [`Cache`] trait and never depends on the physical layout.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod config;
pub mod error;
pub mod local;
pub mod memory;

pub use cache::{BlobReader, Cache, CachedOutput, CachedOutputDebug};
pub use config::CacheConfig;
pub use error::{StoreError, StoreResult};
pub use local::{LocalCache, prune};
pub use memory::{MemoryCache, MemoryCacheStats};
