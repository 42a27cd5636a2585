//! Kiln Core Types
//!
//! This crate contains pure types and logic with no I/O.
//! Digests and input frames are byte-stable across platforms and processes.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod digest;
pub mod error;
pub mod frame;
pub mod id;

// Re-exports
pub use digest::{Digest, DigestAlgorithm, Digester};
pub use error::{CoreError, CoreResult};
pub use frame::{CACHE_VERSION, DigestFrame};
pub use id::ActionId;
