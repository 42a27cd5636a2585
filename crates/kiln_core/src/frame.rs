//! Deterministic input frames.
//!
//! A frame is the textual form hashed to produce an input digest:
//!
//! ```text
//! $V:1
//! Module:my_crate::images
//! Type:BuildImage
//! Version:0
//! Inputs{
//! base:sha256:...
//! platform:sha256:...
//! }
//! ```
//!
//! Entries are sorted before encoding, so two semantically-equal input sets
//! always produce byte-identical frames.

use crate::digest::{Digest, DigestAlgorithm, Digester};

/// Global cache format version. Bumping it invalidates every stored entry.
pub const CACHE_VERSION: u32 = 1;

/// Builder for a deterministic input frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestFrame {
    module_path: String,
    type_name: String,
    serial: i64,
    entries: Vec<(String, String)>,
}

impl DigestFrame {
    /// Start a frame for a producing type
    #[must_use]
    pub fn new(module_path: impl Into<String>, type_name: impl Into<String>, serial: i64) -> Self {
        Self {
            module_path: module_path.into(),
            type_name: type_name.into(),
            serial,
            entries: Vec::new(),
        }
    }

    /// Add a `name:digest` line
    pub fn entry(&mut self, name: impl Into<String>, digest: impl Into<String>) -> &mut Self {
        self.entries.push((name.into(), digest.into()));
        self
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the frame has no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode the frame text
    #[must_use]
    pub fn encode(&self) -> String {
        let mut sorted: Vec<&(String, String)> = self.entries.iter().collect();
        sorted.sort();

        let mut out = format!(
            "$V:{}\nModule:{}\nType:{}\nVersion:{}\nInputs{{\n",
            CACHE_VERSION, self.module_path, self.type_name, self.serial
        );
        for (name, digest) in sorted {
            out.push_str(name);
            out.push(':');
            out.push_str(digest);
            out.push('\n');
        }
        out.push_str("}\n");
        out
    }

    /// SHA-256 digest of the encoded frame
    #[must_use]
    pub fn digest(&self) -> Digest {
        let mut digester = Digester::new(DigestAlgorithm::Sha256);
        digester.update(self.encode().as_bytes());
        digester.finish()
    }
}
