//! Content digests.
//!
//! A digest is written `algorithm:hex`, e.g. `sha256:9f86d0...`. SHA-256 is the
//! default; BLAKE3 digests are accepted from collaborators that produce them.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use std::fmt;
use std::io;
use std::str::FromStr;

/// Hash algorithm used for content addressing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// SHA-256 (default)
    Sha256,
    /// BLAKE3
    Blake3,
}

impl DigestAlgorithm {
    /// Length of the raw hash in bytes
    pub const HASH_LEN: usize = 32;

    /// Parse algorithm from string
    ///
    /// # Errors
    ///
    /// Returns error if algorithm is unknown
    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "sha256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            other => Err(CoreError::UnknownAlgorithm(other.to_string())),
        }
    }

    /// Get string representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Blake3 => "blake3",
        }
    }

    /// Start a streaming digester for this algorithm
    #[must_use]
    pub fn digester(self) -> Digester {
        Digester::new(self)
    }
}

impl Default for DigestAlgorithm {
    fn default() -> Self {
        Self::Sha256
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A content digest: algorithm plus lowercase hex of the raw hash.
///
/// Unset digests are modelled as `Option<Digest>` by callers; a `Digest` value
/// is always well-formed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl Digest {
    /// Build a digest from raw hash bytes
    #[must_use]
    pub fn from_raw(algorithm: DigestAlgorithm, raw: [u8; DigestAlgorithm::HASH_LEN]) -> Self {
        Self {
            algorithm,
            hex: hex::encode(raw),
        }
    }

    /// SHA-256 digest of `data`
    #[must_use]
    pub fn of_bytes(data: &[u8]) -> Self {
        Self::of_bytes_with(DigestAlgorithm::Sha256, data)
    }

    /// Digest of `data` with an explicit algorithm
    #[must_use]
    pub fn of_bytes_with(algorithm: DigestAlgorithm, data: &[u8]) -> Self {
        let mut digester = Digester::new(algorithm);
        digester.update(data);
        digester.finish()
    }

    /// Digest of the canonical JSON encoding of `value`.
    ///
    /// The value goes through `serde_json::Value` first so that map keys are
    /// emitted in sorted order regardless of the source container.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized
    pub fn of_json<T: Serialize + ?Sized>(value: &T) -> CoreResult<Self> {
        let canonical = serde_json::to_value(value)?;
        let encoded = serde_json::to_vec(&canonical)?;
        Ok(Self::of_bytes(&encoded))
    }

    /// Parse from `algorithm:hex`
    ///
    /// # Errors
    ///
    /// Returns error if the format, algorithm or hex is invalid
    pub fn parse(s: &str) -> CoreResult<Self> {
        let (algorithm, hex) = s.split_once(':').ok_or_else(|| CoreError::InvalidDigest {
            reason: format!("missing ':' in {s:?}"),
        })?;

        let algorithm = DigestAlgorithm::parse(algorithm)?;
        let raw = hex::decode(hex).map_err(|e| CoreError::InvalidDigest {
            reason: e.to_string(),
        })?;
        if raw.len() != DigestAlgorithm::HASH_LEN {
            return Err(CoreError::InvalidDigest {
                reason: format!("hash is {} bytes (expected 32)", raw.len()),
            });
        }

        Ok(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }

    /// Get algorithm
    #[must_use]
    pub const fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Get hex-encoded hash
    #[must_use]
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Check if digest addresses `data`
    #[must_use]
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::of_bytes_with(self.algorithm, data) == *self
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.to_string()
    }
}

/// Streaming digester; bytes written through it are hashed.
pub struct Digester {
    inner: DigesterInner,
}

enum DigesterInner {
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl Digester {
    /// Create a digester for `algorithm`
    #[must_use]
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        let inner = match algorithm {
            DigestAlgorithm::Sha256 => DigesterInner::Sha256(sha2::Sha256::new()),
            DigestAlgorithm::Blake3 => DigesterInner::Blake3(Box::new(blake3::Hasher::new())),
        };
        Self { inner }
    }

    /// Feed bytes
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            DigesterInner::Sha256(h) => h.update(data),
            DigesterInner::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// Finish and produce the digest
    #[must_use]
    pub fn finish(self) -> Digest {
        match self.inner {
            DigesterInner::Sha256(h) => Digest::from_raw(DigestAlgorithm::Sha256, h.finalize().into()),
            DigesterInner::Blake3(h) => {
                Digest::from_raw(DigestAlgorithm::Blake3, *h.finalize().as_bytes())
            }
        }
    }
}

impl Default for Digester {
    fn default() -> Self {
        Self::new(DigestAlgorithm::Sha256)
    }
}

impl io::Write for Digester {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
