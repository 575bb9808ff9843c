//! `CodeDigest` — fixed-size digest over a process's executable code.
//!
//! # Binary Form
//!
//! 32 bytes of SHA-256 output.
//!
//! # Text Form
//!
//! Lowercase hex, 64 characters. Used in the expected-digest artifact and
//! on the wire.
//!
//! # Combining
//!
//! When more than one in-bundle binary must be attested jointly, the
//! per-image digests are folded with [`CodeDigest::combine`]. The fold is
//! order-sensitive: `combine([A, B]) != combine([B, A])`. Both sides must
//! therefore combine in the same documented order (lexicographic image
//! path order, see [`crate::hasher::CodeHasher`]).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Size of a code digest in bytes.
pub const DIGEST_SIZE: usize = 32;

/// Domain separation prefix for digest combination.
const COMBINE_DOMAIN: &[u8] = b"covenant:combine:v1\0";

/// Errors parsing the text form of a digest.
#[derive(Debug, Error)]
pub enum DigestParseError {
    /// The hex string does not decode to exactly [`DIGEST_SIZE`] bytes.
    #[error("digest must be {expected} hex bytes, got {actual}")]
    WrongLength {
        /// Required byte length.
        expected: usize,
        /// Decoded byte length.
        actual: usize,
    },

    /// The string is not valid hex.
    #[error("digest is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// A 256-bit digest over executable code.
///
/// Equality is constant-time: digests are compared during attestation
/// verification and must not leak position-of-first-difference timing.
#[derive(Debug, Clone, Copy)]
pub struct CodeDigest([u8; DIGEST_SIZE]);

impl CodeDigest {
    /// Wrap raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; DIGEST_SIZE]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    /// Hash arbitrary content into a digest.
    #[must_use]
    pub fn of_content(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self(hasher.finalize().into())
    }

    /// Fold an ordered sequence of digests into one.
    ///
    /// Computes SHA-256 over a domain prefix followed by the concatenated
    /// digest bytes in the given order. An empty sequence yields the digest
    /// of the bare prefix.
    #[must_use]
    pub fn combine(digests: &[Self]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(COMBINE_DOMAIN);
        for digest in digests {
            hasher.update(digest.as_bytes());
        }
        Self(hasher.finalize().into())
    }

    /// Lowercase hex text form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl PartialEq for CodeDigest {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl Eq for CodeDigest {}

impl fmt::Display for CodeDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for CodeDigest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = hex::decode(s)?;
        let bytes: [u8; DIGEST_SIZE] =
            decoded
                .try_into()
                .map_err(|v: Vec<u8>| DigestParseError::WrongLength {
                    expected: DIGEST_SIZE,
                    actual: v.len(),
                })?;
        Ok(Self(bytes))
    }
}

impl Serialize for CodeDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for CodeDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
