//! Wire message shapes for the attestation exchange.
//!
//! # Exchange Sequence
//!
//! ```text
//! Initiator                                      Responder
//!    |                                               |
//!    | -- AttestationRequest { digest, sig,          |
//!    |      public_key, nonce } ------------------>  |
//!    |                                               |
//!    | <-- AttestationResponse { hash_valid,         |
//!    |      peer_digest, sig, public_key, nonce } -- |
//!    |                                               |
//! ```
//!
//! Both messages are transient, single-exchange values: never persisted,
//! never reused. Serialization is a tagged JSON envelope; transports carry
//! the resulting frames opaquely.
//!
//! # Signing Preimages
//!
//! - Request: `digest ‖ nonce`
//! - Response: `flag_byte ‖ peer_digest ‖ nonce` where the flag byte is
//!   `0x01` for valid and `0x00` for invalid
//!
//! The `timestamp_ms` fields are informational metadata only and are
//! deliberately excluded from both preimages: freshness rides solely on
//! the nonce.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::digest::{CodeDigest, DIGEST_SIZE};
use crate::keystore::PublicKeyBytes;

/// Size of a nonce in bytes.
pub const NONCE_SIZE: usize = 32;

/// Maximum encoded frame size (64 KiB).
///
/// Attestation frames are small; anything larger is rejected before
/// parsing to bound memory and CPU spent on unauthenticated input.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Codec failures for wire frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame exceeds [`MAX_FRAME_SIZE`]. Detected before parsing.
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The frame could not be serialized or deserialized.
    #[error("serialization error: {reason}")]
    Serialization {
        /// What failed.
        reason: String,
    },
}

/// A fresh random value binding a response to one exact exchange.
///
/// Generated per request, single-use, echoed verbatim by the peer inside
/// its signed payload. Equality is constant-time.
#[derive(Debug, Clone, Copy)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Generate a fresh random nonce from the operating system RNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap raw nonce bytes (deserialization only).
    #[must_use]
    pub const fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw nonce bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

impl PartialEq for Nonce {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl Eq for Nonce {}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for Nonce {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Nonce {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let decoded = hex::decode(&text).map_err(serde::de::Error::custom)?;
        let bytes: [u8; NONCE_SIZE] = decoded
            .try_into()
            .map_err(|_| serde::de::Error::custom("nonce must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

/// Challenge from initiator to responder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AttestationRequest {
    /// The initiator's own code digest.
    pub digest: CodeDigest,

    /// Signature over `digest ‖ nonce` by the initiator's key (hex).
    pub signature: String,

    /// The initiator's public key.
    pub public_key: PublicKeyBytes,

    /// Fresh single-use nonce for this exchange.
    pub nonce: Nonce,

    /// Informational send time (epoch milliseconds). Not signed.
    pub timestamp_ms: u64,
}

impl AttestationRequest {
    /// The bytes the request signature covers.
    #[must_use]
    pub fn signing_preimage(digest: &CodeDigest, nonce: &Nonce) -> Vec<u8> {
        let mut preimage = Vec::with_capacity(DIGEST_SIZE + NONCE_SIZE);
        preimage.extend_from_slice(digest.as_bytes());
        preimage.extend_from_slice(nonce.as_bytes());
        preimage
    }

    /// Decode the hex signature field.
    #[must_use]
    pub fn signature_bytes(&self) -> Option<Vec<u8>> {
        hex::decode(&self.signature).ok()
    }
}

/// Signed verdict from responder to initiator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AttestationResponse {
    /// Whether the responder judged the request valid (signature, identity
    /// and digest checks combined). Negative responses are still signed so
    /// the initiator can authenticate the rejection itself.
    pub hash_valid: bool,

    /// The responder's own code digest.
    pub peer_digest: CodeDigest,

    /// Signature over `flag ‖ peer_digest ‖ nonce` by the responder's key
    /// (hex).
    pub signature: String,

    /// The responder's public key.
    pub public_key: PublicKeyBytes,

    /// The request nonce, echoed verbatim.
    pub nonce: Nonce,

    /// Informational send time (epoch milliseconds). Not signed.
    pub timestamp_ms: u64,
}

impl AttestationResponse {
    /// The bytes the response signature covers.
    #[must_use]
    pub fn signing_preimage(hash_valid: bool, peer_digest: &CodeDigest, nonce: &Nonce) -> Vec<u8> {
        let mut preimage = Vec::with_capacity(1 + DIGEST_SIZE + NONCE_SIZE);
        preimage.push(u8::from(hash_valid));
        preimage.extend_from_slice(peer_digest.as_bytes());
        preimage.extend_from_slice(nonce.as_bytes());
        preimage
    }

    /// Decode the hex signature field.
    #[must_use]
    pub fn signature_bytes(&self) -> Option<Vec<u8>> {
        hex::decode(&self.signature).ok()
    }
}

/// Tagged envelope for frames on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttestationMessage {
    /// Initiator challenge.
    Request(AttestationRequest),

    /// Responder verdict.
    Response(AttestationResponse),
}

impl AttestationMessage {
    /// Serialize to a wire frame.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Serialization`] on encoding failure.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|e| CodecError::Serialization {
            reason: e.to_string(),
        })
    }

    /// Parse a wire frame with size validation.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::FrameTooLarge`] before any parsing when the
    /// frame exceeds [`MAX_FRAME_SIZE`], or [`CodecError::Serialization`]
    /// when the content is malformed.
    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        serde_json::from_slice(frame).map_err(|e| CodecError::Serialization {
            reason: e.to_string(),
        })
    }
}

impl From<AttestationRequest> for AttestationMessage {
    fn from(request: AttestationRequest) -> Self {
        Self::Request(request)
    }
}

impl From<AttestationResponse> for AttestationMessage {
    fn from(response: AttestationResponse) -> Self {
        Self::Response(response)
    }
}

/// Current time as epoch milliseconds (informational metadata only).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
