//! Error taxonomy for the attestation engine.
//!
//! # Error Classification
//!
//! - [`KeyError`] / [`StoreError`]: bootstrap-surface failures (key
//!   generation, registry access). These are setup faults, not security
//!   verdicts, and propagate to the caller for remediation.
//! - [`ProtocolError`]: verification anomalies observed during an exchange.
//!   These never cross the API boundary during an attestation; the engine
//!   collapses them into a fail-closed [`crate::engine::ValidationOutcome`]
//!   and records the detail in its own logs only. Distinguishing "signature
//!   invalid" from "timed out" to an attacker-observable caller would leak
//!   information useful for attack refinement.
//! - [`TransportError`]: delivery failures of the opaque channel. Only
//!   `NotConfigured` is reported distinctly (as `Error`); everything else
//!   collapses into the timeout path.
//! - [`ConfigError`]: fatal at startup. A responder without an expected
//!   digest cannot function and must never default to "always valid".

use std::path::PathBuf;

use thiserror::Error;

/// Failures of the key provider capability interface.
///
/// Surfaced during bootstrap (key generation, initial exchange setup).
/// These are remediable setup faults, not attestation verdicts.
#[derive(Debug, Error)]
pub enum KeyError {
    /// A key pair already exists under the requested tag.
    ///
    /// At most one live key pair may exist per tag; regenerate only after
    /// explicit revocation via `delete_key_pair`.
    #[error("key pair already exists for tag {tag:?}")]
    AlreadyExists {
        /// The tag that is already occupied.
        tag: String,
    },

    /// No key pair exists under the requested tag.
    #[error("no key pair found for tag {tag:?}")]
    KeyNotFound {
        /// The tag that was requested.
        tag: String,
    },

    /// Neither the hardware-backed nor the software path can service the
    /// request on this host.
    #[error("no usable key provider: {reason}")]
    ProviderUnavailable {
        /// Why no provider could be selected.
        reason: String,
    },

    /// The provider accepted the request but the signing operation failed.
    #[error("signing failed for tag {tag:?}: {reason}")]
    SigningFailed {
        /// The tag whose key was used.
        tag: String,
        /// Provider-reported failure detail.
        reason: String,
    },

    /// Persistence of software-fallback key material failed.
    #[error("key storage failure: {reason}")]
    Storage {
        /// Underlying storage failure detail.
        reason: String,
    },
}

impl KeyError {
    /// Create an `AlreadyExists` error for `tag`.
    #[must_use]
    pub fn already_exists(tag: impl Into<String>) -> Self {
        Self::AlreadyExists { tag: tag.into() }
    }

    /// Create a `KeyNotFound` error for `tag`.
    #[must_use]
    pub fn not_found(tag: impl Into<String>) -> Self {
        Self::KeyNotFound { tag: tag.into() }
    }

    /// Create a `ProviderUnavailable` error.
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a `SigningFailed` error.
    #[must_use]
    pub fn signing_failed(tag: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SigningFailed {
            tag: tag.into(),
            reason: reason.into(),
        }
    }
}

/// Failures of the durable identity registry.
///
/// Write failures surface here and are never silently dropped.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The registry file or its directory refused access.
    #[error("registry access denied: {reason}")]
    AccessDenied {
        /// Underlying permission failure detail.
        reason: String,
    },

    /// The registry exists but its content is unreadable or inconsistent.
    #[error("registry storage corrupted: {reason}")]
    StorageCorrupted {
        /// Underlying corruption detail.
        reason: String,
    },
}

/// Verification anomalies observed during an attestation exchange.
///
/// Internal only: the engine logs these and collapses them into the
/// fail-closed outcome. They are deliberately never exposed on the wire or
/// through the outcome type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A message signature did not verify against the presented key.
    #[error("message signature invalid")]
    SignatureInvalid,

    /// The echoed nonce does not match the one generated for this exchange.
    ///
    /// Evidence of replay: a captured response is being presented against a
    /// fresh request.
    #[error("nonce mismatch (possible replay)")]
    NonceMismatch,

    /// The presented public key differs from the one recorded for the peer.
    ///
    /// Evidence of identity substitution, not a transient error: a
    /// structurally valid message signed by a key other than the
    /// previously established one.
    #[error("peer identity mismatch (possible identity substitution)")]
    PeerIdentityMismatch,

    /// The peer's code digest does not match the expected value.
    #[error("code digest mismatch")]
    HashMismatch,
}

/// Delivery failures of the opaque transport channel.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport endpoint is absent or was never configured.
    ///
    /// The one transport condition reported distinctly (as `Error` rather
    /// than `Timeout`/`Tampered`): the validator component is not installed
    /// or wired, which is a deployment fault the embedder can fix.
    #[error("transport not configured: {reason}")]
    NotConfigured {
        /// Why the endpoint is unavailable.
        reason: String,
    },

    /// The peer is unreachable or the channel closed mid-exchange.
    #[error("peer unreachable: {reason}")]
    Unreachable {
        /// Underlying delivery failure detail.
        reason: String,
    },

    /// No response arrived before the deadline.
    #[error("transport timed out after {elapsed_ms} ms")]
    Timeout {
        /// Milliseconds waited before giving up.
        elapsed_ms: u64,
    },
}

impl TransportError {
    /// Create a `NotConfigured` error.
    #[must_use]
    pub fn not_configured(reason: impl Into<String>) -> Self {
        Self::NotConfigured {
            reason: reason.into(),
        }
    }

    /// Create an `Unreachable` error.
    #[must_use]
    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self::Unreachable {
            reason: reason.into(),
        }
    }
}

/// Fatal startup configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The expected-digest artifact is absent.
    #[error("expected digest artifact missing at {path}")]
    ExpectedDigestMissing {
        /// Where the artifact was looked for.
        path: PathBuf,
    },

    /// The artifact exists but cannot be parsed into an expected digest.
    #[error("malformed expected digest artifact at {path}: {reason}")]
    MalformedArtifact {
        /// The artifact location.
        path: PathBuf,
        /// What failed to parse.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_error_messages_carry_tag() {
        let err = KeyError::already_exists("initiator");
        assert!(err.to_string().contains("initiator"));

        let err = KeyError::signing_failed("responder", "provider busy");
        let msg = err.to_string();
        assert!(msg.contains("responder"));
        assert!(msg.contains("provider busy"));
    }

    #[test]
    fn protocol_error_text_does_not_leak_values() {
        // Collapsed errors end up in logs; they must describe the class of
        // anomaly without embedding key or nonce material.
        for err in [
            ProtocolError::SignatureInvalid,
            ProtocolError::NonceMismatch,
            ProtocolError::PeerIdentityMismatch,
            ProtocolError::HashMismatch,
        ] {
            let msg = err.to_string();
            assert!(!msg.is_empty());
            assert!(!msg.contains("0x"));
        }
    }

    #[test]
    fn transport_timeout_reports_elapsed() {
        let err = TransportError::Timeout { elapsed_ms: 1500 };
        assert!(err.to_string().contains("1500"));
    }

    #[test]
    fn config_error_reports_path() {
        let err = ConfigError::ExpectedDigestMissing {
            path: PathBuf::from("/tmp/bundle/covenant.digest"),
        };
        assert!(err.to_string().contains("covenant.digest"));
    }
}
