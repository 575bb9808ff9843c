//! Key provider capability interface.
//!
//! Signing identities are owned by a [`KeyProvider`]: an opaque,
//! tag-addressed store of asymmetric key pairs whose private halves are
//! never exposed to callers. Two variants exist behind the trait:
//!
//! - **Hardware-backed**: keys live in an isolated hardware subsystem and
//!   signing happens inside it. Implementations plug in behind this trait;
//!   none is bundled because the hardware API is host-specific.
//! - **Software fallback** ([`SoftwareKeyProvider`]): Ed25519 keys held in
//!   process memory (optionally persisted on disk) with explicitly reduced
//!   guarantees. Used in constrained and test environments.
//!
//! Selection is a runtime capability probe via [`select_key_provider`],
//! not a compile-time choice.
//!
//! # Binding property
//!
//! Hardware-backed implementations must tie key accessibility to the
//! caller's cryptographic signing identity: a bit-identical binary
//! re-signed under a different signing identity must not be able to
//! retrieve the original private key even though the tag strings match.
//! This trust boundary is what defeats re-signing attacks; the software
//! fallback cannot provide it and says so in its availability report.

mod software;

use std::fmt;
use std::sync::Arc;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use subtle::ConstantTimeEq;
use tracing::warn;

pub use software::SoftwareKeyProvider;

use crate::error::KeyError;

/// Size of a public key in bytes (Ed25519).
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of a signature in bytes (Ed25519).
pub const SIGNATURE_SIZE: usize = 64;

/// Raw public key bytes bound to an identity.
///
/// Equality is constant-time: peer keys are compared during attestation
/// verification.
#[derive(Debug, Clone, Copy)]
pub struct PublicKeyBytes([u8; PUBLIC_KEY_SIZE]);

impl PublicKeyBytes {
    /// Wrap raw key bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Lowercase hex text form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from raw bytes of arbitrary length.
    ///
    /// # Errors
    ///
    /// Returns `None` if `bytes` is not exactly [`PUBLIC_KEY_SIZE`] long.
    #[must_use]
    pub fn try_from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; PUBLIC_KEY_SIZE] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl PartialEq for PublicKeyBytes {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl Eq for PublicKeyBytes {}

impl fmt::Display for PublicKeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for PublicKeyBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKeyBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let decoded = hex::decode(&text).map_err(serde::de::Error::custom)?;
        Self::try_from_slice(&decoded)
            .ok_or_else(|| serde::de::Error::custom("public key must be 32 bytes"))
    }
}

/// Capability interface over an asymmetric key provider.
///
/// Private keys are created on first use, addressable only by tag, never
/// duplicated, and deleted only by explicit revocation. At most one live
/// key pair exists per tag.
///
/// Signing is logically atomic and internally serialized per tag: the
/// underlying provider maintains a single-key-pair-in-flight discipline,
/// so callers must not assume concurrent signs on the same tag are
/// independent — they are effectively queued.
pub trait KeyProvider: Send + Sync {
    /// Whether this provider is usable on this host with its full
    /// guarantees.
    ///
    /// The software fallback reports `true` for usability but callers
    /// should consult [`KeyProvider::is_hardware_backed`] for the trust
    /// level actually in effect.
    fn is_available(&self) -> bool;

    /// Whether key material is held in isolated hardware.
    fn is_hardware_backed(&self) -> bool;

    /// Create a non-exportable key pair under `tag`.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if a key pair is already present under `tag`;
    /// `ProviderUnavailable` if the provider cannot service the request;
    /// `Storage` if software-fallback persistence fails.
    fn generate_key_pair(&self, tag: &str) -> Result<(), KeyError>;

    /// Fetch the public key for `tag`, or `None` if no key pair exists.
    fn public_key(&self, tag: &str) -> Option<PublicKeyBytes>;

    /// Sign `message` with the private key under `tag`.
    ///
    /// The private key is never exposed to the caller.
    ///
    /// # Errors
    ///
    /// `KeyNotFound` if `tag` has no key pair; `SigningFailed` if the
    /// provider rejects the operation.
    fn sign(&self, tag: &str, message: &[u8]) -> Result<Vec<u8>, KeyError>;

    /// Irreversibly delete the key pair under `tag`.
    ///
    /// # Errors
    ///
    /// `KeyNotFound` if no key pair exists.
    fn delete_key_pair(&self, tag: &str) -> Result<(), KeyError>;
}

impl fmt::Debug for dyn KeyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyProvider")
            .field("hardware_backed", &self.is_hardware_backed())
            .finish_non_exhaustive()
    }
}

/// Verify `signature` over `message` against `public_key`.
///
/// Pure function: requires no private material. Verification compares
/// against public data only; the sensitive-material comparisons elsewhere
/// in the system (digests, nonces, peer keys) are constant-time.
#[must_use]
pub fn verify(signature: &[u8], message: &[u8], public_key: &PublicKeyBytes) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key.as_bytes()) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify(message, &signature).is_ok()
}

/// Which provider variant to select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyProviderKind {
    /// Hardware when usable, software fallback otherwise.
    #[default]
    Auto,

    /// Hardware only; fail if no hardware provider is usable.
    Hardware,

    /// Software fallback explicitly (test environments).
    Software,
}

/// Select a key provider by runtime capability probe.
///
/// `persist_dir` applies to the software fallback: when set, generated
/// seeds survive process restarts under that directory.
///
/// # Errors
///
/// Returns `ProviderUnavailable` when `Hardware` is requested and no
/// hardware provider is usable on this host.
pub fn select_key_provider(
    kind: KeyProviderKind,
    persist_dir: Option<std::path::PathBuf>,
) -> Result<Arc<dyn KeyProvider>, KeyError> {
    // No hardware provider is bundled; hosts with one register it by
    // constructing the engine with their own `KeyProvider` directly.
    match kind {
        KeyProviderKind::Hardware => Err(KeyError::unavailable(
            "no hardware-backed key provider on this host",
        )),
        KeyProviderKind::Auto => {
            warn!("no hardware-backed key provider, falling back to software keys");
            software_provider(persist_dir)
        },
        KeyProviderKind::Software => software_provider(persist_dir),
    }
}

fn software_provider(
    persist_dir: Option<std::path::PathBuf>,
) -> Result<Arc<dyn KeyProvider>, KeyError> {
    let provider = match persist_dir {
        Some(dir) => SoftwareKeyProvider::with_persistence(dir)?,
        None => SoftwareKeyProvider::in_memory(),
    };
    Ok(Arc::new(provider))
}
