//! covenant-core - Mutual Runtime Integrity Attestation
//!
//! Two co-resident processes continuously prove to each other that their
//! executable code is unmodified. Each side holds an asymmetric signing
//! identity, computes a digest over its own loaded code, and runs a
//! nonce-based challenge/response exchange; any verification anomaly,
//! missing response, or setup fault produces a fail-closed verdict that
//! the embedding application treats as compromise.
//!
//! # Modules
//!
//! - [`digest`]: Fixed-size code digests with constant-time equality and
//!   order-sensitive combination
//! - [`hasher`]: `CodeHasher` — digests of on-disk executable images and
//!   of this process's own loaded code
//! - [`keystore`]: `KeyProvider` capability trait, the software fallback,
//!   and signature verification
//! - [`registry`]: `IdentityRegistry` — durable peer-key records defeating
//!   cross-session identity substitution
//! - [`messages`]: Wire message shapes, signing preimages, and the framed
//!   codec
//! - [`expected`]: The build-time expected-digest artifact
//! - [`engine`]: Initiator/responder protocol state machines and the
//!   [`engine::ValidationOutcome`] verdict
//! - [`role`]: Exchange roles
//! - [`error`]: Error taxonomy shared across the crate
//!
//! # Trust Model
//!
//! The exchange assumes an attacker who can modify binaries on disk,
//! replay captured traffic, or substitute a process wholesale, but who
//! cannot extract private keys from a hardware-backed provider. The
//! software key fallback weakens that last assumption and reports itself
//! as such.

pub mod digest;
pub mod engine;
pub mod error;
pub mod expected;
pub mod hasher;
pub mod keystore;
pub mod messages;
pub mod registry;
pub mod role;

pub use digest::CodeDigest;
pub use engine::{
    AttestationContext, Initiator, Responder, Transport, ValidationOutcome,
    DEFAULT_ATTESTATION_TIMEOUT,
};
pub use error::{ConfigError, KeyError, ProtocolError, StoreError, TransportError};
pub use expected::ExpectedDigest;
pub use hasher::CodeHasher;
pub use keystore::{select_key_provider, KeyProvider, KeyProviderKind, PublicKeyBytes};
pub use messages::{AttestationMessage, AttestationRequest, AttestationResponse, Nonce};
pub use registry::IdentityRegistry;
pub use role::Role;
