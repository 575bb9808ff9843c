//! Software-fallback key provider.
//!
//! Ed25519 key pairs held in process memory, optionally persisted as
//! 0600-permission seed files under a directory so identities survive
//! process restarts. Seeds are zeroized when they leave scope.
//!
//! This variant cannot provide the hardware binding property (key
//! accessibility tied to the caller's signing identity) and reports
//! `is_hardware_backed() == false` accordingly.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use tracing::{debug, info};
use zeroize::Zeroize;

use super::{KeyProvider, PublicKeyBytes};
use crate::error::KeyError;

/// Suffix for on-disk seed files: `<tag>.seed`.
const SEED_FILE_SUFFIX: &str = ".seed";

/// In-memory (optionally disk-persisted) Ed25519 key provider.
pub struct SoftwareKeyProvider {
    /// Tag to signing key. The provider lock also serializes signing,
    /// preserving the single-key-pair-in-flight discipline of the
    /// capability contract.
    keys: Mutex<BTreeMap<String, SigningKey>>,

    /// Seed persistence directory, if any.
    persist_dir: Option<PathBuf>,
}

impl SoftwareKeyProvider {
    /// Create a provider whose keys exist only for this process lifetime.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            keys: Mutex::new(BTreeMap::new()),
            persist_dir: None,
        }
    }

    /// Create a provider that persists seeds under `dir`, loading any
    /// previously persisted identities.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Storage`] if the directory cannot be created or
    /// an existing seed file is unreadable or malformed.
    pub fn with_persistence(dir: impl Into<PathBuf>) -> Result<Self, KeyError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| KeyError::Storage {
            reason: format!("cannot create key directory {}: {e}", dir.display()),
        })?;

        let mut keys = BTreeMap::new();
        let entries = fs::read_dir(&dir).map_err(|e| KeyError::Storage {
            reason: format!("cannot read key directory {}: {e}", dir.display()),
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| KeyError::Storage {
                reason: e.to_string(),
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(tag) = name.strip_suffix(SEED_FILE_SUFFIX) else {
                continue;
            };

            let mut seed_bytes = fs::read(entry.path()).map_err(|e| KeyError::Storage {
                reason: format!("cannot read seed for tag {tag:?}: {e}"),
            })?;
            let seed: [u8; 32] =
                seed_bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| KeyError::Storage {
                        reason: format!("seed for tag {tag:?} has wrong length"),
                    })?;
            keys.insert(tag.to_string(), SigningKey::from_bytes(&seed));
            seed_bytes.zeroize();
        }

        if !keys.is_empty() {
            info!(
                key_count = keys.len(),
                dir = %dir.display(),
                "loaded persisted software identities"
            );
        }

        Ok(Self {
            keys: Mutex::new(keys),
            persist_dir: Some(dir),
        })
    }

    fn seed_path(&self, tag: &str) -> Option<PathBuf> {
        self.persist_dir
            .as_ref()
            .map(|dir| dir.join(format!("{tag}{SEED_FILE_SUFFIX}")))
    }

    fn persist_seed(&self, tag: &str, key: &SigningKey) -> Result<(), KeyError> {
        let Some(path) = self.seed_path(tag) else {
            return Ok(());
        };

        let mut seed = key.to_bytes();
        let result = write_private_file(&path, &seed);
        seed.zeroize();
        result.map_err(|e| KeyError::Storage {
            reason: format!("cannot persist seed for tag {tag:?}: {e}"),
        })
    }
}

impl KeyProvider for SoftwareKeyProvider {
    fn is_available(&self) -> bool {
        true
    }

    fn is_hardware_backed(&self) -> bool {
        false
    }

    fn generate_key_pair(&self, tag: &str) -> Result<(), KeyError> {
        let mut keys = self.keys.lock().expect("key provider lock poisoned");
        if keys.contains_key(tag) {
            return Err(KeyError::already_exists(tag));
        }

        let key = SigningKey::generate(&mut OsRng);
        self.persist_seed(tag, &key)?;
        keys.insert(tag.to_string(), key);
        debug!(tag, "generated software key pair");
        Ok(())
    }

    fn public_key(&self, tag: &str) -> Option<PublicKeyBytes> {
        let keys = self.keys.lock().expect("key provider lock poisoned");
        keys.get(tag)
            .map(|key| PublicKeyBytes::from_bytes(key.verifying_key().to_bytes()))
    }

    fn sign(&self, tag: &str, message: &[u8]) -> Result<Vec<u8>, KeyError> {
        // Signing under the provider lock: one in-flight operation per
        // provider, which subsumes the per-tag discipline.
        let keys = self.keys.lock().expect("key provider lock poisoned");
        let key = keys.get(tag).ok_or_else(|| KeyError::not_found(tag))?;
        Ok(key.sign(message).to_bytes().to_vec())
    }

    fn delete_key_pair(&self, tag: &str) -> Result<(), KeyError> {
        let mut keys = self.keys.lock().expect("key provider lock poisoned");
        if keys.remove(tag).is_none() {
            return Err(KeyError::not_found(tag));
        }
        if let Some(path) = self.seed_path(tag) {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(KeyError::Storage {
                        reason: format!("cannot remove seed for tag {tag:?}: {e}"),
                    });
                }
            }
        }
        info!(tag, "deleted key pair");
        Ok(())
    }
}

/// Write `content` to `path` readable only by the owner.
#[cfg(unix)]
fn write_private_file(path: &std::path::Path, content: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(content)
}

#[cfg(not(unix))]
fn write_private_file(path: &std::path::Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(content)
}

#[cfg(test)]
mod tests {
    use super::super::verify;
    use super::*;

    #[test]
    fn generate_then_sign_then_verify() {
        let provider = SoftwareKeyProvider::in_memory();
        provider.generate_key_pair("initiator").unwrap();

        let public = provider.public_key("initiator").unwrap();
        let signature = provider.sign("initiator", b"attest me").unwrap();

        assert!(verify(&signature, b"attest me", &public));
        assert!(!verify(&signature, b"attest me!", &public));
    }

    #[test]
    fn at_most_one_key_pair_per_tag() {
        let provider = SoftwareKeyProvider::in_memory();
        provider.generate_key_pair("initiator").unwrap();

        let err = provider.generate_key_pair("initiator").unwrap_err();
        assert!(matches!(err, KeyError::AlreadyExists { .. }));
    }

    #[test]
    fn sign_with_unknown_tag_fails() {
        let provider = SoftwareKeyProvider::in_memory();
        let err = provider.sign("ghost", b"message").unwrap_err();
        assert!(matches!(err, KeyError::KeyNotFound { .. }));
    }

    #[test]
    fn delete_is_irreversible_and_reports_absence() {
        let provider = SoftwareKeyProvider::in_memory();
        provider.generate_key_pair("initiator").unwrap();
        provider.delete_key_pair("initiator").unwrap();

        assert!(provider.public_key("initiator").is_none());
        let err = provider.delete_key_pair("initiator").unwrap_err();
        assert!(matches!(err, KeyError::KeyNotFound { .. }));
    }

    #[test]
    fn cross_key_signatures_do_not_verify() {
        let provider = SoftwareKeyProvider::in_memory();
        provider.generate_key_pair("a").unwrap();
        provider.generate_key_pair("b").unwrap();

        let signature = provider.sign("a", b"message").unwrap();
        let other_public = provider.public_key("b").unwrap();
        assert!(!verify(&signature, b"message", &other_public));
    }

    #[test]
    fn persisted_identity_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let public = {
            let provider = SoftwareKeyProvider::with_persistence(dir.path()).unwrap();
            provider.generate_key_pair("responder").unwrap();
            provider.public_key("responder").unwrap()
        };

        let reopened = SoftwareKeyProvider::with_persistence(dir.path()).unwrap();
        assert_eq!(reopened.public_key("responder"), Some(public));

        // Signatures from the reloaded key still verify.
        let signature = reopened.sign("responder", b"still me").unwrap();
        assert!(verify(&signature, b"still me", &public));
    }

    #[cfg(unix)]
    #[test]
    fn seed_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let provider = SoftwareKeyProvider::with_persistence(dir.path()).unwrap();
        provider.generate_key_pair("responder").unwrap();

        let path = dir.path().join("responder.seed");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn delete_removes_persisted_seed() {
        let dir = tempfile::tempdir().unwrap();
        let provider = SoftwareKeyProvider::with_persistence(dir.path()).unwrap();
        provider.generate_key_pair("responder").unwrap();
        provider.delete_key_pair("responder").unwrap();

        assert!(!dir.path().join("responder.seed").exists());

        let reopened = SoftwareKeyProvider::with_persistence(dir.path()).unwrap();
        assert!(reopened.public_key("responder").is_none());
    }
}
