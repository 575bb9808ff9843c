//! `IdentityRegistry` — durable record of previously exchanged peer keys.
//!
//! The registry is the defense against identity substitution across
//! sessions: once a public key is recorded for a role, every later
//! exchange must present the same key unless the registry is explicitly
//! cleared. A mismatch is evidence of an attack, not a transient error.
//!
//! # Storage
//!
//! A single `SQLite` table on a device-local, owner-only file:
//!
//! ```text
//! peer_keys(role TEXT PRIMARY KEY, public_key BLOB NOT NULL)
//! ```
//!
//! Write failures surface as [`StoreError`] and are never silently
//! dropped. The registry is mutated at most once per role (first-exchange
//! bootstrap) and read-only thereafter during verification.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

use crate::error::StoreError;
use crate::keystore::PublicKeyBytes;
use crate::role::Role;

/// Durable peer-key registry backed by `SQLite`.
#[derive(Debug)]
pub struct IdentityRegistry {
    conn: Mutex<Connection>,
}

impl IdentityRegistry {
    /// Open (or create) a registry at `path`.
    ///
    /// The database file is created readable only by the owner.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AccessDenied`] if the file cannot be created
    /// or opened, [`StoreError::StorageCorrupted`] if the schema cannot be
    /// established.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        #[cfg(unix)]
        if !path.exists() {
            // Pre-create with owner-only permissions before SQLite opens it.
            use std::os::unix::fs::OpenOptionsExt;
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .mode(0o600)
                .open(path)
                .map_err(|e| StoreError::AccessDenied {
                    reason: format!("cannot create registry at {}: {e}", path.display()),
                })?;
        }

        let conn = Connection::open(path).map_err(|e| StoreError::AccessDenied {
            reason: format!("cannot open registry at {}: {e}", path.display()),
        })?;
        Self::with_connection(conn)
    }

    /// Open an in-memory registry (tests and ephemeral setups).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StorageCorrupted`] if the schema cannot be
    /// established.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::StorageCorrupted {
            reason: e.to_string(),
        })?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS peer_keys (
                role TEXT PRIMARY KEY,
                public_key BLOB NOT NULL
            )",
            [],
        )
        .map_err(corrupted)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Record the peer public key for `role`.
    ///
    /// Overwrites any existing record: callers enforce the
    /// bootstrap-only-once discipline (the engine writes only when no key
    /// is stored yet, or after an explicit [`Self::clear`]).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails; failures are never
    /// dropped.
    pub fn store_peer_key(&self, role: Role, key: &PublicKeyBytes) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("registry lock poisoned");
        conn.execute(
            "INSERT INTO peer_keys (role, public_key) VALUES (?1, ?2)
             ON CONFLICT(role) DO UPDATE SET public_key = excluded.public_key",
            params![role.as_str(), key.as_bytes().as_slice()],
        )
        .map_err(corrupted)?;
        info!(%role, "recorded peer public key");
        Ok(())
    }

    /// Fetch the recorded key for `role`, or `None` if not yet exchanged.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StorageCorrupted`] if the stored blob is not a
    /// valid public key or the read fails.
    pub fn peer_key(&self, role: Role) -> Result<Option<PublicKeyBytes>, StoreError> {
        let conn = self.conn.lock().expect("registry lock poisoned");
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT public_key FROM peer_keys WHERE role = ?1",
                params![role.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(corrupted)?;

        match blob {
            None => Ok(None),
            Some(bytes) => PublicKeyBytes::try_from_slice(&bytes)
                .map(Some)
                .ok_or_else(|| StoreError::StorageCorrupted {
                    reason: format!("stored key for role {role} has invalid length"),
                }),
        }
    }

    /// Whether keys for both roles are present.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub fn is_configured(&self) -> Result<bool, StoreError> {
        Ok(self.peer_key(Role::Initiator)?.is_some() && self.peer_key(Role::Responder)?.is_some())
    }

    /// Remove all recorded peer keys.
    ///
    /// The explicit reset path: the next exchange re-bootstraps.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the delete fails.
    pub fn clear(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("registry lock poisoned");
        conn.execute("DELETE FROM peer_keys", []).map_err(corrupted)?;
        info!("cleared identity registry");
        Ok(())
    }
}

fn corrupted(err: rusqlite::Error) -> StoreError {
    StoreError::StorageCorrupted {
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> PublicKeyBytes {
        PublicKeyBytes::from_bytes([byte; 32])
    }

    #[test]
    fn store_and_fetch_round_trip() {
        let registry = IdentityRegistry::in_memory().unwrap();
        assert_eq!(registry.peer_key(Role::Responder).unwrap(), None);

        registry.store_peer_key(Role::Responder, &key(7)).unwrap();
        assert_eq!(registry.peer_key(Role::Responder).unwrap(), Some(key(7)));
        assert_eq!(registry.peer_key(Role::Initiator).unwrap(), None);
    }

    #[test]
    fn configured_requires_both_roles() {
        let registry = IdentityRegistry::in_memory().unwrap();
        assert!(!registry.is_configured().unwrap());

        registry.store_peer_key(Role::Initiator, &key(1)).unwrap();
        assert!(!registry.is_configured().unwrap());

        registry.store_peer_key(Role::Responder, &key(2)).unwrap();
        assert!(registry.is_configured().unwrap());
    }

    #[test]
    fn clear_resets_both_roles() {
        let registry = IdentityRegistry::in_memory().unwrap();
        registry.store_peer_key(Role::Initiator, &key(1)).unwrap();
        registry.store_peer_key(Role::Responder, &key(2)).unwrap();

        registry.clear().unwrap();
        assert!(!registry.is_configured().unwrap());
        assert_eq!(registry.peer_key(Role::Initiator).unwrap(), None);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");

        {
            let registry = IdentityRegistry::open(&path).unwrap();
            registry.store_peer_key(Role::Responder, &key(9)).unwrap();
        }

        let reopened = IdentityRegistry::open(&path).unwrap();
        assert_eq!(reopened.peer_key(Role::Responder).unwrap(), Some(key(9)));
    }

    #[cfg(unix)]
    #[test]
    fn registry_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        let _registry = IdentityRegistry::open(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn unwritable_location_is_access_denied() {
        let err = IdentityRegistry::open(Path::new("/nonexistent-dir/registry.db")).unwrap_err();
        assert!(matches!(err, StoreError::AccessDenied { .. }));
    }
}
