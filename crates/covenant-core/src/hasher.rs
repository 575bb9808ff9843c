//! `CodeHasher` — deterministic digests over executable images.
//!
//! The hasher covers the read-only executable code of a process, restricted
//! to images packaged with the application: system-provided shared libraries
//! are excluded, because their bytes vary across hosts and OS updates while
//! the attestation contract covers only the shipped binaries.
//!
//! # Determinism
//!
//! Same binary bytes produce the same digest across repeated invocations
//! and across processes. Two independent *builds* of identical source are
//! not guaranteed to match (embedded build identifiers and other
//! non-reproducible artifacts), so expected digests are captured from the
//! actual shipped binary with the offline tooling, never recomputed from
//! source.
//!
//! # Multi-image order
//!
//! When several in-bundle binaries are covered, their per-image digests are
//! folded with [`CodeDigest::combine`] in **lexicographic path order**.
//! Both sides of an exchange must use this order to compare equal.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::digest::CodeDigest;

/// Read buffer size for streaming image hashing.
const READ_BUF_SIZE: usize = 64 * 1024;

/// Errors from code hashing.
#[derive(Debug, Error)]
pub enum HasherError {
    /// The path is not a readable, recognized executable image.
    #[error("image unreadable at {path}: {reason}")]
    ImageUnreadable {
        /// The offending path.
        path: PathBuf,
        /// Why it could not be hashed.
        reason: String,
    },

    /// The calling process's own loaded images could not be enumerated.
    #[error("self inspection failed: {reason}")]
    SelfInspection {
        /// Underlying failure detail.
        reason: String,
    },
}

impl HasherError {
    fn unreadable(path: &Path, reason: impl Into<String>) -> Self {
        Self::ImageUnreadable {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// Computes deterministic digests over executable code regions.
#[derive(Debug, Clone)]
pub struct CodeHasher {
    /// Images outside this directory are treated as system-provided and
    /// excluded from the self digest.
    app_root: Option<PathBuf>,
}

impl CodeHasher {
    /// Create a hasher whose app root is the directory of the current
    /// executable.
    #[must_use]
    pub fn new() -> Self {
        Self { app_root: None }
    }

    /// Create a hasher with an explicit app root.
    #[must_use]
    pub fn with_app_root(app_root: impl Into<PathBuf>) -> Self {
        Self {
            app_root: Some(app_root.into()),
        }
    }

    /// Compute the digest of the calling process's executable code.
    ///
    /// Enumerates the file-backed executable images loaded into this
    /// process, keeps those under the app root, and folds their per-image
    /// digests in lexicographic path order. Falls back to hashing the
    /// current executable alone when image enumeration is unsupported or
    /// yields nothing under the root.
    ///
    /// # Errors
    ///
    /// Returns [`HasherError::SelfInspection`] if the process's own images
    /// cannot be determined, or [`HasherError::ImageUnreadable`] if a
    /// covered image cannot be hashed.
    pub fn compute_self_digest(&self) -> Result<CodeDigest, HasherError> {
        let root = self.resolve_app_root()?;
        let images = self.bundled_images(&root)?;

        debug!(
            image_count = images.len(),
            app_root = %root.display(),
            "hashing own executable images"
        );

        let mut digests = Vec::with_capacity(images.len());
        for path in &images {
            digests.push(Self::compute_digest_for_image(path)?);
        }
        if digests.len() == 1 {
            return Ok(digests[0]);
        }
        Ok(CodeDigest::combine(&digests))
    }

    /// Compute the digest of an on-disk binary image.
    ///
    /// Used by the offline tooling to capture expected digests from shipped
    /// binaries.
    ///
    /// # Errors
    ///
    /// Returns [`HasherError::ImageUnreadable`] if the path is absent, not
    /// permission-readable, or not a recognized executable image.
    pub fn compute_digest_for_image(path: &Path) -> Result<CodeDigest, HasherError> {
        let mut file =
            File::open(path).map_err(|e| HasherError::unreadable(path, e.to_string()))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)
            .map_err(|e| HasherError::unreadable(path, format!("short read: {e}")))?;
        if !is_executable_magic(&magic) {
            return Err(HasherError::unreadable(
                path,
                "not a recognized executable image",
            ));
        }

        let mut hasher = Sha256::new();
        hasher.update(magic);
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            let n = file
                .read(&mut buf)
                .map_err(|e| HasherError::unreadable(path, e.to_string()))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(CodeDigest::from_bytes(hasher.finalize().into()))
    }

    fn resolve_app_root(&self) -> Result<PathBuf, HasherError> {
        if let Some(root) = &self.app_root {
            return Ok(root.clone());
        }
        let exe = std::env::current_exe().map_err(|e| HasherError::SelfInspection {
            reason: format!("cannot determine current executable: {e}"),
        })?;
        exe.parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| HasherError::SelfInspection {
                reason: "current executable has no parent directory".to_string(),
            })
    }

    /// Enumerate the in-bundle executable images of this process, sorted
    /// lexicographically (the documented combine order).
    #[cfg(target_os = "linux")]
    fn bundled_images(&self, root: &Path) -> Result<BTreeSet<PathBuf>, HasherError> {
        let maps =
            std::fs::read_to_string("/proc/self/maps").map_err(|e| HasherError::SelfInspection {
                reason: format!("cannot read process mappings: {e}"),
            })?;

        let mut images = BTreeSet::new();
        for line in maps.lines() {
            // address perms offset dev inode [path]
            let mut fields = line.split_whitespace();
            let Some(_addr) = fields.next() else { continue };
            let Some(perms) = fields.next() else { continue };
            if !perms.contains('x') {
                continue;
            }
            let path = match fields.nth(3) {
                Some(p) if p.starts_with('/') => PathBuf::from(p),
                _ => continue,
            };
            if path.starts_with(root) {
                images.insert(path);
            }
        }

        if images.is_empty() {
            warn!(
                app_root = %root.display(),
                "no executable mappings under app root, falling back to current executable"
            );
            images.insert(self.current_exe()?);
        }
        Ok(images)
    }

    /// Portable fallback: the current executable is the only covered image.
    #[cfg(not(target_os = "linux"))]
    fn bundled_images(&self, _root: &Path) -> Result<BTreeSet<PathBuf>, HasherError> {
        let mut images = BTreeSet::new();
        images.insert(self.current_exe()?);
        Ok(images)
    }

    fn current_exe(&self) -> Result<PathBuf, HasherError> {
        std::env::current_exe().map_err(|e| HasherError::SelfInspection {
            reason: format!("cannot determine current executable: {e}"),
        })
    }
}

impl Default for CodeHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Recognize ELF and Mach-O (thin and fat, both endiannesses) magic bytes.
fn is_executable_magic(magic: &[u8; 4]) -> bool {
    matches!(
        magic,
        [0x7f, b'E', b'L', b'F']
            | [0xfe, 0xed, 0xfa, 0xce]
            | [0xce, 0xfa, 0xed, 0xfe]
            | [0xfe, 0xed, 0xfa, 0xcf]
            | [0xcf, 0xfa, 0xed, 0xfe]
            | [0xca, 0xfe, 0xba, 0xbe]
            | [0xbe, 0xba, 0xfe, 0xca]
    )
}
