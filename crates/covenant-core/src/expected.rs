//! Build-time expected-digest artifact.
//!
//! The responder compares incoming code digests against a value captured
//! from the actual shipped binary by the offline tooling. The artifact is
//! a flat key→value text record:
//!
//! ```text
//! # produced by `covenant digest`
//! expected_digest = 9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08
//! ```
//!
//! Absence or malformed content is a configuration error, fatal at
//! responder startup — never silently defaulted to "always valid".

use std::fmt::Write as _;
use std::path::Path;

use crate::digest::CodeDigest;
use crate::error::ConfigError;

/// Well-known artifact key holding the hex expected digest.
pub const EXPECTED_DIGEST_KEY: &str = "expected_digest";

/// The expected code digest loaded from a build-time artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedDigest {
    digest: CodeDigest,
}

impl ExpectedDigest {
    /// Wrap an already-known digest (tests, embedded configuration).
    #[must_use]
    pub const fn new(digest: CodeDigest) -> Self {
        Self { digest }
    }

    /// The expected digest value.
    #[must_use]
    pub const fn digest(&self) -> CodeDigest {
        self.digest
    }

    /// Load the artifact at `path`, read once at responder startup.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ExpectedDigestMissing`] if the file is absent;
    /// [`ConfigError::MalformedArtifact`] if it exists but the
    /// `expected_digest` key is missing, duplicated, or not a valid hex
    /// digest.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::ExpectedDigestMissing {
                    path: path.to_path_buf(),
                });
            },
            Err(e) => {
                return Err(ConfigError::MalformedArtifact {
                    path: path.to_path_buf(),
                    reason: format!("unreadable: {e}"),
                });
            },
        };
        Self::parse(&content).map_err(|reason| ConfigError::MalformedArtifact {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Parse artifact content.
    fn parse(content: &str) -> Result<Self, String> {
        let mut found: Option<CodeDigest> = None;
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(format!("line {}: expected `key = value`", lineno + 1));
            };
            if key.trim() != EXPECTED_DIGEST_KEY {
                // Unknown keys are tolerated for forward compatibility.
                continue;
            }
            if found.is_some() {
                return Err(format!("duplicate `{EXPECTED_DIGEST_KEY}` key"));
            }
            let digest = value
                .trim()
                .parse::<CodeDigest>()
                .map_err(|e| format!("line {}: {e}", lineno + 1))?;
            found = Some(digest);
        }
        found
            .map(|digest| Self { digest })
            .ok_or_else(|| format!("`{EXPECTED_DIGEST_KEY}` key not present"))
    }

    /// Render artifact content for `digest`.
    #[must_use]
    pub fn render(digest: &CodeDigest) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# captured from the shipped binary; do not edit");
        let _ = writeln!(out, "{EXPECTED_DIGEST_KEY} = {digest}");
        out
    }

    /// Write an artifact for `digest` at `path` (offline tooling).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MalformedArtifact`] if the write fails.
    pub fn write(path: &Path, digest: &CodeDigest) -> Result<(), ConfigError> {
        std::fs::write(path, Self::render(digest)).map_err(|e| ConfigError::MalformedArtifact {
            path: path.to_path_buf(),
            reason: format!("cannot write artifact: {e}"),
        })
    }
}
