//! `covenant check-bundle` — structural checks on a deployment bundle.
//!
//! Catches packaging mistakes before they become runtime `Error` outcomes:
//! a bundle that ships without its validator binary or expected-digest
//! artifact will fail closed on every exchange in the field.

use std::path::Path;

use anyhow::{bail, Result};
use covenant_core::expected::ExpectedDigest;
use covenant_core::hasher::CodeHasher;

/// Conventional artifact file name inside a bundle.
pub const ARTIFACT_NAME: &str = "covenant.digest";

struct Report {
    failures: usize,
}

impl Report {
    const fn new() -> Self {
        Self { failures: 0 }
    }

    fn check(&mut self, name: &str, result: Result<String, String>) {
        match result {
            Ok(detail) => println!("  ok   {name}: {detail}"),
            Err(detail) => {
                println!("  FAIL {name}: {detail}");
                self.failures += 1;
            },
        }
    }
}

/// Run all bundle checks; non-zero exit on any failure.
pub fn run(dir: &Path, validator_name: &str) -> Result<()> {
    if !dir.is_dir() {
        bail!("bundle directory {} does not exist", dir.display());
    }
    println!("checking bundle {}", dir.display());

    let mut report = Report::new();

    let validator = dir.join(validator_name);
    report.check("validator present", {
        if validator.is_file() {
            Ok(validator.display().to_string())
        } else {
            Err(format!("{} not found", validator.display()))
        }
    });

    if validator.is_file() {
        report.check("validator executable", executable_check(&validator));
        report.check(
            "validator image",
            CodeHasher::compute_digest_for_image(&validator)
                .map(|digest| format!("digest {digest}"))
                .map_err(|e| e.to_string()),
        );
    }

    let artifact = dir.join(ARTIFACT_NAME);
    report.check(
        "expected-digest artifact",
        ExpectedDigest::load(&artifact)
            .map(|expected| format!("digest {}", expected.digest()))
            .map_err(|e| e.to_string()),
    );

    if report.failures > 0 {
        bail!("{} bundle check(s) failed", report.failures);
    }
    println!("bundle ok");
    Ok(())
}

#[cfg(unix)]
fn executable_check(path: &Path) -> Result<String, String> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path).map_err(|e| e.to_string())?;
    let mode = metadata.permissions().mode();
    if mode & 0o111 == 0 {
        return Err(format!("mode {:o} lacks execute permission", mode & 0o777));
    }
    Ok(format!("mode {:o}", mode & 0o777))
}

#[cfg(not(unix))]
fn executable_check(_path: &Path) -> Result<String, String> {
    Ok("execute bit not applicable".to_string())
}
