//! `covenant digest` — capture the expected digest of a shipped binary.
//!
//! Run against the exact binary that ships; the output feeds the
//! responder's expected-digest artifact.

use std::path::Path;

use anyhow::{bail, Context, Result};
use covenant_core::expected::ExpectedDigest;
use covenant_core::hasher::CodeHasher;

/// Compute and print (or persist) the digest of `binary`.
pub fn run(binary: &Path, arch: &str, output: Option<&Path>) -> Result<()> {
    // Digests are computed over the slice actually mapped at runtime.
    // Selecting a foreign slice of a multi-architecture image would
    // produce a digest the running process can never match, so only the
    // native slice is offered.
    if arch != "native" {
        bail!("unsupported --arch `{arch}`: only `native` is supported");
    }

    let digest = CodeHasher::compute_digest_for_image(binary)
        .with_context(|| format!("cannot digest {}", binary.display()))?;

    match output {
        Some(path) => {
            ExpectedDigest::write(path, &digest)
                .with_context(|| format!("cannot write artifact {}", path.display()))?;
            println!("wrote {} ({digest})", path.display());
        },
        None => println!("{digest}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // 64-byte minimal ELF header prefix; enough for the magic check.
    fn write_fake_elf(path: &Path, payload: &[u8]) {
        let mut image = vec![0x7f, b'E', b'L', b'F', 2, 1, 1, 0];
        image.resize(64, 0);
        image.extend_from_slice(payload);
        std::fs::write(path, image).unwrap();
    }

    #[test]
    fn digest_matches_core_hasher() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("app");
        write_fake_elf(&binary, b"payload");

        let artifact = dir.path().join("covenant.digest");
        run(&binary, "native", Some(&artifact)).unwrap();

        let expected = CodeHasher::compute_digest_for_image(&binary).unwrap();
        let loaded = ExpectedDigest::load(&artifact).unwrap();
        assert_eq!(loaded.digest(), expected);
    }

    #[test]
    fn foreign_arch_selector_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("app");
        write_fake_elf(&binary, b"payload");

        let err = run(&binary, "arm64", None).unwrap_err();
        assert!(err.to_string().contains("only `native`"));
    }

    #[test]
    fn missing_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run(&dir.path().join("absent"), "native", None).is_err());
    }
}
