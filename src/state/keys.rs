//! Deterministic item keys for the hosted key-value backend.
//!
//! Keys are SHA-384 hex digests of `repo`, `repo/package` and
//! `repo/package:version`, so the same logical entry always lands on the
//! same item regardless of which worker writes it.

use sha2::{Digest, Sha384};

fn digest(input: &str) -> String {
    format!("{:x}", Sha384::digest(input.as_bytes()))
}

pub fn repository_key(repo: &str) -> String {
    digest(repo)
}

/// Compound `repo/package` value used as the versions-index hash key.
pub fn repository_package(repo: &str, pkg: &str) -> String {
    format!("{}/{}", repo, pkg)
}

pub fn package_key(repo: &str, pkg: &str) -> String {
    digest(&repository_package(repo, pkg))
}

pub fn version_key(repo: &str, pkg: &str, version: &str) -> String {
    digest(&format!("{}/{}:{}", repo, pkg, version))
}
