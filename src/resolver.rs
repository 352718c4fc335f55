//! Version resolution from raw source listings.
//!
//! The source inventory hands back binary URIs; which of them are binaries,
//! and where the version hides in the path, depends on the package kind.
//! URIs that don't parse are skipped, never fatal.

use crate::package::{PackageDescriptor, PackageKind};

/// Auxiliary file that sits next to maven binaries but is never one.
pub const MAVEN_METADATA_FILE: &str = "maven-metadata.xml";

/// Suffixes that mark a URI as a binary when discovering versions of
/// directory-per-version kinds.
const VERSIONED_ARCHIVE_SUFFIXES: &[&str] = &[".pom", ".jar", ".tar.gz", ".whl", ".egg"];

/// Suffixes uploaded per version.
fn upload_suffixes(kind: PackageKind) -> &'static [&'static str] {
    match kind {
        PackageKind::Maven => &[".pom", ".jar", ".tar.gz"],
        PackageKind::Pypi => &[".tar.gz", ".whl", ".egg"],
        PackageKind::Npm => &[".tgz"],
    }
}

fn segments(uri: &str) -> Vec<&str> {
    uri.split('/').filter(|s| !s.is_empty()).collect()
}

/// Extract the version from `…/<package path>/<version>/<file>`.
fn directory_version<'a>(package_path: &str, uri: &'a str) -> Option<&'a str> {
    let package = segments(package_path);
    let parts = segments(uri);
    if package.is_empty() || parts.len() < package.len() + 2 {
        return None;
    }
    let version_idx = parts.len() - 2;
    let start = version_idx - package.len();
    (parts[start..version_idx] == package[..]).then_some(parts[version_idx])
}

/// Extract the version from `…/<package>/-/<basename>-<version>.tgz`.
fn tarball_version<'a>(basename: &str, uri: &'a str) -> Option<&'a str> {
    let file = uri.rsplit('/').next()?;
    let version = file
        .strip_suffix(".tgz")?
        .strip_prefix(basename)?
        .strip_prefix('-')?;
    (!version.is_empty()).then_some(version)
}

fn is_versioned_archive(uri: &str) -> bool {
    !uri.ends_with(MAVEN_METADATA_FILE)
        && VERSIONED_ARCHIVE_SUFFIXES.iter().any(|s| uri.ends_with(s))
}

/// Resolve the version of a single binary URI, if it names one.
pub fn version_of(package: &PackageDescriptor, uri: &str) -> Option<String> {
    let version = match package.kind {
        PackageKind::Maven | PackageKind::Pypi => {
            if !is_versioned_archive(uri) {
                return None;
            }
            directory_version(&package.path, uri)?
        }
        PackageKind::Npm => tarball_version(package.basename(), uri)?,
    };
    Some(version.to_string())
}

/// Deduplicated versions in discovery order.
pub fn resolve_versions(package: &PackageDescriptor, uris: &[String]) -> Vec<String> {
    let mut versions: Vec<String> = Vec::new();
    for uri in uris {
        match version_of(package, uri) {
            Some(version) if !versions.contains(&version) => versions.push(version),
            Some(_) => {}
            None => tracing::debug!(uri = %uri, "No version in binary path, skipping"),
        }
    }
    if versions.is_empty() {
        tracing::warn!(
            repository = %package.repository,
            package = %package.path,
            "No versions found in source binaries"
        );
    }
    versions
}

/// Binaries belonging to one version, in listing order.
pub fn binaries_for_version(
    package: &PackageDescriptor,
    version: &str,
    uris: &[String],
) -> Vec<String> {
    let suffixes = upload_suffixes(package.kind);
    uris.iter()
        .filter(|uri| {
            if uri.ends_with(MAVEN_METADATA_FILE) || !suffixes.iter().any(|s| uri.ends_with(s)) {
                return false;
            }
            match package.kind {
                PackageKind::Maven | PackageKind::Pypi => {
                    directory_version(&package.path, uri) == Some(version)
                }
                PackageKind::Npm => tarball_version(package.basename(), uri) == Some(version),
            }
        })
        .cloned()
        .collect()
}

/// Location of the trailing metadata file that accompanies the last binary
/// uploaded for a manifest-driven kind.
pub fn trailing_metadata_uri(kind: PackageKind, last_binary: &str) -> Option<String> {
    if !kind.is_manifest_driven() {
        return None;
    }
    let (dir, _file) = last_binary.rsplit_once('/')?;
    Some(format!("{}/{}", dir, MAVEN_METADATA_FILE))
}

/// Package paths found in a deep repository file listing, sorted and
/// deduplicated.
pub fn packages_from_listing(kind: PackageKind, files: &[String]) -> Vec<String> {
    let mut packages: Vec<String> = files
        .iter()
        .filter_map(|file| {
            let path = file.trim_start_matches('/');
            match kind {
                PackageKind::Npm => {
                    if path.starts_with(".npm") {
                        return None;
                    }
                    let (name, _) = path.split_once("/-/")?;
                    Some(name.to_string())
                }
                PackageKind::Maven | PackageKind::Pypi => {
                    if path.ends_with(MAVEN_METADATA_FILE) {
                        return None;
                    }
                    let parts: Vec<&str> = path.split('/').collect();
                    if parts.len() <= 2 {
                        return None;
                    }
                    Some(parts[..parts.len() - 2].join("/"))
                }
            }
        })
        .collect();
    packages.sort();
    packages.dedup();
    packages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(kind: PackageKind, path: &str) -> PackageDescriptor {
        PackageDescriptor::new("repo", path, kind, "https://endpoint/")
    }

    fn uris(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_maven_metadata_excluded() {
        let p = pkg(PackageKind::Maven, "pkg");
        let found = resolve_versions(
            &p,
            &uris(&[
                "pkg/1.0.0/pkg-1.0.0.tar.gz",
                "pkg/1.0.0/pkg-1.0.0.whl",
                "pkg/maven-metadata.xml",
            ]),
        );
        assert_eq!(found, vec!["1.0.0"]);
    }

    #[test]
    fn test_namespaced_maven_versions_in_discovery_order() {
        let p = pkg(PackageKind::Maven, "com/acme/lib");
        let found = resolve_versions(
            &p,
            &uris(&[
                "https://src/artifactory/libs/com/acme/lib/2.0/lib-2.0.jar",
                "https://src/artifactory/libs/com/acme/lib/1.0/lib-1.0.pom",
                "https://src/artifactory/libs/com/acme/lib/2.0/lib-2.0.pom",
                "https://src/artifactory/libs/com/acme/lib/1.0/lib-1.0.jar.sha1",
            ]),
        );
        assert_eq!(found, vec!["2.0", "1.0"]);
    }

    #[test]
    fn test_repository_named_like_package() {
        let p = pkg(PackageKind::Pypi, "pkg");
        assert_eq!(
            version_of(&p, "https://src/pkg/pkg/3.1/pkg-3.1.tar.gz").as_deref(),
            Some("3.1")
        );
    }

    #[test]
    fn test_unparseable_uri_skipped() {
        let p = pkg(PackageKind::Pypi, "requests");
        let found = resolve_versions(&p, &uris(&["requests.tar.gz", "other/1.0/x.whl"]));
        assert!(found.is_empty());
    }

    #[test]
    fn test_npm_versions() {
        let p = pkg(PackageKind::Npm, "@acme/widgets");
        let found = resolve_versions(
            &p,
            &uris(&[
                "https://src/npm-local/@acme/widgets/-/widgets-1.2.3.tgz",
                "https://src/npm-local/@acme/widgets/-/widgets-1.2.4-beta.1.tgz",
                "https://src/npm-local/.npm/@acme/widgets/package.json",
            ]),
        );
        assert_eq!(found, vec!["1.2.3", "1.2.4-beta.1"]);
    }

    #[test]
    fn test_binaries_for_version_pypi() {
        let p = pkg(PackageKind::Pypi, "requests");
        let all = uris(&[
            "https://src/py/requests/2.0/requests-2.0.tar.gz",
            "https://src/py/requests/2.0/requests-2.0-py3-none-any.whl",
            "https://src/py/requests/2.0/requests-2.0.tar.gz.asc",
            "https://src/py/requests/1.0/requests-1.0.tar.gz",
        ]);
        assert_eq!(
            binaries_for_version(&p, "2.0", &all),
            uris(&[
                "https://src/py/requests/2.0/requests-2.0.tar.gz",
                "https://src/py/requests/2.0/requests-2.0-py3-none-any.whl",
            ])
        );
    }

    #[test]
    fn test_binaries_for_version_npm_exact_match() {
        let p = pkg(PackageKind::Npm, "left-pad");
        let all = uris(&[
            "https://src/npm/left-pad/-/left-pad-1.0.0.tgz",
            "https://src/npm/left-pad/-/left-pad-1.0.0-rc.tgz",
        ]);
        assert_eq!(
            binaries_for_version(&p, "1.0.0", &all),
            uris(&["https://src/npm/left-pad/-/left-pad-1.0.0.tgz"])
        );
    }

    #[test]
    fn test_trailing_metadata_only_for_manifest_kinds() {
        assert_eq!(
            trailing_metadata_uri(PackageKind::Maven, "https://src/libs/a/b/1.0/b-1.0.jar")
                .as_deref(),
            Some("https://src/libs/a/b/1.0/maven-metadata.xml")
        );
        assert_eq!(
            trailing_metadata_uri(PackageKind::Pypi, "https://src/py/a/1.0/a.whl"),
            None
        );
    }

    #[test]
    fn test_packages_from_maven_listing() {
        let files = uris(&[
            "/com/acme/lib/1.0/lib-1.0.jar",
            "/com/acme/lib/1.0/lib-1.0.pom",
            "/com/acme/lib/maven-metadata.xml",
            "/com/acme/util/2.0/util-2.0.jar",
            "/stray.txt",
        ]);
        assert_eq!(
            packages_from_listing(PackageKind::Maven, &files),
            vec!["com/acme/lib", "com/acme/util"]
        );
    }

    #[test]
    fn test_packages_from_npm_listing() {
        let files = uris(&[
            "/.npm/left-pad/package.json",
            "/left-pad/-/left-pad-1.0.0.tgz",
            "/@acme/widgets/-/widgets-1.0.0.tgz",
            "/left-pad/-/left-pad-1.1.0.tgz",
        ]);
        assert_eq!(
            packages_from_listing(PackageKind::Npm, &files),
            vec!["@acme/widgets", "left-pad"]
        );
    }
}
