//! Per-format upload request construction.
//!
//! Everything here is pure: URLs, the single-version npm publish document
//! and the legacy package-index upload fields. The registry client does the
//! sending.

use base64::Engine as _;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::DestinationError;
use crate::package::PackageDescriptor;

/// `PUT` target for one maven file.
pub fn maven_url(package: &PackageDescriptor, version: &str, file_name: &str) -> String {
    format!("{}{}/{}/{}", package.endpoint, package.path, version, file_name)
}

/// `PUT` target for an npm publish; scoped names keep the scope in one
/// path segment.
pub fn npm_url(package: &PackageDescriptor) -> String {
    format!("{}{}", package.endpoint, package.path.replace('/', "%2f"))
}

/// Build the publish document for one npm version from the source's full
/// package manifest: drop the revision, keep only this version, point its
/// tarball at the destination and attach the tarball inline.
pub fn npm_document(
    manifest: &Value,
    package: &PackageDescriptor,
    version: &str,
    file_name: &str,
    data: &[u8],
) -> Result<Value, DestinationError> {
    let mut version_spec = manifest
        .get("versions")
        .and_then(|v| v.get(version))
        .cloned()
        .ok_or_else(|| DestinationError::MissingFromManifest {
            package: package.path.clone(),
            version: version.to_string(),
        })?;

    let mut document = manifest.clone();
    let Some(fields) = document.as_object_mut() else {
        return Err(DestinationError::InvalidRequest(format!(
            "package manifest for {} is not an object",
            package.path
        )));
    };
    fields.remove("_rev");

    if let Some(dist) = version_spec.get_mut("dist").and_then(Value::as_object_mut) {
        dist.insert(
            "tarball".to_string(),
            Value::String(format!("{}{}/{}", package.endpoint, package.path, file_name)),
        );
    }

    let attachment_name = format!("{}-{}.tgz", package.path, version);
    fields.insert(
        "_attachments".to_string(),
        json!({
            attachment_name: {
                "content_type": "application/octet-stream",
                "data": base64::engine::general_purpose::STANDARD.encode(data),
                "length": data.len().to_string(),
            }
        }),
    );
    fields.insert("versions".to_string(), json!({ version: version_spec }));
    Ok(document)
}

/// Text fields of a legacy package-index `file_upload` form. The file
/// itself goes in a separate `content` part.
pub fn pypi_form_fields(
    package: &PackageDescriptor,
    version: &str,
    file_name: &str,
    data: &[u8],
) -> Vec<(&'static str, String)> {
    let (filetype, pyversion) = pypi_file_type(file_name);
    vec![
        (":action", "file_upload".to_string()),
        ("protocol_version", "1".to_string()),
        ("metadata_version", "2.1".to_string()),
        ("name", package.coordinates.name.clone()),
        ("version", version.to_string()),
        ("filetype", filetype.to_string()),
        ("pyversion", pyversion),
        ("sha256_digest", format!("{:x}", Sha256::digest(data))),
    ]
}

/// Distribution type and python tag from the file name.
fn pypi_file_type(file_name: &str) -> (&'static str, String) {
    if let Some(stem) = file_name.strip_suffix(".whl") {
        // name-version(-build)?-python-abi-platform
        let python = stem.rsplit('-').nth(2).unwrap_or("py3");
        ("bdist_wheel", python.to_string())
    } else if let Some(stem) = file_name.strip_suffix(".egg") {
        let python = stem
            .rsplit('-')
            .find(|part| part.starts_with("py"))
            .unwrap_or("py3");
        ("bdist_egg", python.trim_start_matches("py").to_string())
    } else {
        ("sdist", "source".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::PackageKind;

    fn npm(path: &str) -> PackageDescriptor {
        PackageDescriptor::new("npm-local", path, PackageKind::Npm, "https://ca/npm/npm-local/")
    }

    #[test]
    fn test_maven_url() {
        let p = PackageDescriptor::new(
            "libs",
            "com/acme/lib",
            PackageKind::Maven,
            "https://ca/maven/libs/",
        );
        assert_eq!(
            maven_url(&p, "1.0", "lib-1.0.jar"),
            "https://ca/maven/libs/com/acme/lib/1.0/lib-1.0.jar"
        );
    }

    #[test]
    fn test_npm_url_encodes_scope_separator() {
        assert_eq!(
            npm_url(&npm("@acme/widgets")),
            "https://ca/npm/npm-local/@acme%2fwidgets"
        );
        assert_eq!(npm_url(&npm("left-pad")), "https://ca/npm/npm-local/left-pad");
    }

    #[test]
    fn test_npm_document_single_version() {
        let manifest = json!({
            "name": "left-pad",
            "_rev": "3-abc",
            "versions": {
                "1.0.0": {"name": "left-pad", "dist": {"tarball": "https://src/left-pad-1.0.0.tgz"}},
                "1.1.0": {"name": "left-pad", "dist": {"tarball": "https://src/left-pad-1.1.0.tgz"}}
            }
        });
        let doc = npm_document(&manifest, &npm("left-pad"), "1.0.0", "left-pad-1.0.0.tgz", b"tgz")
            .unwrap();

        assert!(doc.get("_rev").is_none());
        let versions = doc["versions"].as_object().unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(
            doc["versions"]["1.0.0"]["dist"]["tarball"],
            "https://ca/npm/npm-local/left-pad/left-pad-1.0.0.tgz"
        );
        let attachment = &doc["_attachments"]["left-pad-1.0.0.tgz"];
        assert_eq!(attachment["data"], "dGd6");
        assert_eq!(attachment["length"], "3");
    }

    #[test]
    fn test_npm_document_missing_version() {
        let manifest = json!({"versions": {"1.0.0": {}}});
        let err = npm_document(&manifest, &npm("left-pad"), "2.0.0", "x.tgz", b"").unwrap_err();
        assert!(matches!(err, DestinationError::MissingFromManifest { .. }));
    }

    #[test]
    fn test_pypi_fields() {
        let p = PackageDescriptor::new("py", "Flask_Login", PackageKind::Pypi, "https://ca/pypi/py/");
        let fields = pypi_form_fields(&p, "0.6.3", "Flask_Login-0.6.3-py3-none-any.whl", b"");
        let get = |k: &str| {
            fields
                .iter()
                .find(|(name, _)| *name == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get(":action"), Some("file_upload"));
        assert_eq!(get("protocol_version"), Some("1"));
        assert_eq!(get("name"), Some("flask-login"));
        assert_eq!(get("filetype"), Some("bdist_wheel"));
        assert_eq!(get("pyversion"), Some("py3"));
        assert_eq!(
            get("sha256_digest"),
            Some("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
        );
    }

    #[test]
    fn test_pypi_file_types() {
        assert_eq!(pypi_file_type("requests-2.0.tar.gz"), ("sdist", "source".to_string()));
        assert_eq!(
            pypi_file_type("requests-2.0-py2.7.egg"),
            ("bdist_egg", "2.7".to_string())
        );
        assert_eq!(
            pypi_file_type("numpy-1.26.0-cp311-cp311-manylinux_x86_64.whl"),
            ("bdist_wheel", "cp311".to_string())
        );
    }
}
