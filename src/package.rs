//! Package kinds and the per-unit package descriptor.
//!
//! Every package-manager difference the engine cares about (naming rules,
//! which files count as binaries, whether a trailing metadata upload is
//! needed) is answered by [`PackageKind`], so nothing downstream dispatches
//! on free-form strings.

use std::fmt;

/// Characters the destination's URL/path scheme can't carry in a package
/// name or version. Whitespace is rejected separately.
const UNSAFE_CHARS: &[char] = &[
    '$', '&', '+', ',', ':', ';', '=', '?', '#', '|', '\'', '<', '>', '^', '*', '(', ')', '%',
    '!', '"', '[', ']',
];

/// Supported package-manager formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageKind {
    /// Library archives laid out as `group/path/artifact/version/file`.
    Maven,
    /// Language package index; one directory per version.
    Pypi,
    /// Node module registry; tarballs under `name/-/`.
    Npm,
}

impl PackageKind {
    /// Parse the source inventory's `packageType` field.
    pub fn from_source_type(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "maven" => Some(Self::Maven),
            "pypi" => Some(Self::Pypi),
            "npm" => Some(Self::Npm),
            _ => None,
        }
    }

    /// Format name as the destination registry spells it.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Maven => "maven",
            Self::Pypi => "pypi",
            Self::Npm => "npm",
        }
    }

    /// Whether a version needs a trailing metadata upload plus an explicit
    /// status finalize before the destination reports it as published.
    pub fn is_manifest_driven(&self) -> bool {
        matches!(self, Self::Maven)
    }

    /// Whether uploads need the package manifest fetched from the source.
    pub fn needs_package_manifest(&self) -> bool {
        matches!(self, Self::Npm)
    }

    /// Split a source package path into destination coordinates.
    pub fn coordinates(&self, path: &str) -> Coordinates {
        let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let last = segments.pop().unwrap_or_default();
        match self {
            Self::Maven => Coordinates {
                namespace: (!segments.is_empty()).then(|| segments.join(".")),
                name: last.to_string(),
            },
            Self::Npm => Coordinates {
                namespace: segments
                    .first()
                    .map(|scope| scope.trim_start_matches('@').to_string()),
                name: last.to_string(),
            },
            Self::Pypi => Coordinates {
                namespace: None,
                name: last.to_lowercase().replace('_', "-"),
            },
        }
    }
}

impl fmt::Display for PackageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Package identity as the destination registry expects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coordinates {
    pub namespace: Option<String>,
    pub name: String,
}

/// Immutable description of one package in one repository, built fresh per
/// unit of work and cloned into each concurrent task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDescriptor {
    /// Source/destination repository name (identical on both sides).
    pub repository: String,
    /// Package path as the source inventory names it, e.g. `com/acme/lib`,
    /// `@scope/name` or `requests`.
    pub path: String,
    pub kind: PackageKind,
    /// Destination repository endpoint for uploads.
    pub endpoint: String,
    pub coordinates: Coordinates,
}

impl PackageDescriptor {
    pub fn new(repository: &str, path: &str, kind: PackageKind, endpoint: &str) -> Self {
        Self {
            repository: repository.to_string(),
            path: path.to_string(),
            kind,
            endpoint: endpoint.to_string(),
            coordinates: kind.coordinates(path),
        }
    }

    /// Last path segment, the name binaries are filed under.
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Scratch directory name for one version of this package. Both parts
    /// are percent-encoded, so `@` only ever appears as the separator and
    /// distinct (path, version) pairs never share a directory.
    pub fn scratch_dir_name(&self, version: &str) -> String {
        format!(
            "{}@{}",
            urlencoding::encode(&self.path),
            urlencoding::encode(version)
        )
    }
}

/// Whether a package path or version contains characters the destination
/// can't address.
pub fn has_unsafe_chars(s: &str) -> bool {
    s.chars()
        .any(|c| c.is_whitespace() || UNSAFE_CHARS.contains(&c))
}
