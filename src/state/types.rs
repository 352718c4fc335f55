//! Types for the replication state store.

use chrono::{DateTime, Utc};

/// How a package version entered the store.
///
/// Versions pinned on the command line are tracked apart from versions
/// found by enumerating the source, so a pinned run never makes the package
/// root look fully enumerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOrigin {
    Discovered,
    Requested,
}

impl VersionOrigin {
    /// Convert to the string stored in either backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Requested => "requested",
        }
    }

    /// Parse from the stored string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "discovered" => Some(Self::Discovered),
            "requested" => Some(Self::Requested),
            _ => None,
        }
    }
}

/// Repository-level completeness flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepositoryState {
    pub all_versions_fetched: bool,
    pub all_versions_published: bool,
    pub publish_failed: bool,
}

/// A version currently in the failed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedVersion {
    pub package: String,
    pub version: String,
    pub error: String,
    pub failed_at: Option<DateTime<Utc>>,
}
