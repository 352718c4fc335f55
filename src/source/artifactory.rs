//! Artifactory REST client.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use super::{RepositorySummary, SourceError, SourceInventory};
use crate::package::{PackageDescriptor, PackageKind};

/// Storage-API marker that search results carry but download URLs don't.
const STORAGE_API_SEGMENT: &str = "api/storage/";

#[derive(Debug, Deserialize)]
struct StorageInfo {
    #[serde(rename = "repositoriesSummaryList", default)]
    repositories: Vec<RepositoryEntry>,
}

#[derive(Debug, Deserialize)]
struct RepositoryEntry {
    #[serde(rename = "repoKey")]
    repo_key: String,
    #[serde(rename = "repoType", default)]
    repo_type: String,
    #[serde(rename = "packageType", default)]
    package_type: String,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<UriEntry>,
}

#[derive(Debug, Deserialize)]
struct SearchResults {
    #[serde(default)]
    results: Vec<UriEntry>,
}

#[derive(Debug, Deserialize)]
struct UriEntry {
    uri: String,
}

/// Basic-auth client for one Artifactory instance. Each call makes a single
/// attempt; callers wrap calls in their retry policy.
pub struct ArtifactoryClient {
    http: Client,
    /// `<protocol>://<host>[/<prefix>]`, no trailing slash.
    base_url: String,
    user: String,
    password: String,
}

impl std::fmt::Debug for ArtifactoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactoryClient")
            .field("base_url", &self.base_url)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Turn a storage-API URI into a direct download URL.
fn download_url(uri: &str) -> String {
    uri.replacen(STORAGE_API_SEGMENT, "", 1)
}

/// Search hits that actually belong to `package` rather than a package
/// sharing its basename elsewhere in the repository.
fn search_hits_for(package: &PackageDescriptor, hits: Vec<UriEntry>) -> Vec<String> {
    let needle = format!("/{}/", package.path);
    hits.into_iter()
        .filter(|hit| hit.uri.contains(&needle))
        .map(|hit| download_url(&hit.uri))
        .collect()
}

impl ArtifactoryClient {
    pub fn new(
        base_url: &str,
        user: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Http {
                url: base_url.to_string(),
                source: e,
            })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            user: user.to_string(),
            password: password.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_once(&self, url: &str) -> Result<reqwest::Response, SourceError> {
        let response = self
            .http
            .get(url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|e| SourceError::Http {
                url: url.to_string(),
                source: e,
            })?;
        if !response.status().is_success() {
            return Err(SourceError::HttpStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SourceError> {
        let url = self.url(path);
        tracing::debug!(url = %url, "GET");
        let body = self
            .get_once(&url)
            .await?
            .text()
            .await
            .map_err(|e| SourceError::Http {
                url: url.to_string(),
                source: e,
            })?;
        serde_json::from_str(&body).map_err(|e| SourceError::InvalidResponse {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl SourceInventory for ArtifactoryClient {
    async fn repositories(&self) -> Result<Vec<RepositorySummary>, SourceError> {
        let info: StorageInfo = self.get_json("/api/storageinfo").await?;
        Ok(info
            .repositories
            .into_iter()
            .filter(|r| r.repo_key != "TOTAL")
            .map(|r| RepositorySummary {
                key: r.repo_key,
                repo_type: r.repo_type,
                package_type: r.package_type,
            })
            .collect())
    }

    async fn repository_files(&self, repo: &str) -> Result<Vec<String>, SourceError> {
        let list: FileList = self
            .get_json(&format!("/api/storage/{}?list&deep=1&listFolders=0", repo))
            .await?;
        Ok(list.files.into_iter().map(|f| f.uri).collect())
    }

    async fn package_exists(&self, repo: &str, pkg: &str) -> Result<bool, SourceError> {
        match self
            .get_json::<serde_json::Value>(&format!("/api/storage/{}/{}", repo, pkg))
            .await
        {
            Ok(item) => Ok(item
                .get("uri")
                .and_then(|u| u.as_str())
                .is_some_and(|u| u.contains(&format!("{}/{}", repo, pkg)))),
            Err(SourceError::HttpStatus { status: 404, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn package_binaries(
        &self,
        package: &PackageDescriptor,
    ) -> Result<Vec<String>, SourceError> {
        match package.kind {
            // Package index layouts are listed directly; search misses
            // normalized-name variants.
            PackageKind::Pypi => {
                let root = format!("/{}/{}", package.repository, package.basename());
                let list: FileList = self
                    .get_json(&format!("/api/storage{}?list&deep=1", root))
                    .await?;
                if list.files.is_empty() {
                    tracing::info!(
                        repository = %package.repository,
                        package = %package.path,
                        "No files found in source"
                    );
                }
                Ok(list
                    .files
                    .into_iter()
                    .map(|f| format!("{}{}{}", self.base_url, root, f.uri))
                    .collect())
            }
            PackageKind::Maven | PackageKind::Npm => {
                let results: SearchResults = self
                    .get_json(&format!(
                        "/api/search/artifact?name={}&repos={}",
                        urlencoding::encode(package.basename()),
                        urlencoding::encode(&package.repository)
                    ))
                    .await?;
                Ok(search_hits_for(package, results.results))
            }
        }
    }

    async fn fetch_binary(&self, uri: &str, dest: &Path) -> Result<u64, SourceError> {
        tracing::debug!(uri = %uri, dest = %dest.display(), "Downloading binary");
        let response = self.get_once(uri).await?;
        let disk_error = |e: std::io::Error| SourceError::Disk {
            path: dest.display().to_string(),
            source: e,
        };
        // Truncates any partial file left by an earlier attempt
        let mut file = tokio::fs::File::create(dest).await.map_err(disk_error)?;
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SourceError::Http {
                url: uri.to_string(),
                source: e,
            })?;
            file.write_all(&chunk).await.map_err(disk_error)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(disk_error)?;
        Ok(written)
    }

    async fn package_manifest(
        &self,
        repo: &str,
        pkg: &str,
    ) -> Result<serde_json::Value, SourceError> {
        self.get_json(&format!("/{}/.npm/{}/package.json", repo, pkg))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_url_strips_storage_api() {
        assert_eq!(
            download_url("https://src/artifactory/api/storage/libs/com/acme/lib/1.0/lib-1.0.jar"),
            "https://src/artifactory/libs/com/acme/lib/1.0/lib-1.0.jar"
        );
        assert_eq!(download_url("https://src/libs/x.jar"), "https://src/libs/x.jar");
    }

    #[test]
    fn test_search_hits_filtered_to_package_path() {
        let pkg = PackageDescriptor::new("libs", "com/acme/lib", PackageKind::Maven, "");
        let hits = vec![
            UriEntry {
                uri: "https://src/api/storage/libs/com/acme/lib/1.0/lib-1.0.jar".into(),
            },
            UriEntry {
                uri: "https://src/api/storage/libs/org/other/lib/1.0/lib-1.0.jar".into(),
            },
        ];
        assert_eq!(
            search_hits_for(&pkg, hits),
            vec!["https://src/libs/com/acme/lib/1.0/lib-1.0.jar"]
        );
    }

    #[test]
    fn test_storage_info_parsing() {
        let body = r#"{
            "repositoriesSummaryList": [
                {"repoKey": "libs-local", "repoType": "LOCAL", "packageType": "Maven"},
                {"repoKey": "npm-remote", "repoType": "REMOTE", "packageType": "Npm"},
                {"repoKey": "TOTAL", "repoType": "NA"}
            ]
        }"#;
        let info: StorageInfo = serde_json::from_str(body).unwrap();
        assert_eq!(info.repositories.len(), 3);
        assert_eq!(info.repositories[0].repo_key, "libs-local");
        assert_eq!(info.repositories[2].package_type, "");
    }

    #[test]
    fn test_file_list_tolerates_missing_files() {
        let list: FileList = serde_json::from_str(r#"{"uri": "x"}"#).unwrap();
        assert!(list.files.is_empty());
    }

    #[test]
    fn test_base_url_normalized() {
        let client = ArtifactoryClient::new(
            "https://src.example.com/artifactory/",
            "user",
            "secret",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            client.url("/api/storageinfo"),
            "https://src.example.com/artifactory/api/storageinfo"
        );
        assert!(!format!("{:?}", client).contains("secret"));
    }
}
