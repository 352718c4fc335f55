//! CodeArtifact registry client.
//!
//! Control-plane calls go through the AWS SDK (built with SDK retries
//! disabled); binary uploads go straight to the repository endpoint over
//! HTTP with basic auth `aws:<token>`.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_codeartifact::types::{PackageFormat, PackageVersionStatus};
use aws_sdk_codeartifact::Client;
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::redirect::Policy;

use super::upload;
use super::{AuthToken, DestinationError, DestinationRegistry, UploadRequest, VersionStatus};
use crate::package::{PackageDescriptor, PackageKind};

const TOKEN_USER: &str = "aws";

fn format_of(kind: PackageKind) -> PackageFormat {
    match kind {
        PackageKind::Maven => PackageFormat::Maven,
        PackageKind::Pypi => PackageFormat::Pypi,
        PackageKind::Npm => PackageFormat::Npm,
    }
}

pub struct CodeArtifactRegistry {
    client: Client,
    http: reqwest::Client,
    domain: String,
    domain_owner: Option<String>,
}

impl std::fmt::Debug for CodeArtifactRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeArtifactRegistry")
            .field("domain", &self.domain)
            .field("domain_owner", &self.domain_owner)
            .finish_non_exhaustive()
    }
}

impl CodeArtifactRegistry {
    pub fn new(
        client: Client,
        domain: &str,
        domain_owner: Option<String>,
        timeout: Duration,
    ) -> Result<Self, DestinationError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(Policy::none())
            .build()
            .map_err(|e| DestinationError::Http {
                url: String::new(),
                source: e,
            })?;
        Ok(Self {
            client,
            http,
            domain: domain.to_string(),
            domain_owner,
        })
    }

    async fn send_upload(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<(), DestinationError> {
        let response = request.send().await.map_err(|e| DestinationError::Http {
            url: url.to_string(),
            source: e,
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(DestinationError::UploadStatus {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            body,
        })
    }
}

#[async_trait]
impl DestinationRegistry for CodeArtifactRegistry {
    async fn list_repositories(&self) -> Result<Vec<String>, DestinationError> {
        let mut names = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let out = self
                .client
                .list_repositories_in_domain()
                .domain(&self.domain)
                .set_domain_owner(self.domain_owner.clone())
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| DestinationError::api("list_repositories_in_domain", e))?;
            names.extend(
                out.repositories()
                    .iter()
                    .filter_map(|r| r.name().map(str::to_string)),
            );
            match out.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }
        Ok(names)
    }

    async fn create_repository(&self, name: &str) -> Result<(), DestinationError> {
        self.client
            .create_repository()
            .domain(&self.domain)
            .set_domain_owner(self.domain_owner.clone())
            .repository(name)
            .send()
            .await
            .map_err(|e| DestinationError::api("create_repository", e))?;
        tracing::info!(repository = %name, "Created destination repository");
        Ok(())
    }

    async fn repository_endpoint(
        &self,
        name: &str,
        kind: PackageKind,
    ) -> Result<String, DestinationError> {
        let out = self
            .client
            .get_repository_endpoint()
            .domain(&self.domain)
            .set_domain_owner(self.domain_owner.clone())
            .repository(name)
            .format(format_of(kind))
            .send()
            .await
            .map_err(|e| DestinationError::api("get_repository_endpoint", e))?;
        let endpoint = out.repository_endpoint().ok_or_else(|| {
            DestinationError::InvalidRequest(format!("no {} endpoint returned for {}", kind, name))
        })?;
        Ok(if endpoint.ends_with('/') {
            endpoint.to_string()
        } else {
            format!("{}/", endpoint)
        })
    }

    async fn authorization_token(&self) -> Result<AuthToken, DestinationError> {
        let out = self
            .client
            .get_authorization_token()
            .domain(&self.domain)
            .set_domain_owner(self.domain_owner.clone())
            .send()
            .await
            .map_err(|e| DestinationError::api("get_authorization_token", e))?;
        out.authorization_token()
            .map(|t| AuthToken(t.to_string()))
            .ok_or_else(|| DestinationError::InvalidRequest("empty authorization token".into()))
    }

    async fn describe_version(
        &self,
        package: &PackageDescriptor,
        version: &str,
    ) -> Result<VersionStatus, DestinationError> {
        let result = self
            .client
            .describe_package_version()
            .domain(&self.domain)
            .set_domain_owner(self.domain_owner.clone())
            .repository(&package.repository)
            .format(format_of(package.kind))
            .set_namespace(package.coordinates.namespace.clone())
            .package(&package.coordinates.name)
            .package_version(version)
            .send()
            .await;
        match result {
            Ok(out) => {
                let status = out.package_version().and_then(|v| v.status());
                Ok(match status {
                    Some(PackageVersionStatus::Published) => VersionStatus::Published,
                    Some(other) => VersionStatus::Other(other.as_str().to_string()),
                    None => VersionStatus::Other("unknown".to_string()),
                })
            }
            Err(e)
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_resource_not_found_exception()) =>
            {
                Ok(VersionStatus::NotFound)
            }
            Err(e) => Err(DestinationError::api("describe_package_version", e)),
        }
    }

    async fn delete_version(
        &self,
        package: &PackageDescriptor,
        version: &str,
    ) -> Result<(), DestinationError> {
        self.client
            .delete_package_versions()
            .domain(&self.domain)
            .set_domain_owner(self.domain_owner.clone())
            .repository(&package.repository)
            .format(format_of(package.kind))
            .set_namespace(package.coordinates.namespace.clone())
            .package(&package.coordinates.name)
            .versions(version)
            .send()
            .await
            .map_err(|e| DestinationError::api("delete_package_versions", e))?;
        Ok(())
    }

    async fn upload_binary(
        &self,
        token: &AuthToken,
        request: &UploadRequest<'_>,
    ) -> Result<(), DestinationError> {
        let package = request.package;
        let file_name = request
            .file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                DestinationError::InvalidRequest(format!(
                    "not a file path: {}",
                    request.file.display()
                ))
            })?;
        let data = tokio::fs::read(request.file)
            .await
            .map_err(|e| DestinationError::Disk {
                path: request.file.display().to_string(),
                source: e,
            })?;

        tracing::info!(
            repository = %package.repository,
            package = %package.path,
            version = %request.version,
            file = %file_name,
            "Publishing binary"
        );

        match package.kind {
            PackageKind::Maven => {
                let url = upload::maven_url(package, request.version, file_name);
                let builder = self
                    .http
                    .put(&url)
                    .basic_auth(TOKEN_USER, Some(&token.0))
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(data);
                self.send_upload(&url, builder).await
            }
            PackageKind::Npm => {
                let manifest = request.manifest.ok_or_else(|| {
                    DestinationError::InvalidRequest(format!(
                        "no package manifest for {}",
                        package.path
                    ))
                })?;
                let document =
                    upload::npm_document(manifest, package, request.version, file_name, &data)?;
                let url = upload::npm_url(package);
                let builder = self
                    .http
                    .put(&url)
                    .basic_auth(TOKEN_USER, Some(&token.0))
                    .json(&document);
                self.send_upload(&url, builder).await
            }
            PackageKind::Pypi => {
                let mut form = Form::new();
                for (name, value) in
                    upload::pypi_form_fields(package, request.version, file_name, &data)
                {
                    form = form.text(name, value);
                }
                let url = package.endpoint.clone();
                let content = Part::bytes(data)
                    .file_name(file_name.to_string())
                    .mime_str("application/octet-stream")
                    .map_err(|e| DestinationError::Http {
                        url: url.clone(),
                        source: e,
                    })?;
                let builder = self
                    .http
                    .post(&url)
                    .basic_auth(TOKEN_USER, Some(&token.0))
                    .multipart(form.part("content", content));
                self.send_upload(&url, builder).await
            }
        }
    }

    async fn finalize_status(
        &self,
        package: &PackageDescriptor,
        version: &str,
    ) -> Result<(), DestinationError> {
        let out = self
            .client
            .update_package_versions_status()
            .domain(&self.domain)
            .set_domain_owner(self.domain_owner.clone())
            .repository(&package.repository)
            .format(format_of(package.kind))
            .set_namespace(package.coordinates.namespace.clone())
            .package(&package.coordinates.name)
            .versions(version)
            .target_status(PackageVersionStatus::Published)
            .send()
            .await
            .map_err(|e| DestinationError::api("update_package_versions_status", e))?;
        if let Some(failure) = out.failed_versions().and_then(|f| f.get(version)) {
            return Err(DestinationError::Api {
                operation: "update_package_versions_status",
                message: failure
                    .error_message()
                    .unwrap_or("status update rejected")
                    .to_string(),
                retryable: false,
            });
        }
        tracing::debug!(
            repository = %package.repository,
            package = %package.path,
            version = %version,
            "Requested published status"
        );
        Ok(())
    }
}
