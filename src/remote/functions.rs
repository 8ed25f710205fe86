//! Serverless function deployment channel.
//!
//! Talks to the platform management API for function listing, bundle
//! download, deployment, and deletion. Bundle files travel as base64
//! payloads inside JSON bodies in both directions. Deploy rejections that
//! name an unsupported native module are classified as incompatible so the
//! planner can report them instead of retrying.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, header};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::bundle::FunctionBundle;
use crate::config::Environment;
use crate::error::{RemoteError, Result};

use super::endpoint::ConnectionEndpoint;

/// Default request timeout in seconds. Deploys upload whole bundles.
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// One deployed serverless function as reported by the management API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionInfo {
    /// URL-safe function identifier.
    pub slug: String,
    /// Human-readable name.
    pub name: String,
    /// Deployment status reported by the platform.
    pub status: String,
    /// Monotonic deployment version.
    pub version: u32,
    /// Whether the platform checks JWTs before invoking.
    pub verify_jwt: bool,
    /// Entrypoint path within the bundle, when reported.
    pub entrypoint_path: Option<String>,
    /// Import map path within the bundle, when reported.
    pub import_map_path: Option<String>,
    /// Last deployment time, when reported.
    pub updated_at: Option<DateTime<Utc>>,
}

/// List/download/deploy/delete against one environment's function runtime.
#[async_trait]
pub trait FunctionChannel: Send + Sync {
    /// Lists all deployed functions.
    async fn list_functions(&self, endpoint: &ConnectionEndpoint) -> Result<Vec<FunctionInfo>>;

    /// Downloads the deployed bundle for one function.
    async fn download_bundle(
        &self,
        endpoint: &ConnectionEndpoint,
        slug: &str,
    ) -> Result<FunctionBundle>;

    /// Deploys a bundle, creating the function or bumping its version.
    async fn deploy_function(
        &self,
        endpoint: &ConnectionEndpoint,
        info: &FunctionInfo,
        bundle: &FunctionBundle,
    ) -> Result<()>;

    /// Deletes one function.
    async fn delete_function(&self, endpoint: &ConnectionEndpoint, slug: &str) -> Result<()>;
}

/// Management API function entry. Timestamps arrive as epoch milliseconds.
#[derive(Debug, Deserialize)]
struct FunctionEntry {
    slug: String,
    name: String,
    status: String,
    version: u32,
    #[serde(default)]
    verify_jwt: bool,
    entrypoint_path: Option<String>,
    import_map_path: Option<String>,
    updated_at: Option<i64>,
}

impl FunctionEntry {
    fn into_info(self) -> FunctionInfo {
        FunctionInfo {
            slug: self.slug,
            name: self.name,
            status: self.status,
            version: self.version,
            verify_jwt: self.verify_jwt,
            entrypoint_path: self.entrypoint_path,
            import_map_path: self.import_map_path,
            updated_at: self.updated_at.and_then(DateTime::from_timestamp_millis),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FilePayload {
    name: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct BundlePayload {
    files: Vec<FilePayload>,
}

/// HTTP-backed function channel for one environment.
#[derive(Debug, Clone)]
pub struct HttpFunctionChannel {
    client: Client,
    base_url: String,
    access_token: String,
    project_ref: String,
}

impl HttpFunctionChannel {
    /// Creates a channel for the given environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(environment: &Environment) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| {
                RemoteError::operation(
                    "function-client",
                    format!("Failed to create HTTP client: {e}"),
                )
            })?;

        Ok(Self {
            client,
            base_url: String::from("https://api.supabase.com"),
            access_token: environment.credentials.access_token.clone(),
            project_ref: environment.project_ref.clone(),
        })
    }

    /// Overrides the API base URL (used by tests against a local server).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn functions_url(&self) -> String {
        format!("{}/v1/projects/{}/functions", self.base_url, self.project_ref)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header(
            header::AUTHORIZATION,
            format!("Bearer {}", self.access_token),
        )
    }

    async fn send(
        &self,
        endpoint: &ConnectionEndpoint,
        operation: &str,
        builder: RequestBuilder,
    ) -> Result<Response> {
        let response = self.authorize(builder).send().await.map_err(|e| {
            RemoteError::unreachable(endpoint.describe(), format!("Request failed: {e}"))
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok());
        let body = response.text().await.unwrap_or_default();

        if status.is_client_error() && is_incompatibility_signature(&body) {
            return Err(RemoteError::Incompatible {
                resource: operation.to_string(),
                message: body,
            }
            .into());
        }

        Err(RemoteError::from_http_status(operation, status.as_u16(), retry_after, &body).into())
    }
}

#[async_trait]
impl FunctionChannel for HttpFunctionChannel {
    async fn list_functions(&self, endpoint: &ConnectionEndpoint) -> Result<Vec<FunctionInfo>> {
        let response = self
            .send(
                endpoint,
                "list-functions",
                self.client.get(self.functions_url()),
            )
            .await?;

        let entries: Vec<FunctionEntry> = response.json().await.map_err(|e| {
            RemoteError::InvalidResponse {
                message: format!("Failed to parse function listing: {e}"),
            }
        })?;

        let mut functions: Vec<FunctionInfo> =
            entries.into_iter().map(FunctionEntry::into_info).collect();
        functions.sort_by(|a, b| a.slug.cmp(&b.slug));
        debug!(count = functions.len(), "listed deployed functions");
        Ok(functions)
    }

    async fn download_bundle(
        &self,
        endpoint: &ConnectionEndpoint,
        slug: &str,
    ) -> Result<FunctionBundle> {
        let url = format!("{}/{slug}/body", self.functions_url());
        let response = self
            .send(endpoint, "download-bundle", self.client.get(&url))
            .await?;

        let payload: BundlePayload = response.json().await.map_err(|e| {
            RemoteError::InvalidResponse {
                message: format!("Failed to parse bundle for '{slug}': {e}"),
            }
        })?;

        let mut bundle = FunctionBundle::new(slug);
        for file in payload.files {
            let content = BASE64.decode(&file.content).map_err(|e| {
                RemoteError::InvalidResponse {
                    message: format!("Invalid base64 in '{slug}/{}': {e}", file.name),
                }
            })?;
            bundle.insert_file(file.name, content);
        }
        Ok(bundle)
    }

    async fn deploy_function(
        &self,
        endpoint: &ConnectionEndpoint,
        info: &FunctionInfo,
        bundle: &FunctionBundle,
    ) -> Result<()> {
        let files: Vec<FilePayload> = bundle
            .files()
            .map(|(name, content)| FilePayload {
                name: name.to_string(),
                content: BASE64.encode(content),
            })
            .collect();

        let body = serde_json::json!({
            "name": info.name,
            "verify_jwt": info.verify_jwt,
            "entrypoint_path": info.entrypoint_path,
            "import_map_path": info.import_map_path,
            "files": files,
        });

        let url = format!("{}/{}/deploy", self.functions_url(), info.slug);
        debug!(slug = %info.slug, files = files.len(), "deploying function bundle");
        self.send(endpoint, "deploy-function", self.client.post(&url).json(&body))
            .await?;
        Ok(())
    }

    async fn delete_function(&self, endpoint: &ConnectionEndpoint, slug: &str) -> Result<()> {
        let url = format!("{}/{slug}", self.functions_url());
        self.send(endpoint, "delete-function", self.client.delete(&url))
            .await?;
        Ok(())
    }
}

/// Returns true when a deploy rejection names a capability the edge runtime
/// cannot provide, such as a native Node module.
#[must_use]
pub fn is_incompatibility_signature(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("native module")
        || lower.contains(".node file")
        || lower.contains("unsupported module")
        || lower.contains("not supported in the edge runtime")
}
