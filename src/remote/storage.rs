//! Object storage channel.
//!
//! Talks to the platform's storage HTTP API: bucket listing and creation,
//! hierarchical object listing (folders are entries without metadata and
//! are walked iteratively), object download/upload, and the deletions
//! replace mode needs. Every response status goes through the shared HTTP
//! classifier so the engine only ever sees taxonomy classes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, header};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::Environment;
use crate::error::{RemoteError, Result};

use super::endpoint::ConnectionEndpoint;

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Page size for object listing.
const LIST_PAGE_SIZE: usize = 1000;

/// One storage bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketInfo {
    /// Bucket name.
    pub name: String,
    /// Whether objects are publicly readable.
    pub public: bool,
}

/// One stored object as reported by a list operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Object key, including any folder prefix.
    pub key: String,
    /// Entity tag, when the backend reports one on listing.
    pub etag: Option<String>,
    /// Object size in bytes, when reported.
    pub size: Option<u64>,
    /// Last update time, when reported.
    pub updated_at: Option<DateTime<Utc>>,
    /// Content type, when reported.
    pub content_type: Option<String>,
}

/// List/download/upload/create-bucket against one environment's blob store.
#[async_trait]
pub trait StorageChannel: Send + Sync {
    /// Lists all buckets.
    async fn list_buckets(&self, endpoint: &ConnectionEndpoint) -> Result<Vec<BucketInfo>>;

    /// Creates a bucket.
    async fn create_bucket(
        &self,
        endpoint: &ConnectionEndpoint,
        bucket: &BucketInfo,
    ) -> Result<()>;

    /// Empties and deletes a bucket.
    async fn delete_bucket(&self, endpoint: &ConnectionEndpoint, name: &str) -> Result<()>;

    /// Lists every object in a bucket, folders included, in key order.
    async fn list_objects(
        &self,
        endpoint: &ConnectionEndpoint,
        bucket: &str,
    ) -> Result<Vec<ObjectInfo>>;

    /// Downloads one object.
    async fn download_object(
        &self,
        endpoint: &ConnectionEndpoint,
        bucket: &str,
        key: &str,
    ) -> Result<Vec<u8>>;

    /// Uploads one object, overwriting any existing content at the key.
    async fn upload_object(
        &self,
        endpoint: &ConnectionEndpoint,
        bucket: &str,
        key: &str,
        content: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<()>;

    /// Deletes one object.
    async fn delete_object(
        &self,
        endpoint: &ConnectionEndpoint,
        bucket: &str,
        key: &str,
    ) -> Result<()>;
}

/// Storage API entry as returned by the list endpoint. Folder entries
/// carry no metadata.
#[derive(Debug, Deserialize)]
struct ListEntry {
    name: String,
    id: Option<String>,
    updated_at: Option<DateTime<Utc>>,
    metadata: Option<ListEntryMetadata>,
}

#[derive(Debug, Deserialize)]
struct ListEntryMetadata {
    #[serde(rename = "eTag")]
    etag: Option<String>,
    size: Option<u64>,
    mimetype: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BucketEntry {
    name: String,
    #[serde(default)]
    public: bool,
}

/// HTTP-backed storage channel for one environment.
#[derive(Debug, Clone)]
pub struct HttpStorageChannel {
    client: Client,
    base_url: String,
    service_key: String,
}

impl HttpStorageChannel {
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
                RemoteError::operation("storage-client", format!("Failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            base_url: format!("https://{}.supabase.co/storage/v1", environment.project_ref),
            service_key: environment.credentials.service_key.clone(),
        })
    }

    /// Overrides the API base URL (used by tests against a local server).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header(header::AUTHORIZATION, format!("Bearer {}", self.service_key))
            .header("apikey", &self.service_key)
    }

    /// Sends one request and classifies the outcome.
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

        let retry_after = retry_after_secs(&response);
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::from_http_status(operation, status.as_u16(), retry_after, &body).into())
    }

    /// Lists one page of entries under a prefix.
    async fn list_page(
        &self,
        endpoint: &ConnectionEndpoint,
        bucket: &str,
        prefix: &str,
        offset: usize,
    ) -> Result<Vec<ListEntry>> {
        let url = format!("{}/object/list/{bucket}", self.base_url);
        let body = serde_json::json!({
            "prefix": prefix,
            "limit": LIST_PAGE_SIZE,
            "offset": offset,
            "sortBy": { "column": "name", "order": "asc" },
        });

        let response = self
            .send(endpoint, "list-objects", self.client.post(&url).json(&body))
            .await?;

        response.json().await.map_err(|e| {
            RemoteError::InvalidResponse {
                message: format!("Failed to parse object listing: {e}"),
            }
            .into()
        })
    }
}

#[async_trait]
impl StorageChannel for HttpStorageChannel {
    async fn list_buckets(&self, endpoint: &ConnectionEndpoint) -> Result<Vec<BucketInfo>> {
        let url = format!("{}/bucket", self.base_url);
        let response = self
            .send(endpoint, "list-buckets", self.client.get(&url))
            .await?;

        let entries: Vec<BucketEntry> = response.json().await.map_err(|e| {
            RemoteError::InvalidResponse {
                message: format!("Failed to parse bucket listing: {e}"),
            }
        })?;

        Ok(entries
            .into_iter()
            .map(|b| BucketInfo {
                name: b.name,
                public: b.public,
            })
            .collect())
    }

    async fn create_bucket(
        &self,
        endpoint: &ConnectionEndpoint,
        bucket: &BucketInfo,
    ) -> Result<()> {
        let url = format!("{}/bucket", self.base_url);
        let body = serde_json::json!({
            "id": bucket.name,
            "name": bucket.name,
            "public": bucket.public,
        });

        self.send(endpoint, "create-bucket", self.client.post(&url).json(&body))
            .await?;
        Ok(())
    }

    async fn delete_bucket(&self, endpoint: &ConnectionEndpoint, name: &str) -> Result<()> {
        // The API refuses to drop a non-empty bucket
        let empty_url = format!("{}/bucket/{name}/empty", self.base_url);
        self.send(endpoint, "empty-bucket", self.client.post(&empty_url))
            .await?;

        let url = format!("{}/bucket/{name}", self.base_url);
        self.send(endpoint, "delete-bucket", self.client.delete(&url))
            .await?;
        Ok(())
    }

    async fn list_objects(
        &self,
        endpoint: &ConnectionEndpoint,
        bucket: &str,
    ) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut prefixes = vec![String::new()];

        // The list endpoint is folder-scoped; walk folders breadth-first
        while let Some(prefix) = prefixes.pop() {
            let mut offset = 0;
            loop {
                let page = self.list_page(endpoint, bucket, &prefix, offset).await?;
                let page_len = page.len();

                for entry in page {
                    let key = if prefix.is_empty() {
                        entry.name.clone()
                    } else {
                        format!("{prefix}{}", entry.name)
                    };

                    if entry.id.is_none() && entry.metadata.is_none() {
                        trace!(bucket, folder = %key, "descending into folder");
                        prefixes.push(format!("{key}/"));
                    } else {
                        let metadata = entry.metadata;
                        objects.push(ObjectInfo {
                            key,
                            etag: metadata
                                .as_ref()
                                .and_then(|m| m.etag.as_deref())
                                .map(normalize_etag),
                            size: metadata.as_ref().and_then(|m| m.size),
                            updated_at: entry.updated_at,
                            content_type: metadata.and_then(|m| m.mimetype),
                        });
                    }
                }

                if page_len < LIST_PAGE_SIZE {
                    break;
                }
                offset += page_len;
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        debug!(bucket, count = objects.len(), "listed storage objects");
        Ok(objects)
    }

    async fn download_object(
        &self,
        endpoint: &ConnectionEndpoint,
        bucket: &str,
        key: &str,
    ) -> Result<Vec<u8>> {
        let url = format!("{}/object/{bucket}/{key}", self.base_url);
        let response = self
            .send(endpoint, "download-object", self.client.get(&url))
            .await?;

        let bytes = response.bytes().await.map_err(|e| {
            RemoteError::InvalidResponse {
                message: format!("Failed to read object body: {e}"),
            }
        })?;
        Ok(bytes.to_vec())
    }

    async fn upload_object(
        &self,
        endpoint: &ConnectionEndpoint,
        bucket: &str,
        key: &str,
        content: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<()> {
        let url = format!("{}/object/{bucket}/{key}", self.base_url);
        let builder = self
            .client
            .post(&url)
            .header("x-upsert", "true")
            .header(
                header::CONTENT_TYPE,
                content_type.unwrap_or("application/octet-stream"),
            )
            .body(content);

        self.send(endpoint, "upload-object", builder).await?;
        Ok(())
    }

    async fn delete_object(
        &self,
        endpoint: &ConnectionEndpoint,
        bucket: &str,
        key: &str,
    ) -> Result<()> {
        let url = format!("{}/object/{bucket}/{key}", self.base_url);
        self.send(endpoint, "delete-object", self.client.delete(&url))
            .await?;
        Ok(())
    }
}

/// Extracts the Retry-After header as whole seconds.
fn retry_after_secs(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}

/// Strips the quoting some backends wrap around etag values.
fn normalize_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}
