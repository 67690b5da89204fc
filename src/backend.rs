use crate::transfer::TransferError;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Request for an upload destination for one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTicketRequest {
    pub filename: String,
    pub album_id: String,
    pub album_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Where (and whether) to upload a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadDestination {
    /// Object already exists in the bucket
    Skip { object_path: Option<String> },
    Upload {
        upload_url: String,
        object_path: Option<String>,
    },
}

/// Descriptive fields registered after a successful upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    pub filename: String,
    pub album_id: String,
    pub album_name: String,
    pub scene: String,
    pub file_id: String,
    pub domain: String,
}

/// Album manifest registered before an album's uploads start
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlbumManifest {
    pub album_id: String,
    pub album_name: String,
    pub total_files: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Trait for the migration backend and the object store behind it (allows mocking for tests)
#[async_trait::async_trait]
pub trait UploadBackend: Send + Sync {
    async fn request_upload_destination(
        &self,
        request: &UploadTicketRequest,
    ) -> Result<UploadDestination, TransferError>;

    async fn put_bytes(&self, upload_url: &str, data: Vec<u8>) -> Result<(), TransferError>;

    async fn register_metadata(&self, metadata: &ImageMetadata) -> Result<(), TransferError>;

    async fn create_album(&self, manifest: &AlbumManifest) -> Result<(), TransferError>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadTicketResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    skipped: bool,
    upload_url: Option<String>,
    object_path: Option<String>,
    error: Option<String>,
}

/// HTTP client for the migration backend
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: String, auth_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
        }
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(format!("{}{}", self.base_url, path));
        match &self.auth_token {
            Some(token) => request.header("X-Auth-Token", token),
            None => request,
        }
    }
}

#[async_trait::async_trait]
impl UploadBackend for HttpBackend {
    async fn request_upload_destination(
        &self,
        request: &UploadTicketRequest,
    ) -> Result<UploadDestination, TransferError> {
        let response = self
            .post("/api/get-upload-url")
            .json(request)
            .send()
            .await
            .map_err(|e| TransferError::Network(format!("backend unreachable: {}", e)))?;

        let status = response.status();
        let body: UploadTicketResponse = response.json().await.unwrap_or_default();

        if !status.is_success() || !body.ok {
            return Err(TransferError::Rejected(body.error.unwrap_or_else(|| {
                format!("Upload URL request failed (HTTP {})", status.as_u16())
            })));
        }

        if body.skipped {
            return Ok(UploadDestination::Skip {
                object_path: body.object_path,
            });
        }

        let upload_url = body.upload_url.ok_or(TransferError::MissingUploadUrl)?;
        Ok(UploadDestination::Upload {
            upload_url,
            object_path: body.object_path,
        })
    }

    async fn put_bytes(&self, upload_url: &str, data: Vec<u8>) -> Result<(), TransferError> {
        debug!("Uploading {} bytes", data.len());

        let response = self
            .client
            .put(upload_url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(|e| TransferError::Network(format!("upload network error: {}", e)))?;

        if !response.status().is_success() {
            return Err(TransferError::Rejected(format!(
                "Upload failed: HTTP {}",
                response.status().as_u16()
            )));
        }
        Ok(())
    }

    async fn register_metadata(&self, metadata: &ImageMetadata) -> Result<(), TransferError> {
        let response = self
            .post("/api/set-image-metadata")
            .json(metadata)
            .send()
            .await?;
        response
            .error_for_status()
            .map_err(|e| TransferError::Rejected(e.to_string()))?;
        Ok(())
    }

    async fn create_album(&self, manifest: &AlbumManifest) -> Result<(), TransferError> {
        let response = self.post("/api/create-album").json(manifest).send().await?;
        response
            .error_for_status()
            .map_err(|e| TransferError::Rejected(e.to_string()))?;
        Ok(())
    }
}
