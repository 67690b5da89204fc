// Collaborators served by the cooperating page agent: the album catalog
// scraped from the source site, and the primitives challenge recovery needs
// (page reload, corrective action, unblock verification, operator alert).

use crate::transfer::{Album, SourceFile};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("page agent unreachable: {0}")]
    Unreachable(String),
    #[error("page agent error: {0}")]
    Failed(String),
}

impl From<reqwest::Error> for AgentError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            AgentError::Unreachable(e.to_string())
        } else {
            AgentError::Failed(e.to_string())
        }
    }
}

/// Why file enumeration for an album failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnumerateError {
    /// The source listed no files for an album that has some
    #[error("source returned zero items")]
    ZeroItems,
    /// The source returned empty album metadata
    #[error("source returned empty album metadata")]
    MetadataEmpty,
    #[error("enumeration failed: {0}")]
    Failed(String),
}

/// Album listing and per-album file enumeration
#[async_trait::async_trait]
pub trait Catalog: Send + Sync {
    async fn list_albums(&self) -> Result<Vec<Album>, AgentError>;

    /// Files of an album, in source order
    async fn enumerate_files(&self, album_id: &str) -> Result<Vec<SourceFile>, EnumerateError>;
}

/// Page-side actions used by challenge recovery
#[async_trait::async_trait]
pub trait PageAgent: Send + Sync {
    async fn reload_page(&self) -> Result<(), AgentError>;
    async fn trigger_corrective_action(&self) -> Result<(), AgentError>;
    async fn verify_unblocked(&self, album_id: &str) -> Result<bool, AgentError>;
    async fn show_alert(&self, message: &str) -> Result<(), AgentError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum EnumerationStatus {
    Ok,
    ZeroItems,
    MetadataEmpty,
}

#[derive(Debug, Deserialize)]
struct EnumerationResponse {
    status: EnumerationStatus,
    #[serde(default)]
    files: Vec<SourceFile>,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    cleared: bool,
}

/// HTTP client for a page agent running next to the source site session
pub struct HttpAgentClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAgentClient {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_action(&self, path: &str) -> Result<(), AgentError> {
        self.client
            .post(self.url(path))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn interpret_enumeration(response: EnumerationResponse) -> Result<Vec<SourceFile>, EnumerateError> {
    match response.status {
        EnumerationStatus::Ok if response.files.is_empty() => Err(EnumerateError::ZeroItems),
        EnumerationStatus::Ok => Ok(response.files),
        EnumerationStatus::ZeroItems => Err(EnumerateError::ZeroItems),
        EnumerationStatus::MetadataEmpty => Err(EnumerateError::MetadataEmpty),
    }
}

#[async_trait::async_trait]
impl Catalog for HttpAgentClient {
    async fn list_albums(&self) -> Result<Vec<Album>, AgentError> {
        let albums = self
            .client
            .get(self.url("/albums"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(albums)
    }

    async fn enumerate_files(&self, album_id: &str) -> Result<Vec<SourceFile>, EnumerateError> {
        let response = self
            .client
            .get(self.url(&format!("/albums/{}/files", album_id)))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| EnumerateError::Failed(e.to_string()))?;

        let body: EnumerationResponse = response
            .json()
            .await
            .map_err(|e| EnumerateError::Failed(e.to_string()))?;

        interpret_enumeration(body)
    }
}

#[async_trait::async_trait]
impl PageAgent for HttpAgentClient {
    async fn reload_page(&self) -> Result<(), AgentError> {
        self.post_action("/reload").await
    }

    async fn trigger_corrective_action(&self) -> Result<(), AgentError> {
        self.post_action("/unblock").await
    }

    async fn verify_unblocked(&self, album_id: &str) -> Result<bool, AgentError> {
        let response: VerifyResponse = self
            .client
            .get(self.url(&format!("/albums/{}/verify", album_id)))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.cleared)
    }

    async fn show_alert(&self, message: &str) -> Result<(), AgentError> {
        self.client
            .post(self.url("/alert"))
            .json(&serde_json::json!({ "message": message }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
