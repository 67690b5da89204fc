use crate::transfer::TransferError;
use reqwest::StatusCode;
use tracing::trace;

/// Retrieves file bytes from the source site under the user's session
#[async_trait::async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, TransferError>;
}

/// Source fetcher that replays the browser session cookie
pub struct HttpSourceFetcher {
    client: reqwest::Client,
    session_cookie: Option<String>,
}

impl HttpSourceFetcher {
    pub fn new(session_cookie: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            session_cookie,
        }
    }
}

/// Statuses the source uses when it refuses automated traffic
fn is_blocking_status(status: StatusCode) -> bool {
    status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS
}

#[async_trait::async_trait]
impl SourceFetcher for HttpSourceFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, TransferError> {
        let mut request = self.client.get(url);
        if let Some(cookie) = &self.session_cookie {
            request = request.header(reqwest::header::COOKIE, cookie);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransferError::Network(format!("source fetch failed: {}", e)))?;

        let status = response.status();
        if is_blocking_status(status) {
            return Err(TransferError::Blocked(format!(
                "source answered HTTP {}",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(TransferError::Rejected(format!(
                "Source fetch failed: HTTP {}",
                status.as_u16()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransferError::Network(format!("source fetch failed: {}", e)))?;
        trace!("Fetched {} bytes from {}", bytes.len(), url);
        Ok(bytes.to_vec())
    }
}
