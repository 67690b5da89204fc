use thiserror::Error;

/// Failure of one step of the per-file pipeline.
///
/// Collaborators return these at the fetch/put boundary so the retry loop can
/// classify failures without looking at message text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("transfers are frozen while challenge recovery runs")]
    Frozen,
    #[error("source is blocking automated access: {0}")]
    Blocked(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("{0}")]
    Rejected(String),
    #[error("backend returned no upload URL")]
    MissingUploadUrl,
}

/// How the retry loop treats a [`TransferError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Wait for the freeze to lift, then retry the same attempt.
    Freeze,
    /// Back off and retry without consuming the retry budget.
    Blocking,
    /// Back off and retry without consuming the retry budget.
    Transient,
    /// Consumes one retry.
    Permanent,
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Frozen => ErrorKind::Freeze,
            TransferError::Blocked(_) => ErrorKind::Blocking,
            TransferError::Network(_) => ErrorKind::Transient,
            TransferError::Rejected(_) | TransferError::MissingUploadUrl => ErrorKind::Permanent,
        }
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() || e.is_request() {
            TransferError::Network(e.to_string())
        } else {
            TransferError::Rejected(e.to_string())
        }
    }
}
