use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

/// Why uploads are currently gated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    User,
    Network,
    Challenge,
}

/// Lifecycle of the active album transfer.
///
/// `Idle` is the empty state (engine start, cleared transfer), `Halted` is a
/// finished or abandoned album.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum TransferStatus {
    #[default]
    Idle,
    Running,
    Paused(PauseReason),
    Halted,
}

/// Inputs of the status state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    Start,
    Pause(PauseReason),
    Resume,
    /// Reachability probe failed; only a running transfer pauses
    NetworkLost,
    NetworkRestored,
    ChallengeCleared,
    Stop,
    Reset,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("no transfer is running")]
    NotRunning,
}

impl TransferStatus {
    /// An album transfer is in progress (possibly paused)
    pub fn is_running(&self) -> bool {
        matches!(self, TransferStatus::Running | TransferStatus::Paused(_))
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, TransferStatus::Paused(_))
    }

    pub fn paused_reason(&self) -> Option<PauseReason> {
        match self {
            TransferStatus::Paused(reason) => Some(*reason),
            _ => None,
        }
    }

    pub fn apply(self, event: StatusEvent) -> Result<TransferStatus, TransitionError> {
        use TransferStatus::*;

        let next = match (self, event) {
            (_, StatusEvent::Start) => Running,
            (_, StatusEvent::Reset) => Idle,

            (Running | Paused(_), StatusEvent::Pause(reason)) => Paused(reason),
            (Idle | Halted, StatusEvent::Pause(_)) => return Err(TransitionError::NotRunning),

            (Running | Paused(_), StatusEvent::Resume) => Running,
            (Idle | Halted, StatusEvent::Resume) => return Err(TransitionError::NotRunning),

            (Running, StatusEvent::NetworkLost) => Paused(PauseReason::Network),
            (status, StatusEvent::NetworkLost) => status,

            (Paused(PauseReason::Network), StatusEvent::NetworkRestored) => Running,
            (status, StatusEvent::NetworkRestored) => status,

            (Paused(PauseReason::Challenge), StatusEvent::ChallengeCleared) => Running,
            (status, StatusEvent::ChallengeCleared) => status,

            (Running | Paused(_), StatusEvent::Stop) => Halted,
            (status @ (Idle | Halted), StatusEvent::Stop) => status,
        };

        Ok(next)
    }
}

/// Album identity as used by the backend and the ledger
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlbumRef {
    pub id: String,
    pub name: String,
}

/// Album as listed by the source catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Album {
    pub id: String,
    pub name: String,
    pub file_count: usize,
}

impl Album {
    pub fn album_ref(&self) -> AlbumRef {
        AlbumRef {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

/// One downloadable file of an album
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceFile {
    pub filename: String,
    pub file_id: String,
    #[serde(default)]
    pub scene_label: String,
    pub source_url: String,
}

/// Which of the enumerated files an album transfer should process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSelection {
    /// First `n` files in source order
    First(usize),
    /// Only files with these names (bulk retry)
    Named(HashSet<String>),
}

impl FileSelection {
    pub fn apply(&self, files: Vec<SourceFile>) -> Vec<SourceFile> {
        match self {
            FileSelection::First(count) => files.into_iter().take(*count).collect(),
            FileSelection::Named(names) => files
                .into_iter()
                .filter(|f| names.contains(&f.filename))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSuccess {
    pub filename: String,
    pub skipped: bool,
    pub object_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFailure {
    pub filename: String,
    pub error: String,
}

/// Terminal outcome of one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Uploaded(UploadSuccess),
    Failed(UploadFailure),
}

/// Failure tagged with its album, kept across album resets for bulk retry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub filename: String,
    pub error: String,
    pub album_id: String,
    pub album_name: String,
}

/// Snapshot of the active album transfer.
///
/// `completed` always equals `successes.len() + failures.len()`; the state
/// store changes all three in one step.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferState {
    pub status: TransferStatus,
    pub album_id: Option<String>,
    pub album_name: Option<String>,
    pub total: usize,
    pub completed: usize,
    pub successes: Vec<UploadSuccess>,
    pub failures: Vec<UploadFailure>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub delay_ms: u64,
    pub domain: Option<String>,
    /// Bumped on every published mutation
    pub version: u64,
}

impl TransferState {
    pub fn running(&self) -> bool {
        self.status.is_running()
    }

    pub fn paused(&self) -> bool {
        self.status.is_paused()
    }

    pub fn paused_reason(&self) -> Option<PauseReason> {
        self.status.paused_reason()
    }

    pub fn album_ref(&self) -> Option<AlbumRef> {
        match (&self.album_id, &self.album_name) {
            (Some(id), Some(name)) => Some(AlbumRef {
                id: id.clone(),
                name: name.clone(),
            }),
            _ => None,
        }
    }

    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        ((self.completed.min(self.total) as f64 / self.total as f64) * 100.0) as u8
    }
}

/// Descriptive fields external collaborators may change
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub album_name: Option<String>,
    pub total: Option<usize>,
    pub delay_ms: Option<u64>,
    pub domain: Option<String>,
}

/// Per-album line of a run summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlbumLog {
    pub album_id: String,
    pub album_name: String,
    pub total_files: usize,
    pub successful: usize,
    pub failed: usize,
    pub failures: Vec<UploadFailure>,
}

impl AlbumLog {
    pub fn from_state(album: &AlbumRef, state: &TransferState) -> Self {
        Self {
            album_id: album.id.clone(),
            album_name: album.name.clone(),
            total_files: state.total,
            successful: state.successes.len(),
            failed: state.failures.len(),
            failures: state.failures.clone(),
        }
    }
}

/// Result of a batch or bulk-retry run. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub domain: Option<String>,
    pub delay_ms: u64,
    pub total_files: usize,
    pub successful: usize,
    pub total_failed: usize,
    pub failures: Vec<LedgerEntry>,
    pub albums: Vec<AlbumLog>,
}

/// What the last finished run left behind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunSnapshot {
    Album(TransferState),
    Batch(RunSummary),
}

impl RunSnapshot {
    /// Failures of the run, tagged with their album
    pub fn failures(&self) -> Vec<LedgerEntry> {
        match self {
            RunSnapshot::Batch(summary) => summary.failures.clone(),
            RunSnapshot::Album(state) => {
                let Some(album) = state.album_ref() else {
                    return Vec::new();
                };
                state
                    .failures
                    .iter()
                    .map(|f| LedgerEntry {
                        filename: f.filename.clone(),
                        error: f.error.clone(),
                        album_id: album.id.clone(),
                        album_name: album.name.clone(),
                    })
                    .collect()
            }
        }
    }

    pub fn domain(&self) -> Option<&str> {
        match self {
            RunSnapshot::Album(state) => state.domain.as_deref(),
            RunSnapshot::Batch(summary) => summary.domain.as_deref(),
        }
    }

    pub fn delay_ms(&self) -> u64 {
        match self {
            RunSnapshot::Album(state) => state.delay_ms,
            RunSnapshot::Batch(summary) => summary.delay_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> SourceFile {
        SourceFile {
            filename: name.to_string(),
            file_id: format!("id-{}", name),
            scene_label: "Ceremony".to_string(),
            source_url: format!("https://source.test/{}", name),
        }
    }

    #[test]
    fn test_pause_requires_running_transfer() {
        assert_eq!(
            TransferStatus::Idle.apply(StatusEvent::Pause(PauseReason::User)),
            Err(TransitionError::NotRunning)
        );
        assert_eq!(
            TransferStatus::Halted.apply(StatusEvent::Resume),
            Err(TransitionError::NotRunning)
        );
        assert_eq!(
            TransferStatus::Running.apply(StatusEvent::Pause(PauseReason::User)),
            Ok(TransferStatus::Paused(PauseReason::User))
        );
    }

    #[test]
    fn test_only_network_pause_self_heals() {
        let network = TransferStatus::Paused(PauseReason::Network);
        let user = TransferStatus::Paused(PauseReason::User);
        let challenge = TransferStatus::Paused(PauseReason::Challenge);

        assert_eq!(
            network.apply(StatusEvent::NetworkRestored),
            Ok(TransferStatus::Running)
        );
        assert_eq!(user.apply(StatusEvent::NetworkRestored), Ok(user));
        assert_eq!(challenge.apply(StatusEvent::NetworkRestored), Ok(challenge));
        assert_eq!(
            challenge.apply(StatusEvent::ChallengeCleared),
            Ok(TransferStatus::Running)
        );
        assert_eq!(user.apply(StatusEvent::ChallengeCleared), Ok(user));
    }

    #[test]
    fn test_network_loss_never_replaces_another_pause() {
        assert_eq!(
            TransferStatus::Running.apply(StatusEvent::NetworkLost),
            Ok(TransferStatus::Paused(PauseReason::Network))
        );
        for status in [
            TransferStatus::Idle,
            TransferStatus::Halted,
            TransferStatus::Paused(PauseReason::User),
            TransferStatus::Paused(PauseReason::Challenge),
            TransferStatus::Paused(PauseReason::Network),
        ] {
            assert_eq!(status.apply(StatusEvent::NetworkLost), Ok(status));
        }
    }

    #[test]
    fn test_stop_and_reset() {
        assert_eq!(
            TransferStatus::Paused(PauseReason::Challenge).apply(StatusEvent::Stop),
            Ok(TransferStatus::Halted)
        );
        assert_eq!(
            TransferStatus::Idle.apply(StatusEvent::Stop),
            Ok(TransferStatus::Idle)
        );
        assert_eq!(
            TransferStatus::Running.apply(StatusEvent::Reset),
            Ok(TransferStatus::Idle)
        );
        assert!(!TransferStatus::Halted.is_running());
        assert!(!TransferStatus::Halted.is_paused());
    }

    #[test]
    fn test_file_selection() {
        let files = vec![file("a.jpg"), file("b.jpg"), file("c.jpg")];

        let first = FileSelection::First(2).apply(files.clone());
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].filename, "b.jpg");

        let names: HashSet<String> = ["c.jpg".to_string(), "x.jpg".to_string()].into();
        let named = FileSelection::Named(names).apply(files);
        assert_eq!(named.len(), 1);
        assert_eq!(named[0].filename, "c.jpg");
    }

    #[test]
    fn test_album_snapshot_failures_are_tagged() {
        let state = TransferState {
            status: TransferStatus::Halted,
            album_id: Some("42".to_string()),
            album_name: Some("Smith Wedding".to_string()),
            total: 2,
            completed: 1,
            failures: vec![UploadFailure {
                filename: "a.jpg".to_string(),
                error: "HTTP 500".to_string(),
            }],
            ..Default::default()
        };

        let failures = RunSnapshot::Album(state).failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].album_id, "42");
        assert_eq!(failures[0].album_name, "Smith Wedding");
    }

    #[test]
    fn test_status_serializes_with_reason() {
        let json = serde_json::to_value(TransferStatus::Paused(PauseReason::Network)).unwrap();
        assert_eq!(json["state"], "paused");
        assert_eq!(json["reason"], "network");
    }
}
