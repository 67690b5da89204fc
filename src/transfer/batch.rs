// # Batch Orchestrator
//
// Runs albums strictly one after another through the worker pool. Each album
// gets a fresh TransferState; the failure ledger accumulates across the whole
// run and ends up in the RunSummary, which bulk retry consumes later.

use crate::agent::{AgentError, Catalog, EnumerateError};
use crate::backend::{AlbumManifest, UploadBackend};
use crate::transfer::challenge::{ChallengeRecovery, ChallengeTrigger, RecoveryOutcome};
use crate::transfer::state::{AlbumStart, StateError, StateHandle};
use crate::transfer::types::{
    Album, AlbumLog, AlbumRef, FileSelection, LedgerEntry, RunSnapshot, RunSummary, StatePatch,
    TransferState,
};
use crate::transfer::worker::{AlbumJob, UploadWorkerPool};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("no matching albums")]
    NoMatchingAlbums,
    #[error("no failed files to retry")]
    NoFailedFiles,
    #[error("album catalog error: {0}")]
    Catalog(#[from] AgentError),
    #[error(transparent)]
    State(#[from] StateError),
}

/// Previously failed files of one album, for bulk retry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryGroup {
    pub album: AlbumRef,
    /// In ledger order, without duplicates
    pub filenames: Vec<String>,
}

/// Keep albums with files, restricted to `selection` when given
pub fn plan_batch(
    albums: Vec<Album>,
    selection: Option<&HashSet<String>>,
) -> Result<Vec<Album>, BatchError> {
    let planned: Vec<Album> = albums
        .into_iter()
        .filter(|album| album.file_count > 0)
        .filter(|album| selection.map_or(true, |ids| ids.contains(&album.id)))
        .collect();

    if planned.is_empty() {
        return Err(BatchError::NoMatchingAlbums);
    }
    Ok(planned)
}

/// Group failures by album in first-seen order, optionally limited to `album_ids`
pub fn plan_retry(
    failures: &[LedgerEntry],
    album_ids: Option<&HashSet<String>>,
) -> Result<Vec<RetryGroup>, BatchError> {
    let mut groups: Vec<RetryGroup> = Vec::new();

    for entry in failures {
        if album_ids.is_some_and(|ids| !ids.contains(&entry.album_id)) {
            continue;
        }

        let album = AlbumRef {
            id: entry.album_id.clone(),
            name: entry.album_name.clone(),
        };
        let index = match groups.iter().position(|g| g.album == album) {
            Some(i) => i,
            None => {
                groups.push(RetryGroup {
                    album,
                    filenames: Vec::new(),
                });
                groups.len() - 1
            }
        };
        let group = &mut groups[index];
        if !group.filenames.contains(&entry.filename) {
            group.filenames.push(entry.filename.clone());
        }
    }

    if groups.is_empty() {
        return Err(BatchError::NoFailedFiles);
    }
    Ok(groups)
}

struct AlbumRun {
    log: AlbumLog,
    /// The operator cleared the transfer while this album ran
    cancelled: bool,
}

pub struct BatchOrchestrator {
    state: StateHandle,
    catalog: Arc<dyn Catalog>,
    backend: Arc<dyn UploadBackend>,
    recovery: ChallengeRecovery,
    pool: UploadWorkerPool,
    concurrency: usize,
}

impl BatchOrchestrator {
    pub fn new(
        state: StateHandle,
        catalog: Arc<dyn Catalog>,
        backend: Arc<dyn UploadBackend>,
        recovery: ChallengeRecovery,
        pool: UploadWorkerPool,
        concurrency: usize,
    ) -> Self {
        Self {
            state,
            catalog,
            backend,
            recovery,
            pool,
            concurrency,
        }
    }

    /// Transfer the planned albums in order and save the summary as the last run
    pub async fn execute_batch(
        &self,
        albums: Vec<Album>,
        domain: Option<String>,
        delay_ms: u64,
    ) -> Result<RunSummary, BatchError> {
        info!("Starting batch of {} albums", albums.len());
        let plan = albums
            .into_iter()
            .map(|album| {
                let selection = FileSelection::First(album.file_count);
                (album.album_ref(), selection)
            })
            .collect();
        self.execute_sequence(plan, domain, delay_ms).await
    }

    /// Re-run only the failed files of each group, one album at a time
    pub async fn execute_retry(
        &self,
        groups: Vec<RetryGroup>,
        domain: Option<String>,
        delay_ms: u64,
    ) -> Result<RunSummary, BatchError> {
        info!("Retrying failed files of {} albums", groups.len());
        let plan = groups
            .into_iter()
            .map(|group| {
                let names: HashSet<String> = group.filenames.into_iter().collect();
                (group.album, FileSelection::Named(names))
            })
            .collect();
        self.execute_sequence(plan, domain, delay_ms).await
    }

    async fn execute_sequence(
        &self,
        plan: Vec<(AlbumRef, FileSelection)>,
        domain: Option<String>,
        delay_ms: u64,
    ) -> Result<RunSummary, BatchError> {
        let started_at = Utc::now();
        self.state.clear_ledger().await?;

        let mut albums = Vec::with_capacity(plan.len());
        let mut total_files = 0;
        let mut successful = 0;

        for (album, selection) in plan {
            let run = self
                .run_album(&album, selection, domain.clone(), delay_ms)
                .await?;
            total_files += run.log.total_files;
            successful += run.log.successful;
            albums.push(run.log);

            if run.cancelled {
                warn!("Transfer cleared, abandoning remaining albums");
                break;
            }
        }

        let failures = self.state.ledger().await?;
        let summary = RunSummary {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: Utc::now(),
            domain,
            delay_ms,
            total_files,
            successful,
            total_failed: failures.len(),
            failures,
            albums,
        };

        info!(
            "Run finished: {}/{} files uploaded, {} failed",
            summary.successful, summary.total_files, summary.total_failed
        );
        self.state
            .set_last_run(RunSnapshot::Batch(summary.clone()))
            .await?;
        Ok(summary)
    }

    /// Transfer one album and return its log
    pub async fn transfer_album(
        &self,
        album: &AlbumRef,
        selection: FileSelection,
        domain: Option<String>,
        delay_ms: u64,
    ) -> Result<AlbumLog, BatchError> {
        let run = self.run_album(album, selection, domain, delay_ms).await?;
        Ok(run.log)
    }

    async fn run_album(
        &self,
        album: &AlbumRef,
        selection: FileSelection,
        domain: Option<String>,
        delay_ms: u64,
    ) -> Result<AlbumRun, BatchError> {
        // Never overlap with a transfer that is still winding down
        self.state.wait_until_quiet().await?;

        let expected = match &selection {
            FileSelection::First(count) => *count,
            FileSelection::Named(names) => names.len(),
        };

        info!("Starting album '{}' ({} files)", album.name, expected);
        self.state
            .begin_album(AlbumStart {
                album: album.clone(),
                total: expected,
                delay_ms,
                domain: domain.clone(),
            })
            .await?;

        let manifest = AlbumManifest {
            album_id: album.id.clone(),
            album_name: album.name.clone(),
            total_files: expected,
            domain: domain.clone(),
        };
        if let Err(e) = self.backend.create_album(&manifest).await {
            warn!("Failed to register album '{}': {}", album.name, e);
        }

        loop {
            let trigger = match self.catalog.enumerate_files(&album.id).await {
                Ok(files) => {
                    let files = selection.apply(files);
                    if files.len() != expected {
                        self.state
                            .patch(StatePatch {
                                total: Some(files.len()),
                                ..Default::default()
                            })
                            .await?;
                    }

                    let job = AlbumJob {
                        album: album.clone(),
                        domain: domain.clone(),
                        delay_ms,
                        files,
                    };
                    self.pool.run(job, self.concurrency).await;
                    break;
                }
                Err(EnumerateError::ZeroItems) => ChallengeTrigger::ZeroItems,
                Err(EnumerateError::MetadataEmpty) => ChallengeTrigger::MetadataEmpty,
                Err(EnumerateError::Failed(message)) => {
                    error!("Could not enumerate '{}': {}", album.name, message);
                    break;
                }
            };

            match self.recovery.recover(trigger).await {
                RecoveryOutcome::Resolved { .. } => continue,
                RecoveryOutcome::AlreadyRecovering | RecoveryOutcome::Halted => {
                    self.recovery.wait_settled().await;
                    // Operator either resumes (retry enumeration) or clears
                    let state = self.state.wait_for(|s| !s.paused()).await?;
                    if !state.running() {
                        break;
                    }
                }
                RecoveryOutcome::SkippedAlbum | RecoveryOutcome::NotRunning => break,
            }
        }

        let finished = self.state.finish().await?;
        Ok(finalize(album, &finished))
    }
}

fn finalize(album: &AlbumRef, finished: &TransferState) -> AlbumRun {
    // A cleared transfer has already dropped the album's state
    let cancelled = finished.album_id.as_deref() != Some(album.id.as_str());
    let log = AlbumLog::from_state(album, finished);

    info!(
        "Album '{}' done: {} uploaded, {} failed",
        album.name, log.successful, log.failed
    );
    AlbumRun { log, cancelled }
}
