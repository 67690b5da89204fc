use crate::backend::{ImageMetadata, UploadBackend, UploadDestination, UploadTicketRequest};
use crate::config::TransferConfig;
use crate::source::SourceFetcher;
use crate::transfer::barrier::{Clearance, LivenessBarrier};
use crate::transfer::challenge::{ChallengeRecovery, ChallengeTrigger};
use crate::transfer::error::{ErrorKind, TransferError};
use crate::transfer::state::StateHandle;
use crate::transfer::types::{
    AlbumRef, FileOutcome, SourceFile, TransferStatus, UploadFailure, UploadSuccess,
};
use futures::future::join_all;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Files of one album handed to the pool
#[derive(Debug, Clone)]
pub struct AlbumJob {
    pub album: AlbumRef,
    pub domain: Option<String>,
    pub delay_ms: u64,
    pub files: Vec<SourceFile>,
}

/// Fixed-size pool of upload workers sharing one work cursor
#[derive(Clone)]
pub struct UploadWorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    state: StateHandle,
    barrier: LivenessBarrier,
    recovery: ChallengeRecovery,
    backend: Arc<dyn UploadBackend>,
    fetcher: Arc<dyn SourceFetcher>,
    config: TransferConfig,
}

impl UploadWorkerPool {
    pub fn new(
        state: StateHandle,
        barrier: LivenessBarrier,
        recovery: ChallengeRecovery,
        backend: Arc<dyn UploadBackend>,
        fetcher: Arc<dyn SourceFetcher>,
        config: TransferConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state,
                barrier,
                recovery,
                backend,
                fetcher,
                config,
            }),
        }
    }

    /// Process `job.files` with at most `concurrency` workers.
    ///
    /// Returns once every worker has drained the queue or observed a stop.
    /// Returns the number of outcomes recorded.
    pub async fn run(&self, job: AlbumJob, concurrency: usize) -> usize {
        let total = job.files.len();
        let workers = concurrency.max(1).min(total);
        if workers == 0 {
            return 0;
        }

        info!(
            "Uploading {} files of '{}' with {} workers",
            total, job.album.name, workers
        );

        let job = Arc::new(job);
        let cursor = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..workers)
            .map(|worker_id| {
                let pool = self.clone();
                let job = job.clone();
                let cursor = cursor.clone();
                tokio::spawn(async move { pool.worker_loop(worker_id, job, cursor).await })
            })
            .collect();

        let mut recorded = 0;
        for result in join_all(handles).await {
            match result {
                Ok(count) => recorded += count,
                Err(e) => warn!("Upload worker panicked: {}", e),
            }
        }
        recorded
    }

    async fn worker_loop(
        &self,
        worker_id: usize,
        job: Arc<AlbumJob>,
        cursor: Arc<AtomicUsize>,
    ) -> usize {
        let mut recorded = 0;

        loop {
            let index = cursor.fetch_add(1, Ordering::SeqCst);
            let Some(file) = job.files.get(index) else {
                break;
            };

            let Some(outcome) = self.process_file(&job, file).await else {
                debug!("Worker {} stopping, transfer no longer running", worker_id);
                break;
            };

            if let Err(e) = self.inner.state.record(&job.album.id, outcome).await {
                warn!("Worker {} could not record outcome: {}", worker_id, e);
                break;
            }
            recorded += 1;
        }

        trace!("Worker {} finished", worker_id);
        recorded
    }

    /// Retry loop for one file. `None` means the transfer stopped first.
    async fn process_file(&self, job: &AlbumJob, file: &SourceFile) -> Option<FileOutcome> {
        let config = &self.inner.config;
        let mut attempt: u32 = 0;

        loop {
            if self.inner.barrier.await_clearance().await == Clearance::Stop {
                return None;
            }

            if job.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(job.delay_ms)).await;
            }
            tokio::time::sleep(jitter(config)).await;

            let error = match self.upload_file(job, file).await {
                Ok(success) => return Some(FileOutcome::Uploaded(success)),
                Err(e) => e,
            };

            match error.kind() {
                ErrorKind::Freeze => {
                    debug!("{}: attempt suspended", file.filename);
                    self.inner.recovery.freeze_signal().wait_thawed().await;
                }
                ErrorKind::Blocking => {
                    warn!("{}: {}, backing off", file.filename, error);
                    let _ = self.inner.recovery.report(ChallengeTrigger::Blocked);
                    tokio::time::sleep(config.challenge_backoff).await;
                }
                ErrorKind::Transient => {
                    warn!("{}: {}, retrying", file.filename, error);
                    tokio::time::sleep(config.transient_backoff).await;
                }
                ErrorKind::Permanent => {
                    attempt += 1;
                    if attempt >= config.max_retries {
                        warn!(
                            "{}: giving up after {} attempts: {}",
                            file.filename, attempt, error
                        );
                        return Some(FileOutcome::Failed(UploadFailure {
                            filename: file.filename.clone(),
                            error: error.to_string(),
                        }));
                    }
                    warn!(
                        "{}: attempt {}/{} failed: {}",
                        file.filename, attempt, config.max_retries, error
                    );
                    tokio::time::sleep(config.retry_unit * attempt).await;
                }
            }
        }
    }

    /// Ticket, fetch, put, then best-effort metadata
    async fn upload_file(
        &self,
        job: &AlbumJob,
        file: &SourceFile,
    ) -> Result<UploadSuccess, TransferError> {
        let inner = &self.inner;

        let request = UploadTicketRequest {
            filename: file.filename.clone(),
            album_id: job.album.id.clone(),
            album_name: job.album.name.clone(),
            domain: job.domain.clone(),
        };

        let (upload_url, object_path) =
            match inner.backend.request_upload_destination(&request).await? {
                UploadDestination::Skip { object_path } => {
                    debug!("{} already uploaded, skipping", file.filename);
                    return Ok(UploadSuccess {
                        filename: file.filename.clone(),
                        skipped: true,
                        object_path,
                    });
                }
                UploadDestination::Upload {
                    upload_url,
                    object_path,
                } => (upload_url, object_path),
            };

        self.ensure_ungated()?;
        let bytes = inner.fetcher.fetch(&file.source_url).await?;

        self.ensure_ungated()?;
        inner.backend.put_bytes(&upload_url, bytes).await?;

        let metadata = ImageMetadata {
            filename: file.filename.clone(),
            album_id: job.album.id.clone(),
            album_name: job.album.name.clone(),
            scene: file.scene_label.clone(),
            file_id: file.file_id.clone(),
            domain: job.domain.clone().unwrap_or_default(),
        };
        if let Err(e) = inner.backend.register_metadata(&metadata).await {
            warn!("Metadata registration failed for {}: {}", file.filename, e);
        }

        debug!("Uploaded {}", file.filename);
        Ok(UploadSuccess {
            filename: file.filename.clone(),
            skipped: false,
            object_path,
        })
    }

    /// Refuse to start the next network step while frozen, paused or stopped
    fn ensure_ungated(&self) -> Result<(), TransferError> {
        let gated = self.inner.recovery.freeze_signal().is_frozen()
            || self.inner.state.snapshot().status != TransferStatus::Running;
        if gated {
            Err(TransferError::Frozen)
        } else {
            Ok(())
        }
    }
}

fn jitter(config: &TransferConfig) -> Duration {
    let min = config.jitter_min.as_millis() as u64;
    let max = (config.jitter_max.as_millis() as u64).max(min);
    Duration::from_millis(rand::thread_rng().gen_range(min..=max))
}
