// # Transfer Service
//
// Wires the engine together on the shared runtime and exposes the operator
// commands through `TransferHandle`. Long-running commands (batch, single
// album, bulk retry) run as background tasks; their JoinHandles are returned
// so the caller can await the result.

use crate::agent::{Catalog, PageAgent};
use crate::backend::UploadBackend;
use crate::config::TransferConfig;
use crate::network::ReachabilityProbe;
use crate::source::SourceFetcher;
use crate::storage::StateStorage;
use crate::transfer::barrier::LivenessBarrier;
use crate::transfer::batch::{plan_batch, plan_retry, BatchError, BatchOrchestrator, RetryGroup};
use crate::transfer::challenge::{
    ChallengeRecovery, ChallengeTrigger, FreezeSignal, RecoveryOutcome, RecoveryPhase,
    RecoverySettings,
};
use crate::transfer::state::{StateError, StateHandle, TransferStateStore};
use crate::transfer::types::{
    Album, AlbumLog, AlbumRef, FileSelection, LedgerEntry, PauseReason, RunSnapshot, RunSummary,
    TransferState,
};
use crate::transfer::worker::UploadWorkerPool;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("a transfer is already running")]
    AlreadyRunning,
    #[error("network is unreachable")]
    NetworkUnreachable,
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    State(#[from] StateError),
}

/// External systems the engine talks to
#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn UploadBackend>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub catalog: Arc<dyn Catalog>,
    pub agent: Arc<dyn PageAgent>,
    pub probe: Arc<dyn ReachabilityProbe>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchRequest {
    pub domain: Option<String>,
    pub delay_ms: u64,
    /// Album ids to include; all albums when `None`
    pub selection: Option<HashSet<String>>,
}

/// Overrides for a bulk retry; missing values come from the last run
#[derive(Debug, Clone, Default)]
pub struct RetryRequest {
    pub domain: Option<String>,
    pub delay_ms: Option<u64>,
    pub albums: Option<HashSet<String>>,
}

pub struct BatchStarted {
    pub albums: Vec<Album>,
    pub handle: JoinHandle<Result<RunSummary, BatchError>>,
}

pub struct RetryStarted {
    pub groups: Vec<RetryGroup>,
    pub handle: JoinHandle<Result<RunSummary, BatchError>>,
}

pub struct SingleStarted {
    pub handle: JoinHandle<Result<AlbumLog, BatchError>>,
}

pub struct TransferService;

impl TransferService {
    /// Start the state store and build the engine, returning the command handle
    pub async fn start(
        runtime_handle: tokio::runtime::Handle,
        storage: Arc<dyn StateStorage>,
        collaborators: Collaborators,
        config: TransferConfig,
    ) -> TransferHandle {
        let state = TransferStateStore::start(storage, runtime_handle.clone()).await;

        let recovery = ChallengeRecovery::new(
            state.clone(),
            collaborators.agent.clone(),
            FreezeSignal::new(),
            RecoverySettings {
                max_cycles: config.max_challenge_cycles,
                settle: config.challenge_settle,
            },
        );
        let barrier = LivenessBarrier::new(
            state.clone(),
            collaborators.probe.clone(),
            config.network_poll,
        );
        let pool = UploadWorkerPool::new(
            state.clone(),
            barrier,
            recovery.clone(),
            collaborators.backend.clone(),
            collaborators.fetcher.clone(),
            config.clone(),
        );
        let orchestrator = BatchOrchestrator::new(
            state.clone(),
            collaborators.catalog.clone(),
            collaborators.backend.clone(),
            recovery.clone(),
            pool,
            config.concurrency,
        );

        info!(
            "Transfer service started ({} workers per album)",
            config.concurrency
        );

        TransferHandle {
            state,
            orchestrator: Arc::new(orchestrator),
            recovery,
            catalog: collaborators.catalog,
            probe: collaborators.probe,
            runtime_handle,
            run_active: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Clears the run flag when the background run ends
struct RunGuard(Arc<AtomicBool>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Operator commands and read-only views of the engine
#[derive(Clone)]
pub struct TransferHandle {
    state: StateHandle,
    orchestrator: Arc<BatchOrchestrator>,
    recovery: ChallengeRecovery,
    catalog: Arc<dyn Catalog>,
    probe: Arc<dyn ReachabilityProbe>,
    runtime_handle: tokio::runtime::Handle,
    run_active: Arc<AtomicBool>,
}

impl TransferHandle {
    pub fn snapshot(&self) -> TransferState {
        self.state.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<TransferState> {
        self.state.subscribe()
    }

    pub fn recovery_phase(&self) -> watch::Receiver<RecoveryPhase> {
        self.recovery.subscribe_phase()
    }

    pub async fn last_run(&self) -> Result<Option<RunSnapshot>, CommandError> {
        Ok(self.state.last_run().await?)
    }

    pub async fn ledger(&self) -> Result<Vec<LedgerEntry>, CommandError> {
        Ok(self.state.ledger().await?)
    }

    pub async fn list_albums(&self) -> Result<Vec<Album>, CommandError> {
        let albums = self
            .catalog
            .list_albums()
            .await
            .map_err(BatchError::from)?;
        Ok(albums)
    }

    pub async fn pause(&self) -> Result<TransferState, CommandError> {
        info!("Pause requested");
        Ok(self.state.pause(PauseReason::User).await?)
    }

    /// Resume a paused transfer; refused while the network is down
    pub async fn resume(&self) -> Result<TransferState, CommandError> {
        if !self.probe.is_reachable().await {
            return Err(CommandError::NetworkUnreachable);
        }
        info!("Resume requested");
        Ok(self.state.resume().await?)
    }

    /// Drop the active transfer; workers stop at their next barrier check
    pub async fn clear_active(&self) -> Result<TransferState, CommandError> {
        info!("Clearing active transfer");
        Ok(self.state.reset().await?)
    }

    pub async fn clear_last_run(&self) -> Result<(), CommandError> {
        Ok(self.state.clear_last_run().await?)
    }

    pub fn report_challenge(&self, trigger: ChallengeTrigger) -> Option<JoinHandle<RecoveryOutcome>> {
        self.recovery.report(trigger)
    }

    fn claim_run(&self) -> Result<RunGuard, CommandError> {
        if self.state.snapshot().running() {
            return Err(CommandError::AlreadyRunning);
        }
        self.run_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| CommandError::AlreadyRunning)?;
        Ok(RunGuard(self.run_active.clone()))
    }

    /// Transfer the first `count` files of one album in the background
    pub async fn start_single(
        &self,
        album: AlbumRef,
        count: usize,
        domain: Option<String>,
        delay_ms: u64,
    ) -> Result<SingleStarted, CommandError> {
        let guard = self.claim_run()?;
        let orchestrator = self.orchestrator.clone();
        let state = self.state.clone();

        let handle = self.runtime_handle.spawn(async move {
            let _guard = guard;
            state.clear_ledger().await?;
            orchestrator
                .transfer_album(&album, FileSelection::First(count), domain, delay_ms)
                .await
        });

        Ok(SingleStarted { handle })
    }

    /// List albums, filter them, and run the batch in the background
    pub async fn start_batch(&self, request: BatchRequest) -> Result<BatchStarted, CommandError> {
        let albums = self.list_albums().await?;
        let albums = plan_batch(albums, request.selection.as_ref())?;
        let guard = self.claim_run()?;

        let orchestrator = self.orchestrator.clone();
        let planned = albums.clone();
        let handle = self.runtime_handle.spawn(async move {
            let _guard = guard;
            orchestrator
                .execute_batch(planned, request.domain, request.delay_ms)
                .await
        });

        Ok(BatchStarted { albums, handle })
    }

    /// Re-run the failed files of the last run, grouped by album
    pub async fn retry_failed(&self, request: RetryRequest) -> Result<RetryStarted, CommandError> {
        let last_run = self.state.last_run().await?;
        let failures = match &last_run {
            Some(snapshot) => snapshot.failures(),
            None => self.state.ledger().await?,
        };
        let groups = plan_retry(&failures, request.albums.as_ref())?;

        let domain = request
            .domain
            .or_else(|| last_run.as_ref().and_then(|r| r.domain().map(str::to_string)));
        let delay_ms = request
            .delay_ms
            .or_else(|| last_run.as_ref().map(|r| r.delay_ms()))
            .unwrap_or(0);

        let guard = self.claim_run()?;
        let orchestrator = self.orchestrator.clone();
        let planned = groups.clone();
        let handle = self.runtime_handle.spawn(async move {
            let _guard = guard;
            orchestrator.execute_retry(planned, domain, delay_ms).await
        });

        Ok(RetryStarted { groups, handle })
    }
}
