// # Transfer Engine
//
// Moves album files from the source site to the migration backend:
//
// - **TransferStateStore**: Actor owning the live TransferState, failure ledger and last run
// - **LivenessBarrier**: Gates each attempt on running/paused/network state
// - **UploadWorkerPool**: Shared-cursor workers running the per-file retry loop
// - **ChallengeRecovery**: Multi-cycle recovery when the source blocks automation
// - **BatchOrchestrator**: Sequential album runs, run summaries and bulk retry
// - **TransferService**: Wires the above and exposes operator commands
//
// Public API:
// - `TransferService::start`: Build the engine, returning a `TransferHandle`
// - `TransferHandle`: Operator commands and state subscriptions

mod barrier;
mod batch;
mod challenge;
mod error;
mod service;
mod state;
mod types;
mod worker;

#[cfg(test)]
mod tests;

pub use barrier::{Clearance, LivenessBarrier};
pub use batch::{plan_batch, plan_retry, BatchError, BatchOrchestrator, RetryGroup};
pub use challenge::{
    ChallengeRecovery, ChallengeTrigger, FreezeSignal, RecoveryOutcome, RecoveryPhase,
    RecoverySettings,
};
pub use error::{ErrorKind, TransferError};
pub use service::{
    BatchRequest, BatchStarted, Collaborators, CommandError, RetryRequest, RetryStarted,
    SingleStarted, TransferHandle, TransferService,
};
pub use state::{AlbumStart, StateError, StateHandle, TransferStateStore};
pub use types::{
    Album, AlbumLog, AlbumRef, FileOutcome, FileSelection, LedgerEntry, PauseReason,
    RunSnapshot, RunSummary, SourceFile, StatePatch, StatusEvent, TransferState,
    TransferStatus, TransitionError, UploadFailure, UploadSuccess,
};
pub use worker::{AlbumJob, UploadWorkerPool};
