// # Transfer State Store
//
// Single owner of the active `TransferState`, the failure ledger and the last
// run snapshot. Workers, the barrier, the recovery sequencer and operator
// commands send `StateCommand`s to the store task; the task applies them one at
// a time, publishes the new snapshot on a watch channel and persists it.

use crate::storage::StateStorage;
use crate::transfer::types::{
    AlbumRef, FileOutcome, LedgerEntry, PauseReason, RunSnapshot, StatePatch, StatusEvent,
    TransferState, TransferStatus, TransitionError,
};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

const KEY_TRANSFER: &str = "transfer_state";
const KEY_LEDGER: &str = "failure_ledger";
const KEY_LAST_RUN: &str = "last_run";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("transfer state store has stopped")]
    Closed,
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Parameters of a new album transfer
#[derive(Debug, Clone)]
pub struct AlbumStart {
    pub album: AlbumRef,
    pub total: usize,
    pub delay_ms: u64,
    pub domain: Option<String>,
}

enum StateCommand {
    Begin {
        start: AlbumStart,
        reply: oneshot::Sender<TransferState>,
    },
    Patch {
        patch: StatePatch,
        reply: oneshot::Sender<TransferState>,
    },
    Transition {
        event: StatusEvent,
        reply: oneshot::Sender<Result<TransferState, TransitionError>>,
    },
    Record {
        album_id: String,
        outcome: FileOutcome,
        reply: oneshot::Sender<TransferState>,
    },
    Finish {
        reply: oneshot::Sender<TransferState>,
    },
    Ledger {
        reply: oneshot::Sender<Vec<LedgerEntry>>,
    },
    ClearLedger {
        reply: oneshot::Sender<()>,
    },
    LastRun {
        reply: oneshot::Sender<Option<RunSnapshot>>,
    },
    SetLastRun {
        snapshot: Option<RunSnapshot>,
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the state store
#[derive(Clone)]
pub struct StateHandle {
    commands_tx: mpsc::UnboundedSender<StateCommand>,
    snapshot_rx: watch::Receiver<TransferState>,
}

impl StateHandle {
    /// Latest published snapshot
    pub fn snapshot(&self) -> TransferState {
        self.snapshot_rx.borrow().clone()
    }

    /// Receiver that is notified on every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<TransferState> {
        self.snapshot_rx.clone()
    }

    /// Wait until a published snapshot satisfies `predicate`
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&TransferState) -> bool,
    ) -> Result<TransferState, StateError> {
        let mut rx = self.subscribe();
        let state = rx
            .wait_for(predicate)
            .await
            .map_err(|_| StateError::Closed)?
            .clone();
        Ok(state)
    }

    /// Wait until no album transfer is active
    pub async fn wait_until_quiet(&self) -> Result<TransferState, StateError> {
        self.wait_for(|s| !s.running()).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> StateCommand,
    ) -> Result<T, StateError> {
        let (reply, rx) = oneshot::channel();
        self.commands_tx
            .send(build(reply))
            .map_err(|_| StateError::Closed)?;
        rx.await.map_err(|_| StateError::Closed)
    }

    /// Replace the state wholesale with a fresh running album
    pub async fn begin_album(&self, start: AlbumStart) -> Result<TransferState, StateError> {
        self.request(|reply| StateCommand::Begin { start, reply })
            .await
    }

    /// Merge descriptive fields, returning the merged snapshot
    pub async fn patch(&self, patch: StatePatch) -> Result<TransferState, StateError> {
        self.request(|reply| StateCommand::Patch { patch, reply })
            .await
    }

    pub async fn transition(&self, event: StatusEvent) -> Result<TransferState, StateError> {
        let result = self
            .request(|reply| StateCommand::Transition { event, reply })
            .await?;
        Ok(result?)
    }

    pub async fn pause(&self, reason: PauseReason) -> Result<TransferState, StateError> {
        self.transition(StatusEvent::Pause(reason)).await
    }

    pub async fn resume(&self) -> Result<TransferState, StateError> {
        self.transition(StatusEvent::Resume).await
    }

    /// Drop the active transfer; workers see `Idle` and stop
    pub async fn reset(&self) -> Result<TransferState, StateError> {
        self.transition(StatusEvent::Reset).await
    }

    /// Record a terminal file outcome for `album_id`.
    ///
    /// Outcomes for an album that is no longer the active one are dropped.
    pub async fn record(
        &self,
        album_id: &str,
        outcome: FileOutcome,
    ) -> Result<TransferState, StateError> {
        let album_id = album_id.to_string();
        self.request(|reply| StateCommand::Record {
            album_id,
            outcome,
            reply,
        })
        .await
    }

    /// Stop the album and keep its final state as the last run
    pub async fn finish(&self) -> Result<TransferState, StateError> {
        self.request(|reply| StateCommand::Finish { reply }).await
    }

    pub async fn ledger(&self) -> Result<Vec<LedgerEntry>, StateError> {
        self.request(|reply| StateCommand::Ledger { reply }).await
    }

    pub async fn clear_ledger(&self) -> Result<(), StateError> {
        self.request(|reply| StateCommand::ClearLedger { reply })
            .await
    }

    pub async fn last_run(&self) -> Result<Option<RunSnapshot>, StateError> {
        self.request(|reply| StateCommand::LastRun { reply }).await
    }

    pub async fn set_last_run(&self, snapshot: RunSnapshot) -> Result<(), StateError> {
        self.request(|reply| StateCommand::SetLastRun {
            snapshot: Some(snapshot),
            reply,
        })
        .await
    }

    pub async fn clear_last_run(&self) -> Result<(), StateError> {
        self.request(|reply| StateCommand::SetLastRun {
            snapshot: None,
            reply,
        })
        .await
    }
}

/// Store task that owns and serializes all state mutations
pub struct TransferStateStore {
    state: TransferState,
    ledger: Vec<LedgerEntry>,
    last_run: Option<RunSnapshot>,
    storage: Arc<dyn StateStorage>,
    commands_rx: mpsc::UnboundedReceiver<StateCommand>,
    snapshot_tx: watch::Sender<TransferState>,
}

impl TransferStateStore {
    /// Load the ledger and last run, reset the live state, and spawn the store task
    pub async fn start(
        storage: Arc<dyn StateStorage>,
        runtime_handle: tokio::runtime::Handle,
    ) -> StateHandle {
        let ledger: Vec<LedgerEntry> = load_key(storage.as_ref(), KEY_LEDGER)
            .await
            .unwrap_or_default();
        let last_run: Option<RunSnapshot> = load_key(storage.as_ref(), KEY_LAST_RUN).await;

        info!(
            "Transfer state store starting ({} ledger entries, last run: {})",
            ledger.len(),
            last_run.is_some()
        );

        let state = TransferState::default();
        let (snapshot_tx, snapshot_rx) = watch::channel(state.clone());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let store = TransferStateStore {
            state,
            ledger,
            last_run,
            storage,
            commands_rx,
            snapshot_tx,
        };
        store.persist(KEY_TRANSFER, &store.state).await;

        runtime_handle.spawn(store.run());

        StateHandle {
            commands_tx,
            snapshot_rx,
        }
    }

    async fn run(mut self) {
        while let Some(command) = self.commands_rx.recv().await {
            self.handle(command).await;
        }
        debug!("Transfer state channel closed, exiting");
    }

    async fn handle(&mut self, command: StateCommand) {
        match command {
            StateCommand::Begin { start, reply } => {
                self.state = TransferState {
                    status: TransferStatus::Running,
                    album_id: Some(start.album.id),
                    album_name: Some(start.album.name),
                    total: start.total,
                    started_at: Some(Utc::now()),
                    delay_ms: start.delay_ms,
                    domain: start.domain,
                    version: self.state.version,
                    ..Default::default()
                };
                self.publish().await;
                let _ = reply.send(self.state.clone());
            }
            StateCommand::Patch { patch, reply } => {
                if let Some(album_name) = patch.album_name {
                    self.state.album_name = Some(album_name);
                }
                if let Some(total) = patch.total {
                    self.state.total = total;
                }
                if let Some(delay_ms) = patch.delay_ms {
                    self.state.delay_ms = delay_ms;
                }
                if let Some(domain) = patch.domain {
                    self.state.domain = Some(domain);
                }
                self.publish().await;
                let _ = reply.send(self.state.clone());
            }
            StateCommand::Transition { event, reply } => {
                let result = match self.state.status.apply(event) {
                    Ok(status) => {
                        if event == StatusEvent::Reset {
                            self.state = TransferState {
                                version: self.state.version,
                                ..Default::default()
                            };
                        }
                        if status != self.state.status || event == StatusEvent::Reset {
                            debug!("Transfer status {:?} -> {:?}", self.state.status, status);
                            self.state.status = status;
                            self.publish().await;
                        }
                        Ok(self.state.clone())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            StateCommand::Record {
                album_id,
                outcome,
                reply,
            } => {
                if self.state.album_id.as_deref() == Some(album_id.as_str()) {
                    self.apply_outcome(outcome).await;
                    self.publish().await;
                } else {
                    debug!("Dropping outcome for inactive album {}", album_id);
                }
                let _ = reply.send(self.state.clone());
            }
            StateCommand::Finish { reply } => {
                // Stop never fails
                if let Ok(status) = self.state.status.apply(StatusEvent::Stop) {
                    self.state.status = status;
                }
                self.publish().await;

                if self.state.status == TransferStatus::Halted && self.state.album_id.is_some() {
                    self.last_run = Some(RunSnapshot::Album(self.state.clone()));
                    self.persist(KEY_LAST_RUN, &self.last_run).await;
                }
                let _ = reply.send(self.state.clone());
            }
            StateCommand::Ledger { reply } => {
                let _ = reply.send(self.ledger.clone());
            }
            StateCommand::ClearLedger { reply } => {
                self.ledger.clear();
                self.persist(KEY_LEDGER, &self.ledger).await;
                let _ = reply.send(());
            }
            StateCommand::LastRun { reply } => {
                let _ = reply.send(self.last_run.clone());
            }
            StateCommand::SetLastRun { snapshot, reply } => {
                self.last_run = snapshot;
                match &self.last_run {
                    Some(_) => self.persist(KEY_LAST_RUN, &self.last_run).await,
                    None => {
                        if let Err(e) = self.storage.remove(KEY_LAST_RUN).await {
                            warn!("Failed to remove last run: {}", e);
                        }
                    }
                }
                let _ = reply.send(());
            }
        }
    }

    async fn apply_outcome(&mut self, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Uploaded(success) => {
                self.state.successes.push(success);
            }
            FileOutcome::Failed(failure) => {
                if let Some(album) = self.state.album_ref() {
                    self.ledger.push(LedgerEntry {
                        filename: failure.filename.clone(),
                        error: failure.error.clone(),
                        album_id: album.id,
                        album_name: album.name,
                    });
                    self.persist(KEY_LEDGER, &self.ledger).await;
                }
                self.state.failures.push(failure);
            }
        }
        self.state.completed = self.state.successes.len() + self.state.failures.len();
    }

    async fn publish(&mut self) {
        self.state.version += 1;
        self.state.updated_at = Some(Utc::now());
        self.snapshot_tx.send_replace(self.state.clone());
        self.persist(KEY_TRANSFER, &self.state).await;
    }

    async fn persist<T: Serialize>(&self, key: &str, value: &T) {
        let json = match serde_json::to_value(value) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize {}: {}", key, e);
                return;
            }
        };
        if let Err(e) = self.storage.save(key, &json).await {
            warn!("Failed to persist {}: {}", key, e);
        }
    }
}

async fn load_key<T: DeserializeOwned>(storage: &dyn StateStorage, key: &str) -> Option<T> {
    match storage.load(key).await {
        Ok(Some(json)) => match serde_json::from_value(json) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring unreadable {}: {}", key, e);
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!("Failed to load {}: {}", key, e);
            None
        }
    }
}
