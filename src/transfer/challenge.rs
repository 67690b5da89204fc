// # Challenge Recovery
//
// Runs when the source signals it is blocking automated access. Recovery
// freezes in-flight attempts, pauses the transfer with reason `Challenge`, and
// drives up to `max_challenge_cycles` cycles of
// reload -> settle -> corrective action -> settle -> verify.
//
// Exhaustion depends on the trigger: a zero-items block skips the album, every
// other block pauses for the operator and raises an alert.

use crate::agent::PageAgent;
use crate::transfer::state::{StateError, StateHandle};
use crate::transfer::types::{PauseReason, StatusEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Hard-pause flag raised while recovery runs.
///
/// In-flight attempts check it between pipeline steps and wait on the
/// notifier until it is lowered.
#[derive(Clone, Default)]
pub struct FreezeSignal {
    inner: Arc<FreezeInner>,
}

#[derive(Default)]
struct FreezeInner {
    frozen: AtomicBool,
    notify: Notify,
}

impl FreezeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn freeze(&self) {
        self.inner.frozen.store(true, Ordering::SeqCst);
    }

    pub fn thaw(&self) {
        self.inner.frozen.store(false, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.frozen.load(Ordering::SeqCst)
    }

    pub async fn wait_thawed(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a thaw in between is not missed
            notified.as_mut().enable();

            if !self.is_frozen() {
                return;
            }
            notified.await;
        }
    }
}

/// What signalled the block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeTrigger {
    /// Album metadata came back empty
    MetadataEmpty,
    /// Enumeration returned no files for a non-empty album
    ZeroItems,
    /// A source fetch was refused
    Blocked,
}

impl ChallengeTrigger {
    /// Whether exhaustion should stop for the operator instead of skipping the album
    pub fn is_hard(&self) -> bool {
        match self {
            ChallengeTrigger::MetadataEmpty | ChallengeTrigger::Blocked => true,
            ChallengeTrigger::ZeroItems => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    Idle,
    Recovering { cycle: u32 },
    Resolved,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Verification passed; uploads resume
    Resolved { cycle: u32 },
    /// Soft block exhausted; the album was stopped
    SkippedAlbum,
    /// Hard block exhausted; paused for the operator
    Halted,
    /// Another recovery is in progress
    AlreadyRecovering,
    /// No transfer was running, or it was stopped during recovery
    NotRunning,
}

#[derive(Clone, Debug)]
pub struct RecoverySettings {
    pub max_cycles: u32,
    pub settle: Duration,
}

/// Challenge recovery sequencer (cloneable, one active recovery at a time)
#[derive(Clone)]
pub struct ChallengeRecovery {
    inner: Arc<RecoveryInner>,
}

struct RecoveryInner {
    state: StateHandle,
    agent: Arc<dyn PageAgent>,
    freeze: FreezeSignal,
    settings: RecoverySettings,
    active: AtomicBool,
    phase_tx: watch::Sender<RecoveryPhase>,
}

impl ChallengeRecovery {
    pub fn new(
        state: StateHandle,
        agent: Arc<dyn PageAgent>,
        freeze: FreezeSignal,
        settings: RecoverySettings,
    ) -> Self {
        let (phase_tx, _) = watch::channel(RecoveryPhase::Idle);
        Self {
            inner: Arc::new(RecoveryInner {
                state,
                agent,
                freeze,
                settings,
                active: AtomicBool::new(false),
                phase_tx,
            }),
        }
    }

    pub fn freeze_signal(&self) -> &FreezeSignal {
        &self.inner.freeze
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> RecoveryPhase {
        *self.inner.phase_tx.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<RecoveryPhase> {
        self.inner.phase_tx.subscribe()
    }

    /// Wait until no recovery is in progress
    pub async fn wait_settled(&self) {
        let mut rx = self.subscribe_phase();
        // Sender lives in self, so this cannot fail
        let _ = rx
            .wait_for(|phase| !matches!(phase, RecoveryPhase::Recovering { .. }))
            .await;
    }

    /// Start recovery in the background unless one is already running
    pub fn report(&self, trigger: ChallengeTrigger) -> Option<JoinHandle<RecoveryOutcome>> {
        if self.is_active() {
            debug!("Challenge recovery already active, ignoring {:?}", trigger);
            return None;
        }
        let recovery = self.clone();
        Some(tokio::spawn(async move { recovery.recover(trigger).await }))
    }

    /// Run the recovery protocol to completion
    pub async fn recover(&self, trigger: ChallengeTrigger) -> RecoveryOutcome {
        let inner = &self.inner;

        let snapshot = inner.state.snapshot();
        let (true, Some(album_id)) = (snapshot.running(), snapshot.album_id) else {
            return RecoveryOutcome::NotRunning;
        };

        if inner
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return RecoveryOutcome::AlreadyRecovering;
        }

        warn!("Source is blocking access ({:?}), starting recovery", trigger);
        inner.freeze.freeze();

        let outcome = match inner.state.pause(PauseReason::Challenge).await {
            Ok(_) => self.run_cycles(trigger, &album_id).await,
            Err(e) => {
                debug!("Could not pause for challenge: {}", e);
                inner.phase_tx.send_replace(RecoveryPhase::Idle);
                RecoveryOutcome::NotRunning
            }
        };

        inner.freeze.thaw();
        inner.active.store(false, Ordering::SeqCst);
        outcome
    }

    async fn run_cycles(&self, trigger: ChallengeTrigger, album_id: &str) -> RecoveryOutcome {
        let inner = &self.inner;
        let settle = inner.settings.settle;

        for cycle in 1..=inner.settings.max_cycles {
            inner
                .phase_tx
                .send_replace(RecoveryPhase::Recovering { cycle });
            info!(
                "Challenge recovery cycle {}/{}",
                cycle, inner.settings.max_cycles
            );

            if let Err(e) = inner.agent.reload_page().await {
                warn!("Page reload failed: {}", e);
            }
            tokio::time::sleep(settle).await;

            if let Err(e) = inner.agent.trigger_corrective_action().await {
                warn!("Corrective action failed: {}", e);
            }
            tokio::time::sleep(settle).await;

            if !inner.state.snapshot().running() {
                info!("Transfer stopped during challenge recovery");
                inner.phase_tx.send_replace(RecoveryPhase::Idle);
                return RecoveryOutcome::NotRunning;
            }

            match inner.agent.verify_unblocked(album_id).await {
                Ok(true) => {
                    info!("Challenge cleared on cycle {}", cycle);
                    if let Err(e) = inner.state.transition(StatusEvent::ChallengeCleared).await {
                        warn!("Failed to clear challenge pause: {}", e);
                    }
                    inner.phase_tx.send_replace(RecoveryPhase::Resolved);
                    return RecoveryOutcome::Resolved { cycle };
                }
                Ok(false) => warn!("Still blocked after cycle {}", cycle),
                Err(e) => warn!("Unblock verification failed: {}", e),
            }
        }

        inner.phase_tx.send_replace(RecoveryPhase::Exhausted);

        if trigger.is_hard() {
            error!("Challenge recovery exhausted, waiting for the operator");
            log_state_error(inner.state.pause(PauseReason::User).await.err());
            let message = "Automated access is blocked. Solve the challenge on the source page, then resume the transfer.";
            if let Err(e) = inner.agent.show_alert(message).await {
                warn!("Failed to show alert: {}", e);
            }
            RecoveryOutcome::Halted
        } else {
            warn!("Challenge recovery exhausted on a zero-items block, skipping album");
            // Halted is never paused, so this also releases the challenge pause
            log_state_error(inner.state.transition(StatusEvent::Stop).await.err());
            RecoveryOutcome::SkippedAlbum
        }
    }
}

fn log_state_error(error: Option<StateError>) {
    if let Some(e) = error {
        warn!("State update during recovery failed: {}", e);
    }
}
