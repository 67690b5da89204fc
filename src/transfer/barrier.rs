use crate::network::ReachabilityProbe;
use crate::transfer::state::{StateError, StateHandle};
use crate::transfer::types::{PauseReason, StatusEvent, TransferState, TransferStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Answer of [`LivenessBarrier::await_clearance`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clearance {
    /// Running, reachable and not paused
    Proceed,
    /// The transfer is no longer running; abandon remaining work
    Stop,
}

/// Gate every worker passes before each attempt.
///
/// User and challenge pauses are waited out on the state watch channel. Only
/// network reachability is polled, every `network_poll`.
#[derive(Clone)]
pub struct LivenessBarrier {
    state: StateHandle,
    probe: Arc<dyn ReachabilityProbe>,
    network_poll: Duration,
}

impl LivenessBarrier {
    pub fn new(
        state: StateHandle,
        probe: Arc<dyn ReachabilityProbe>,
        network_poll: Duration,
    ) -> Self {
        Self {
            state,
            probe,
            network_poll,
        }
    }

    pub async fn await_clearance(&self) -> Clearance {
        let mut rx = self.state.subscribe();

        loop {
            let status = rx.borrow_and_update().status;

            match status {
                TransferStatus::Idle | TransferStatus::Halted => return Clearance::Stop,

                TransferStatus::Paused(PauseReason::User)
                | TransferStatus::Paused(PauseReason::Challenge) => {
                    if rx.changed().await.is_err() {
                        return Clearance::Stop;
                    }
                }

                TransferStatus::Paused(PauseReason::Network) => {
                    if self.probe.is_reachable().await {
                        info!("Network reachable again, resuming uploads");
                        if let Err(StateError::Closed) =
                            self.state.transition(StatusEvent::NetworkRestored).await
                        {
                            return Clearance::Stop;
                        }
                    } else if !self.wait_poll(&mut rx).await {
                        return Clearance::Stop;
                    }
                }

                TransferStatus::Running => {
                    if self.probe.is_reachable().await {
                        return Clearance::Proceed;
                    }

                    // The status may have moved while the probe was in flight;
                    // NetworkLost only pauses a transfer that is still running.
                    warn!("Network unreachable, pausing uploads");
                    if let Err(StateError::Closed) =
                        self.state.transition(StatusEvent::NetworkLost).await
                    {
                        return Clearance::Stop;
                    }
                    let now = rx.borrow_and_update().status;
                    if now == TransferStatus::Paused(PauseReason::Network)
                        && !self.wait_poll(&mut rx).await
                    {
                        return Clearance::Stop;
                    }
                }
            }
        }
    }

    /// Sleep one poll interval, cut short by any status change.
    /// Returns false once the state store is gone.
    async fn wait_poll(&self, rx: &mut watch::Receiver<TransferState>) -> bool {
        tokio::select! {
            changed = rx.changed() => changed.is_ok(),
            _ = tokio::time::sleep(self.network_poll) => true,
        }
    }
}
