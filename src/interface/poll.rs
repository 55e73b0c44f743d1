//! Fallback store polling
//!
//! Realtime delivery of session updates is best-effort. The poller re-reads
//! the live session for the mounted participant on a fixed interval and
//! feeds it through the same reconciliation path as the store feed, so a
//! lost broadcast only delays a transition instead of wedging the call.

use crate::application::call_machine::CallMachine;
use crate::application::state::CallPhase;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct FallbackPoller {
    handle: Option<JoinHandle<()>>,
}

impl FallbackPoller {
    pub fn start(machine: Arc<CallMachine>) -> Self {
        let interval = machine.config().fallback_poll_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Skip the immediate first tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                Self::poll_once(&machine).await;
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    async fn poll_once(machine: &Arc<CallMachine>) {
        match machine.snapshot().phase {
            CallPhase::Ended => {}
            CallPhase::Idle => {
                // Look for an inbound request the feed never delivered
                match machine.poll_live_for_self().await {
                    Ok(Some(session)) => {
                        debug!(call_id = %session.id(), "poll found a live session");
                        machine.reconcile(session).await;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "fallback poll failed"),
                }
            }
            _ => {
                // Re-read our own row; a terminal or advanced status we
                // missed gets applied here
                if let Some(call_id) = machine.current_call_id().await {
                    match machine.poll_call(call_id).await {
                        Ok(Some(session)) => machine.reconcile(session).await,
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "fallback poll failed"),
                    }
                }
            }
        }
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for FallbackPoller {
    fn drop(&mut self) {
        self.stop();
    }
}
