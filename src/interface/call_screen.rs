//! Call screen handle
//!
//! The interface the UI programs against. Owns the machine's background
//! tasks for one mounted screen and guarantees cleanup on drop, so
//! navigating away mid-call cannot leak a camera or a channel.

use crate::application::call_machine::CallMachine;
use crate::application::state::{CallPhase, CallSnapshot};
use crate::domain::session::entity::Participant;
use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::CallId;
use crate::interface::poll::FallbackPoller;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Handle for one mounted call screen
pub struct CallScreenHandle {
    machine: Arc<CallMachine>,
    store_watch: Option<JoinHandle<()>>,
    poller: FallbackPoller,
}

impl CallScreenHandle {
    /// Mount the screen: start consuming the store feed and arm the
    /// fallback poll.
    pub fn mount(machine: Arc<CallMachine>) -> Self {
        let store_watch = machine.spawn_store_watch();
        let poller = FallbackPoller::start(Arc::clone(&machine));
        Self {
            machine,
            store_watch: Some(store_watch),
            poller,
        }
    }

    pub fn machine(&self) -> &Arc<CallMachine> {
        &self.machine
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.machine.watch()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.machine.snapshot()
    }

    pub async fn call(&self, remote: Participant) -> Result<CallId> {
        self.machine.start_outgoing_call(remote).await
    }

    pub async fn accept(&self, call_id: CallId) -> Result<()> {
        self.machine.accept_incoming_call(call_id).await
    }

    pub async fn reject(&self, call_id: CallId) -> Result<()> {
        self.machine.reject_incoming_call(call_id).await
    }

    pub async fn hang_up(&self) -> Result<()> {
        self.machine.end_call().await
    }

    pub async fn toggle_mute(&self) -> Result<bool> {
        self.machine.toggle_mute().await
    }

    pub async fn toggle_video(&self) -> Result<bool> {
        self.machine.toggle_video().await
    }

    /// Wait for a specific inbound call to ring here, then accept it.
    ///
    /// Used by supervised child devices configured to answer a parent
    /// automatically. Fails closed: if the call does not ring within
    /// `wait`, nothing is accepted and no media is acquired.
    pub async fn auto_accept(&self, call_id: CallId) -> Result<()> {
        let wait = self.machine.config().auto_accept_wait();
        let mut rx = self.machine.watch();

        let ringing = tokio::time::timeout(wait, async {
            loop {
                {
                    let snap = rx.borrow();
                    if snap.phase == CallPhase::Incoming && snap.call_id == Some(call_id) {
                        break true;
                    }
                    // Already resolved some other way
                    if snap.phase == CallPhase::Ended {
                        break false;
                    }
                }
                if rx.changed().await.is_err() {
                    break false;
                }
            }
        })
        .await;

        match ringing {
            Ok(true) => {
                info!(%call_id, "auto-accepting inbound call");
                self.machine.accept_incoming_call(call_id).await
            }
            Ok(false) => Err(CallError::InvalidCallState(format!(
                "call {} resolved before it could be auto-accepted",
                call_id
            ))),
            Err(_) => {
                // Fail closed: an elapsed window means nothing is accepted,
                // same as a call that resolved before we saw it
                warn!(%call_id, "auto-accept window elapsed without ringing");
                Err(CallError::InvalidCallState(format!(
                    "call {} did not ring within the auto-accept window",
                    call_id
                )))
            }
        }
    }

    /// Unmount: end any live call and stop the background tasks
    pub async fn unmount(mut self) {
        if self.snapshot().phase.is_live() {
            let _ = self.machine.end_call().await;
        }
        self.stop_tasks();
    }

    fn stop_tasks(&mut self) {
        if let Some(handle) = self.store_watch.take() {
            handle.abort();
        }
        self.poller.stop();
    }
}

impl Drop for CallScreenHandle {
    fn drop(&mut self) {
        self.stop_tasks();
        // A live call at drop time still has media open; tear it down from
        // a detached task since Drop cannot await. Outside a runtime (e.g.
        // after shutdown) there is nothing left to run the task on, so the
        // drop must not panic.
        if self.machine.snapshot().phase.is_live() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let machine = Arc::clone(&self.machine);
                runtime.spawn(async move {
                    let _ = machine.end_call().await;
                });
            }
        }
    }
}
