use crate::channel::ChannelInterrupt;
use crate::collaborators::Collaborators;
use crate::session::{Role, SessionState};
use log::{error, info, warn};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailoverState {
    Idle,
    Requested,
    Completed,
}

/// Request/completion coordination for failover.
///
/// Moves `Idle -> Requested -> Completed` once per session; `clear` returns it
/// to `Idle` for the next session. Loops observe it only at their safe points,
/// while the registered channel interrupts wake loops blocked on the peer.
#[derive(Debug)]
pub struct FailoverSignal {
    state: Mutex<FailoverState>,
    changed: Condvar,
    interrupts: Mutex<Vec<ChannelInterrupt>>,
}

impl Default for FailoverSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl FailoverSignal {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FailoverState::Idle),
            changed: Condvar::new(),
            interrupts: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> FailoverState {
        *self.state.lock()
    }

    /// Files a request. Returns false when one was already filed.
    pub fn request(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state != FailoverState::Idle {
                return false;
            }
            *state = FailoverState::Requested;
            self.changed.notify_all();
        }
        info!("event=colo_failover_requested");
        let interrupts: Vec<ChannelInterrupt> = self.interrupts.lock().clone();
        for interrupt in interrupts {
            interrupt.fire();
        }
        true
    }

    pub fn is_requested(&self) -> bool {
        self.state() != FailoverState::Idle
    }

    pub fn is_completed(&self) -> bool {
        self.state() == FailoverState::Completed
    }

    pub fn complete(&self) {
        let mut state = self.state.lock();
        *state = FailoverState::Completed;
        self.changed.notify_all();
    }

    pub fn wait_completed(&self) {
        let mut state = self.state.lock();
        while *state != FailoverState::Completed {
            self.changed.wait(&mut state);
        }
    }

    /// Waits up to `timeout` for a request; true when one is pending.
    pub fn wait_requested(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while *state == FailoverState::Idle {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        *state != FailoverState::Idle
    }

    /// Resets to `Idle` and forgets the session's channel interrupts.
    pub fn clear(&self) {
        *self.state.lock() = FailoverState::Idle;
        self.interrupts.lock().clear();
    }

    pub fn register_interrupt(&self, interrupt: ChannelInterrupt) {
        self.interrupts.lock().push(interrupt);
    }

    /// Drops the channel interrupts of a finished session.
    pub fn release_interrupts(&self) {
        self.interrupts.lock().clear();
    }
}

/// Continuation produced by a promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Takeover {
    pub role: Role,
    /// Checkpoints fully applied before promotion (secondary only).
    pub applied_checkpoints: u64,
    /// True when the orchestrator restarted the VM itself rather than handing
    /// the continuation to a resumption channel.
    pub resumed_locally: bool,
}

/// Promotes one side to stand-alone operation. Runs at most once per session.
pub struct FailoverOrchestrator {
    state: Arc<SessionState>,
    collaborators: Collaborators,
    handoff: Option<Sender<Takeover>>,
    outcome: Mutex<Option<Takeover>>,
}

impl FailoverOrchestrator {
    pub fn new(state: Arc<SessionState>, collaborators: Collaborators) -> Self {
        Self {
            state,
            collaborators,
            handoff: None,
            outcome: Mutex::new(None),
        }
    }

    /// Sends the secondary's continuation to `handoff` instead of restarting
    /// the VM in place.
    pub fn with_handoff(mut self, handoff: Sender<Takeover>) -> Self {
        self.handoff = Some(handoff);
        self
    }

    pub fn completed(&self) -> Option<Takeover> {
        *self.outcome.lock()
    }

    /// Performs the role-specific promotion and signals completion. A second
    /// call returns the first outcome without touching any collaborator.
    pub fn execute(&self) -> Takeover {
        let mut outcome = self.outcome.lock();
        if let Some(done) = *outcome {
            return done;
        }
        let role = self.state.role();
        info!("event=colo_failover_start role={role}");
        self.ensure_vm_stopped();
        let takeover = match role {
            Role::Primary => self.promote_primary(),
            Role::Secondary => self.promote_secondary(),
        };
        *outcome = Some(takeover);
        self.state.failover().complete();
        info!(
            "event=colo_failover_complete role={} applied_checkpoints={} resumed_locally={}",
            role, takeover.applied_checkpoints, takeover.resumed_locally
        );
        takeover
    }

    fn ensure_vm_stopped(&self) {
        let _machine = self.collaborators.machine.lock();
        if self.collaborators.vm.is_running() {
            self.collaborators.vm.stop();
            info!("event=colo_vm_state_change from=run to=stop context=failover");
        }
    }

    fn promote_primary(&self) -> Takeover {
        if let Err(err) = self.collaborators.network.revert(Role::Primary) {
            warn!("event=colo_network_revert_error role=primary error={err}");
        }
        self.state.mark_completed_unless_failed();
        {
            let _machine = self.collaborators.machine.lock();
            if let Err(err) = self.collaborators.storage.stop(true) {
                error!("event=colo_storage_stop_error role=primary error={err}");
            }
            info!("event=colo_storage_replication_stop reason=failover role=primary");
            self.collaborators.vm.start();
        }
        info!("event=colo_vm_state_change from=stop to=run context=standalone");
        Takeover {
            role: Role::Primary,
            applied_checkpoints: 0,
            resumed_locally: true,
        }
    }

    fn promote_secondary(&self) -> Takeover {
        // never promote a half-applied checkpoint
        self.state.loading().wait_clear();
        if let Err(err) = self.collaborators.oracle.failover() {
            error!("event=colo_oracle_failover_error error={err}");
        }
        {
            let _machine = self.collaborators.machine.lock();
            if let Err(err) = self.collaborators.storage.stop(true) {
                error!("event=colo_storage_stop_error role=secondary error={err}");
            }
        }
        info!("event=colo_storage_replication_stop reason=failover role=secondary");
        if let Err(err) = self.collaborators.network.revert(Role::Secondary) {
            warn!("event=colo_network_revert_error role=secondary error={err}");
        }
        self.state.mark_completed_unless_failed();
        let mut takeover = Takeover {
            role: Role::Secondary,
            applied_checkpoints: self.state.applied_checkpoints(),
            resumed_locally: false,
        };
        let handed_off = match &self.handoff {
            Some(handoff) => handoff.send(takeover).is_ok(),
            None => false,
        };
        if !handed_off {
            let _machine = self.collaborators.machine.lock();
            self.collaborators.vm.start();
            takeover.resumed_locally = true;
            info!("event=colo_vm_state_change from=stop to=run context=standalone");
        }
        takeover
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn request_is_single_assignment() {
        let signal = FailoverSignal::new();
        assert!(signal.request());
        assert!(!signal.request());
        assert_eq!(signal.state(), FailoverState::Requested);
        signal.complete();
        assert!(signal.is_requested());
        signal.clear();
        assert_eq!(signal.state(), FailoverState::Idle);
        assert!(signal.request());
    }

    #[test]
    fn wait_requested_times_out_when_idle() {
        let signal = FailoverSignal::new();
        let start = Instant::now();
        assert!(!signal.wait_requested(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn wait_requested_wakes_on_request() {
        let signal = Arc::new(FailoverSignal::new());
        let requester = {
            let signal = signal.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                signal.request();
            })
        };
        assert!(signal.wait_requested(Duration::from_secs(5)));
        requester.join().unwrap();
    }

    #[test]
    fn wait_completed_blocks_until_complete() {
        let signal = Arc::new(FailoverSignal::new());
        signal.request();
        let completer = {
            let signal = signal.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                signal.complete();
            })
        };
        signal.wait_completed();
        assert!(signal.is_completed());
        completer.join().unwrap();
    }
}
