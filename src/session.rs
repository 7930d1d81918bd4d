use crate::buffer::CheckpointBuffer;
use crate::channel::ControlChannel;
use crate::config::CheckpointConfig;
use crate::control::CheckpointControl;
use crate::failover::{FailoverSignal, Takeover};
use crate::stats::StatisticsLedger;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Role {
    Primary,
    Secondary,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Secondary => "secondary",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    /// Handshake and collaborator setup in progress.
    Setup,
    /// Checkpoint loop running.
    Active,
    /// Failover promoted this side to stand-alone operation.
    Completed,
    /// Setup never reached the checkpoint loop.
    Failed,
    /// Guest shutdown propagated; the loop is finished.
    Shutdown,
}

/// How a checkpoint loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionExit {
    /// Guest shutdown was propagated to both sides.
    Shutdown,
    /// This side was promoted to stand-alone operation.
    FailedOver(Takeover),
    /// Secondary lost its primary and no failover was requested in time; the
    /// owner is expected to terminate the process.
    Terminated,
}

/// Marks an in-progress, non-interruptible device-state apply on the
/// secondary. Promotion waits for it to clear.
#[derive(Debug, Default)]
pub struct LoadingGuard {
    loading: Mutex<bool>,
    cleared: Condvar,
}

impl LoadingGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the guard until the returned scope is dropped.
    pub fn enter(&self) -> LoadingScope<'_> {
        self.set();
        LoadingScope { guard: self }
    }

    pub fn set(&self) {
        *self.loading.lock() = true;
    }

    pub fn clear(&self) {
        let mut loading = self.loading.lock();
        *loading = false;
        self.cleared.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.loading.lock()
    }

    /// Blocks until no apply is in progress.
    pub fn wait_clear(&self) {
        let mut loading = self.loading.lock();
        while *loading {
            self.cleared.wait(&mut loading);
        }
    }
}

pub struct LoadingScope<'a> {
    guard: &'a LoadingGuard,
}

impl Drop for LoadingScope<'_> {
    fn drop(&mut self) {
        self.guard.clear();
    }
}

/// State shared between a checkpoint loop, its failover orchestrator and the
/// operator control handle.
#[derive(Debug)]
pub struct SessionState {
    role: Role,
    status: Mutex<SessionStatus>,
    guest_shutdown: AtomicBool,
    checkpoint_period_ms: AtomicU64,
    applied_checkpoints: AtomicU64,
    loading: LoadingGuard,
    failover: Arc<FailoverSignal>,
    stats: StatisticsLedger,
}

impl SessionState {
    pub fn new(role: Role, config: &CheckpointConfig, failover: Arc<FailoverSignal>) -> Self {
        Self {
            role,
            status: Mutex::new(SessionStatus::Setup),
            guest_shutdown: AtomicBool::new(false),
            checkpoint_period_ms: AtomicU64::new(config.checkpoint_period_ms),
            applied_checkpoints: AtomicU64::new(0),
            loading: LoadingGuard::new(),
            failover,
            stats: StatisticsLedger::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: SessionStatus) {
        *self.status.lock() = status;
    }

    /// Moves the session to `Completed` unless setup already failed.
    pub fn mark_completed_unless_failed(&self) {
        let mut status = self.status.lock();
        if *status != SessionStatus::Failed {
            *status = SessionStatus::Completed;
        }
    }

    pub fn request_guest_shutdown(&self) {
        self.guest_shutdown.store(true, Ordering::SeqCst);
    }

    pub fn guest_shutdown_pending(&self) -> bool {
        self.guest_shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_guest_shutdown(&self) {
        self.guest_shutdown.store(false, Ordering::SeqCst);
    }

    pub fn checkpoint_period(&self) -> Duration {
        Duration::from_millis(self.checkpoint_period_ms.load(Ordering::Relaxed))
    }

    pub fn set_checkpoint_period(&self, period: Duration) {
        let millis = u64::try_from(period.as_millis()).unwrap_or(u64::MAX).max(1);
        self.checkpoint_period_ms.store(millis, Ordering::Relaxed);
    }

    pub(crate) fn record_applied_checkpoint(&self) -> u64 {
        self.applied_checkpoints.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Checkpoints fully applied on the secondary.
    pub fn applied_checkpoints(&self) -> u64 {
        self.applied_checkpoints.load(Ordering::SeqCst)
    }

    pub fn loading(&self) -> &LoadingGuard {
        &self.loading
    }

    pub fn failover(&self) -> &Arc<FailoverSignal> {
        &self.failover
    }

    pub fn stats(&self) -> &StatisticsLedger {
        &self.stats
    }
}

/// Everything one checkpoint loop owns for its lifetime.
pub struct CheckpointSession {
    pub(crate) state: Arc<SessionState>,
    pub(crate) channel: ControlChannel,
    pub(crate) buffer: CheckpointBuffer,
    pub(crate) config: CheckpointConfig,
}

impl CheckpointSession {
    /// Binds a channel to a session. Failover requests interrupt the channel
    /// so a loop blocked on the peer reaches its exit path.
    pub fn new(
        channel: ControlChannel,
        config: CheckpointConfig,
        failover: Arc<FailoverSignal>,
    ) -> Self {
        let state = Arc::new(SessionState::new(channel.role(), &config, failover));
        if let Some(interrupt) = channel.interrupt_handle() {
            state.failover().register_interrupt(interrupt);
        }
        Self {
            state,
            channel,
            buffer: CheckpointBuffer::with_capacity(config.buffer_capacity_bytes),
            config,
        }
    }

    pub fn role(&self) -> Role {
        self.state.role()
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    pub fn control(&self) -> CheckpointControl {
        CheckpointControl::new(self.state.clone())
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }
}
