use crate::session::{Role, SessionState, SessionStatus};
use crate::stats::StatisticsSnapshot;
use crate::telemetry::MetricsRegistry;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Operator-facing handle over a running session. Every call is a thin
/// pass-through into the shared session state.
#[derive(Clone)]
pub struct CheckpointControl {
    state: Arc<SessionState>,
}

impl CheckpointControl {
    pub fn new(state: Arc<SessionState>) -> Self {
        Self { state }
    }

    pub fn set_checkpoint_period(&self, period: Duration) {
        self.state.set_checkpoint_period(period);
        info!(
            "event=colo_checkpoint_period_set role={} period_ms={}",
            self.state.role(),
            self.state.checkpoint_period().as_millis()
        );
    }

    pub fn checkpoint_period(&self) -> Duration {
        self.state.checkpoint_period()
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.state.stats().snapshot()
    }

    pub fn publish_metrics(&self, registry: &mut MetricsRegistry) {
        self.state.stats().publish_metrics(registry);
    }

    /// Files a manual failover request. Returns false when one is already pending.
    pub fn request_failover(&self) -> bool {
        info!("event=colo_manual_failover role={}", self.state.role());
        self.state.failover().request()
    }

    /// Makes the next primary transaction the final one. Guest shutdown
    /// originates on the primary only; a secondary handle refuses and
    /// returns false.
    pub fn request_guest_shutdown(&self) -> bool {
        if self.state.role() == Role::Secondary {
            warn!("event=colo_guest_shutdown_rejected role=secondary");
            return false;
        }
        info!("event=colo_guest_shutdown_requested role=primary");
        self.state.request_guest_shutdown();
        true
    }

    pub fn role(&self) -> Role {
        self.state.role()
    }

    pub fn status(&self) -> SessionStatus {
        self.state.status()
    }

    pub fn in_checkpoint_session(&self) -> bool {
        self.state.status() == SessionStatus::Active
    }

    pub fn is_loading(&self) -> bool {
        self.state.loading().is_set()
    }
}
