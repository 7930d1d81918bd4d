//! Primary-side checkpoint coordinator.
//!
//! Decides when to checkpoint and drives each transaction through the sync
//! points. Every failure is terminal: the loop exits through the failover
//! orchestrator and nothing is retried.

use crate::collaborators::{Collaborators, CompareVerdict};
use crate::control::CheckpointControl;
use crate::error::CheckpointError;
use crate::failover::FailoverOrchestrator;
use crate::message::CheckpointMessage;
use crate::session::{CheckpointSession, Role, SessionExit, SessionStatus};
use log::{debug, error, info, warn};
use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

/// Result of one trigger evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    GuestShutdown,
    CompareMismatch,
    Periodic,
    LiveMigrate,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionOutcome {
    Resumed,
    Shutdown,
}

/// Remaining sleep before a compare-triggered checkpoint so that consecutive
/// suspends stay at least `min_period` apart.
pub fn min_period_delay(since_last: Duration, min_period: Duration) -> Duration {
    min_period.saturating_sub(since_last)
}

pub struct PrimaryCoordinator {
    session: CheckpointSession,
    collaborators: Collaborators,
    orchestrator: FailoverOrchestrator,
    last_checkpoint: Instant,
}

impl PrimaryCoordinator {
    pub fn new(session: CheckpointSession, collaborators: Collaborators) -> Self {
        let orchestrator = FailoverOrchestrator::new(session.state().clone(), collaborators.clone());
        Self {
            session,
            collaborators,
            orchestrator,
            last_checkpoint: Instant::now(),
        }
    }

    pub fn control(&self) -> CheckpointControl {
        self.session.control()
    }

    /// Runs the session to completion on the calling thread.
    pub fn run(mut self) -> SessionExit {
        let hotplug_allowed = self.collaborators.vm.set_hotplug_allowed(false);
        let result = match self.setup() {
            Ok(()) => self.checkpoint_loop(),
            Err(err) => {
                self.session.state.set_status(SessionStatus::Failed);
                Err(err)
            }
        };
        let exit = match result {
            Ok(exit) => exit,
            Err(err) => self.exit_through_failover(err),
        };
        self.session.buffer.release();
        self.session.state.failover().release_interrupts();
        self.collaborators.vm.set_hotplug_allowed(hotplug_allowed);
        info!("event=colo_session_exit role=primary exit={exit:?}");
        exit
    }

    fn setup(&mut self) -> Result<(), CheckpointError> {
        if let Err(err) = self.collaborators.network.apply(Role::Primary) {
            warn!("event=colo_network_apply_error role=primary error={err}");
        }
        self.collaborators
            .memory
            .begin_save(self.session.channel.outbound())
            .map_err(CheckpointError::MemoryTransfer)?;
        self.session.channel.flush()?;
        self.session.channel.recv_expect(CheckpointMessage::Ready)?;
        {
            let _machine = self.collaborators.machine.lock();
            self.collaborators
                .storage
                .start(Role::Primary)
                .map_err(CheckpointError::StorageReplication)?;
            info!("event=colo_storage_replication_start role=primary");
            self.collaborators.vm.start();
        }
        info!("event=colo_vm_state_change from=stop to=run context=setup");
        self.session.state.set_status(SessionStatus::Active);
        self.last_checkpoint = Instant::now();
        Ok(())
    }

    fn checkpoint_loop(&mut self) -> Result<SessionExit, CheckpointError> {
        while self.session.state.status() == SessionStatus::Active {
            let trigger = self.evaluate_trigger()?;
            match trigger {
                Trigger::Idle => {
                    thread::sleep(self.session.config.idle_poll());
                    continue;
                }
                Trigger::LiveMigrate => {
                    self.live_migrate()?;
                    continue;
                }
                Trigger::Periodic => self.session.state.stats().record_periodic_trigger(),
                Trigger::CompareMismatch => {
                    let delay = min_period_delay(
                        self.last_checkpoint.elapsed(),
                        self.session.config.min_period(),
                    );
                    if !delay.is_zero() {
                        debug!(
                            "event=colo_min_period_wait delay_ms={}",
                            delay.as_millis()
                        );
                        thread::sleep(delay);
                    }
                    self.session.state.stats().record_compare_trigger();
                }
                Trigger::GuestShutdown => {
                    info!("event=colo_final_checkpoint reason=guest_shutdown");
                }
            }
            match self.transaction()? {
                TransactionOutcome::Resumed => self.last_checkpoint = Instant::now(),
                TransactionOutcome::Shutdown => return Ok(SessionExit::Shutdown),
            }
        }
        Err(CheckpointError::FailoverRequested)
    }

    fn evaluate_trigger(&self) -> Result<Trigger, CheckpointError> {
        let state = &self.session.state;
        if state.failover().is_requested() {
            return Err(CheckpointError::FailoverRequested);
        }
        if state.guest_shutdown_pending() {
            return Ok(Trigger::GuestShutdown);
        }
        let verdict = self
            .collaborators
            .oracle
            .compare()
            .map_err(CheckpointError::Oracle)?;
        if verdict == CompareVerdict::Mismatch {
            return Ok(Trigger::CompareMismatch);
        }
        if self.last_checkpoint.elapsed() < state.checkpoint_period() {
            let threshold = self.session.config.live_migrate_threshold_bytes;
            let pending = self.collaborators.memory.pending_bytes(threshold);
            if pending > 0 && pending >= threshold {
                return Ok(Trigger::LiveMigrate);
            }
            return Ok(Trigger::Idle);
        }
        Ok(Trigger::Periodic)
    }

    fn live_migrate(&mut self) -> Result<(), CheckpointError> {
        let channel = &mut self.session.channel;
        channel.send(CheckpointMessage::RamLiveMigrate)?;
        let pages = self
            .collaborators
            .memory
            .save_incremental(channel.outbound())
            .map_err(CheckpointError::MemoryTransfer)?;
        channel.flush()?;
        self.session.state.stats().record_incremental_pages(pages);
        debug!("event=colo_live_migrate pages={pages}");
        Ok(())
    }

    fn check_failover(&self) -> Result<(), CheckpointError> {
        if self.session.state.failover().is_requested() {
            return Err(CheckpointError::FailoverRequested);
        }
        Ok(())
    }

    fn transaction(&mut self) -> Result<TransactionOutcome, CheckpointError> {
        self.session.channel.send(CheckpointMessage::New)?;
        self.session.channel.recv_expect(CheckpointMessage::Suspended)?;
        self.session.buffer.reset();
        self.check_failover()?;

        let suspended_at = Instant::now();
        let final_transaction = {
            let _machine = self.collaborators.machine.lock();
            let shutdown = self.session.state.guest_shutdown_pending();
            self.collaborators.vm.stop();
            shutdown
        };
        info!("event=colo_vm_state_change from=run to=stop context=checkpoint");
        self.check_failover()?;

        self.collaborators
            .oracle
            .checkpoint(Role::Primary)
            .map_err(CheckpointError::Oracle)?;
        {
            let _machine = self.collaborators.machine.lock();
            self.collaborators
                .storage
                .checkpoint()
                .map_err(CheckpointError::StorageReplication)?;
        }

        self.session.channel.send(CheckpointMessage::Send)?;
        let state_bytes = {
            let _machine = self.collaborators.machine.lock();
            let mut sink = self.session.buffer.open_write();
            let written = self
                .collaborators
                .codec
                .serialize(&mut sink)
                .map_err(CheckpointError::Snapshot)?;
            sink.flush()?;
            written
        };
        let pages = self
            .collaborators
            .memory
            .save_full(self.session.channel.outbound())
            .map_err(CheckpointError::MemoryTransfer)?;
        self.session.state.stats().record_full_pages(pages);
        debug!(
            "event=colo_snapshot_staged device_bytes={} buffer_bytes={} pages={}",
            state_bytes,
            self.session.buffer.len(),
            pages
        );
        self.session.channel.send_buffer(&self.session.buffer)?;

        self.session.channel.recv_expect(CheckpointMessage::Received)?;
        self.session.channel.recv_expect(CheckpointMessage::Loaded)?;
        self.session.state.stats().record_checkpoint();

        if final_transaction {
            self.finish_guest_shutdown();
            return Ok(TransactionOutcome::Shutdown);
        }

        {
            let _machine = self.collaborators.machine.lock();
            self.collaborators.vm.start();
        }
        let downtime = suspended_at.elapsed();
        self.session.state.stats().record_downtime(downtime);
        info!(
            "event=colo_vm_state_change from=stop to=run context=checkpoint downtime_ms={}",
            downtime.as_millis()
        );
        Ok(TransactionOutcome::Resumed)
    }

    /// Ends replication after the final checkpoint. The VM stays stopped.
    fn finish_guest_shutdown(&mut self) {
        {
            let _machine = self.collaborators.machine.lock();
            if let Err(err) = self.collaborators.storage.stop(false) {
                warn!("event=colo_storage_stop_error role=primary reason=shutdown error={err}");
            }
        }
        info!("event=colo_storage_replication_stop reason=shutdown role=primary");
        if let Err(err) = self.session.channel.send(CheckpointMessage::GuestShutdown) {
            warn!("event=colo_guest_shutdown_send_error error={err}");
        }
        self.session.state.clear_guest_shutdown();
        self.collaborators.vm.request_shutdown();
        self.session.state.set_status(SessionStatus::Shutdown);
    }

    fn exit_through_failover(&mut self, err: CheckpointError) -> SessionExit {
        error!(
            "event=colo_checkpoint_abort role=primary kind={} error={}",
            err.kind(),
            err
        );
        let signal = self.session.state.failover().clone();
        if signal.request() {
            error!("event=colo_takeover role=primary reason=\"takeover from checkpoint channel\"");
        }
        let takeover = self.orchestrator.execute();
        signal.wait_completed();
        signal.clear();
        SessionExit::FailedOver(takeover)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_period_delay_covers_remaining_window() {
        let min = Duration::from_millis(100);
        assert_eq!(
            min_period_delay(Duration::from_millis(30), min),
            Duration::from_millis(70)
        );
        assert_eq!(min_period_delay(Duration::from_millis(150), min), Duration::ZERO);
        assert_eq!(min_period_delay(Duration::ZERO, min), min);
    }
}
