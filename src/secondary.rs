//! Secondary-side checkpoint processor.
//!
//! Mirrors the primary's transactions: suspends on NEW, receives memory and
//! device state, applies them over a freshly reset machine and resumes.

use crate::collaborators::Collaborators;
use crate::control::CheckpointControl;
use crate::error::{CheckpointError, ProtocolError};
use crate::failover::{FailoverOrchestrator, Takeover};
use crate::message::CheckpointMessage;
use crate::session::{CheckpointSession, Role, SessionExit, SessionStatus};
use log::{debug, error, info, warn};
use std::sync::mpsc::Sender;

pub struct SecondaryProcessor {
    session: CheckpointSession,
    collaborators: Collaborators,
    orchestrator: FailoverOrchestrator,
}

impl SecondaryProcessor {
    pub fn new(session: CheckpointSession, collaborators: Collaborators) -> Self {
        let orchestrator = FailoverOrchestrator::new(session.state().clone(), collaborators.clone());
        Self {
            session,
            collaborators,
            orchestrator,
        }
    }

    /// Passes the promotion continuation to `handoff` instead of having the
    /// orchestrator restart the VM.
    pub fn with_handoff(mut self, handoff: Sender<Takeover>) -> Self {
        self.orchestrator = self.orchestrator.with_handoff(handoff);
        self
    }

    pub fn control(&self) -> CheckpointControl {
        self.session.control()
    }

    pub fn run(mut self) -> SessionExit {
        let hotplug_allowed = self.collaborators.vm.set_hotplug_allowed(false);
        let result = match self.setup() {
            Ok(()) => self.command_loop(),
            Err(err) => {
                self.session.state.set_status(SessionStatus::Failed);
                Err(err)
            }
        };
        let exit = match result {
            Ok(exit) => exit,
            Err(err) => self.exit_after_error(err),
        };
        self.session.buffer.release();
        self.session.state.failover().release_interrupts();
        self.collaborators.vm.set_hotplug_allowed(hotplug_allowed);
        info!("event=colo_session_exit role=secondary exit={exit:?}");
        exit
    }

    fn setup(&mut self) -> Result<(), CheckpointError> {
        if let Err(err) = self.collaborators.network.apply(Role::Secondary) {
            warn!("event=colo_network_apply_error role=secondary error={err}");
        }
        self.collaborators
            .memory
            .init_cache()
            .map_err(CheckpointError::MemoryTransfer)?;
        {
            let _machine = self.collaborators.machine.lock();
            self.collaborators
                .storage
                .start(Role::Secondary)
                .map_err(CheckpointError::StorageReplication)?;
        }
        info!("event=colo_storage_replication_start role=secondary");
        self.collaborators
            .memory
            .begin_load(self.session.channel.inbound())
            .map_err(CheckpointError::MemoryTransfer)?;
        self.session.channel.send(CheckpointMessage::Ready)?;
        {
            let _machine = self.collaborators.machine.lock();
            self.collaborators.vm.start();
        }
        info!("event=colo_vm_state_change from=stop to=run context=setup");
        self.session.state.set_status(SessionStatus::Active);
        Ok(())
    }

    fn command_loop(&mut self) -> Result<SessionExit, CheckpointError> {
        loop {
            match self.session.channel.recv_any()? {
                CheckpointMessage::New => self.checkpoint()?,
                CheckpointMessage::RamLiveMigrate => {
                    self.collaborators
                        .memory
                        .load(self.session.channel.inbound())
                        .map_err(CheckpointError::MemoryTransfer)?;
                    debug!("event=colo_live_migrate_applied");
                }
                CheckpointMessage::GuestShutdown => {
                    self.guest_shutdown();
                    return Ok(SessionExit::Shutdown);
                }
                other => {
                    return Err(ProtocolError::Unexpected {
                        expected: CheckpointMessage::New,
                        received: other.as_u64(),
                    }
                    .into())
                }
            }
        }
    }

    fn check_failover(&self) -> Result<(), CheckpointError> {
        if self.session.state.failover().is_requested() {
            return Err(CheckpointError::FailoverRequested);
        }
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<(), CheckpointError> {
        self.check_failover()?;
        {
            let _machine = self.collaborators.machine.lock();
            self.collaborators.vm.stop();
        }
        info!("event=colo_vm_state_change from=run to=stop context=checkpoint");
        self.session.channel.send(CheckpointMessage::Suspended)?;
        self.collaborators
            .oracle
            .checkpoint(Role::Secondary)
            .map_err(CheckpointError::Oracle)?;

        self.session.channel.recv_expect(CheckpointMessage::Send)?;
        self.collaborators
            .memory
            .load(self.session.channel.inbound())
            .map_err(CheckpointError::MemoryTransfer)?;
        let limit = self.session.config.max_device_state_bytes;
        let received = self
            .session
            .channel
            .recv_buffer(&mut self.session.buffer, limit)?;
        self.session.channel.send(CheckpointMessage::Received)?;
        debug!("event=colo_device_state_received bytes={received}");
        self.check_failover()?;

        self.apply()?;
        let applied = self.session.state.record_applied_checkpoint();

        self.session.channel.send(CheckpointMessage::Loaded)?;
        {
            let _machine = self.collaborators.machine.lock();
            self.collaborators.vm.start();
        }
        info!("event=colo_vm_state_change from=stop to=run context=checkpoint applied={applied}");
        Ok(())
    }

    /// Reset, cache merge and device-state load run under the machine lock
    /// with the loading guard set for the whole sequence.
    fn apply(&mut self) -> Result<(), CheckpointError> {
        let _machine = self.collaborators.machine.lock();
        self.collaborators.vm.reset();
        {
            let _loading = self.session.state.loading().enter();
            self.collaborators
                .memory
                .flush_cache()
                .map_err(CheckpointError::MemoryTransfer)?;
            let mut source = self.session.buffer.open_read();
            self.collaborators
                .codec
                .deserialize(&mut source)
                .map_err(CheckpointError::Snapshot)?;
        }
        self.collaborators
            .storage
            .checkpoint()
            .map_err(CheckpointError::StorageReplication)?;
        Ok(())
    }

    fn guest_shutdown(&mut self) {
        {
            let _machine = self.collaborators.machine.lock();
            self.collaborators.vm.stop();
            if let Err(err) = self.collaborators.storage.stop(false) {
                warn!("event=colo_storage_stop_error role=secondary reason=shutdown error={err}");
            }
            self.collaborators.vm.request_shutdown();
        }
        info!("event=colo_storage_replication_stop reason=shutdown role=secondary");
        self.session.state.set_status(SessionStatus::Shutdown);
    }

    fn exit_after_error(&mut self, err: CheckpointError) -> SessionExit {
        error!(
            "event=colo_checkpoint_abort role=secondary kind={} error={}",
            err.kind(),
            err
        );
        let signal = self.session.state.failover().clone();
        let grace = self.session.config.failover_grace();
        if !signal.is_requested() && !signal.wait_requested(grace) {
            error!(
                "event=colo_secondary_terminate reason=no_failover_request grace_ms={}",
                grace.as_millis()
            );
            if let Err(err) = self.collaborators.network.revert(Role::Secondary) {
                warn!("event=colo_network_revert_error role=secondary error={err}");
            }
            self.collaborators.memory.release_cache();
            return SessionExit::Terminated;
        }
        let takeover = self.orchestrator.execute();
        signal.wait_completed();
        signal.clear();
        self.collaborators.memory.release_cache();
        SessionExit::FailedOver(takeover)
    }
}
