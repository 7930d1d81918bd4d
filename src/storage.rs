use crate::collaborators::StorageReplication;
use crate::error::CollaboratorError;
use crate::session::Role;
use log::{debug, info, warn};
use std::sync::Arc;

/// One block device taking part in replication.
pub trait ReplicatedDisk: Send + Sync {
    fn name(&self) -> &str;
    fn is_read_only(&self) -> bool;
    /// False when no medium is attached.
    fn is_inserted(&self) -> bool;
    fn start(&self, role: Role) -> Result<(), CollaboratorError>;
    fn stop(&self, failover: bool) -> Result<(), CollaboratorError>;
    fn checkpoint(&self) -> Result<(), CollaboratorError>;
}

/// Drives replication across every writable, inserted disk.
#[derive(Default)]
pub struct ReplicatedDiskSet {
    disks: Vec<Arc<dyn ReplicatedDisk>>,
}

impl ReplicatedDiskSet {
    pub fn new(disks: Vec<Arc<dyn ReplicatedDisk>>) -> Self {
        Self { disks }
    }

    pub fn push(&mut self, disk: Arc<dyn ReplicatedDisk>) {
        self.disks.push(disk);
    }

    fn replicated(&self) -> impl Iterator<Item = &Arc<dyn ReplicatedDisk>> {
        self.disks
            .iter()
            .filter(|disk| !disk.is_read_only() && disk.is_inserted())
    }
}

impl StorageReplication for ReplicatedDiskSet {
    /// Starts every disk; on the first failure the disks already started are
    /// stopped again without failover.
    fn start(&self, role: Role) -> Result<(), CollaboratorError> {
        let mut started: Vec<&Arc<dyn ReplicatedDisk>> = Vec::new();
        for disk in self.replicated() {
            if let Err(err) = disk.start(role) {
                warn!(
                    "event=colo_disk_start_error disk={} role={} error={}",
                    disk.name(),
                    role,
                    err
                );
                for done in started.iter().rev() {
                    if let Err(stop_err) = done.stop(false) {
                        warn!(
                            "event=colo_disk_rollback_error disk={} error={}",
                            done.name(),
                            stop_err
                        );
                    }
                }
                return Err(err);
            }
            debug!("event=colo_disk_start disk={} role={}", disk.name(), role);
            started.push(disk);
        }
        info!(
            "event=colo_disk_set_started role={} disks={}",
            role,
            started.len()
        );
        Ok(())
    }

    /// Visits every disk and reports the first failure.
    fn stop(&self, failover: bool) -> Result<(), CollaboratorError> {
        let mut first_err = None;
        for disk in self.replicated() {
            if let Err(err) = disk.stop(failover) {
                warn!(
                    "event=colo_disk_stop_error disk={} failover={} error={}",
                    disk.name(),
                    failover,
                    err
                );
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn checkpoint(&self) -> Result<(), CollaboratorError> {
        for disk in self.replicated() {
            disk.checkpoint()?;
        }
        Ok(())
    }
}
