//! Narrow contracts for the services the checkpoint loops drive.
//!
//! None of these are implemented by the core; production embeddings provide
//! them and [`crate::sim`] provides in-memory versions.

use crate::error::{CollaboratorError, NetReconfigError};
use crate::session::Role;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::io::{Read, Write};
use std::sync::Arc;

/// Run-state control of the local virtual machine. Calls complete eventually.
pub trait VmControl: Send + Sync {
    fn stop(&self);
    fn start(&self);
    fn is_running(&self) -> bool;
    /// Returns devices to a freshly reset baseline before a state load.
    fn reset(&self);
    /// Asks the hosting process to shut the machine down.
    fn request_shutdown(&self);
    /// Allows or freezes device hotplug; returns the previous setting.
    fn set_hotplug_allowed(&self, allowed: bool) -> bool;
}

/// Replicated, checkpointable block storage.
pub trait StorageReplication: Send + Sync {
    fn start(&self, role: Role) -> Result<(), CollaboratorError>;
    /// Ends replication. `failover` makes the local side authoritative.
    fn stop(&self, failover: bool) -> Result<(), CollaboratorError>;
    /// Point-in-time marker; on the secondary it drops the replica write buffer.
    fn checkpoint(&self) -> Result<(), CollaboratorError>;
}

/// Device/model state serialization.
pub trait DeviceStateCodec: Send + Sync {
    fn serialize(&self, sink: &mut dyn Write) -> Result<u64, CollaboratorError>;
    fn deserialize(&self, source: &mut dyn Read) -> Result<(), CollaboratorError>;
}

/// Dirty-memory tracking and page transfer. The stream format is owned by the
/// implementation; the core only tells it where to read or write.
pub trait MemoryTransport: Send + Sync {
    /// Stream preamble written by the primary before it waits for READY.
    fn begin_save(&self, sink: &mut dyn Write) -> Result<(), CollaboratorError>;
    /// Consumes the preamble on the secondary before it sends READY.
    fn begin_load(&self, source: &mut dyn Read) -> Result<(), CollaboratorError>;
    /// Forced flush of every outstanding dirty page; returns pages sent.
    fn save_full(&self, sink: &mut dyn Write) -> Result<u64, CollaboratorError>;
    /// Incremental push while the guest keeps running; returns pages sent.
    fn save_incremental(&self, sink: &mut dyn Write) -> Result<u64, CollaboratorError>;
    fn load(&self, source: &mut dyn Read) -> Result<(), CollaboratorError>;
    /// Best-effort estimate of pending dirty bytes, capped around `budget`.
    fn pending_bytes(&self, budget: u64) -> u64;
    fn init_cache(&self) -> Result<(), CollaboratorError>;
    /// Merges the secondary's working cache into live memory.
    fn flush_cache(&self) -> Result<(), CollaboratorError>;
    fn release_cache(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompareVerdict {
    Match,
    Mismatch,
}

/// Divergence oracle deciding whether both executions still agree.
pub trait CompareOracle: Send + Sync {
    fn compare(&self) -> Result<CompareVerdict, CollaboratorError>;
    fn checkpoint(&self, role: Role) -> Result<(), CollaboratorError>;
    /// Told when the secondary is promoted.
    fn failover(&self) -> Result<(), CollaboratorError>;
}

/// Network-interface reconfiguration run once at session start and once at failover.
pub trait NetworkReconfig: Send + Sync {
    fn apply(&self, role: Role) -> Result<(), NetReconfigError>;
    fn revert(&self, role: Role) -> Result<(), NetReconfigError>;
}

/// The single exclusive lock serializing VM run-state, storage and device
/// state mutation. The VM's own execution context takes it too.
#[derive(Debug, Clone, Default)]
pub struct MachineLock {
    inner: Arc<Mutex<()>>,
}

impl MachineLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.inner.lock()
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub vm: Arc<dyn VmControl>,
    pub storage: Arc<dyn StorageReplication>,
    pub codec: Arc<dyn DeviceStateCodec>,
    pub memory: Arc<dyn MemoryTransport>,
    pub oracle: Arc<dyn CompareOracle>,
    pub network: Arc<dyn NetworkReconfig>,
    pub machine: MachineLock,
}
