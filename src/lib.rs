//! Checkpoint replication core for a primary/secondary virtual machine pair.
//! Drives the NEW, SUSPENDED, SEND, RECEIVED and LOADED handshake on both
//! sides and promotes either side to stand-alone operation on failover.

pub mod buffer;
pub mod channel;
pub mod collaborators;
pub mod config;
pub mod control;
pub mod error;
pub mod failover;
pub mod message;
pub mod metadata;
pub mod netreconf;
pub mod primary;
pub mod secondary;
pub mod session;
pub mod sim;
pub mod stats;
pub mod storage;
pub mod telemetry;
pub mod timeouts;

pub use buffer::CheckpointBuffer;
pub use channel::{accept_session, connect_session, ChannelInterrupt, ControlChannel, Direction};
pub use collaborators::{
    Collaborators, CompareOracle, CompareVerdict, DeviceStateCodec, MachineLock, MemoryTransport,
    NetworkReconfig, StorageReplication, VmControl,
};
pub use config::CheckpointConfig;
pub use control::CheckpointControl;
pub use error::{
    CheckpointError, CollaboratorError, ConfigError, MetadataError, NetReconfigError,
    ProtocolError,
};
pub use failover::{FailoverOrchestrator, FailoverSignal, FailoverState, Takeover};
pub use message::CheckpointMessage;
pub use metadata::SessionMetadata;
pub use netreconf::{NicBinding, ScriptNetworkReconfig};
pub use primary::PrimaryCoordinator;
pub use secondary::SecondaryProcessor;
pub use session::{
    CheckpointSession, LoadingGuard, Role, SessionExit, SessionState, SessionStatus,
};
pub use stats::{StatisticsLedger, StatisticsSnapshot};
pub use storage::{ReplicatedDisk, ReplicatedDiskSet};
pub use telemetry::{MetricsRegistry, MetricsSnapshot};
