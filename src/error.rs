use crate::message::CheckpointMessage;
use thiserror::Error;

/// Fatal conditions raised by the checkpoint loops. Every variant ends the
/// session and hands control to the failover orchestrator.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("control channel io error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("protocol desync: {0}")]
    ProtocolDesync(#[from] ProtocolError),
    #[error("compare oracle failed: {0}")]
    Oracle(#[source] CollaboratorError),
    #[error("storage replication failed: {0}")]
    StorageReplication(#[source] CollaboratorError),
    #[error("device state snapshot failed: {0}")]
    Snapshot(#[source] CollaboratorError),
    #[error("memory transfer failed: {0}")]
    MemoryTransfer(#[source] CollaboratorError),
    #[error("failover requested")]
    FailoverRequested,
}

impl CheckpointError {
    pub fn is_desync(&self) -> bool {
        matches!(self, CheckpointError::ProtocolDesync(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, CheckpointError::Transport(_))
    }

    /// Short label used in `event=` log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            CheckpointError::Transport(_) => "transport",
            CheckpointError::ProtocolDesync(_) => "protocol_desync",
            CheckpointError::Oracle(_) => "oracle",
            CheckpointError::StorageReplication(_) => "storage_replication",
            CheckpointError::Snapshot(_) => "snapshot",
            CheckpointError::MemoryTransfer(_) => "memory_transfer",
            CheckpointError::FailoverRequested => "failover_requested",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("expected {expected}, received {received:#x}")]
    Unexpected {
        expected: CheckpointMessage,
        received: u64,
    },
    #[error("unrecognized command {value:#x}")]
    Unrecognized { value: u64 },
    #[error("device state of {declared} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { declared: u64, limit: u64 },
}

/// Uniform failure reported by an external collaborator.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{context}: {details}")]
    Failed {
        context: &'static str,
        details: String,
    },
}

impl CollaboratorError {
    pub fn failed(context: &'static str, details: impl Into<String>) -> Self {
        CollaboratorError::Failed {
            context,
            details: details.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config field `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected record name `{found}`")]
    NameMismatch { found: String },
    #[error("unsupported record version {version} (minimum {minimum})")]
    UnsupportedVersion { version: u32, minimum: u32 },
    #[error("record name is not valid utf-8")]
    InvalidName,
}

#[derive(Debug, Error)]
pub enum NetReconfigError {
    #[error("no network bindings registered")]
    NoBindings,
    #[error("empty helper command line")]
    EmptyCommand,
    #[error("empty `{argument}` argument for nic `{nic}`")]
    MissingArgument {
        nic: String,
        argument: &'static str,
    },
    #[error("nic `{nic}` needs if_up and if_down scripts on the secondary")]
    MissingStandaloneScripts { nic: String },
    #[error("failed to launch `{script}`: {source}")]
    Launch {
        script: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{script}` exited with {status}")]
    ScriptFailed { script: String, status: String },
}
