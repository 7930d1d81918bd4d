//! Control-channel command tags.
//!
//! Commands travel as 64-bit big-endian integers. The checkpoint sync points
//! (`NEW` through `LOADED`) are single-direction: only the side that advances a
//! point transmits it, the peer acknowledges by waiting for the next one.
//!
//! ```text
//!              Primary                  Secondary
//!  NEW         @
//!                                       suspend
//!  SUSPENDED                            @
//!              suspend, save state
//!  SEND        @
//!              send state               receive state
//!  RECEIVED                             @
//!                                       load state
//!  LOADED                               @
//!              resume                   resume
//! ```

use serde::Serialize;
use std::fmt;

/// Width in bytes of every command and length prefix on the wire.
pub const COMMAND_WIDTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CheckpointMessage {
    Ready,
    New,
    Suspended,
    Send,
    Received,
    Loaded,
    GuestShutdown,
    RamLiveMigrate,
}

impl CheckpointMessage {
    pub const ALL: [CheckpointMessage; 8] = [
        CheckpointMessage::Ready,
        CheckpointMessage::New,
        CheckpointMessage::Suspended,
        CheckpointMessage::Send,
        CheckpointMessage::Received,
        CheckpointMessage::Loaded,
        CheckpointMessage::GuestShutdown,
        CheckpointMessage::RamLiveMigrate,
    ];

    pub const fn as_u64(self) -> u64 {
        match self {
            CheckpointMessage::Ready => 0x46,
            CheckpointMessage::New => 0x47,
            CheckpointMessage::Suspended => 0x48,
            CheckpointMessage::Send => 0x49,
            CheckpointMessage::Received => 0x4A,
            CheckpointMessage::Loaded => 0x4B,
            CheckpointMessage::GuestShutdown => 0x4C,
            CheckpointMessage::RamLiveMigrate => 0x4D,
        }
    }

    pub fn from_u64(value: u64) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|message| message.as_u64() == value)
    }

    pub fn encode(self) -> [u8; COMMAND_WIDTH] {
        self.as_u64().to_be_bytes()
    }

    /// Position of a sync point within one transaction, `None` for the
    /// commands that sit outside the transaction sequence.
    pub fn sync_point_index(self) -> Option<usize> {
        match self {
            CheckpointMessage::New => Some(0),
            CheckpointMessage::Suspended => Some(1),
            CheckpointMessage::Send => Some(2),
            CheckpointMessage::Received => Some(3),
            CheckpointMessage::Loaded => Some(4),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CheckpointMessage::Ready => "READY",
            CheckpointMessage::New => "NEW",
            CheckpointMessage::Suspended => "SUSPENDED",
            CheckpointMessage::Send => "SEND",
            CheckpointMessage::Received => "RECEIVED",
            CheckpointMessage::Loaded => "LOADED",
            CheckpointMessage::GuestShutdown => "GUEST_SHUTDOWN",
            CheckpointMessage::RamLiveMigrate => "RAM_LIVE_MIGRATE",
        }
    }
}

impl fmt::Display for CheckpointMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
