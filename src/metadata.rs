use crate::config::CheckpointConfig;
use crate::error::MetadataError;
use serde::Serialize;
use std::io::{Read, Write};

pub const RECORD_NAME: &str = "COLOState";
pub const RECORD_VERSION: u32 = 1;
pub const RECORD_MINIMUM_VERSION: u32 = 1;

/// Session-metadata record carrying the "replication requested" flag.
///
/// Layout: name length (u8), name bytes, version (u32 BE), flag (u32 BE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionMetadata {
    pub replication_requested: bool,
}

impl SessionMetadata {
    /// Captures the flag from configuration at save time.
    pub fn from_config(config: &CheckpointConfig) -> Self {
        Self {
            replication_requested: config.replication_requested,
        }
    }

    pub fn save(&self, sink: &mut impl Write) -> Result<(), MetadataError> {
        sink.write_all(&[RECORD_NAME.len() as u8])?;
        sink.write_all(RECORD_NAME.as_bytes())?;
        sink.write_all(&RECORD_VERSION.to_be_bytes())?;
        sink.write_all(&u32::from(self.replication_requested).to_be_bytes())?;
        Ok(())
    }

    pub fn restore(source: &mut impl Read) -> Result<Self, MetadataError> {
        let mut len = [0u8; 1];
        source.read_exact(&mut len)?;
        let mut name = vec![0u8; usize::from(len[0])];
        source.read_exact(&mut name)?;
        let name = String::from_utf8(name).map_err(|_| MetadataError::InvalidName)?;
        if name != RECORD_NAME {
            return Err(MetadataError::NameMismatch { found: name });
        }
        let version = read_u32(source)?;
        if version < RECORD_MINIMUM_VERSION || version > RECORD_VERSION {
            return Err(MetadataError::UnsupportedVersion {
                version,
                minimum: RECORD_MINIMUM_VERSION,
            });
        }
        let flag = read_u32(source)?;
        Ok(Self {
            replication_requested: flag != 0,
        })
    }
}

fn read_u32(source: &mut impl Read) -> Result<u32, MetadataError> {
    let mut raw = [0u8; 4];
    source.read_exact(&mut raw)?;
    Ok(u32::from_be_bytes(raw))
}
