//! Framed command exchange between the two checkpoint loops.
//!
//! One session transport carries two logical directions. The forward direction
//! (primary to secondary) carries sync-point advances, memory streams and the
//! device-state payload; the backward direction carries acknowledgements.

mod tcp;

pub use tcp::{accept_session, connect_session, ChannelInterrupt};

use crate::buffer::CheckpointBuffer;
use crate::error::{CheckpointError, ProtocolError};
use crate::message::{CheckpointMessage, COMMAND_WIDTH};
use crate::session::Role;
use log::{debug, trace};
use std::io::{BufReader, BufWriter, Read, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Primary to secondary.
    Forward,
    /// Secondary to primary.
    Backward,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
        }
    }
}

/// One side's view of the control channel: the direction it writes and the
/// direction it reads.
pub struct ControlChannel {
    role: Role,
    inbound: BufReader<Box<dyn Read + Send>>,
    outbound: BufWriter<Box<dyn Write + Send>>,
    interrupt: Option<ChannelInterrupt>,
}

impl ControlChannel {
    pub fn new<R, W>(role: Role, inbound: R, outbound: W) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self {
            role,
            inbound: BufReader::new(Box::new(inbound)),
            outbound: BufWriter::new(Box::new(outbound)),
            interrupt: None,
        }
    }

    pub(crate) fn with_interrupt(mut self, interrupt: ChannelInterrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn outbound_direction(&self) -> Direction {
        match self.role {
            Role::Primary => Direction::Forward,
            Role::Secondary => Direction::Backward,
        }
    }

    pub fn inbound_direction(&self) -> Direction {
        match self.role {
            Role::Primary => Direction::Backward,
            Role::Secondary => Direction::Forward,
        }
    }

    /// Handle that aborts blocked reads and writes on this channel, when the
    /// underlying transport supports it.
    pub fn interrupt_handle(&self) -> Option<ChannelInterrupt> {
        self.interrupt.clone()
    }

    /// Writes one command and flushes it to the peer.
    pub fn send(&mut self, message: CheckpointMessage) -> Result<(), CheckpointError> {
        self.outbound.write_all(&message.encode())?;
        self.outbound.flush()?;
        debug!(
            "event=colo_send role={} direction={} message={}",
            self.role,
            self.outbound_direction().label(),
            message
        );
        Ok(())
    }

    /// Writes a raw 64-bit value (length prefix) without flushing.
    pub fn send_value(&mut self, value: u64) -> Result<(), CheckpointError> {
        self.outbound.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    /// Sends the staged snapshot as an 8-byte length followed by its bytes.
    pub fn send_buffer(&mut self, buffer: &CheckpointBuffer) -> Result<(), CheckpointError> {
        self.send_value(buffer.len())?;
        self.outbound.write_all(buffer.as_bytes())?;
        self.outbound.flush()?;
        trace!(
            "event=colo_send_buffer role={} bytes={}",
            self.role,
            buffer.len()
        );
        Ok(())
    }

    pub fn recv_value(&mut self) -> Result<u64, CheckpointError> {
        let mut raw = [0u8; COMMAND_WIDTH];
        self.inbound.read_exact(&mut raw)?;
        Ok(u64::from_be_bytes(raw))
    }

    /// Blocks for the next command and decodes it. Unknown tags are a desync.
    pub fn recv_any(&mut self) -> Result<CheckpointMessage, CheckpointError> {
        let value = self.recv_value()?;
        let message = CheckpointMessage::from_u64(value)
            .ok_or(ProtocolError::Unrecognized { value })?;
        debug!(
            "event=colo_recv role={} direction={} message={}",
            self.role,
            self.inbound_direction().label(),
            message
        );
        Ok(message)
    }

    /// Blocks for the next command and fails with a desync unless it is `expected`.
    pub fn recv_expect(&mut self, expected: CheckpointMessage) -> Result<(), CheckpointError> {
        let received = self.recv_value()?;
        if received != expected.as_u64() {
            return Err(ProtocolError::Unexpected { expected, received }.into());
        }
        debug!(
            "event=colo_recv role={} direction={} message={}",
            self.role,
            self.inbound_direction().label(),
            expected
        );
        Ok(())
    }

    /// Receives a length-prefixed snapshot into `buffer`, refusing lengths above `limit`.
    pub fn recv_buffer(
        &mut self,
        buffer: &mut CheckpointBuffer,
        limit: u64,
    ) -> Result<u64, CheckpointError> {
        let declared = self.recv_value()?;
        if declared > limit {
            return Err(ProtocolError::PayloadTooLarge { declared, limit }.into());
        }
        buffer.fill_from(&mut self.inbound, declared)?;
        trace!(
            "event=colo_recv_buffer role={} bytes={}",
            self.role,
            declared
        );
        Ok(declared)
    }

    /// Raw inbound stream, used by the memory transport for page streams.
    pub fn inbound(&mut self) -> &mut dyn Read {
        &mut self.inbound
    }

    /// Raw outbound stream, used by the memory transport for page streams.
    pub fn outbound(&mut self) -> &mut dyn Write {
        &mut self.outbound
    }

    pub fn flush(&mut self) -> Result<(), CheckpointError> {
        self.outbound.flush()?;
        Ok(())
    }
}
