#![allow(dead_code)]

use colo::sim::{PAGE_SIZE, STREAM_MAGIC};
use colo::{accept_session, connect_session, CheckpointConfig, CheckpointMessage, ControlChannel};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

/// Timings short enough for tests; periodic checkpoints effectively disabled.
pub fn fast_config() -> CheckpointConfig {
    CheckpointConfig {
        min_period_ms: 10,
        checkpoint_period_ms: 10_000,
        idle_poll_ms: 2,
        failover_grace_ms: 100,
        ..CheckpointConfig::default()
    }
}

/// Raw end of a session driven step by step by a test.
pub struct ScriptedPeer {
    stream: TcpStream,
}

/// Primary channel paired with a peer standing in for the secondary.
pub fn primary_with_peer() -> (ControlChannel, ScriptedPeer) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    let channel = connect_session(addr).expect("connect");
    let (stream, _) = listener.accept().expect("accept");
    (channel, ScriptedPeer::new(stream))
}

/// Secondary channel paired with a peer standing in for the primary.
pub fn secondary_with_peer() -> (ControlChannel, ScriptedPeer) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    let stream = TcpStream::connect(addr).expect("connect");
    let channel = accept_session(&listener).expect("accept");
    (channel, ScriptedPeer::new(stream))
}

/// Both ends of a real session.
pub fn session_pair() -> (ControlChannel, ControlChannel) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    let primary = connect_session(addr).expect("connect");
    let secondary = accept_session(&listener).expect("accept");
    (primary, secondary)
}

impl ScriptedPeer {
    pub fn new(stream: TcpStream) -> Self {
        stream.set_nodelay(true).expect("nodelay");
        Self { stream }
    }

    pub fn send(&mut self, message: CheckpointMessage) {
        self.send_value(message.as_u64());
    }

    pub fn send_value(&mut self, value: u64) {
        self.stream
            .write_all(&value.to_be_bytes())
            .expect("peer write");
    }

    pub fn read_value(&mut self) -> io::Result<u64> {
        let mut raw = [0u8; 8];
        self.stream.read_exact(&mut raw)?;
        Ok(u64::from_be_bytes(raw))
    }

    pub fn read_command(&mut self) -> CheckpointMessage {
        let value = self.read_value().expect("peer read");
        CheckpointMessage::from_u64(value).unwrap_or_else(|| panic!("unknown command {value:#x}"))
    }

    pub fn expect(&mut self, expected: CheckpointMessage) {
        assert_eq!(self.read_command(), expected);
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.stream.set_read_timeout(timeout).expect("read timeout");
    }

    /// Consumes the simulated memory-stream preamble and returns its page count.
    pub fn read_preamble(&mut self) -> u64 {
        assert_eq!(self.read_value().expect("preamble magic"), STREAM_MAGIC);
        self.read_value().expect("preamble pages")
    }

    pub fn write_preamble(&mut self, page_count: u64) {
        self.send_value(STREAM_MAGIC);
        self.send_value(page_count);
    }

    /// Reads one simulated page stream.
    pub fn read_pages(&mut self) -> Vec<(u64, [u8; PAGE_SIZE])> {
        let count = self.read_value().expect("page count");
        (0..count)
            .map(|_| {
                let index = self.read_value().expect("page index");
                let mut page = [0u8; PAGE_SIZE];
                self.stream.read_exact(&mut page).expect("page bytes");
                (index, page)
            })
            .collect()
    }

    pub fn write_pages(&mut self, pages: &[(u64, u8)]) {
        self.send_value(pages.len() as u64);
        for (index, fill) in pages {
            self.send_value(*index);
            self.stream
                .write_all(&[*fill; PAGE_SIZE])
                .expect("page bytes");
        }
    }

    pub fn read_payload(&mut self) -> Vec<u8> {
        let len = self.read_value().expect("payload length");
        let mut payload = vec![0u8; len as usize];
        self.stream.read_exact(&mut payload).expect("payload bytes");
        payload
    }

    pub fn write_payload(&mut self, payload: &[u8]) {
        self.send_value(payload.len() as u64);
        self.stream.write_all(payload).expect("payload bytes");
    }

    /// Plays the secondary's half of one transaction after NEW was read.
    /// Returns the device-state payload.
    pub fn acknowledge_transaction(&mut self) -> Vec<u8> {
        self.send(CheckpointMessage::Suspended);
        self.expect(CheckpointMessage::Send);
        self.read_pages();
        let payload = self.read_payload();
        self.send(CheckpointMessage::Received);
        self.send(CheckpointMessage::Loaded);
        payload
    }

    /// True once the other end has closed or shut down the connection.
    pub fn at_eof(&mut self) -> bool {
        let mut byte = [0u8; 1];
        matches!(self.stream.read(&mut byte), Ok(0) | Err(_))
    }
}
