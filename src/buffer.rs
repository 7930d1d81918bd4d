use std::io::{self, Cursor, Read, Write};

/// Staging area for one device-state snapshot.
///
/// Written once and then read once per transaction; `reset` drops the previous
/// content at the start of the next one.
#[derive(Debug, Default)]
pub struct CheckpointBuffer {
    bytes: Vec<u8>,
}

impl CheckpointBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
        }
    }

    pub fn reset(&mut self) {
        self.bytes.clear();
    }

    /// Sequential sink appending to the staged snapshot.
    pub fn open_write(&mut self) -> BufferWriter<'_> {
        BufferWriter {
            bytes: &mut self.bytes,
        }
    }

    /// Replays the staged bytes from the start.
    pub fn open_read(&self) -> Cursor<&[u8]> {
        Cursor::new(self.bytes.as_slice())
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Replaces the content with exactly `len` bytes drawn from `source`.
    /// A short stream is reported as `UnexpectedEof` and leaves the buffer empty.
    pub fn fill_from(&mut self, source: &mut dyn Read, len: u64) -> io::Result<()> {
        self.reset();
        let copied = source.take(len).read_to_end(&mut self.bytes)? as u64;
        if copied != len {
            self.reset();
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("device state truncated: expected {len} bytes, received {copied}"),
            ));
        }
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.bytes.capacity()
    }

    pub fn release(&mut self) {
        self.bytes = Vec::new();
    }
}

pub struct BufferWriter<'a> {
    bytes: &'a mut Vec<u8>,
}

impl Write for BufferWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_replays_bytes() {
        let mut buffer = CheckpointBuffer::with_capacity(16);
        {
            let mut sink = buffer.open_write();
            sink.write_all(b"device").unwrap();
            sink.write_all(b"-state").unwrap();
        }
        assert_eq!(buffer.len(), 12);
        let mut replay = String::new();
        buffer.open_read().read_to_string(&mut replay).unwrap();
        assert_eq!(replay, "device-state");
    }

    #[test]
    fn reset_discards_previous_snapshot() {
        let mut buffer = CheckpointBuffer::default();
        buffer.open_write().write_all(&[1, 2, 3]).unwrap();
        buffer.reset();
        assert!(buffer.is_empty());
        buffer.open_write().write_all(&[9]).unwrap();
        assert_eq!(buffer.as_bytes(), &[9]);
    }

    #[test]
    fn fill_from_reads_exact_length() {
        let mut buffer = CheckpointBuffer::default();
        let mut source = Cursor::new(vec![7u8; 10]);
        buffer.fill_from(&mut source, 6).unwrap();
        assert_eq!(buffer.len(), 6);
        assert_eq!(source.position(), 6);
    }

    #[test]
    fn fill_from_rejects_short_stream() {
        let mut buffer = CheckpointBuffer::default();
        let mut source = Cursor::new(vec![7u8; 3]);
        let err = buffer.fill_from(&mut source, 8).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(buffer.is_empty());
    }
}
