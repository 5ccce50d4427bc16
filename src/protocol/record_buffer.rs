//! Record buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management. Implements a
//! state machine for handling fragmented records:
//! - `WaitingForHeader`: need at least 8 bytes
//! - `WaitingForContent`: header parsed, need content + declared padding
//!
//! Bytes left over after a parse pass stay in the buffer and are carried
//! into the next push, so callers can feed reads of any size, split at any
//! byte offset.

use bytes::{Bytes, BytesMut};

use super::record::Record;
use super::wire_format::{RecordHeader, HEADER_SIZE};
use crate::error::Result;

/// State machine for record parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for a complete header (need 8 bytes).
    WaitingForHeader,
    /// Header parsed, waiting for content plus padding bytes.
    WaitingForContent { header: RecordHeader },
}

/// Buffer for accumulating inbound bytes and extracting complete records.
pub struct RecordBuffer {
    /// Accumulated bytes from transport reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
}

impl RecordBuffer {
    /// Create a new record buffer.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
            state: State::WaitingForHeader,
        }
    }

    /// Append transport bytes without extracting records.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to extract the next complete record.
    ///
    /// Returns:
    /// - `Ok(Some(record))` if a complete record was extracted
    /// - `Ok(None)` if more data is needed (partial bytes stay buffered)
    /// - `Err(MalformedFrame)` if the next header carries a bad version;
    ///   the offending bytes are left in place and the transport should be
    ///   closed
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            match &self.state {
                State::WaitingForHeader => {
                    if self.buffer.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    // Peek the header; version errors propagate before any
                    // bytes are consumed.
                    let header = RecordHeader::decode(&self.buffer[..HEADER_SIZE])?;
                    let _ = self.buffer.split_to(HEADER_SIZE);
                    self.state = State::WaitingForContent { header };
                }

                State::WaitingForContent { header } => {
                    let content_len = header.content_length as usize;
                    let padded_len = content_len + header.padding_length as usize;

                    if self.buffer.len() < padded_len {
                        return Ok(None);
                    }

                    let content: Bytes = self.buffer.split_to(content_len).freeze();
                    // Discard the declared padding, even when zero.
                    let _ = self.buffer.split_to(padded_len - content_len);

                    let header = *header;
                    self.state = State::WaitingForHeader;
                    return Ok(Some(Record::new(header, content)));
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for RecordBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FcgiError;
    use crate::protocol::record::build_record;
    use crate::protocol::wire_format::RecordType;

    fn drain(buffer: &mut RecordBuffer) -> Vec<Record> {
        let mut records = Vec::new();
        while let Some(record) = buffer.next_record().unwrap() {
            records.push(record);
        }
        records
    }

    #[test]
    fn test_single_complete_record() {
        let mut buffer = RecordBuffer::new();
        buffer.push(&build_record(RecordType::Stdout, 42, b"hello"));

        let records = drain(&mut buffer);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].request_id(), 42);
        assert_eq!(records[0].content(), b"hello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_padding_is_consumed() {
        let mut buffer = RecordBuffer::new();
        // 5 content bytes -> 3 padding bytes; followed by a second record.
        buffer.push(&build_record(RecordType::Stdout, 1, b"hello"));
        buffer.push(&build_record(RecordType::Stderr, 2, b"again"));

        let records = drain(&mut buffer);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].content(), b"hello");
        assert_eq!(records[1].kind(), Some(RecordType::Stderr));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_zero_padding_record() {
        // 8 content bytes -> no padding.
        let mut buffer = RecordBuffer::new();
        buffer.push(&build_record(RecordType::Stdin, 1, b"12345678"));
        let records = drain(&mut buffer);
        assert_eq!(records[0].content(), b"12345678");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_empty_content_record() {
        let mut buffer = RecordBuffer::new();
        buffer.push(&build_record(RecordType::Stdin, 9, b""));
        let records = drain(&mut buffer);
        assert_eq!(records.len(), 1);
        assert!(records[0].is_terminator());
    }

    #[test]
    fn test_fragmented_at_every_offset() {
        let mut wire = build_record(RecordType::Params, 3, b"some params data");
        wire.extend_from_slice(&build_record(RecordType::Stdin, 3, b"body"));

        for split in 0..=wire.len() {
            let mut buffer = RecordBuffer::new();
            buffer.push(&wire[..split]);
            let mut records = drain(&mut buffer);
            buffer.push(&wire[split..]);
            records.extend(drain(&mut buffer));

            assert_eq!(records.len(), 2, "split at {}", split);
            assert_eq!(records[0].content(), b"some params data");
            assert_eq!(records[1].content(), b"body");
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let wire = build_record(RecordType::Stdout, 1, b"hi");
        let mut buffer = RecordBuffer::new();
        let mut records = Vec::new();

        for byte in &wire {
            buffer.push(&[*byte]);
            while let Some(record) = buffer.next_record().unwrap() {
                records.push(record);
            }
        }

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content(), b"hi");
    }

    #[test]
    fn test_bad_version_is_an_error() {
        let mut wire = build_record(RecordType::Stdout, 1, b"x");
        wire[0] = 2;

        let mut buffer = RecordBuffer::new();
        buffer.push(&wire);
        assert!(matches!(
            buffer.next_record(),
            Err(FcgiError::MalformedFrame(2))
        ));
    }

    #[test]
    fn test_partial_header_then_bad_version() {
        let mut wire = build_record(RecordType::Stdout, 1, b"x");
        wire[0] = 7;

        let mut buffer = RecordBuffer::new();
        buffer.push(&wire[..4]);
        assert!(buffer.next_record().unwrap().is_none());
        buffer.push(&wire[4..]);
        assert!(buffer.next_record().is_err());
    }

    #[test]
    fn test_lazy_extraction_leaves_rest_buffered() {
        let mut buffer = RecordBuffer::new();
        buffer.push(&build_record(RecordType::Stdout, 1, b"first"));
        buffer.push(&build_record(RecordType::Stdout, 1, b"second"));

        let first = buffer.next_record().unwrap().unwrap();
        assert_eq!(first.content(), b"first");
        assert!(!buffer.is_empty());

        let second = buffer.next_record().unwrap().unwrap();
        assert_eq!(second.content(), b"second");
        assert!(buffer.is_empty());
    }
}
