//! Complete inbound record with typed accessors.
//!
//! A [`Record`] is one parsed unit of the wire protocol: its header plus
//! the content bytes, padding already stripped. Content is held as
//! `bytes::Bytes` so dispatch can hand chunks to request bundles without
//! copying.

use bytes::Bytes;

use super::wire_format::{RecordHeader, RecordType};

/// A complete protocol record.
#[derive(Debug, Clone)]
pub struct Record {
    /// Decoded header.
    pub header: RecordHeader,
    /// Content bytes, padding excluded (zero-copy via `bytes::Bytes`).
    pub content: Bytes,
}

impl Record {
    /// Create a record from header and content.
    pub fn new(header: RecordHeader, content: Bytes) -> Self {
        Self { header, content }
    }

    /// Get a reference to the content bytes.
    #[inline]
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Get the request id.
    #[inline]
    pub fn request_id(&self) -> u16 {
        self.header.request_id
    }

    /// Typed record type, `None` for unrecognized type bytes.
    #[inline]
    pub fn kind(&self) -> Option<RecordType> {
        self.header.kind()
    }

    /// Check if this is a zero-length stream terminator.
    #[inline]
    pub fn is_terminator(&self) -> bool {
        self.content.is_empty()
    }

    /// Check if this record addresses the transport itself.
    #[inline]
    pub fn is_management(&self) -> bool {
        self.header.is_management()
    }
}

/// Build a complete padded record as a single byte vector.
///
/// Mostly useful in tests and scripted peers; the engines emit records
/// through the writer task instead.
pub fn build_record(record_type: RecordType, request_id: u16, content: &[u8]) -> Vec<u8> {
    let header = RecordHeader::new(record_type, request_id, content.len() as u16);
    let mut buf = Vec::with_capacity(header.record_len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(content);
    buf.resize(header.record_len(), 0);
    buf
}
