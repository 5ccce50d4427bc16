//! Record header and fixed-body wire format.
//!
//! Implements the 8-byte FastCGI record header:
//! ```text
//! ┌─────────┬───────┬──────────┬───────────────┬─────────┬──────────┐
//! │ Version │ Type  │ Req ID   │ Content Len   │ Padding │ Reserved │
//! │ 1 byte  │ 1 byte│ 2 bytes  │ 2 bytes       │ 1 byte  │ 1 byte   │
//! │         │       │ u16 BE   │ u16 BE        │         │          │
//! └─────────┴───────┴──────────┴───────────────┴─────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian. Every record's content is padded
//! with zero bytes up to the next 8-byte multiple; the padding length is
//! declared in the header and stripped by the parser.

use crate::error::{FcgiError, Result};

/// Record header size in bytes (fixed, exactly 8).
pub const HEADER_SIZE: usize = 8;

/// The only protocol version this engine speaks.
pub const FCGI_VERSION: u8 = 1;

/// Maximum content bytes a single record can declare (u16 field).
pub const MAX_CONTENT_LEN: usize = 0xFFFF;

/// Request id 0 addresses the transport itself (management records).
pub const MANAGEMENT_REQUEST_ID: u16 = 0;

/// Highest request id handed out before wrapping back to 1.
pub const MAX_REQUEST_ID: u16 = 65530;

/// BEGIN_REQUEST flag: the peer wants the transport kept open after
/// END_REQUEST.
pub const FLAG_KEEP_CONN: u8 = 1;

/// Variable names for GET_VALUES / GET_VALUES_RESULT records.
pub const FCGI_MAX_CONNS: &str = "FCGI_MAX_CONNS";
pub const FCGI_MAX_REQS: &str = "FCGI_MAX_REQS";
pub const FCGI_MPXS_CONNS: &str = "FCGI_MPXS_CONNS";

/// Alignment padding for a record with `content_len` content bytes.
#[inline]
pub fn pad(content_len: usize) -> u8 {
    ((8 - (content_len % 8)) % 8) as u8
}

/// The eleven record types of the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

impl RecordType {
    /// Map a raw type byte to a known record type.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::BeginRequest),
            2 => Some(Self::AbortRequest),
            3 => Some(Self::EndRequest),
            4 => Some(Self::Params),
            5 => Some(Self::Stdin),
            6 => Some(Self::Stdout),
            7 => Some(Self::Stderr),
            8 => Some(Self::Data),
            9 => Some(Self::GetValues),
            10 => Some(Self::GetValuesResult),
            11 => Some(Self::UnknownType),
            _ => None,
        }
    }
}

/// The application role requested by BEGIN_REQUEST.
///
/// Only Responder is differentiated; the server handles every role the
/// same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Role {
    Responder = 1,
    Authorizer = 2,
    Filter = 3,
}

impl Role {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Responder),
            2 => Some(Self::Authorizer),
            3 => Some(Self::Filter),
            _ => None,
        }
    }
}

/// Protocol status carried by END_REQUEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolStatus {
    RequestComplete = 0,
    CantMpxConn = 1,
    Overloaded = 2,
    UnknownRole = 3,
}

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Protocol version (always 1 on records this engine emits).
    pub version: u8,
    /// Raw record type byte. Unknown values are kept visible so the
    /// engines can log them instead of failing the whole parse.
    pub record_type: u8,
    /// Request identifier (0 = management record).
    pub request_id: u16,
    /// Content length in bytes, padding excluded.
    pub content_length: u16,
    /// Zero bytes following the content.
    pub padding_length: u8,
}

impl RecordHeader {
    /// Create a header for an outbound record, computing the alignment
    /// padding from the content length.
    pub fn new(record_type: RecordType, request_id: u16, content_length: u16) -> Self {
        Self {
            version: FCGI_VERSION,
            record_type: record_type as u8,
            request_id,
            content_length,
            padding_length: pad(content_length as usize),
        }
    }

    /// Encode the header to its 8-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.version;
        buf[1] = self.record_type;
        buf[2..4].copy_from_slice(&self.request_id.to_be_bytes());
        buf[4..6].copy_from_slice(&self.content_length.to_be_bytes());
        buf[6] = self.padding_length;
        buf
    }

    /// Decode a header from bytes.
    ///
    /// # Errors
    ///
    /// `TruncatedFrame` if fewer than 8 bytes are available,
    /// `MalformedFrame` if the version byte is not 1.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(FcgiError::TruncatedFrame);
        }
        if buf[0] != FCGI_VERSION {
            return Err(FcgiError::MalformedFrame(buf[0]));
        }
        Ok(Self {
            version: buf[0],
            record_type: buf[1],
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
        })
    }

    /// Typed view of the raw type byte.
    #[inline]
    pub fn kind(&self) -> Option<RecordType> {
        RecordType::from_u8(self.record_type)
    }

    /// Check if this record addresses the transport rather than a request.
    #[inline]
    pub fn is_management(&self) -> bool {
        self.request_id == MANAGEMENT_REQUEST_ID
    }

    /// Total wire size of the record this header describes.
    #[inline]
    pub fn record_len(&self) -> usize {
        HEADER_SIZE + self.content_length as usize + self.padding_length as usize
    }
}

/// Body of a BEGIN_REQUEST record (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequestBody {
    /// Raw role field; see [`Role`].
    pub role: u16,
    /// Flag bits, currently only [`FLAG_KEEP_CONN`].
    pub flags: u8,
}

impl BeginRequestBody {
    pub fn new(role: Role, flags: u8) -> Self {
        Self {
            role: role as u16,
            flags,
        }
    }

    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..2].copy_from_slice(&self.role.to_be_bytes());
        buf[2] = self.flags;
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(FcgiError::TruncatedFrame);
        }
        Ok(Self {
            role: u16::from_be_bytes([buf[0], buf[1]]),
            flags: buf[2],
        })
    }

    #[inline]
    pub fn keep_conn(&self) -> bool {
        self.flags & FLAG_KEEP_CONN != 0
    }
}

/// Body of an END_REQUEST record (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequestBody {
    pub app_status: u32,
    /// Raw protocol status; see [`ProtocolStatus`].
    pub protocol_status: u8,
}

impl EndRequestBody {
    pub fn new(app_status: u32, protocol_status: ProtocolStatus) -> Self {
        Self {
            app_status,
            protocol_status: protocol_status as u8,
        }
    }

    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&self.app_status.to_be_bytes());
        buf[4] = self.protocol_status;
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(FcgiError::TruncatedFrame);
        }
        Ok(Self {
            app_status: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            protocol_status: buf[4],
        })
    }
}

/// Body of an UNKNOWN_TYPE management reply (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownTypeBody {
    /// The type byte the receiver did not recognize.
    pub record_type: u8,
}

impl UnknownTypeBody {
    pub fn new(record_type: u8) -> Self {
        Self { record_type }
    }

    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0] = self.record_type;
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(FcgiError::TruncatedFrame);
        }
        Ok(Self {
            record_type: buf[0],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = RecordHeader::new(RecordType::Stdout, 42, 100);
        let encoded = original.encode();
        let decoded = RecordHeader::decode(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_big_endian_byte_order() {
        let header = RecordHeader::new(RecordType::Params, 0x0102, 0x0304);
        let bytes = header.encode();

        assert_eq!(bytes[0], 1); // version
        assert_eq!(bytes[1], 4); // PARAMS

        // Request ID: 0x0102 in BE
        assert_eq!(bytes[2], 0x01);
        assert_eq!(bytes[3], 0x02);

        // Content length: 0x0304 in BE
        assert_eq!(bytes[4], 0x03);
        assert_eq!(bytes[5], 0x04);

        // 0x0304 = 772 bytes -> 4 bytes of padding
        assert_eq!(bytes[6], 4);
        assert_eq!(bytes[7], 0); // reserved
    }

    #[test]
    fn test_header_size_is_exactly_8() {
        assert_eq!(HEADER_SIZE, 8);
        let header = RecordHeader::new(RecordType::Stdin, 1, 0);
        assert_eq!(header.encode().len(), 8);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0u8; 7]; // One byte short
        assert!(matches!(
            RecordHeader::decode(&buf),
            Err(FcgiError::TruncatedFrame)
        ));
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let mut buf = RecordHeader::new(RecordType::Stdout, 1, 0).encode();
        buf[0] = 2;
        assert!(matches!(
            RecordHeader::decode(&buf),
            Err(FcgiError::MalformedFrame(2))
        ));
    }

    #[test]
    fn test_padding_table() {
        let expected = [0u8, 7, 6, 5, 4, 3, 2, 1, 0, 7];
        for (n, want) in expected.iter().enumerate() {
            assert_eq!(pad(n), *want, "pad({})", n);
        }
        assert_eq!(pad(16368), 0);
        assert_eq!(pad(16300), 4);
    }

    #[test]
    fn test_record_len_includes_padding() {
        let header = RecordHeader::new(RecordType::Stdout, 1, 5);
        assert_eq!(header.padding_length, 3);
        assert_eq!(header.record_len(), 8 + 5 + 3);
        assert_eq!(header.record_len() % 8, 0);
    }

    #[test]
    fn test_record_type_from_u8() {
        assert_eq!(RecordType::from_u8(1), Some(RecordType::BeginRequest));
        assert_eq!(RecordType::from_u8(11), Some(RecordType::UnknownType));
        assert_eq!(RecordType::from_u8(0), None);
        assert_eq!(RecordType::from_u8(12), None);
    }

    #[test]
    fn test_begin_request_body_roundtrip() {
        let body = BeginRequestBody::new(Role::Responder, FLAG_KEEP_CONN);
        let bytes = body.encode();
        assert_eq!(bytes, [0, 1, 1, 0, 0, 0, 0, 0]);

        let decoded = BeginRequestBody::decode(&bytes).unwrap();
        assert_eq!(decoded, body);
        assert!(decoded.keep_conn());
        assert_eq!(Role::from_u16(decoded.role), Some(Role::Responder));
    }

    #[test]
    fn test_begin_request_body_keep_conn_unset() {
        let body = BeginRequestBody::new(Role::Filter, 0);
        assert!(!BeginRequestBody::decode(&body.encode()).unwrap().keep_conn());
    }

    #[test]
    fn test_end_request_body_roundtrip() {
        let body = EndRequestBody::new(0xDEADBEEF, ProtocolStatus::RequestComplete);
        let bytes = body.encode();
        assert_eq!(&bytes[0..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(bytes[4], 0);

        let decoded = EndRequestBody::decode(&bytes).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn test_unknown_type_body_roundtrip() {
        let body = UnknownTypeBody::new(42);
        let decoded = UnknownTypeBody::decode(&body.encode()).unwrap();
        assert_eq!(decoded.record_type, 42);
    }

    #[test]
    fn test_body_decode_too_short() {
        assert!(BeginRequestBody::decode(&[0; 7]).is_err());
        assert!(EndRequestBody::decode(&[0; 7]).is_err());
        assert!(UnknownTypeBody::decode(&[0; 7]).is_err());
    }

    #[test]
    fn test_management_record_detection() {
        assert!(RecordHeader::new(RecordType::GetValues, 0, 0).is_management());
        assert!(!RecordHeader::new(RecordType::Stdin, 7, 0).is_management());
    }
}
