//! Protocol module - wire format, name-value pairs, and record framing.
//!
//! This module implements the binary record protocol shared by both peers:
//! - 8-byte header encoding/decoding and the fixed 8-byte record bodies
//! - the two-size name-value pair codec
//! - a record buffer for accumulating partial reads

mod nv;
mod record;
mod record_buffer;
mod wire_format;

pub use nv::{encode_nv, encoded_nv_len, NvReader};
pub use record::{build_record, Record};
pub use record_buffer::RecordBuffer;
pub use wire_format::{
    pad, BeginRequestBody, EndRequestBody, ProtocolStatus, RecordHeader, RecordType, Role,
    UnknownTypeBody, FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS, FCGI_VERSION, FLAG_KEEP_CONN,
    HEADER_SIZE, MANAGEMENT_REQUEST_ID, MAX_CONTENT_LEN, MAX_REQUEST_ID,
};
