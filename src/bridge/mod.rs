//! I/O bridges between request handlers and the transport.
//!
//! A server request hands its handler two byte streams: a [`RequestWriter`]
//! that frames writes into STDOUT/STDERR records, and a [`BodyReader`] fed
//! from buffered STDIN records by the dispatch task.

mod input;
mod output;

pub(crate) use input::{body_channel, BodyFeed};
pub use input::BodyReader;
pub use output::{RequestWriter, STREAM_CHUNK_MAX};
