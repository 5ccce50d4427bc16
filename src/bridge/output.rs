//! Output bridge: the byte stream a handler writes its response to.
//!
//! Every write is framed into one or more STDOUT records on the owning
//! transport's writer task. There is no internal buffering: when `write`
//! returns, the full byte count has been framed and queued, which is what
//! keeps handler output strictly ahead of the END_REQUEST the dispatch
//! task emits after the handler finishes.

use bytes::Bytes;

use crate::error::Result;
use crate::protocol::RecordType;
use crate::writer::{OutboundRecord, WriterHandle};

/// Largest content span per stream record: a 16 KiB emit buffer minus the
/// header and up to 8 bytes of padding.
pub const STREAM_CHUNK_MAX: usize = 16368;

/// Writable byte stream handed to the request handler.
#[derive(Clone)]
pub struct RequestWriter {
    request_id: u16,
    writer: WriterHandle,
}

impl RequestWriter {
    pub(crate) fn new(request_id: u16, writer: WriterHandle) -> Self {
        Self { request_id, writer }
    }

    /// Get the request id this writer belongs to.
    #[inline]
    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    /// Frame `data` into STDOUT records.
    ///
    /// Success means the exact byte count was framed; partial writes do
    /// not happen. Empty writes are ignored; the stream terminator is
    /// emitted by the engine, not by handlers.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.write_stream(RecordType::Stdout, data).await
    }

    /// Frame a string into STDOUT records.
    pub async fn write_str(&self, data: &str) -> Result<()> {
        self.write(data.as_bytes()).await
    }

    /// Frame `data` into STDERR records.
    pub async fn write_err(&self, data: &[u8]) -> Result<()> {
        self.write_stream(RecordType::Stderr, data).await
    }

    async fn write_stream(&self, record_type: RecordType, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(STREAM_CHUNK_MAX) {
            let record =
                OutboundRecord::new(record_type, self.request_id, Bytes::copy_from_slice(chunk));
            self.writer.send(record).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Record, RecordBuffer};
    use crate::writer::spawn_writer_task_default;
    use tokio::io::{duplex, AsyncReadExt};

    async fn collect_records(
        mut server: tokio::io::DuplexStream,
        expected: usize,
    ) -> Vec<Record> {
        let mut parsed = RecordBuffer::new();
        let mut records = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        while records.len() < expected {
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream ended early");
            parsed.push(&buf[..n]);
            while let Some(record) = parsed.next_record().unwrap() {
                records.push(record);
            }
        }
        records
    }

    #[tokio::test]
    async fn test_small_write_is_one_record() {
        let (client, server) = duplex(64 * 1024);
        let (handle, _task) = spawn_writer_task_default(client);
        let writer = RequestWriter::new(7, handle);

        writer.write(b"hello").await.unwrap();

        let records = collect_records(server, 1).await;
        assert_eq!(records[0].kind(), Some(RecordType::Stdout));
        assert_eq!(records[0].request_id(), 7);
        assert_eq!(records[0].content(), b"hello");
    }

    #[tokio::test]
    async fn test_large_write_fragments_at_chunk_max() {
        let (client, server) = duplex(256 * 1024);
        let (handle, _task) = spawn_writer_task_default(client);
        let writer = RequestWriter::new(3, handle);

        let data = vec![0x5A; STREAM_CHUNK_MAX * 2 + 100];
        writer.write(&data).await.unwrap();

        let records = collect_records(server, 3).await;
        assert_eq!(records[0].content().len(), STREAM_CHUNK_MAX);
        assert_eq!(records[1].content().len(), STREAM_CHUNK_MAX);
        assert_eq!(records[2].content().len(), 100);

        let total: Vec<u8> = records
            .iter()
            .flat_map(|r| r.content().to_vec())
            .collect();
        assert_eq!(total, data);
    }

    #[tokio::test]
    async fn test_empty_write_emits_nothing() {
        let (client, server) = duplex(4096);
        let (handle, task) = spawn_writer_task_default(client);
        let writer = RequestWriter::new(1, handle);

        writer.write(b"").await.unwrap();
        drop(writer);
        task.abort();

        let mut wire = Vec::new();
        let mut server = server;
        server.read_to_end(&mut wire).await.unwrap();
        assert!(wire.is_empty());
    }

    #[tokio::test]
    async fn test_write_err_uses_stderr_records() {
        let (client, server) = duplex(4096);
        let (handle, _task) = spawn_writer_task_default(client);
        let writer = RequestWriter::new(9, handle);

        writer.write_err(b"oops").await.unwrap();

        let records = collect_records(server, 1).await;
        assert_eq!(records[0].kind(), Some(RecordType::Stderr));
        assert_eq!(records[0].content(), b"oops");
    }

    #[test]
    fn test_chunk_max_leaves_room_for_header_and_padding() {
        assert!(STREAM_CHUNK_MAX + crate::protocol::HEADER_SIZE + 8 <= 16384);
        // A full chunk is already 8-aligned and needs no padding.
        assert_eq!(crate::protocol::pad(STREAM_CHUNK_MAX), 0);
    }
}
