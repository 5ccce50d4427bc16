//! Dedicated writer task for outbound records.
//!
//! Every transport gets one writer task fed through an mpsc channel. This
//! keeps the emit side free of lock contention, guarantees that records are
//! written in send order, and lets several records be flushed in a single
//! `write_vectored` syscall.
//!
//! # Architecture
//!
//! ```text
//! dispatch task ──┐
//! handler task 1 ─┼─► mpsc::Sender<OutboundRecord> ─► writer task ─► transport
//! handler task N ─┘
//! ```
//!
//! The send-order guarantee is what the engines rely on for the "all
//! handler output reaches the peer before END_REQUEST" invariant: the
//! finalization records go through the same handle as the handler's
//! stream records.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{FcgiError, Result};
use crate::protocol::{
    BeginRequestBody, EndRequestBody, ProtocolStatus, RecordHeader, RecordType, Role,
    UnknownTypeBody, FLAG_KEEP_CONN, HEADER_SIZE,
};

/// Default maximum pending records before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_RECORDS: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum records to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Shared source of alignment padding bytes; a record needs at most 7.
static ZERO_PAD: [u8; 8] = [0u8; 8];

/// A record ready to be written to the transport.
#[derive(Debug)]
pub struct OutboundRecord {
    /// Pre-encoded header (8 bytes), padding length already set.
    header: [u8; HEADER_SIZE],
    /// Content bytes (empty for stream terminators).
    content: Bytes,
    /// Alignment padding after the content (0..=7).
    padding: u8,
}

impl OutboundRecord {
    /// Create an outbound record for the given content.
    ///
    /// The content must fit a single record (≤ 65 535 bytes); the engines
    /// fragment longer streams before reaching this point.
    pub fn new(record_type: RecordType, request_id: u16, content: Bytes) -> Self {
        debug_assert!(content.len() <= crate::protocol::MAX_CONTENT_LEN);
        let header = RecordHeader::new(record_type, request_id, content.len() as u16);
        Self {
            header: header.encode(),
            content,
            padding: header.padding_length,
        }
    }

    /// Zero-length record terminating a PARAMS/STDIN/STDOUT stream.
    pub fn terminator(record_type: RecordType, request_id: u16) -> Self {
        Self::new(record_type, request_id, Bytes::new())
    }

    /// BEGIN_REQUEST record.
    pub fn begin_request(request_id: u16, role: Role, keep_conn: bool) -> Self {
        let flags = if keep_conn { FLAG_KEEP_CONN } else { 0 };
        let body = BeginRequestBody::new(role, flags).encode();
        Self::new(
            RecordType::BeginRequest,
            request_id,
            Bytes::copy_from_slice(&body),
        )
    }

    /// ABORT_REQUEST record (empty body).
    pub fn abort_request(request_id: u16) -> Self {
        Self::terminator(RecordType::AbortRequest, request_id)
    }

    /// END_REQUEST record.
    pub fn end_request(request_id: u16, app_status: u32, status: ProtocolStatus) -> Self {
        let body = EndRequestBody::new(app_status, status).encode();
        Self::new(
            RecordType::EndRequest,
            request_id,
            Bytes::copy_from_slice(&body),
        )
    }

    /// UNKNOWN_TYPE management reply.
    pub fn unknown_type(record_type: u8) -> Self {
        let body = UnknownTypeBody::new(record_type).encode();
        Self::new(RecordType::UnknownType, 0, Bytes::copy_from_slice(&body))
    }

    /// Total wire size of this record (header + content + padding).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.content.len() + self.padding as usize
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending records before backpressure kicks in.
    pub max_pending_records: usize,
    /// Channel capacity for the record queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_records: DEFAULT_MAX_PENDING_RECORDS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending records to the writer task.
///
/// Cheaply cloneable; shared by the dispatch task and every handler task
/// on the same transport.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundRecord>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    /// Send a record to the writer task.
    ///
    /// Waits if backpressure is active, timing out after the configured
    /// duration.
    pub async fn send(&self, record: OutboundRecord) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(record).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            FcgiError::ConnectionClosed
        })
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let check_interval = Duration::from_micros(100);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FcgiError::BackpressureTimeout);
            }
            tokio::time::sleep(check_interval).await;
        }
    }

    /// Get current pending record count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Spawn the writer task and return a handle for sending records.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
        max_pending: config.max_pending_records,
        timeout: config.backpressure_timeout,
    };

    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

/// Spawn the writer task with default configuration.
pub fn spawn_writer_task_default<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    spawn_writer_task(writer, WriterConfig::default())
}

/// Main writer loop - receives records and writes them to the transport.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundRecord>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(r) => r,
            None => return Ok(()), // All handles dropped, clean shutdown.
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(record) => batch.push(record),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        write_batch(&mut writer, &batch).await?;

        pending.fetch_sub(batch_size, Ordering::Release);
    }
}

/// Write a batch of records using scatter/gather I/O.
///
/// Each record contributes up to three slices: header, content, padding.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundRecord]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(batch.len() * 3);
    for record in batch {
        slices.push(IoSlice::new(&record.header));
        if !record.content.is_empty() {
            slices.push(IoSlice::new(&record.content));
        }
        if record.padding > 0 {
            slices.push(IoSlice::new(&ZERO_PAD[..record.padding as usize]));
        }
    }

    let total_size: usize = batch.iter().map(|r| r.size()).sum();

    let written = writer.write_vectored(&slices).await?;
    if written == total_size {
        writer.flush().await?;
        return Ok(());
    }
    if written == 0 {
        return Err(FcgiError::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "write_vectored returned 0",
        )));
    }

    // Partial write: rebuild slices for the remaining bytes and continue.
    let mut total_written = written;
    while total_written < total_size {
        let remaining_slices = build_remaining_slices(batch, total_written);
        if remaining_slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&remaining_slices).await?;
        if written == 0 {
            return Err(FcgiError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build the IoSlice array for the bytes after a partial write.
fn build_remaining_slices(batch: &[OutboundRecord], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 3);
    let mut skipped = 0;

    for record in batch {
        let segments: [&[u8]; 3] = [
            &record.header,
            &record.content,
            &ZERO_PAD[..record.padding as usize],
        ];

        for segment in segments {
            if segment.is_empty() {
                continue;
            }
            let start = skipped;
            let end = skipped + segment.len();
            if skip_bytes < end {
                let offset = skip_bytes.saturating_sub(start);
                slices.push(IoSlice::new(&segment[offset..]));
            }
            skipped = end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_record, RecordBuffer};
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    #[test]
    fn test_outbound_record_sizes() {
        let record = OutboundRecord::new(RecordType::Stdout, 42, Bytes::from_static(b"hello"));
        assert_eq!(record.padding, 3);
        assert_eq!(record.size(), 8 + 5 + 3);

        let terminator = OutboundRecord::terminator(RecordType::Stdin, 42);
        assert_eq!(terminator.size(), 8);
        assert_eq!(terminator.padding, 0);
    }

    #[test]
    fn test_fixed_body_records_need_no_padding() {
        assert_eq!(OutboundRecord::begin_request(1, Role::Responder, true).size(), 16);
        assert_eq!(
            OutboundRecord::end_request(1, 0, ProtocolStatus::RequestComplete).size(),
            16
        );
        assert_eq!(OutboundRecord::unknown_type(9).size(), 16);
        assert_eq!(OutboundRecord::abort_request(1).size(), 8);
    }

    #[tokio::test]
    async fn test_writer_emits_parseable_records() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task_default(client);

        handle
            .send(OutboundRecord::new(
                RecordType::Stdout,
                42,
                Bytes::from_static(b"hello"),
            ))
            .await
            .unwrap();
        handle
            .send(OutboundRecord::terminator(RecordType::Stdout, 42))
            .await
            .unwrap();

        let mut buf = vec![0u8; 64];
        let mut parsed = RecordBuffer::new();
        let mut records = Vec::new();
        while records.len() < 2 {
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0);
            parsed.push(&buf[..n]);
            while let Some(record) = parsed.next_record().unwrap() {
                records.push(record);
            }
        }

        assert_eq!(records[0].content(), b"hello");
        assert_eq!(records[0].request_id(), 42);
        assert!(records[1].is_terminator());
    }

    #[tokio::test]
    async fn test_writer_preserves_send_order() {
        let (client, mut server) = duplex(64 * 1024);
        let (handle, _task) = spawn_writer_task_default(client);

        for i in 0..20u16 {
            let content = Bytes::copy_from_slice(format!("chunk-{}", i).as_bytes());
            handle
                .send(OutboundRecord::new(RecordType::Stdout, i + 1, content))
                .await
                .unwrap();
        }
        drop(handle);

        let mut wire = Vec::new();
        server.read_to_end(&mut wire).await.unwrap();

        let mut parsed = RecordBuffer::new();
        parsed.push(&wire);
        for i in 0..20u16 {
            let record = parsed.next_record().unwrap().unwrap();
            assert_eq!(record.request_id(), i + 1);
            assert_eq!(record.content(), format!("chunk-{}", i).as_bytes());
        }
    }

    #[tokio::test]
    async fn test_write_batch_matches_build_record() {
        let mut buf = Cursor::new(Vec::new());
        let batch = vec![
            OutboundRecord::new(RecordType::Params, 3, Bytes::from_static(b"abc")),
            OutboundRecord::terminator(RecordType::Params, 3),
        ];

        write_batch(&mut buf, &batch).await.unwrap();

        let mut expected = build_record(RecordType::Params, 3, b"abc");
        expected.extend_from_slice(&build_record(RecordType::Params, 3, b""));
        assert_eq!(buf.into_inner(), expected);
    }

    #[test]
    fn test_build_remaining_slices_no_skip() {
        let batch = vec![OutboundRecord::new(
            RecordType::Stdout,
            1,
            Bytes::from_static(b"hello"),
        )];
        let slices = build_remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 3); // header + content + padding
        assert_eq!(slices.iter().map(|s| s.len()).sum::<usize>(), 16);
    }

    #[test]
    fn test_build_remaining_slices_partial_header() {
        let batch = vec![OutboundRecord::new(
            RecordType::Stdout,
            1,
            Bytes::from_static(b"hello"),
        )];
        let slices = build_remaining_slices(&batch, 5);
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0].len(), HEADER_SIZE - 5);
        assert_eq!(slices[1].len(), 5);
        assert_eq!(slices[2].len(), 3);
    }

    #[test]
    fn test_build_remaining_slices_into_padding() {
        let batch = vec![OutboundRecord::new(
            RecordType::Stdout,
            1,
            Bytes::from_static(b"hello"),
        )];
        // Skip header + content + 1 padding byte.
        let slices = build_remaining_slices(&batch, HEADER_SIZE + 5 + 1);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), 2);
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task_default(client);

        assert_eq!(handle.pending_count(), 0);
        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_send_after_writer_gone() {
        let (client, server) = duplex(4096);
        let (handle, task) = spawn_writer_task_default(client);

        // Drop the read side and push until the writer task dies.
        drop(server);
        handle
            .send(OutboundRecord::terminator(RecordType::Stdout, 1))
            .await
            .ok();
        let _ = task.await;

        let result = handle
            .send(OutboundRecord::terminator(RecordType::Stdout, 1))
            .await;
        assert!(matches!(result, Err(FcgiError::ConnectionClosed)));
    }
}
