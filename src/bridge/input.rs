//! Input bridge: the byte stream a handler reads its request body from.
//!
//! The dispatch task pushes owned STDIN chunks into an unbounded channel
//! and never blocks; the handler task awaits on the other end. Closing the
//! sender marks end-of-stream, so the STDIN terminator is simply "drop the
//! sender"; the channel doubles as the wake-up signal for a reader parked
//! on an empty queue.

use bytes::Bytes;
use tokio::sync::mpsc;

/// Producer half, owned by the connection dispatch task.
pub(crate) struct BodyFeed {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl BodyFeed {
    /// Queue one owned chunk for the handler.
    ///
    /// Never blocks. A handler that already dropped its reader simply
    /// discards the chunk.
    pub(crate) fn push(&self, chunk: Bytes) {
        let _ = self.tx.send(chunk);
    }
}

/// Readable byte stream handed to the request handler.
pub struct BodyReader {
    rx: mpsc::UnboundedReceiver<Bytes>,
    current: Bytes,
    eof: bool,
}

/// Create a connected feed/reader pair for one request.
pub(crate) fn body_channel() -> (BodyFeed, BodyReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        BodyFeed { tx },
        BodyReader {
            rx,
            current: Bytes::new(),
            eof: false,
        },
    )
}

impl BodyReader {
    /// Read up to `buf.len()` bytes into `buf`.
    ///
    /// Waits while the queue is empty and end-of-stream has not been
    /// reached. Returns the number of bytes copied; `0` means end of
    /// stream (and only that; empty reads are never returned early).
    pub async fn read(&mut self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        if !self.fill_current().await {
            return 0;
        }

        let n = self.current.len().min(buf.len());
        buf[..n].copy_from_slice(&self.current.split_to(n));
        n
    }

    /// Take the next queued chunk whole, `None` at end of stream.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        if !self.fill_current().await {
            return None;
        }
        Some(std::mem::take(&mut self.current))
    }

    /// Read the entire remaining body into one buffer.
    pub async fn read_to_end(&mut self) -> Vec<u8> {
        let mut body = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            body.extend_from_slice(&chunk);
        }
        body
    }

    /// Ensure `current` is non-empty; false once the stream is drained.
    async fn fill_current(&mut self) -> bool {
        while self.current.is_empty() {
            if self.eof {
                return false;
            }
            match self.rx.recv().await {
                // Zero-length pushes are skipped by the loop condition.
                Some(chunk) => self.current = chunk,
                None => {
                    self.eof = true;
                    return false;
                }
            }
        }
        true
    }
}
