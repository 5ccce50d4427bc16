//! Web-server-side engine.
//!
//! [`FcgiClient`] multiplexes dynamic requests onto one persistent
//! transport to an application. Connecting runs a short capability probe
//! (GET_VALUES on a throwaway transport, 500 ms budget) and then opens the
//! transport real traffic flows over. Each request is identified by a
//! 16-bit id; inbound STDOUT is routed to the request's output callback,
//! STDERR is buffered until END_REQUEST, and completion is reported
//! exclusively through the request's [`CompletionFlag`]: on END_REQUEST,
//! on transport close, or on death of the supervised child process.
//!
//! # Example
//!
//! ```ignore
//! use fcgiwire::{CompletionFlag, FcgiClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = FcgiClient::new();
//!     client.connect("127.0.0.1", 9000).await?;
//!
//!     let done = CompletionFlag::new();
//!     let params = vec![("REQUEST_METHOD".into(), "POST".into())];
//!     let id = client
//!         .send_request(&params, |_id, bytes| print!("{}", String::from_utf8_lossy(bytes)), done.clone())
//!         .await;
//!     client.send_request_data(id, b"hello").await;
//!     client.send_request_data(id, b"").await;
//!     done.wait().await;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{tcp::OwnedReadHalf, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{FcgiError, Result};
use crate::process::{ChildStatus, FcgiProcess};
use crate::protocol::{
    build_record, encode_nv, encoded_nv_len, EndRequestBody, NvReader, Record, RecordBuffer,
    RecordType, Role, FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS, MAX_CONTENT_LEN,
    MAX_REQUEST_ID,
};
use crate::writer::{spawn_writer_task_default, OutboundRecord, WriterHandle};

/// Budget for the GET_VALUES probe during connect.
const NEGOTIATION_TIMEOUT: Duration = Duration::from_millis(500);

/// Parameter bytes packed into one PARAMS record before starting the next.
const PARAMS_RECORD_LIMIT: usize = 16300;

/// Largest STDIN content span per record.
const STDIN_CHUNK_MAX: usize = 0x7FFF;

/// Cascading restarts attempted per liveness check before giving up.
const MAX_RESTART_ATTEMPTS: usize = 5;

/// Output callback: receives the request id and a span of response bytes.
pub type OutputFn = dyn Fn(u16, &[u8]) + Send + Sync;

/// Clonable completion signal for one request.
///
/// The engine sets it exactly once per issued request: on END_REQUEST, on
/// transport close, or on child-process death. It is the sole completion
/// notification.
#[derive(Clone, Default)]
pub struct CompletionFlag {
    inner: Arc<CompletionInner>,
}

#[derive(Default)]
struct CompletionInner {
    done: AtomicBool,
    notify: Notify,
}

impl CompletionFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark complete and wake all waiters.
    pub fn signal(&self) {
        self.inner.done.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Check without waiting.
    pub fn is_set(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }

    /// Wait until [`signal`](Self::signal) has been called.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent signal cannot slip
            // between the check and the await.
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// Capability values cached from the peer's GET_VALUES_RESULT.
///
/// Missing or unparseable values keep these defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCapabilities {
    pub max_conns: u32,
    pub max_reqs: u32,
    pub mpxs_conns: u32,
}

impl Default for PeerCapabilities {
    fn default() -> Self {
        Self {
            max_conns: u32::MAX,
            max_reqs: u32::MAX,
            mpxs_conns: 0,
        }
    }
}

struct RequestEntry {
    output: Arc<OutputFn>,
    completion: CompletionFlag,
    /// STDERR is held back and flushed through the output callback when
    /// END_REQUEST arrives.
    stderr_tail: BytesMut,
    aborted: bool,
}

struct ClientState {
    requests: HashMap<u16, RequestEntry>,
    /// Last allocated request id; wraps from 65530 back to 1.
    next_id: u16,
    /// Requests occupying a slot. Not the same as `requests.len()` while
    /// aborts are in flight.
    live: u32,
    connected: bool,
    writer: Option<WriterHandle>,
}

struct ClientShared {
    /// Never held across an await or a callback invocation.
    state: Mutex<ClientState>,
    capabilities: Mutex<PeerCapabilities>,
}

/// Web-server front-end: multiplexes requests onto one transport to the
/// application.
pub struct FcgiClient {
    shared: Arc<ClientShared>,
    read_task: Option<JoinHandle<()>>,
    process: Option<FcgiProcess>,
}

impl Default for FcgiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FcgiClient {
    /// Client for an externally managed application.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ClientShared {
                state: Mutex::new(ClientState {
                    requests: HashMap::new(),
                    next_id: 0,
                    live: 0,
                    connected: false,
                    writer: None,
                }),
                capabilities: Mutex::new(PeerCapabilities::default()),
            }),
            read_task: None,
            process: None,
        }
    }

    /// Client that launches and supervises the application itself.
    pub async fn with_process(command_line: impl Into<String>) -> Result<Self> {
        let process = FcgiProcess::launch(command_line).await?;
        let mut client = Self::new();
        client.process = Some(process);
        Ok(client)
    }

    /// Connect to the application.
    ///
    /// First opens a probe transport and asks for the peer's capability
    /// values; if GET_VALUES_RESULT does not arrive within 500 ms the
    /// connect fails with [`FcgiError::NegotiationTimeout`]. The probe
    /// transport is then discarded and a fresh one is opened for real
    /// traffic.
    pub async fn connect(&mut self, ip: &str, port: u16) -> Result<()> {
        self.teardown_transport();

        let probe = TcpStream::connect((ip, port)).await?;
        let caps = match timeout(NEGOTIATION_TIMEOUT, negotiate(probe)).await {
            Ok(result) => result?,
            Err(_) => return Err(FcgiError::NegotiationTimeout),
        };
        *self.shared.capabilities.lock().unwrap() = caps;
        tracing::debug!(
            max_conns = caps.max_conns,
            max_reqs = caps.max_reqs,
            mpxs_conns = caps.mpxs_conns,
            "peer capabilities cached"
        );

        let stream = TcpStream::connect((ip, port)).await?;
        let (read_half, write_half) = stream.into_split();
        let (writer, _writer_task) = spawn_writer_task_default(write_half);

        {
            let mut state = self.shared.state.lock().unwrap();
            state.connected = true;
            state.writer = Some(writer);
        }

        let shared = self.shared.clone();
        self.read_task = Some(tokio::spawn(read_loop(read_half, shared)));
        Ok(())
    }

    /// Whether the traffic transport is up.
    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().unwrap().connected
    }

    /// The capability values cached at connect time.
    pub fn capabilities(&self) -> PeerCapabilities {
        *self.shared.capabilities.lock().unwrap()
    }

    /// Requests currently occupying a slot.
    pub fn live_requests(&self) -> u32 {
        self.shared.state.lock().unwrap().live
    }

    /// Issue a new request: BEGIN_REQUEST, the parameters as one or more
    /// PARAMS records, and the PARAMS terminator.
    ///
    /// Returns the allocated request id, or `0` when not connected, when
    /// the peer's request limit is reached, or when the peer does not
    /// multiplex and a request is already live. A non-zero return
    /// guarantees `completion` will eventually fire.
    pub async fn send_request(
        &self,
        params: &[(String, String)],
        output: impl Fn(u16, &[u8]) + Send + Sync + 'static,
        completion: CompletionFlag,
    ) -> u16 {
        let (id, writer) = {
            let mut state = self.shared.state.lock().unwrap();
            let caps = *self.shared.capabilities.lock().unwrap();

            let Some(writer) = state.writer.clone() else {
                return 0;
            };
            if !state.connected || state.live >= caps.max_reqs {
                return 0;
            }
            if caps.mpxs_conns == 0 && !state.requests.is_empty() {
                return 0;
            }

            let id = allocate_request_id(&mut state);
            state.live += 1;
            state.requests.insert(
                id,
                RequestEntry {
                    output: Arc::new(output),
                    completion,
                    stderr_tail: BytesMut::new(),
                    aborted: false,
                },
            );
            (id, writer)
        };

        if let Err(e) = send_request_preamble(&writer, id, params).await {
            // The transport is going down; the close path completes the
            // request through its flag.
            tracing::debug!(request_id = id, "request preamble failed: {}", e);
        }
        id
    }

    /// Stream request body bytes as STDIN records (at most 32 767 content
    /// bytes each). An empty `data` emits the STDIN terminator.
    pub async fn send_request_data(&self, request_id: u16, data: &[u8]) {
        let writer = {
            let state = self.shared.state.lock().unwrap();
            match (&state.writer, state.connected) {
                (Some(writer), true) => writer.clone(),
                _ => return,
            }
        };

        if data.is_empty() {
            let _ = writer
                .send(OutboundRecord::terminator(RecordType::Stdin, request_id))
                .await;
            return;
        }

        for chunk in data.chunks(STDIN_CHUNK_MAX) {
            if writer
                .send(OutboundRecord::new(
                    RecordType::Stdin,
                    request_id,
                    Bytes::copy_from_slice(chunk),
                ))
                .await
                .is_err()
            {
                break;
            }
        }
    }

    /// Abort a request: emits ABORT_REQUEST and suppresses further output
    /// delivery for the id. The entry itself is cleaned up when the peer's
    /// END_REQUEST arrives. Returns false for an unknown id.
    pub async fn abort_request(&self, request_id: u16) -> bool {
        let writer = {
            let mut state = self.shared.state.lock().unwrap();
            let Some(entry) = state.requests.get_mut(&request_id) else {
                return false;
            };
            entry.aborted = true;
            state.writer.clone()
        };

        if let Some(writer) = writer {
            let _ = writer.send(OutboundRecord::abort_request(request_id)).await;
        }
        true
    }

    /// Release a request entry irrespective of completion (the caller has
    /// abandoned the result).
    pub fn remove_request(&self, request_id: u16) {
        let mut state = self.shared.state.lock().unwrap();
        if state.requests.remove(&request_id).is_some() {
            state.live = state.live.saturating_sub(1);
        }
    }

    /// Poll the supervised application process.
    ///
    /// Returns true while the child runs, or always when no process path
    /// is configured (externally managed application). An observed exit
    /// force-completes every live request, then the child is relaunched,
    /// at most five cascading restarts before this reports false for good.
    pub async fn is_process_alive(&mut self) -> bool {
        let Some(process) = self.process.as_mut() else {
            return true;
        };

        for attempts in 0..=MAX_RESTART_ATTEMPTS {
            match process.poll_status() {
                ChildStatus::Running => return true,
                ChildStatus::Gone => return false,
                ChildStatus::Exited => {
                    fail_all_requests(&self.shared);
                    if attempts == MAX_RESTART_ATTEMPTS {
                        tracing::error!("giving up on the application process");
                        return false;
                    }
                    if let Err(e) = process.respawn().await {
                        tracing::error!("application process restart failed: {}", e);
                        return false;
                    }
                }
            }
        }
        false
    }

    /// Graceful teardown: force-complete live requests, close the
    /// transport, and terminate the supervised child.
    pub async fn shutdown(&mut self) {
        self.teardown_transport();
        if let Some(mut process) = self.process.take() {
            process.shutdown().await;
        }
    }

    fn teardown_transport(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        fail_all_requests(&self.shared);
    }
}

impl Drop for FcgiClient {
    fn drop(&mut self) {
        // Live requests must not be left dangling; the child handle's own
        // drop performs the immediate-kill fallback.
        self.teardown_transport();
    }
}

/// Allocate the next free request id, wrapping from 65530 back to 1.
fn allocate_request_id(state: &mut ClientState) -> u16 {
    loop {
        state.next_id = if state.next_id >= MAX_REQUEST_ID {
            1
        } else {
            state.next_id + 1
        };
        if !state.requests.contains_key(&state.next_id) {
            return state.next_id;
        }
    }
}

/// Emit BEGIN_REQUEST and the PARAMS stream for a new request.
///
/// Parameter sets that do not fit one record are split at pair boundaries
/// across several PARAMS records.
async fn send_request_preamble(
    writer: &WriterHandle,
    request_id: u16,
    params: &[(String, String)],
) -> Result<()> {
    writer
        .send(OutboundRecord::begin_request(
            request_id,
            Role::Responder,
            true,
        ))
        .await?;

    let mut chunk = BytesMut::new();
    let mut split = false;
    for (key, value) in params {
        let pair_len = encoded_nv_len(key.as_bytes(), value.as_bytes());
        if pair_len > MAX_CONTENT_LEN {
            tracing::warn!(key = %key, "parameter pair exceeds record capacity, dropped");
            continue;
        }
        if !chunk.is_empty() && chunk.len() + pair_len > PARAMS_RECORD_LIMIT {
            split = true;
            writer
                .send(OutboundRecord::new(
                    RecordType::Params,
                    request_id,
                    chunk.split().freeze(),
                ))
                .await?;
        }
        encode_nv(&mut chunk, key.as_bytes(), value.as_bytes())?;
    }
    if split {
        tracing::debug!(request_id, "parameter set split across multiple records");
    }
    if !chunk.is_empty() {
        writer
            .send(OutboundRecord::new(
                RecordType::Params,
                request_id,
                chunk.freeze(),
            ))
            .await?;
    }
    writer
        .send(OutboundRecord::terminator(RecordType::Params, request_id))
        .await?;
    Ok(())
}

/// Run the capability probe on a throwaway transport.
async fn negotiate(mut stream: TcpStream) -> Result<PeerCapabilities> {
    let mut query = BytesMut::new();
    for name in [FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS] {
        encode_nv(&mut query, name.as_bytes(), b"")?;
    }
    stream
        .write_all(&build_record(RecordType::GetValues, 0, &query))
        .await?;

    let mut parse = RecordBuffer::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(FcgiError::ConnectionClosed);
        }
        parse.push(&buf[..n]);
        while let Some(record) = parse.next_record()? {
            if record.kind() == Some(RecordType::GetValuesResult) && record.is_management() {
                return Ok(parse_capabilities(record.content()));
            }
            tracing::debug!(
                record_type = record.header.record_type,
                "ignoring record during negotiation"
            );
        }
    }
}

/// Decode a GET_VALUES_RESULT body. Missing names and unparseable values
/// keep the defaults; a truncated tail stops the scan without failing.
fn parse_capabilities(content: &[u8]) -> PeerCapabilities {
    let mut caps = PeerCapabilities::default();
    let mut reader = NvReader::new(content);
    loop {
        match reader.next_pair() {
            Ok(Some((name, value))) => {
                let Ok(value) = std::str::from_utf8(value) else {
                    continue;
                };
                let Ok(parsed) = value.trim().parse::<u32>() else {
                    tracing::debug!(
                        name = %String::from_utf8_lossy(name),
                        value,
                        "ignoring non-numeric capability value"
                    );
                    continue;
                };
                match name {
                    n if n == FCGI_MAX_CONNS.as_bytes() => caps.max_conns = parsed,
                    n if n == FCGI_MAX_REQS.as_bytes() => caps.max_reqs = parsed,
                    n if n == FCGI_MPXS_CONNS.as_bytes() => caps.mpxs_conns = parsed,
                    _ => {}
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("stopping capability decode: {}", e);
                break;
            }
        }
    }
    caps
}

/// What the dispatcher decided about the rest of a parse pass.
enum Dispatch {
    Continue,
    /// An unexpected record type: stop this pass, keep the transport.
    StopBatch,
}

async fn read_loop(mut read_half: OwnedReadHalf, shared: Arc<ClientShared>) {
    let mut parse = RecordBuffer::new();
    let mut buf = vec![0u8; 16 * 1024];

    'outer: loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("transport read failed: {}", e);
                break;
            }
        };

        parse.push(&buf[..n]);
        loop {
            match parse.next_record() {
                Ok(Some(record)) => match dispatch_record(&shared, record) {
                    Dispatch::Continue => {}
                    Dispatch::StopBatch => break,
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("closing transport: {}", e);
                    break 'outer;
                }
            }
        }
    }

    handle_transport_closed(&shared);
}

fn dispatch_record(shared: &ClientShared, record: Record) -> Dispatch {
    match record.kind() {
        Some(RecordType::GetValuesResult) if record.is_management() => {
            *shared.capabilities.lock().unwrap() = parse_capabilities(record.content());
            Dispatch::Continue
        }

        Some(RecordType::Stdout) if !record.is_management() => {
            let id = record.request_id();
            if record.is_terminator() {
                return Dispatch::Continue;
            }
            let output = {
                let state = shared.state.lock().unwrap();
                match state.requests.get(&id) {
                    Some(entry) if !entry.aborted => Some(entry.output.clone()),
                    _ => None,
                }
            };
            if let Some(output) = output {
                output(id, record.content());
            }
            Dispatch::Continue
        }

        Some(RecordType::Stderr) if !record.is_management() => {
            let id = record.request_id();
            if !record.is_terminator() {
                let mut state = shared.state.lock().unwrap();
                if let Some(entry) = state.requests.get_mut(&id) {
                    if !entry.aborted {
                        entry.stderr_tail.extend_from_slice(record.content());
                    }
                }
            }
            Dispatch::Continue
        }

        Some(RecordType::EndRequest) if !record.is_management() => {
            let id = record.request_id();
            match EndRequestBody::decode(record.content()) {
                Ok(body) => tracing::debug!(
                    request_id = id,
                    app_status = body.app_status,
                    protocol_status = body.protocol_status,
                    "request ended"
                ),
                Err(_) => tracing::debug!(request_id = id, "request ended (short body)"),
            }

            let finished = {
                let mut state = shared.state.lock().unwrap();
                let entry = state.requests.remove(&id);
                if entry.is_some() {
                    state.live = state.live.saturating_sub(1);
                }
                entry
            };
            if let Some(entry) = finished {
                if !entry.aborted && !entry.stderr_tail.is_empty() {
                    (entry.output)(id, &entry.stderr_tail);
                }
                entry.completion.signal();
            }
            Dispatch::Continue
        }

        _ => {
            tracing::warn!(
                record_type = record.header.record_type,
                request_id = record.request_id(),
                "unexpected record, deferring rest of this batch"
            );
            Dispatch::StopBatch
        }
    }
}

/// Transport gone (close, error, malformed frame, child exit): every live
/// request completes now, with its buffered STDERR flushed first.
fn handle_transport_closed(shared: &ClientShared) {
    let entries: Vec<(u16, RequestEntry)> = {
        let mut state = shared.state.lock().unwrap();
        state.connected = false;
        state.writer = None;
        state.live = 0;
        state.requests.drain().collect()
    };

    for (id, entry) in entries {
        if !entry.aborted && !entry.stderr_tail.is_empty() {
            (entry.output)(id, &entry.stderr_tail);
        }
        entry.completion.signal();
    }
}

fn fail_all_requests(shared: &ClientShared) {
    handle_transport_closed(shared);
}
