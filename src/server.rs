//! Application-side engine.
//!
//! [`FcgiServer`] accepts transports from a web-server front-end and
//! demultiplexes the records on each of them. Every request spawns one
//! handler task as soon as its parameter stream terminates; STDIN records
//! arriving afterwards are queued into the handler's [`BodyReader`]
//! without ever blocking dispatch. When the input stream terminates, the
//! dispatch task awaits the handler and finalizes the request with the
//! STDOUT terminator followed by END_REQUEST, over the same ordered
//! writer the handler used, so every handler byte reaches the peer first.
//!
//! # Example
//!
//! ```ignore
//! use fcgiwire::{FcgiServer, Params, RequestWriter, BodyReader};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut server = FcgiServer::new(
//!         "127.0.0.1",
//!         9000,
//!         |_params: Params, out: RequestWriter, mut body: BodyReader| async move {
//!             let input = body.read_to_end().await;
//!             out.write(&input).await.ok();
//!             0
//!         },
//!     );
//!     server.start().await.unwrap();
//! }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::{tcp::OwnedReadHalf, TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::bridge::{body_channel, BodyFeed, RequestWriter};
use crate::error::{FcgiError, Result};
use crate::handler::{Handler, Params};
use crate::protocol::{
    encode_nv, BeginRequestBody, NvReader, ProtocolStatus, Record, RecordBuffer, RecordType,
    FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS,
};
use crate::writer::{spawn_writer_task_default, OutboundRecord, WriterHandle};

/// Capability values the server advertises in GET_VALUES_RESULT.
///
/// The defaults are part of the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Maximum concurrent transport connections (`FCGI_MAX_CONNS`).
    pub max_conns: u32,
    /// Maximum concurrent requests (`FCGI_MAX_REQS`).
    pub max_reqs: u32,
    /// Whether one transport may carry concurrent requests
    /// (`FCGI_MPXS_CONNS`).
    pub mpxs_conns: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            max_conns: 10,
            max_reqs: 50,
            mpxs_conns: true,
        }
    }
}

/// Application-side server: accepts transports and dispatches each request
/// to the configured handler.
pub struct FcgiServer {
    bind_addr: String,
    port: u16,
    handler: Arc<dyn Handler>,
    capabilities: Capabilities,
    last_error: Arc<AtomicI32>,
    local_port: Option<u16>,
    runtime: Option<ServerRuntime>,
}

struct ServerRuntime {
    accept_task: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl FcgiServer {
    /// Create a server bound to `bind_addr:port` (port 0 picks an
    /// ephemeral port on [`start`](Self::start)).
    pub fn new(bind_addr: impl Into<String>, port: u16, handler: impl Handler) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            port,
            handler: Arc::new(handler),
            capabilities: Capabilities::default(),
            last_error: Arc::new(AtomicI32::new(0)),
            local_port: None,
            runtime: None,
        }
    }

    /// Override the advertised capability values.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Bind the listener and begin accepting transports.
    pub async fn start(&mut self) -> Result<()> {
        if self.runtime.is_some() {
            return Ok(());
        }

        let listener = match TcpListener::bind((self.bind_addr.as_str(), self.port)).await {
            Ok(listener) => listener,
            Err(e) => {
                self.last_error
                    .store(e.raw_os_error().unwrap_or(-1), Ordering::Release);
                return Err(e.into());
            }
        };
        self.local_port = Some(listener.local_addr()?.port());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.handler.clone(),
            self.capabilities,
            shutdown_rx,
            self.last_error.clone(),
        ));

        self.runtime = Some(ServerRuntime {
            accept_task,
            shutdown_tx,
        });
        tracing::info!(addr = %self.bind_addr, port = self.local_port.unwrap_or(self.port), "server started");
        Ok(())
    }

    /// Stop accepting, close every transport, and wait until every live
    /// handler task has been awaited.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(runtime) = self.runtime.take() {
            let _ = runtime.shutdown_tx.send(true);
            let _ = runtime.accept_task.await;
            tracing::info!("server stopped");
        }
        Ok(())
    }

    /// Last raw OS error observed while binding or accepting; 0 when none.
    pub fn get_error(&self) -> i32 {
        self.last_error.load(Ordering::Acquire)
    }

    /// The port the listener is bound to (the configured one before
    /// [`start`](Self::start)).
    pub fn get_port(&self) -> u16 {
        self.local_port.unwrap_or(self.port)
    }

    /// The configured bind address.
    pub fn get_bind_address(&self) -> &str {
        &self.bind_addr
    }

    /// The capability values advertised to peers.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}

impl Drop for FcgiServer {
    fn drop(&mut self) {
        // Dropping the watch sender signals every task; connections drain
        // their handlers in the background. stop() is the deterministic
        // path.
        if let Some(runtime) = self.runtime.take() {
            let _ = runtime.shutdown_tx.send(true);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn Handler>,
    capabilities: Capabilities,
    mut shutdown_rx: watch::Receiver<bool>,
    last_error: Arc<AtomicI32>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "transport accepted");
                    connections.spawn(serve_connection(
                        stream,
                        handler.clone(),
                        capabilities,
                        shutdown_rx.clone(),
                    ));
                }
                Err(e) => {
                    tracing::error!("accept failed: {}", e);
                    last_error.store(e.raw_os_error().unwrap_or(-1), Ordering::Release);
                }
            },
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
}

/// What the dispatcher wants done with the transport after a record.
enum ConnAction {
    Continue,
    Close,
}

async fn serve_connection(
    stream: TcpStream,
    handler: Arc<dyn Handler>,
    capabilities: Capabilities,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (read_half, write_half) = stream.into_split();
    let (writer, writer_task) = spawn_writer_task_default(write_half);

    let mut conn = Connection {
        requests: HashMap::new(),
        handler,
        capabilities,
        writer,
    };

    if let Err(e) = read_records(read_half, &mut conn, &mut shutdown_rx).await {
        tracing::warn!("closing transport: {}", e);
    }

    // EOF every input queue and await every live handler before the
    // request bundles go away; each bundle is owned here, so no shared
    // lock is ever held around the join.
    conn.drain().await;
    drop(conn);
    let _ = writer_task.await;
}

async fn read_records(
    mut read_half: OwnedReadHalf,
    conn: &mut Connection,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<()> {
    let mut parse = RecordBuffer::new();
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        let n = tokio::select! {
            _ = shutdown_rx.changed() => return Ok(()),
            n = read_half.read(&mut buf) => n?,
        };
        if n == 0 {
            return Ok(());
        }

        parse.push(&buf[..n]);
        while let Some(record) = parse.next_record()? {
            match conn.dispatch(record).await? {
                ConnAction::Continue => {}
                ConnAction::Close => return Ok(()),
            }
        }
        // A partial record stays in the parse buffer for the next read.
    }
}

/// One accepted transport and the requests multiplexed on it.
struct Connection {
    requests: HashMap<u16, RequestSlot>,
    handler: Arc<dyn Handler>,
    capabilities: Capabilities,
    writer: WriterHandle,
}

struct RequestSlot {
    state: SlotState,
    keep_conn: bool,
}

enum SlotState {
    /// PARAMS records still arriving.
    AwaitingParams { params: Params },
    /// Parameter stream ended; handler running, STDIN being fed.
    ReceivingBody {
        feed: BodyFeed,
        handler_task: JoinHandle<i32>,
    },
}

impl Connection {
    async fn dispatch(&mut self, record: Record) -> Result<ConnAction> {
        if record.is_management() {
            return match record.kind() {
                Some(RecordType::GetValues) => self.on_get_values(&record).await,
                _ => {
                    tracing::warn!(
                        record_type = record.header.record_type,
                        "unrecognized management record"
                    );
                    self.writer
                        .send(OutboundRecord::unknown_type(record.header.record_type))
                        .await?;
                    Ok(ConnAction::Continue)
                }
            };
        }

        match record.kind() {
            Some(RecordType::BeginRequest) => self.on_begin_request(&record),
            Some(RecordType::Params) => self.on_params(&record).await,
            Some(RecordType::Stdin) => self.on_stdin(&record).await,
            Some(RecordType::AbortRequest) => self.on_abort(record.request_id()).await,
            _ => Err(FcgiError::Protocol(format!(
                "unexpected record type {} for request {}",
                record.header.record_type,
                record.request_id()
            ))),
        }
    }

    async fn on_get_values(&mut self, record: &Record) -> Result<ConnAction> {
        if !self.requests.is_empty() {
            return Err(FcgiError::Protocol(
                "GET_VALUES while requests are live".into(),
            ));
        }

        // Echo only the recognized names that were asked for. Undecodable
        // tails of a management record are dropped, not fatal.
        let mut reply = BytesMut::new();
        let mut reader = NvReader::new(record.content());
        loop {
            match reader.next_pair() {
                Ok(Some((name, _))) => {
                    let value = match name {
                        n if n == FCGI_MAX_CONNS.as_bytes() => {
                            self.capabilities.max_conns.to_string()
                        }
                        n if n == FCGI_MAX_REQS.as_bytes() => {
                            self.capabilities.max_reqs.to_string()
                        }
                        n if n == FCGI_MPXS_CONNS.as_bytes() => {
                            u32::from(self.capabilities.mpxs_conns).to_string()
                        }
                        _ => continue,
                    };
                    encode_nv(&mut reply, name, value.as_bytes())?;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("stopping GET_VALUES decode: {}", e);
                    break;
                }
            }
        }

        self.writer
            .send(OutboundRecord::new(
                RecordType::GetValuesResult,
                0,
                reply.freeze(),
            ))
            .await?;
        Ok(ConnAction::Continue)
    }

    fn on_begin_request(&mut self, record: &Record) -> Result<ConnAction> {
        let id = record.request_id();
        if self.requests.contains_key(&id) {
            return Err(FcgiError::Protocol(format!(
                "BEGIN_REQUEST for in-use request id {}",
                id
            )));
        }

        let body = BeginRequestBody::decode(record.content())?;
        self.requests.insert(
            id,
            RequestSlot {
                state: SlotState::AwaitingParams {
                    params: Params::new(),
                },
                keep_conn: body.keep_conn(),
            },
        );
        // Every role is served the Responder way.
        tracing::debug!(request_id = id, role = body.role, "request started");
        Ok(ConnAction::Continue)
    }

    async fn on_params(&mut self, record: &Record) -> Result<ConnAction> {
        let id = record.request_id();
        let slot = self
            .requests
            .get_mut(&id)
            .ok_or_else(|| FcgiError::Protocol(format!("PARAMS for unknown request {}", id)))?;

        let SlotState::AwaitingParams { params } = &mut slot.state else {
            return Err(FcgiError::Protocol(format!(
                "PARAMS after the parameter stream of request {} ended",
                id
            )));
        };

        if !record.is_terminator() {
            let mut reader = NvReader::new(record.content());
            while let Some((key, value)) = reader.next_pair()? {
                // Later values overwrite earlier ones on duplicate keys.
                params.insert(
                    String::from_utf8_lossy(key).into_owned(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
            return Ok(ConnAction::Continue);
        }

        // Parameter stream ended: wire up the bridges and start the
        // handler. STDIN may now race ahead of it; the queue decouples
        // the two.
        let params = std::mem::take(params);
        let (feed, body) = body_channel();
        let out = RequestWriter::new(id, self.writer.clone());
        let handler_task = tokio::spawn(self.handler.call(params, out, body));
        slot.state = SlotState::ReceivingBody { feed, handler_task };
        Ok(ConnAction::Continue)
    }

    async fn on_stdin(&mut self, record: &Record) -> Result<ConnAction> {
        let id = record.request_id();
        let Some(slot) = self.requests.get_mut(&id) else {
            if record.is_terminator() {
                // The request already completed; a repeated terminator is
                // a no-op.
                tracing::debug!(request_id = id, "ignoring repeated STDIN terminator");
                return Ok(ConnAction::Continue);
            }
            return Err(FcgiError::Protocol(format!(
                "STDIN for unknown request {}",
                id
            )));
        };

        match &mut slot.state {
            SlotState::AwaitingParams { .. } => {
                return Err(FcgiError::Protocol(format!(
                    "STDIN before the parameter stream of request {} ended",
                    id
                )))
            }
            SlotState::ReceivingBody { feed, .. } => {
                if !record.is_terminator() {
                    feed.push(record.content.clone());
                    return Ok(ConnAction::Continue);
                }
            }
        }

        self.finish_request(id).await
    }

    async fn on_abort(&mut self, id: u16) -> Result<ConnAction> {
        let handler_running = match self.requests.get(&id) {
            None => {
                tracing::debug!(request_id = id, "abort for unknown or completed request");
                return Ok(ConnAction::Continue);
            }
            Some(slot) => matches!(slot.state, SlotState::ReceivingBody { .. }),
        };

        if handler_running {
            return self.finish_request(id).await;
        }

        // No handler running yet; answer immediately.
        let Some(slot) = self.requests.remove(&id) else {
            return Ok(ConnAction::Continue);
        };
        self.writer
            .send(OutboundRecord::end_request(
                id,
                0,
                ProtocolStatus::RequestComplete,
            ))
            .await?;
        if slot.keep_conn {
            Ok(ConnAction::Continue)
        } else {
            Ok(ConnAction::Close)
        }
    }

    /// End-of-input finalization: EOF the queue, await the handler, then
    /// terminate the output stream and the request. In that order, on
    /// this task, through the same writer the handler used.
    async fn finish_request(&mut self, id: u16) -> Result<ConnAction> {
        let Some(slot) = self.requests.remove(&id) else {
            return Ok(ConnAction::Continue);
        };

        if let SlotState::ReceivingBody { feed, handler_task } = slot.state {
            drop(feed);
            match handler_task.await {
                Ok(status) => {
                    tracing::debug!(request_id = id, status, "handler finished");
                }
                Err(e) => {
                    tracing::error!(request_id = id, "handler task failed: {}", e);
                }
            }

            self.writer
                .send(OutboundRecord::terminator(RecordType::Stdout, id))
                .await?;
            self.writer
                .send(OutboundRecord::end_request(
                    id,
                    0,
                    ProtocolStatus::RequestComplete,
                ))
                .await?;
        }

        if slot.keep_conn {
            Ok(ConnAction::Continue)
        } else {
            Ok(ConnAction::Close)
        }
    }

    /// Transport teardown with live requests: unblock and await every
    /// handler so none outlives its connection.
    async fn drain(&mut self) {
        for (id, slot) in self.requests.drain() {
            if let SlotState::ReceivingBody { feed, handler_task } = slot.state {
                drop(feed);
                if let Err(e) = handler_task.await {
                    tracing::error!(request_id = id, "handler task failed during drain: {}", e);
                }
            }
        }
    }
}
