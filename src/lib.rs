//! # fcgiwire
//!
//! A FastCGI 1.0 protocol engine with both peers of the protocol:
//!
//! - [`FcgiClient`]: the web-server front-end. Multiplexes dynamic
//!   requests onto one persistent transport to an application, negotiates
//!   the peer's capabilities, and can launch and supervise the
//!   application binary itself.
//! - [`FcgiServer`]: the application side. Accepts transports, runs one
//!   handler task per request, and bridges the handler's byte streams
//!   into STDOUT/STDIN records.
//!
//! The record protocol is the binary framing defined by the FastCGI 1.0
//! specification: 8-byte headers, 8-byte content alignment, and two-size
//! name-value pairs. The codec lives in [`protocol`] and is shared by
//! both engines.
//!
//! ## Server example
//!
//! ```ignore
//! use fcgiwire::{BodyReader, FcgiServer, Params, RequestWriter};
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

pub mod protocol;

mod bridge;
mod client;
mod error;
mod handler;
mod process;
mod server;
mod writer;

pub use bridge::{BodyReader, RequestWriter, STREAM_CHUNK_MAX};
pub use client::{CompletionFlag, FcgiClient, OutputFn, PeerCapabilities};
pub use error::{FcgiError, Result};
pub use handler::{BoxFuture, Handler, Params};
pub use process::{split_command_line, FcgiProcess};
pub use server::{Capabilities, FcgiServer};
pub use writer::{spawn_writer_task, spawn_writer_task_default, OutboundRecord, WriterHandle, WriterConfig};
