//! Request handler trait for the application-side server.
//!
//! A handler receives the decoded parameter map and the two request-scoped
//! byte streams, and returns an application exit code. Any async closure
//! with the right shape implements [`Handler`] through the blanket impl,
//! so servers are usually constructed straight from a closure.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use crate::bridge::{BodyReader, RequestWriter};

/// Decoded PARAMS of one request: parameter name to value.
pub type Params = HashMap<String, String>;

/// Boxed future returned by handler invocations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for request handlers.
pub trait Handler: Send + Sync + 'static {
    /// Handle one request. Runs concurrently with the request's STDIN
    /// records still arriving; `body` yields them in order and signals end
    /// of stream once the peer terminates the input.
    fn call(&self, params: Params, out: RequestWriter, body: BodyReader) -> BoxFuture<'static, i32>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Params, RequestWriter, BodyReader) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = i32> + Send + 'static,
{
    fn call(&self, params: Params, out: RequestWriter, body: BodyReader) -> BoxFuture<'static, i32> {
        Box::pin((self)(params, out, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_implements_handler() {
        fn assert_handler<H: Handler>(_h: &H) {}

        let echo = |_params: Params, _out: RequestWriter, _body: BodyReader| async move { 0 };
        assert_handler(&echo);
    }

    #[tokio::test]
    async fn test_handler_call_returns_status() {
        let handler = |params: Params, _out: RequestWriter, _body: BodyReader| async move {
            params.len() as i32
        };

        let (_feed, body) = crate::bridge::body_channel();
        let (writer_half, _server) = tokio::io::duplex(1024);
        let (writer, _task) = crate::writer::spawn_writer_task_default(writer_half);
        let out = RequestWriter::new(1, writer);

        let mut params = Params::new();
        params.insert("A".into(), "1".into());
        params.insert("B".into(), "2".into());

        let status = handler.call(params, out, body).await;
        assert_eq!(status, 2);
    }
}
