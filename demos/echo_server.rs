//! Echo responder - the application side of the protocol.
//!
//! Listens on 127.0.0.1:9000 and copies every request body back to the
//! peer, prefixed with the request method taken from the parameters.
//!
//! Run the matching front-end with:
//!
//! ```sh
//! cargo run --example echo_client
//! ```

use fcgiwire::{BodyReader, FcgiServer, Params, RequestWriter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut server = FcgiServer::new(
        "127.0.0.1",
        9000,
        |params: Params, out: RequestWriter, mut body: BodyReader| async move {
            let method = params
                .get("REQUEST_METHOD")
                .cloned()
                .unwrap_or_else(|| "UNKNOWN".into());
            let input = body.read_to_end().await;

            out.write_str(&format!("[{}] ", method)).await.ok();
            out.write(&input).await.ok();
            0
        },
    );

    server.start().await?;
    println!(
        "echo responder listening on {}:{}",
        server.get_bind_address(),
        server.get_port()
    );

    tokio::signal::ctrl_c().await?;
    server.stop().await?;
    Ok(())
}
