//! Echo front-end - the web-server side of the protocol.
//!
//! Connects to the responder from `echo_server`, issues one request with
//! a small body, and prints everything the peer streams back.

use fcgiwire::{CompletionFlag, FcgiClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut client = FcgiClient::new();
    client.connect("127.0.0.1", 9000).await?;

    let caps = client.capabilities();
    println!(
        "peer capabilities: max_conns={} max_reqs={} mpxs_conns={}",
        caps.max_conns, caps.max_reqs, caps.mpxs_conns
    );

    let params = vec![
        ("REQUEST_METHOD".to_string(), "POST".to_string()),
        ("SCRIPT_NAME".to_string(), "/echo".to_string()),
    ];

    let done = CompletionFlag::new();
    let id = client
        .send_request(
            &params,
            |_id, bytes| print!("{}", String::from_utf8_lossy(bytes)),
            done.clone(),
        )
        .await;
    if id == 0 {
        eprintln!("request refused by the engine");
        return Ok(());
    }

    client.send_request_data(id, b"hello over the wire").await;
    client.send_request_data(id, b"").await;

    done.wait().await;
    println!();

    client.shutdown().await;
    Ok(())
}
