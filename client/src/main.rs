use std::env;

use anyhow::{Context, Result};

use courier_client::{ClientConfig, CourierClient};
use courier_common::{config::Endpoint, wire::Message, KeyStore};

/// Small requester CLI: each argument becomes one frame of the request.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let frames: Vec<Vec<u8>> = env::args().skip(1).map(String::into_bytes).collect();
    if frames.is_empty() {
        anyhow::bail!("usage: courier-client <frame> [frame ...]");
    }

    let host = env::var("COURIER_FRONTEND_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = env::var("COURIER_FRONTEND_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(5570);
    let encrypt = env::var("COURIER_FRONTEND_ENCRYPT")
        .map(|v| v.to_lowercase() == "true" || v == "1")
        .unwrap_or(false);

    let mut config = ClientConfig::new(Endpoint::new(host, port));
    if encrypt {
        config = config
            .encrypted(&KeyStore::from_env())
            .context("secure client setup failed")?;
    }

    let mut client = CourierClient::connect(config).context("could not reach broker")?;
    let reply = client
        .request(&Message::from_frames(frames))
        .context("request failed")?;

    for frame in reply.frames() {
        println!("{}", String::from_utf8_lossy(frame));
    }
    Ok(())
}
