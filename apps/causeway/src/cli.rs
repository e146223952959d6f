use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "causeway")]
#[command(about = "WebRTC signaling relay")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Listen port override (otherwise CAUSEWAY_PORT, default 8080)
    #[arg(long)]
    pub port: Option<u16>,

    /// Serve static files from this directory
    #[arg(long)]
    pub static_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check that a running relay accepts sessions and answers probes
    Probe {
        /// Relay URL
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,
    },
}

/// Open a session against a running relay, send a transport ping, and
/// report the round trip time.
pub async fn run_probe(url: String) -> Result<()> {
    let ws_url = format!("{}/ws", url.trim_end_matches('/'));
    debug!("connecting to {}", ws_url);

    let (stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(connected)) => connected,
        Ok(Err(err)) => {
            return Err(anyhow::anyhow!("connection to {} failed: {}", ws_url, err));
        }
        Err(_) => {
            return Err(anyhow::anyhow!("connection timeout - is the relay running?"));
        }
    };
    let (mut write, mut read) = stream.split();

    let started = Instant::now();
    write
        .send(Message::Ping(b"causeway-probe".to_vec().into()))
        .await?;

    let rtt = timeout(Duration::from_secs(5), async {
        while let Some(frame) = read.next().await {
            if let Message::Pong(_) = frame? {
                return Ok::<_, anyhow::Error>(started.elapsed());
            }
        }
        Err(anyhow::anyhow!("connection closed before pong"))
    })
    .await
    .map_err(|_| anyhow::anyhow!("timed out waiting for pong"))??;

    println!("pong from {} in {:?}", ws_url, rtt);

    write.send(Message::Close(None)).await?;
    Ok(())
}
