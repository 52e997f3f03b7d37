//! Terminal meeting peer
//!
//! Usage: `locus-client <username> [server_host] [config.toml]`
//!
//! Lines typed on stdin are sent as chat. `/mute`, `/deaf` toggle the local
//! switches and `/quit` leaves. The camera is reported as off.

use anyhow::{Context, Result};
use bytes::Bytes;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use locus_relay::{
    client::{ClientEvent, RelayClient},
    config::ClientConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let username = args.next();
    let host = args.next();
    let config_path = args.next().map(PathBuf::from);

    let mut config = ClientConfig::load(config_path.as_deref()).context("loading client configuration")?;
    if let Some(username) = username {
        config.username = username;
    }
    if let Some(host) = host {
        config.server_host = host;
    }

    let client = RelayClient::connect(config).await.context("connecting to relay")?;

    // Print events off the async runtime
    let events = client.events().clone();
    std::thread::spawn(move || {
        for event in events.iter() {
            match event {
                ClientEvent::Joined { user } => println!("* {} joined", user),
                ClientEvent::Left { user } => println!("* {} left", user),
                ClientEvent::Chat { user, text } => println!("<{}> {}", user, text),
                ClientEvent::CameraOff { .. } => {}
                ClientEvent::Video { user, frame, .. } => {
                    tracing::debug!("Frame from {}: {} bytes", user, frame.len());
                }
            }
        }
    });

    // No audio device here; keep the buffer from filling with stale blocks
    let jitter = client.jitter();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(20));
        loop {
            ticker.tick().await;
            while jitter.try_pop().is_some() {}
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    {
        let camera = client.run_video(|| -> Option<Bytes> { None }, shutdown_rx);
        tokio::pin!(camera);

        loop {
            tokio::select! {
                result = &mut camera => {
                    result?;
                    break;
                }
                _ = tokio::signal::ctrl_c() => break,
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    match line.trim() {
                        "" => {}
                        "/quit" => break,
                        "/mute" => client.set_mute(!client.is_mute()),
                        "/deaf" => client.set_deaf(!client.is_deaf()),
                        text => {
                            if let Err(e) = client.send_chat(text).await {
                                tracing::error!("Chat failed: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    client.close().await;
    Ok(())
}
