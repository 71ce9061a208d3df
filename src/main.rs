//! splunk-forward - pipe lines from stdin into a Splunk HTTP Event Collector
//!
//! Every non-empty line read from stdin is logged at `info` through the
//! Splunk transport. On EOF or Ctrl+C the transport is closed so the last
//! partial batch still goes out.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `SPLUNK_TOKEN`: HTTP Event Collector token (required)
//! - `SPLUNK_HOST`: Collector host (default: localhost)
//! - `SPLUNK_PORT`: Collector port (default: 8088)
//! - `SPLUNK_PROTOCOL`: `https` or `http` (default: https)
//! - `SPLUNK_MAX_BATCH_COUNT`: Events per batch, 1 to 10000 (default: 1)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::time::Duration;

use serde_json::Map;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use splunk_transport::config::{SplunkSettings, TransportOptions};
use splunk_transport::transport::{EventTransport, Transport, TransportEvent};

/// How long to wait for the final flush on shutdown
const SHUTDOWN_TIMEOUT_SECS: u64 = 10;

#[tokio::main]
async fn main() {
    init_tracing();

    let settings = match SplunkSettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let transport = match EventTransport::new(Some(&TransportOptions::with_settings(settings))) {
        Ok(transport) => {
            info!(
                url = %transport.config().url(),
                max_batch_count = transport.config().max_batch_count,
                "Transport initialized"
            );
            transport
        }
        Err(e) => {
            error!(error = %e, "Failed to create transport");
            std::process::exit(1);
        }
    };

    let mut notifications = transport.subscribe();
    let reporter = tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(TransportEvent::Logged { batch_id, count }) => {
                    debug!(batch_id = %batch_id, count = count, "Batch logged");
                }
                Ok(TransportEvent::Error {
                    batch_id,
                    count,
                    error,
                }) => {
                    warn!(batch_id = %batch_id, count = count, error = %error, "Batch lost");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Notification reporter fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let forwarded = forward_stdin(&transport).await;

    info!(forwarded = forwarded, "Closing transport...");
    let shutdown_timeout = Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
    match tokio::time::timeout(shutdown_timeout, transport.close()).await {
        Ok(()) => info!("Transport closed"),
        Err(_) => warn!("Transport shutdown timed out after {:?}", shutdown_timeout),
    }

    if tokio::time::timeout(Duration::from_secs(1), reporter).await.is_err() {
        warn!("Notification reporter did not stop in time");
    }
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .init();
}

/// Log each stdin line until EOF or Ctrl+C. Returns the number of lines logged.
async fn forward_stdin(transport: &EventTransport) -> u64 {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut forwarded: u64 = 0;
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    transport.log("info", &line, Map::new(), Box::new(|_| {}));
                    forwarded += 1;
                }
                Ok(None) => {
                    info!("Reached end of input");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read stdin");
                    break;
                }
            },
            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping...");
                break;
            }
        }
    }
    forwarded
}
