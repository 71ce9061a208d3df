//! Splunk Transport Library
//!
//! A logging transport that forwards structured records to a Splunk HTTP
//! Event Collector, batching them before delivery:
//!
//! - **config**: Validation and defaulting of caller-supplied options
//! - **record**: Log records, the default event formatter and wire envelopes
//! - **client**: The collector client seam and the default HTTP client
//! - **transport**: The framework-facing transport with batching and notifications
//!
//! # Example
//!
//! ```no_run
//! use serde_json::Map;
//! use splunk_transport::config::{SplunkSettings, TransportOptions};
//! use splunk_transport::transport::{EventTransport, Transport, TransportEvent};
//!
//! #[tokio::main]
//! async fn main() {
//!     let options = TransportOptions::with_settings(SplunkSettings {
//!         max_batch_count: Some(10),
//!         ..SplunkSettings::with_token("00000000-0000-0000-0000-000000000000")
//!     });
//!     let transport = EventTransport::new(Some(&options)).expect("Failed to create transport");
//!
//!     let mut notifications = transport.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = notifications.recv().await {
//!             if let TransportEvent::Error { error, .. } = event {
//!                 eprintln!("delivery failed: {}", error);
//!             }
//!         }
//!     });
//!
//!     transport.log("info", "hello from rust", Map::new(), Box::new(|_| {}));
//!     transport.close().await;
//! }
//! ```

pub mod client;
pub mod config;
pub mod record;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use client::{CollectorClient, DeliveryError, HecClient};
pub use config::{
    resolve, Config, ConfigError, PayloadMetadata, PayloadMetadataOptions, SplunkSettings,
    TransportOptions,
};
pub use record::{default_formatter, EventEnvelope, EventFormatter, LogRecord};
pub use transport::{Callback, EventTransport, Transport, TransportEvent, TRANSPORT_NAME};
