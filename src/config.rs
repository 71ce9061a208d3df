//! Configuration resolution for the Splunk transport.
//!
//! Callers hand in loosely-shaped [`TransportOptions`] (typically built in code
//! or deserialized from JSON/YAML). [`resolve`] validates them and applies the
//! defaults field by field, producing an immutable [`Config`] and the
//! [`PayloadMetadata`] attached to every event.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Number;
use thiserror::Error;

use crate::record::{default_formatter, EventFormatter};

/// Default collector host
const DEFAULT_HOST: &str = "localhost";

/// Default HTTP Event Collector port
const DEFAULT_PORT: u16 = 8088;

/// Default scheme used to reach the collector
const DEFAULT_PROTOCOL: &str = "https";

/// Default event endpoint path on the collector
const DEFAULT_PATH: &str = "/services/collector/event/1.0";

/// Default number of events per batch (no batching)
const DEFAULT_MAX_BATCH_COUNT: usize = 1;

/// Upper bound on events per batch
pub const MAX_BATCH_COUNT: usize = 10_000;

/// Default level reported to the host framework
pub const DEFAULT_LEVEL: &str = "info";

/// Default `source` routing field
pub const DEFAULT_SOURCE: &str = "winston";

/// Default `sourcetype` routing field
pub const DEFAULT_SOURCETYPE: &str = "winston-splunk-logger";

const ENV_TOKEN: &str = "SPLUNK_TOKEN";
const ENV_HOST: &str = "SPLUNK_HOST";
const ENV_PORT: &str = "SPLUNK_PORT";
const ENV_PROTOCOL: &str = "SPLUNK_PROTOCOL";
const ENV_MAX_BATCH_COUNT: &str = "SPLUNK_MAX_BATCH_COUNT";

/// Errors raised while building a transport.
///
/// These are always returned synchronously from construction; a transport is
/// never handed out in a partially configured state.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: no transport options supplied")]
    MissingOptions,

    #[error("Configuration error: options must contain a `splunk` settings object")]
    MissingSettings,

    #[error("Configuration error: `splunk.token` is required")]
    MissingToken,

    #[error("Configuration error: max batch count must be greater than 0")]
    InvalidBatchCount,

    #[error("Configuration error: max batch count {count} exceeds maximum {max}")]
    BatchCountTooLarge { count: usize, max: usize },

    #[error("Configuration error for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("Client configuration error: {0}")]
    Client(String),

    #[error("Configuration error: transport must be created inside a Tokio runtime")]
    NoRuntime,
}

/// Top-level options accepted by the transport constructor.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    /// Level the host framework should filter at (default: `info`)
    #[serde(default)]
    pub level: Option<String>,

    /// Collector settings; required
    #[serde(default)]
    pub splunk: Option<SplunkSettings>,
}

impl TransportOptions {
    /// Options carrying only the given collector settings.
    pub fn with_settings(splunk: SplunkSettings) -> Self {
        Self {
            level: None,
            splunk: Some(splunk),
        }
    }
}

/// Collector settings as supplied by the caller. Every field is optional here;
/// [`resolve`] decides what is required and what gets defaulted.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplunkSettings {
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub protocol: Option<String>,

    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub max_batch_count: Option<usize>,

    #[serde(default)]
    pub payload_metadata: Option<PayloadMetadataOptions>,

    /// Custom event formatter. Only settable in code.
    #[serde(skip)]
    pub event_formatter: Option<EventFormatter>,
}

impl fmt::Debug for SplunkSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplunkSettings")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .field("path", &self.path)
            .field("max_batch_count", &self.max_batch_count)
            .field("payload_metadata", &self.payload_metadata)
            .field("event_formatter", &self.event_formatter.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl SplunkSettings {
    /// Settings with only a token set.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Self::default()
        }
    }

    /// Load collector settings from environment variables.
    ///
    /// Reads `SPLUNK_TOKEN`, `SPLUNK_HOST`, `SPLUNK_PORT`, `SPLUNK_PROTOCOL`
    /// and `SPLUNK_MAX_BATCH_COUNT`. Unset variables stay unset so the usual
    /// defaults apply during [`resolve`]; a missing token is reported there.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a numeric variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`SplunkSettings::from_env`] but reading through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        Ok(Self {
            token: get(ENV_TOKEN),
            host: get(ENV_HOST),
            port: parse_var(get(ENV_PORT), ENV_PORT)?,
            protocol: get(ENV_PROTOCOL),
            max_batch_count: parse_var(get(ENV_MAX_BATCH_COUNT), ENV_MAX_BATCH_COUNT)?,
            ..Self::default()
        })
    }
}

fn parse_var<T: FromStr>(value: Option<String>, var: &str) -> Result<Option<T>, ConfigError> {
    match value {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                var: var.to_string(),
                message: format!("'{}' is not a valid number", value),
            }),
        None => Ok(None),
    }
}

/// Caller overrides for the payload metadata.
///
/// Only the five recognised keys are kept; anything else in the input is
/// dropped during deserialization.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PayloadMetadataOptions {
    #[serde(default)]
    pub source: Option<String>,

    #[serde(default)]
    pub sourcetype: Option<String>,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub index: Option<String>,

    /// Epoch timestamp, kept exactly as the caller wrote it
    #[serde(default)]
    pub time: Option<Number>,
}

/// Routing metadata attached to every event sent to the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadMetadata {
    pub source: String,

    pub sourcetype: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<Number>,
}

impl Default for PayloadMetadata {
    fn default() -> Self {
        Self {
            source: DEFAULT_SOURCE.to_string(),
            sourcetype: DEFAULT_SOURCETYPE.to_string(),
            host: None,
            index: None,
            time: None,
        }
    }
}

impl PayloadMetadata {
    /// Merge caller overrides onto the defaults.
    pub fn resolve(overrides: Option<&PayloadMetadataOptions>) -> Self {
        let defaults = Self::default();
        let Some(overrides) = overrides else {
            return defaults;
        };

        Self {
            source: overrides.source.clone().unwrap_or(defaults.source),
            sourcetype: overrides.sourcetype.clone().unwrap_or(defaults.sourcetype),
            host: overrides.host.clone(),
            index: overrides.index.clone(),
            time: overrides.time.clone(),
        }
    }
}

/// Fully resolved collector configuration.
#[derive(Clone)]
pub struct Config {
    /// HEC token used to authenticate every request
    pub token: String,

    pub host: String,

    pub port: u16,

    /// URL scheme, `https` unless overridden
    pub protocol: String,

    /// Event endpoint path on the collector
    pub path: String,

    /// Number of events accumulated before a batch is sent
    pub max_batch_count: usize,

    /// Maps a log record to the `event` body
    pub event_formatter: EventFormatter,
}

impl Config {
    /// Full URL of the collector event endpoint.
    pub fn url(&self) -> String {
        format!("{}://{}:{}{}", self.protocol, self.host, self.port, self.path)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("token", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .field("path", &self.path)
            .field("max_batch_count", &self.max_batch_count)
            .finish_non_exhaustive()
    }
}

/// Output of [`resolve`].
#[derive(Debug, Clone)]
pub struct Resolved {
    pub level: String,
    pub config: Config,
    pub payload_metadata: PayloadMetadata,
}

/// Validate caller options and apply defaults.
///
/// # Errors
///
/// Returns `ConfigError` if:
/// - no options were supplied
/// - the `splunk` settings object is missing
/// - the token is missing or empty
/// - `max_batch_count` is 0
pub fn resolve(options: Option<&TransportOptions>) -> Result<Resolved, ConfigError> {
    let options = options.ok_or(ConfigError::MissingOptions)?;
    let settings = options.splunk.as_ref().ok_or(ConfigError::MissingSettings)?;

    let token = match settings.token.as_deref() {
        Some(token) if !token.is_empty() => token.to_string(),
        _ => return Err(ConfigError::MissingToken),
    };

    let max_batch_count = settings.max_batch_count.unwrap_or(DEFAULT_MAX_BATCH_COUNT);
    if max_batch_count == 0 {
        return Err(ConfigError::InvalidBatchCount);
    }
    if max_batch_count > MAX_BATCH_COUNT {
        return Err(ConfigError::BatchCountTooLarge {
            count: max_batch_count,
            max: MAX_BATCH_COUNT,
        });
    }

    let config = Config {
        token,
        host: settings.host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: settings.port.unwrap_or(DEFAULT_PORT),
        protocol: settings
            .protocol
            .clone()
            .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
        path: settings.path.clone().unwrap_or_else(|| DEFAULT_PATH.to_string()),
        max_batch_count,
        event_formatter: settings
            .event_formatter
            .clone()
            .unwrap_or_else(|| Arc::new(default_formatter) as EventFormatter),
    };

    Ok(Resolved {
        level: options
            .level
            .clone()
            .unwrap_or_else(|| DEFAULT_LEVEL.to_string()),
        config,
        payload_metadata: PayloadMetadata::resolve(settings.payload_metadata.as_ref()),
    })
}
