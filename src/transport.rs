//! The transport the host logging framework talks to.
//!
//! [`Transport::log`] formats a record, wraps it with the payload metadata
//! and hands it to a background worker over an unbounded channel, so the call
//! never blocks. The worker owns the batch accumulator: once it holds
//! `max_batch_count` envelopes it sends them as one delivery, waits for the
//! collector client, then completes every callback of the batch in order and
//! publishes exactly one [`TransportEvent`]. Deliveries never overlap, so
//! completions are observed in the order batches were formed.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::{CollectorClient, DeliveryError, HecClient};
use crate::config::{resolve, Config, ConfigError, PayloadMetadata, Resolved, TransportOptions};
use crate::record::{EventEnvelope, LogRecord};

/// Name the transport registers under with the host framework.
pub const TRANSPORT_NAME: &str = "SplunkStreamEvent";

/// Notifications buffered per subscriber before the slowest one starts lagging.
const NOTIFICATION_CAPACITY: usize = 1_024;

/// Completion handler passed to [`Transport::log`].
///
/// Callbacks run on the batch worker. A callback that panics is caught and
/// logged; the rest of its batch and later batches are unaffected.
pub type Callback = Box<dyn FnOnce(Result<(), DeliveryError>) + Send + 'static>;

/// Notification published once per delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The collector accepted a batch
    Logged { batch_id: Uuid, count: usize },

    /// The collector client reported a failure for a batch
    Error {
        batch_id: Uuid,
        count: usize,
        error: DeliveryError,
    },
}

impl TransportEvent {
    /// Event name as host frameworks know it: `"logged"` or `"error"`.
    pub fn name(&self) -> &'static str {
        match self {
            TransportEvent::Logged { .. } => "logged",
            TransportEvent::Error { .. } => "error",
        }
    }

    pub fn batch_id(&self) -> Uuid {
        match self {
            TransportEvent::Logged { batch_id, .. } | TransportEvent::Error { batch_id, .. } => {
                *batch_id
            }
        }
    }
}

/// What a host logging framework needs from a transport.
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Level the framework filters at before calling [`Transport::log`].
    fn level(&self) -> &str;

    fn log(&self, level: &str, message: &str, meta: Map<String, Value>, callback: Callback);
}

/// A queued event waiting for its batch to fill.
struct Pending {
    envelope: EventEnvelope,
    callback: Callback,
}

enum Command {
    Record(Pending),
    Flush(oneshot::Sender<()>),
}

/// Splunk HTTP Event Collector transport.
///
/// Must be created inside a Tokio runtime; the batch worker is spawned on it.
///
/// # Example
///
/// ```no_run
/// use serde_json::Map;
/// use splunk_transport::config::{SplunkSettings, TransportOptions};
/// use splunk_transport::transport::{EventTransport, Transport};
///
/// #[tokio::main]
/// async fn main() {
///     let options = TransportOptions::with_settings(SplunkSettings::with_token("token"));
///     let transport = EventTransport::new(Some(&options)).expect("invalid options");
///
///     transport.log("info", "service started", Map::new(), Box::new(|result| {
///         if let Err(e) = result {
///             eprintln!("delivery failed: {}", e);
///         }
///     }));
///
///     transport.close().await;
/// }
/// ```
pub struct EventTransport {
    level: String,

    config: Config,

    payload_metadata: PayloadMetadata,

    /// Sending half of the worker channel
    tx: mpsc::UnboundedSender<Command>,

    /// Publishes `logged`/`error` notifications
    events: broadcast::Sender<TransportEvent>,

    worker: JoinHandle<()>,
}

impl EventTransport {
    /// Resolve `options` and connect a [`HecClient`] to the configured collector.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the options are invalid, the HTTP client cannot
    /// be built, or no Tokio runtime is running.
    pub fn new(options: Option<&TransportOptions>) -> Result<Self, ConfigError> {
        let resolved = resolve(options)?;
        let client = HecClient::new(&resolved.config)?;
        Self::start(resolved, Arc::new(client))
    }

    /// Resolve `options` and deliver through an injected collector client.
    pub fn with_client(
        options: Option<&TransportOptions>,
        client: Arc<dyn CollectorClient>,
    ) -> Result<Self, ConfigError> {
        Self::start(resolve(options)?, client)
    }

    fn start(resolved: Resolved, client: Arc<dyn CollectorClient>) -> Result<Self, ConfigError> {
        let runtime = Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;
        let Resolved {
            level,
            config,
            payload_metadata,
        } = resolved;

        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let worker = runtime.spawn(batch_task(
            rx,
            client,
            config.max_batch_count,
            events.clone(),
        ));

        info!(
            host = %config.host,
            port = config.port,
            max_batch_count = config.max_batch_count,
            level = %level,
            "Splunk transport started"
        );

        Ok(Self {
            level,
            config,
            payload_metadata,
            tx,
            events,
            worker,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn payload_metadata(&self) -> &PayloadMetadata {
        &self.payload_metadata
    }

    /// Receive `logged`/`error` notifications for every delivery from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Queue a record for delivery. Never blocks; `callback` runs once the
    /// batch holding this record has been sent (or has failed).
    pub fn log_record(&self, record: LogRecord, callback: Callback) {
        let envelope = EventEnvelope::from_record(
            &record,
            &self.config.event_formatter,
            &self.payload_metadata,
        );

        let command = Command::Record(Pending { envelope, callback });
        if let Err(mpsc::error::SendError(Command::Record(pending))) = self.tx.send(command) {
            warn!("Batch worker is gone, dropping log record");
            (pending.callback)(Err(DeliveryError::Closed));
            let _ = self.events.send(TransportEvent::Error {
                batch_id: Uuid::new_v4(),
                count: 1,
                error: DeliveryError::Closed,
            });
        }
    }

    /// Send whatever is buffered now, without waiting for the batch to fill.
    ///
    /// Resolves after that delivery has completed. Does nothing if the buffer
    /// is empty.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    /// Stop accepting records, deliver what is still buffered and wait for the
    /// worker to finish.
    pub async fn close(self) {
        let Self { tx, worker, .. } = self;
        drop(tx);

        if let Err(e) = worker.await {
            warn!(error = %e, "Batch worker panicked during shutdown");
        }
    }
}

impl Transport for EventTransport {
    fn name(&self) -> &str {
        TRANSPORT_NAME
    }

    fn level(&self) -> &str {
        &self.level
    }

    fn log(&self, level: &str, message: &str, meta: Map<String, Value>, callback: Callback) {
        self.log_record(LogRecord::new(level, message).with_meta(meta), callback);
    }
}

/// Worker loop: accumulates envelopes and delivers them in batches.
async fn batch_task(
    mut rx: mpsc::UnboundedReceiver<Command>,
    client: Arc<dyn CollectorClient>,
    max_batch_count: usize,
    events: broadcast::Sender<TransportEvent>,
) {
    let mut pending: Vec<Pending> = Vec::new();

    while let Some(command) = rx.recv().await {
        match command {
            Command::Record(item) => {
                pending.push(item);

                if pending.len() >= max_batch_count {
                    debug!(
                        batch_size = pending.len(),
                        "Flushing batch: count threshold reached"
                    );
                    let batch = std::mem::take(&mut pending);
                    deliver(client.as_ref(), batch, &events).await;
                }
            }
            Command::Flush(done) => {
                if !pending.is_empty() {
                    debug!(batch_size = pending.len(), "Manual flush");
                    let batch = std::mem::take(&mut pending);
                    deliver(client.as_ref(), batch, &events).await;
                }
                let _ = done.send(());
            }
        }
    }

    if !pending.is_empty() {
        info!(
            remaining = pending.len(),
            "Transport closed, flushing remaining events"
        );
        deliver(client.as_ref(), pending, &events).await;
    }
}

/// Send one batch and report the outcome to its callbacks and subscribers.
async fn deliver(
    client: &dyn CollectorClient,
    batch: Vec<Pending>,
    events: &broadcast::Sender<TransportEvent>,
) {
    let batch_id = Uuid::new_v4();
    let count = batch.len();
    let (envelopes, callbacks): (Vec<EventEnvelope>, Vec<Callback>) = batch
        .into_iter()
        .map(|pending| (pending.envelope, pending.callback))
        .unzip();

    match client.send(envelopes).await {
        Ok(()) => {
            debug!(batch_id = %batch_id, count = count, "Batch delivered");
            for callback in callbacks {
                complete(callback, Ok(()));
            }
            let _ = events.send(TransportEvent::Logged { batch_id, count });
        }
        Err(e) => {
            error!(batch_id = %batch_id, count = count, error = %e, "Failed to deliver batch");
            for callback in callbacks {
                complete(callback, Err(e.clone()));
            }
            let _ = events.send(TransportEvent::Error {
                batch_id,
                count,
                error: e,
            });
        }
    }
}

/// Run one callback without letting a panic in caller code take the worker down.
fn complete(callback: Callback, result: Result<(), DeliveryError>) {
    if panic::catch_unwind(AssertUnwindSafe(move || callback(result))).is_err() {
        warn!("Log callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PayloadMetadataOptions, SplunkSettings};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::time::{sleep, timeout};

    /// Records every send; fails the first `failures` of them.
    #[derive(Default)]
    struct RecordingClient {
        sends: Mutex<Vec<Vec<EventEnvelope>>>,
        failures: AtomicUsize,
    }

    impl RecordingClient {
        fn failing(failures: usize) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                ..Self::default()
            }
        }

        fn sends(&self) -> Vec<Vec<EventEnvelope>> {
            self.sends.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CollectorClient for RecordingClient {
        async fn send(&self, envelopes: Vec<EventEnvelope>) -> Result<(), DeliveryError> {
            self.sends.lock().unwrap().push(envelopes);

            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(DeliveryError::Status {
                    status: 503,
                    message: "busy".to_string(),
                });
            }
            Ok(())
        }
    }

    /// Panics inside `send`, taking the batch worker down with it.
    struct PanickingClient;

    #[async_trait]
    impl CollectorClient for PanickingClient {
        async fn send(&self, _envelopes: Vec<EventEnvelope>) -> Result<(), DeliveryError> {
            panic!("collector client exploded");
        }
    }

    fn options(max_batch_count: usize) -> TransportOptions {
        TransportOptions::with_settings(SplunkSettings {
            max_batch_count: Some(max_batch_count),
            ..SplunkSettings::with_token("foo")
        })
    }

    fn start(
        options: &TransportOptions,
        client: &Arc<RecordingClient>,
    ) -> EventTransport {
        EventTransport::with_client(Some(options), client.clone()).expect("valid options")
    }

    fn log_msg(
        transport: &EventTransport,
        message: &str,
    ) -> oneshot::Receiver<Result<(), DeliveryError>> {
        let (tx, rx) = oneshot::channel();
        transport.log(
            "info",
            message,
            Map::new(),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx
    }

    async fn completion(
        rx: oneshot::Receiver<Result<(), DeliveryError>>,
    ) -> Result<(), DeliveryError> {
        timeout(Duration::from_secs(1), rx)
            .await
            .expect("callback should fire")
            .expect("callback should not be dropped")
    }

    async fn next_event(rx: &mut broadcast::Receiver<TransportEvent>) -> TransportEvent {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("notification should arrive")
            .expect("channel open")
    }

    fn messages(batch: &[EventEnvelope]) -> Vec<String> {
        batch
            .iter()
            .map(|e| e.event["message"]["msg"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_construction_requires_token() {
        let client: Arc<dyn CollectorClient> = Arc::new(RecordingClient::default());

        assert!(EventTransport::with_client(None, client.clone()).is_err());
        assert!(
            EventTransport::with_client(Some(&TransportOptions::default()), client.clone())
                .is_err()
        );

        let no_token = TransportOptions::with_settings(SplunkSettings::default());
        assert!(matches!(
            EventTransport::with_client(Some(&no_token), client.clone()),
            Err(ConfigError::MissingToken)
        ));

        let empty_token = TransportOptions::with_settings(SplunkSettings::with_token(""));
        assert!(EventTransport::with_client(Some(&empty_token), client).is_err());
    }

    #[test]
    fn test_construction_outside_runtime() {
        let client: Arc<dyn CollectorClient> = Arc::new(RecordingClient::default());
        let result = EventTransport::with_client(Some(&options(1)), client);
        assert!(matches!(result, Err(ConfigError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_minimal_config_accessors() {
        let options = TransportOptions::with_settings(SplunkSettings::with_token("foo"));
        let transport = EventTransport::new(Some(&options)).expect("valid options");

        assert_eq!(transport.name(), "SplunkStreamEvent");
        assert_eq!(transport.level(), "info");
        assert_eq!(transport.config().token, "foo");
        assert_eq!(transport.config().host, "localhost");
        assert_eq!(transport.config().port, 8088);
        assert_eq!(transport.config().max_batch_count, 1);
        assert_eq!(transport.payload_metadata(), &PayloadMetadata::default());
    }

    #[tokio::test]
    async fn test_level_override() {
        let options = TransportOptions {
            level: Some("debug".to_string()),
            ..options(1)
        };
        let client = Arc::new(RecordingClient::default());
        let transport = start(&options, &client);
        assert_eq!(transport.level(), "debug");
    }

    #[tokio::test]
    async fn test_unbatched_send_per_record() {
        let options = TransportOptions::with_settings(SplunkSettings {
            payload_metadata: Some(PayloadMetadataOptions {
                index: Some("main".to_string()),
                ..Default::default()
            }),
            ..SplunkSettings::with_token("foo")
        });
        let client = Arc::new(RecordingClient::default());
        let transport = start(&options, &client);
        let mut events = transport.subscribe();

        let mut meta = Map::new();
        meta.insert("user".to_string(), json!("alice"));
        let (tx, rx) = oneshot::channel();
        transport.log(
            "warn",
            "first",
            meta,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        assert_eq!(completion(rx).await, Ok(()));
        assert_eq!(next_event(&mut events).await.name(), "logged");

        assert_eq!(completion(log_msg(&transport, "second")).await, Ok(()));
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Logged { count: 1, .. }
        ));

        let sends = client.sends();
        assert_eq!(sends.len(), 2);
        assert_eq!(sends[0].len(), 1);

        let first = serde_json::to_value(&sends[0][0]).unwrap();
        assert_eq!(
            first,
            json!({
                "event": {
                    "message": { "msg": "first", "meta": { "user": "alice" } },
                    "severity": "warn"
                },
                "source": "winston",
                "sourcetype": "winston-splunk-logger",
                "index": "main"
            })
        );
    }

    #[tokio::test]
    async fn test_batch_waits_for_threshold() {
        let client = Arc::new(RecordingClient::default());
        let transport = start(&options(3), &client);
        let mut events = transport.subscribe();

        let first = log_msg(&transport, "one");
        let second = log_msg(&transport, "two");

        sleep(Duration::from_millis(50)).await;
        assert!(client.sends().is_empty());
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        let third = log_msg(&transport, "three");
        for rx in [first, second, third] {
            assert_eq!(completion(rx).await, Ok(()));
        }

        let event = next_event(&mut events).await;
        assert!(matches!(event, TransportEvent::Logged { count: 3, .. }));

        // Barrier: the worker has finished everything queued before this.
        transport.flush().await;
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        let sends = client.sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(messages(&sends[0]), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_batches_keep_call_order() {
        let client = Arc::new(RecordingClient::default());
        let transport = start(&options(2), &client);
        let mut events = transport.subscribe();

        let receivers: Vec<_> = (0..4)
            .map(|i| log_msg(&transport, &format!("msg-{}", i)))
            .collect();
        for rx in receivers {
            assert_eq!(completion(rx).await, Ok(()));
        }

        let first = next_event(&mut events).await;
        let second = next_event(&mut events).await;
        assert_ne!(first.batch_id(), second.batch_id());

        let sends = client.sends();
        assert_eq!(sends.len(), 2);
        assert_eq!(messages(&sends[0]), vec!["msg-0", "msg-1"]);
        assert_eq!(messages(&sends[1]), vec!["msg-2", "msg-3"]);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_reported_not_raised() {
        let client = Arc::new(RecordingClient::failing(1));
        let transport = start(&options(1), &client);
        let mut events = transport.subscribe();

        let result = completion(log_msg(&transport, "lost")).await;
        assert_eq!(
            result,
            Err(DeliveryError::Status {
                status: 503,
                message: "busy".to_string(),
            })
        );

        let event = next_event(&mut events).await;
        assert_eq!(event.name(), "error");
        assert!(matches!(
            event,
            TransportEvent::Error { count: 1, error: DeliveryError::Status { status: 503, .. }, .. }
        ));

        // Still usable, and the failed record is not retried.
        assert_eq!(completion(log_msg(&transport, "kept")).await, Ok(()));
        assert_eq!(next_event(&mut events).await.name(), "logged");

        let sends = client.sends();
        assert_eq!(sends.len(), 2);
        assert_eq!(messages(&sends[1]), vec!["kept"]);
    }

    #[tokio::test]
    async fn test_failed_batch_reaches_every_callback() {
        let client = Arc::new(RecordingClient::failing(1));
        let transport = start(&options(2), &client);

        let first = log_msg(&transport, "a");
        let second = log_msg(&transport, "b");

        assert!(completion(first).await.is_err());
        assert!(completion(second).await.is_err());
    }

    #[tokio::test]
    async fn test_log_after_worker_died_reports_closed() {
        let client: Arc<dyn CollectorClient> = Arc::new(PanickingClient);
        let transport = EventTransport::with_client(Some(&options(1)), client).unwrap();
        let mut events = transport.subscribe();

        // The worker panics mid-delivery, so this callback is dropped unrun.
        let lost = log_msg(&transport, "lost");
        let lost = timeout(Duration::from_secs(1), lost)
            .await
            .expect("worker should have stopped");
        assert!(lost.is_err());

        // Returns once the worker's queue is gone.
        timeout(Duration::from_secs(1), transport.flush())
            .await
            .expect("flush should not hang on a dead worker");

        let result = completion(log_msg(&transport, "after")).await;
        assert_eq!(result, Err(DeliveryError::Closed));
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Error { count: 1, error: DeliveryError::Closed, .. }
        ));
    }

    #[tokio::test]
    async fn test_panicking_callback_keeps_worker_alive() {
        let client = Arc::new(RecordingClient::default());
        let transport = start(&options(2), &client);
        let mut events = transport.subscribe();

        transport.log(
            "info",
            "boom",
            Map::new(),
            Box::new(|_| panic!("callback exploded")),
        );
        let sibling = log_msg(&transport, "sibling");

        assert_eq!(completion(sibling).await, Ok(()));
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Logged { count: 2, .. }
        ));

        let later = log_msg(&transport, "later");
        transport.flush().await;
        assert_eq!(completion(later).await, Ok(()));
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Logged { count: 1, .. }
        ));

        let sends = client.sends();
        assert_eq!(sends.len(), 2);
        assert_eq!(messages(&sends[1]), vec!["later"]);
    }

    #[tokio::test]
    async fn test_max_batch_count_accepted_without_preallocation() {
        let client = Arc::new(RecordingClient::default());
        let transport = start(&options(crate::config::MAX_BATCH_COUNT), &client);

        let first = log_msg(&transport, "only");
        transport.flush().await;
        assert_eq!(completion(first).await, Ok(()));
        assert_eq!(client.sends().len(), 1);

        let too_large: Arc<dyn CollectorClient> = Arc::new(RecordingClient::default());
        assert!(matches!(
            EventTransport::with_client(Some(&options(usize::MAX)), too_large),
            Err(ConfigError::BatchCountTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_manual_flush() {
        let client = Arc::new(RecordingClient::default());
        let transport = start(&options(5), &client);
        let mut events = transport.subscribe();

        transport.flush().await;
        assert!(client.sends().is_empty());

        let first = log_msg(&transport, "a");
        let second = log_msg(&transport, "b");
        transport.flush().await;

        assert_eq!(completion(first).await, Ok(()));
        assert_eq!(completion(second).await, Ok(()));
        assert!(matches!(
            events.try_recv(),
            Ok(TransportEvent::Logged { count: 2, .. })
        ));
        assert_eq!(client.sends().len(), 1);
    }

    #[tokio::test]
    async fn test_close_flushes_remaining() {
        let client = Arc::new(RecordingClient::default());
        let transport = start(&options(10), &client);
        let mut events = transport.subscribe();

        let receivers: Vec<_> = ["x", "y", "z"]
            .iter()
            .map(|m| log_msg(&transport, m))
            .collect();
        transport.close().await;

        for rx in receivers {
            assert_eq!(completion(rx).await, Ok(()));
        }
        assert!(matches!(
            events.try_recv(),
            Ok(TransportEvent::Logged { count: 3, .. })
        ));
        assert_eq!(messages(&client.sends()[0]), vec!["x", "y", "z"]);
    }

    #[tokio::test]
    async fn test_custom_formatter_used_for_event_body() {
        let options = TransportOptions::with_settings(SplunkSettings {
            event_formatter: Some(Arc::new(|record: &LogRecord| {
                json!(format!("[{}] {}", record.level, record.message))
            })),
            ..SplunkSettings::with_token("foo")
        });
        let client = Arc::new(RecordingClient::default());
        let transport = start(&options, &client);

        assert_eq!(completion(log_msg(&transport, "custom")).await, Ok(()));
        assert_eq!(client.sends()[0][0].event, json!("[info] custom"));
    }

    #[test]
    fn test_transport_event_names() {
        let id = Uuid::new_v4();
        let logged = TransportEvent::Logged {
            batch_id: id,
            count: 1,
        };
        let failed = TransportEvent::Error {
            batch_id: id,
            count: 1,
            error: DeliveryError::Closed,
        };
        assert_eq!(logged.name(), "logged");
        assert_eq!(failed.name(), "error");
        assert_eq!(failed.batch_id(), id);
    }
}
