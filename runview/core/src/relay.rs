//! Cross-Thread Relay
//!
//! Hands `(name, document, validate)` triples from producer threads to the
//! single thread that owns the router, registry and artists.
//!
//! # Modes
//!
//! - **Queued**: a bounded tokio mpsc channel. Producers wait only for queue
//!   capacity, never for the consumer to finish processing. The owning thread
//!   calls [`RelayReceiver::drain`] once per loop tick, or awaits
//!   [`RelayReceiver::run`].
//! - **Direct**: no owning loop exists, so `submit` runs the sink right away
//!   on the calling thread, behind a mutex.
//!
//! [`RelayMode::Auto`] picks `Queued` when a render loop is active and
//! `Direct` otherwise.
//!
//! # Ordering
//!
//! Envelopes are delivered exactly once and in submission order for any one
//! producer. Every envelope carries a per-relay sequence number.
//!
//! ```
//! use runview_core::relay::Relay;
//! use serde_json::json;
//!
//! let (handle, mut receiver) = Relay::queued(16);
//! handle.try_submit("start", json!({"uid": "r1"}), false).unwrap();
//!
//! let mut router = runview_core::RunRouter::new();
//! let report = receiver.drain(&mut router);
//! assert_eq!(report.delivered, 1);
//! ```

use std::error::Error as StdError;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tracing::{debug, error};

use crate::document::{Document, DocumentError};
use crate::render_loop;

/// Default queue capacity
pub const DEFAULT_CAPACITY: usize = 1024;

// =============================================================================
// Sink
// =============================================================================

/// Something that accepts documents on the owning thread
pub trait DocumentSink {
    /// Delivery failure
    type Error: StdError;

    /// Accept one document; unknown names are ignored
    fn deliver(&mut self, name: &str, document: Value, validate: bool) -> Result<(), Self::Error>;
}

// =============================================================================
// Configuration
// =============================================================================

/// How submissions reach the sink
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// `Queued` if a render loop is active, else `Direct`
    #[default]
    Auto,
    /// Bounded channel drained by the owning thread
    Queued,
    /// Synchronous call on the submitting thread
    Direct,
}

impl RelayMode {
    /// Resolve `Auto` against the process-wide render loop
    #[must_use]
    pub fn resolve(self) -> Self {
        match self {
            Self::Auto if render_loop::is_active() => Self::Queued,
            Self::Auto => Self::Direct,
            other => other,
        }
    }
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Queued => "queued",
            Self::Direct => "direct",
        })
    }
}

impl FromStr for RelayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "queued" => Ok(Self::Queued),
            "direct" => Ok(Self::Direct),
            other => Err(format!("unknown relay mode '{other}' (expected auto, queued or direct)")),
        }
    }
}

/// Relay settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Queue capacity; producers wait when it is reached
    pub capacity: usize,
    /// Delivery mode
    pub mode: RelayMode,
    /// Upper bound on envelopes delivered per drain; 0 means unlimited
    pub max_per_tick: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            mode: RelayMode::Auto,
            max_per_tick: 0,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Submission failures; a document is never dropped silently
#[derive(Debug, Error)]
pub enum RelayError {
    /// Every receiver is gone
    #[error("relay is closed; {name} was not delivered")]
    Closed {
        /// Document name
        name: String,
    },

    /// Queue at capacity (only from `try_submit`)
    #[error("relay queue is full; {name} was not queued")]
    Full {
        /// Document name
        name: String,
    },

    /// The sink rejected a directly delivered document
    #[error("direct delivery of {name} failed: {source}")]
    Delivery {
        /// Document name
        name: String,
        /// Sink error
        source: Box<dyn StdError + Send + Sync>,
    },

    /// A typed document could not be encoded
    #[error(transparent)]
    Encode(#[from] DocumentError),
}

// =============================================================================
// Relay
// =============================================================================

/// One queued submission
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    /// Per-relay sequence number
    pub seq: u64,
    /// Document name
    pub name: String,
    /// Document body
    pub document: Value,
    /// Whether the sink should validate the body
    pub validate: bool,
}

type DirectFn = dyn Fn(&str, Value, bool) -> Result<(), RelayError> + Send + Sync;

#[derive(Clone)]
enum Route {
    Queued(mpsc::Sender<Envelope>),
    Direct(Arc<DirectFn>),
}

/// Producer side; cheap to clone and safe to share across threads
#[derive(Clone)]
pub struct RelayHandle {
    route: Route,
    next_seq: Arc<AtomicU64>,
}

/// Result of [`Relay::with_mode`]
pub enum RelayDelivery<S> {
    /// The owning thread drains `receiver` into `sink`
    Queued {
        /// Producer side
        handle: RelayHandle,
        /// Consumer side
        receiver: RelayReceiver,
        /// The sink, handed back to the owning thread
        sink: S,
    },
    /// Producers call into the sink directly
    Direct {
        /// Producer side
        handle: RelayHandle,
        /// The sink, shared with the handle
        sink: Arc<Mutex<S>>,
    },
}

/// Relay constructors
pub struct Relay;

impl Relay {
    /// Bounded queue of the given capacity (at least 1)
    #[must_use]
    pub fn queued(capacity: usize) -> (RelayHandle, RelayReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = RelayHandle {
            route: Route::Queued(tx),
            next_seq: Arc::new(AtomicU64::new(0)),
        };
        let receiver = RelayReceiver {
            rx,
            max_per_tick: 0,
            total: DrainReport::default(),
        };
        (handle, receiver)
    }

    /// Synchronous delivery on the submitting thread
    ///
    /// The sink is shared behind a mutex; a sink that submits back into the
    /// same direct relay from `deliver` deadlocks.
    pub fn direct<S>(sink: S) -> (RelayHandle, Arc<Mutex<S>>)
    where
        S: DocumentSink + Send + 'static,
        S::Error: Send + Sync + 'static,
    {
        let shared = Arc::new(Mutex::new(sink));
        let target = Arc::clone(&shared);
        let deliver: Arc<DirectFn> = Arc::new(move |name: &str, document: Value, validate: bool| {
            target
                .lock()
                .deliver(name, document, validate)
                .map_err(|e| RelayError::Delivery {
                    name: name.to_string(),
                    source: Box::new(e),
                })
        });

        let handle = RelayHandle {
            route: Route::Direct(deliver),
            next_seq: Arc::new(AtomicU64::new(0)),
        };
        (handle, shared)
    }

    /// Build a relay from settings, resolving `Auto`
    pub fn with_mode<S>(config: &RelayConfig, sink: S) -> RelayDelivery<S>
    where
        S: DocumentSink + Send + 'static,
        S::Error: Send + Sync + 'static,
    {
        match config.mode.resolve() {
            RelayMode::Direct => {
                debug!("Relay in direct mode");
                let (handle, sink) = Self::direct(sink);
                RelayDelivery::Direct { handle, sink }
            }
            _ => {
                debug!(capacity = config.capacity, "Relay in queued mode");
                let (handle, receiver) = Self::queued(config.capacity);
                RelayDelivery::Queued {
                    handle,
                    receiver: receiver.with_max_per_tick(config.max_per_tick),
                    sink,
                }
            }
        }
    }
}

impl RelayHandle {
    /// Resolved mode of this relay
    #[must_use]
    pub fn mode(&self) -> RelayMode {
        match self.route {
            Route::Queued(_) => RelayMode::Queued,
            Route::Direct(_) => RelayMode::Direct,
        }
    }

    /// Whether the receiver is gone
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match &self.route {
            Route::Queued(tx) => tx.is_closed(),
            Route::Direct(_) => false,
        }
    }

    /// Submit from any thread, waiting for queue capacity if needed
    ///
    /// A thread that is driving an async runtime must not block, so there
    /// a queued submit does not wait and fails with `Full` at capacity;
    /// use [`RelayHandle::submit_async`] to wait instead.
    pub fn submit(
        &self,
        name: impl Into<String>,
        document: Value,
        validate: bool,
    ) -> Result<(), RelayError> {
        if matches!(self.route, Route::Queued(_)) && Handle::try_current().is_ok() {
            return self.try_submit(name, document, validate);
        }

        let envelope = self.envelope(name.into(), document, validate);
        match &self.route {
            Route::Queued(tx) => tx
                .blocking_send(envelope)
                .map_err(|e| RelayError::Closed { name: e.0.name }),
            Route::Direct(deliver) => {
                deliver(&envelope.name, envelope.document, envelope.validate)
            }
        }
    }

    /// Submit from async code
    pub async fn submit_async(
        &self,
        name: impl Into<String>,
        document: Value,
        validate: bool,
    ) -> Result<(), RelayError> {
        let envelope = self.envelope(name.into(), document, validate);
        match &self.route {
            Route::Queued(tx) => tx
                .send(envelope)
                .await
                .map_err(|e| RelayError::Closed { name: e.0.name }),
            Route::Direct(deliver) => {
                deliver(&envelope.name, envelope.document, envelope.validate)
            }
        }
    }

    /// Submit without waiting; fails with `Full` at capacity
    pub fn try_submit(
        &self,
        name: impl Into<String>,
        document: Value,
        validate: bool,
    ) -> Result<(), RelayError> {
        let envelope = self.envelope(name.into(), document, validate);
        match &self.route {
            Route::Queued(tx) => tx.try_send(envelope).map_err(|e| match e {
                TrySendError::Full(env) => RelayError::Full { name: env.name },
                TrySendError::Closed(env) => RelayError::Closed { name: env.name },
            }),
            Route::Direct(deliver) => {
                deliver(&envelope.name, envelope.document, envelope.validate)
            }
        }
    }

    /// Encode and submit a typed document
    pub fn submit_document(&self, document: &Document, validate: bool) -> Result<(), RelayError> {
        self.submit(document.name().as_str(), document.to_value()?, validate)
    }

    fn envelope(&self, name: String, document: Value, validate: bool) -> Envelope {
        Envelope {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            name,
            document,
            validate,
        }
    }
}

/// Outcome of a drain
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Envelopes the sink accepted
    pub delivered: usize,
    /// Envelopes the sink rejected (logged)
    pub failed: usize,
    /// Every handle has been dropped and the queue is empty
    pub disconnected: bool,
}

impl DrainReport {
    /// Envelopes taken off the queue
    #[must_use]
    pub fn processed(&self) -> usize {
        self.delivered + self.failed
    }
}

/// Consumer side, owned by the render thread
pub struct RelayReceiver {
    rx: mpsc::Receiver<Envelope>,
    max_per_tick: usize,
    total: DrainReport,
}

impl RelayReceiver {
    /// Cap the envelopes delivered per [`RelayReceiver::drain`]; 0 means unlimited
    #[must_use]
    pub fn with_max_per_tick(mut self, max_per_tick: usize) -> Self {
        self.max_per_tick = max_per_tick;
        self
    }

    /// Envelopes waiting in the queue
    #[must_use]
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Totals since the receiver was created
    #[must_use]
    pub fn totals(&self) -> DrainReport {
        self.total
    }

    /// Deliver what is queued right now, in arrival order
    ///
    /// Sink errors are logged and counted; the drain continues.
    pub fn drain<S: DocumentSink + ?Sized>(&mut self, sink: &mut S) -> DrainReport {
        let mut report = DrainReport::default();
        while self.max_per_tick == 0 || report.processed() < self.max_per_tick {
            match self.rx.try_recv() {
                Ok(envelope) => self.deliver(sink, envelope, &mut report),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    report.disconnected = true;
                    break;
                }
            }
        }
        report
    }

    /// Deliver until every handle is dropped
    pub async fn run<S: DocumentSink + ?Sized>(&mut self, sink: &mut S) -> DrainReport {
        let mut report = DrainReport::default();
        while let Some(envelope) = self.rx.recv().await {
            self.deliver(sink, envelope, &mut report);
        }
        report.disconnected = true;
        debug!(
            delivered = report.delivered,
            failed = report.failed,
            "Relay closed"
        );
        report
    }

    fn deliver<S: DocumentSink + ?Sized>(
        &mut self,
        sink: &mut S,
        envelope: Envelope,
        report: &mut DrainReport,
    ) {
        let Envelope {
            seq,
            name,
            document,
            validate,
        } = envelope;

        match sink.deliver(&name, document, validate) {
            Ok(()) => {
                report.delivered += 1;
                self.total.delivered += 1;
            }
            Err(e) => {
                error!(seq, name = %name, error = %e, "Document delivery failed");
                report.failed += 1;
                self.total.failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Error)]
    #[error("rejected {0}")]
    struct Rejected(String);

    #[derive(Default)]
    struct Collect {
        seen: Vec<(String, Value)>,
    }

    impl DocumentSink for Collect {
        type Error = Rejected;

        fn deliver(
            &mut self,
            name: &str,
            document: Value,
            _validate: bool,
        ) -> Result<(), Rejected> {
            if name == "bad" {
                return Err(Rejected(name.to_string()));
            }
            self.seen.push((name.to_string(), document));
            Ok(())
        }
    }

    fn indices(sink: &Collect) -> Vec<u64> {
        sink.seen
            .iter()
            .filter_map(|(_, doc)| doc["i"].as_u64())
            .collect()
    }

    #[test]
    fn test_order_preserved_under_backpressure() {
        let (handle, mut receiver) = Relay::queued(4);
        let producer = std::thread::spawn(move || {
            for i in 0..200u64 {
                handle.submit("event", json!({ "i": i }), false).unwrap();
            }
        });

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let mut sink = Collect::default();
        let report = runtime.block_on(receiver.run(&mut sink));
        producer.join().unwrap();

        assert_eq!(report.delivered, 200);
        assert!(report.disconnected);
        assert_eq!(indices(&sink), (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn test_drain_logs_and_continues() {
        let (handle, mut receiver) = Relay::queued(8);
        handle.try_submit("event", json!({"i": 0}), false).unwrap();
        handle.try_submit("bad", json!({}), false).unwrap();
        handle.try_submit("event", json!({"i": 1}), false).unwrap();

        let mut sink = Collect::default();
        let report = receiver.drain(&mut sink);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);
        assert!(!report.disconnected);
        assert_eq!(indices(&sink), vec![0, 1]);
    }

    #[test]
    fn test_drain_respects_tick_budget() {
        let (handle, receiver) = Relay::queued(8);
        let mut receiver = receiver.with_max_per_tick(2);
        for i in 0..5 {
            handle.try_submit("event", json!({ "i": i }), false).unwrap();
        }

        let mut sink = Collect::default();
        assert_eq!(receiver.drain(&mut sink).delivered, 2);
        assert_eq!(receiver.pending(), 3);
        assert_eq!(receiver.drain(&mut sink).delivered, 2);
        assert_eq!(receiver.drain(&mut sink).delivered, 1);
        assert_eq!(indices(&sink), vec![0, 1, 2, 3, 4]);
        assert_eq!(receiver.totals().delivered, 5);
    }

    #[test]
    fn test_try_submit_full() {
        let (handle, _receiver) = Relay::queued(1);
        handle.try_submit("event", json!({}), false).unwrap();
        let err = handle.try_submit("event", json!({}), false).unwrap_err();
        assert!(matches!(err, RelayError::Full { .. }));
    }

    #[test]
    fn test_closed_relay_reports_error() {
        let (handle, receiver) = Relay::queued(4);
        drop(receiver);
        assert!(handle.is_closed());
        let err = handle.submit("start", json!({}), false).unwrap_err();
        assert!(matches!(err, RelayError::Closed { ref name } if name == "start"));
    }

    #[test]
    fn test_submit_inside_runtime_does_not_block() {
        let (handle, mut receiver) = Relay::queued(1);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();

        let (first, second) = runtime.block_on(async {
            (
                handle.submit("event", json!({"i": 0}), false),
                handle.submit("event", json!({"i": 1}), false),
            )
        });
        assert!(first.is_ok());
        assert!(matches!(second, Err(RelayError::Full { ref name }) if name == "event"));

        let mut sink = Collect::default();
        assert_eq!(receiver.drain(&mut sink).delivered, 1);
        assert_eq!(indices(&sink), vec![0]);

        drop(receiver);
        let closed = runtime.block_on(async { handle.submit("start", json!({}), false) });
        assert!(matches!(closed, Err(RelayError::Closed { .. })));
    }

    #[test]
    fn test_disconnect_seen_by_drain() {
        let (handle, mut receiver) = Relay::queued(4);
        handle.try_submit("event", json!({"i": 9}), false).unwrap();
        drop(handle);

        let mut sink = Collect::default();
        let report = receiver.drain(&mut sink);
        assert_eq!(report.delivered, 1);
        assert!(report.disconnected);
    }

    #[test]
    fn test_direct_mode_delivers_synchronously() {
        let (handle, sink) = Relay::direct(Collect::default());
        assert_eq!(handle.mode(), RelayMode::Direct);

        let worker = handle.clone();
        std::thread::spawn(move || worker.submit("event", json!({"i": 3}), false))
            .join()
            .unwrap()
            .unwrap();
        assert_eq!(indices(&sink.lock()), vec![3]);

        let err = handle.submit("bad", json!({}), false).unwrap_err();
        assert!(matches!(err, RelayError::Delivery { .. }));
    }

    #[test]
    fn test_with_mode_explicit() {
        let config = RelayConfig {
            mode: RelayMode::Queued,
            ..RelayConfig::default()
        };
        match Relay::with_mode(&config, Collect::default()) {
            RelayDelivery::Queued { handle, .. } => assert_eq!(handle.mode(), RelayMode::Queued),
            RelayDelivery::Direct { .. } => panic!("expected queued relay"),
        }

        let config = RelayConfig {
            mode: RelayMode::Direct,
            ..RelayConfig::default()
        };
        assert!(matches!(
            Relay::with_mode(&config, Collect::default()),
            RelayDelivery::Direct { .. }
        ));
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("Queued".parse::<RelayMode>(), Ok(RelayMode::Queued));
        assert_eq!("direct".parse::<RelayMode>(), Ok(RelayMode::Direct));
        assert!("sometimes".parse::<RelayMode>().is_err());
    }

    #[tokio::test]
    async fn test_async_submit_and_run() {
        let (handle, mut receiver) = Relay::queued(2);
        let producer = tokio::spawn(async move {
            for i in 0..10u64 {
                handle.submit_async("event", json!({ "i": i }), false).await.unwrap();
            }
        });

        let mut sink = Collect::default();
        let report = receiver.run(&mut sink).await;
        producer.await.unwrap();
        assert_eq!(report.delivered, 10);
        assert_eq!(indices(&sink), (0..10).collect::<Vec<_>>());
    }
}
