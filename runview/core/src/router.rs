//! Run Router
//!
//! Routes documents to per-run consumer groups. Factories are called once per
//! `start`; the consumers they return receive every document of that run.
//! Factories may also return sub-factories, which are called for each new
//! descriptor of the run and build consumers scoped to that event stream.
//!
//! # Example
//!
//! ```
//! use runview_core::router::{ConsumerSet, FactoryError, RunRouter};
//! use runview_core::document::{Document, RunStart};
//!
//! let mut router = RunRouter::new();
//! router.add_factory(|_start: &RunStart| Ok::<_, FactoryError>(ConsumerSet::new()));
//!
//! router.route(&Document::Start(RunStart::new("run-1"))).unwrap();
//! assert_eq!(router.len(), 1);
//! ```

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dispatch::{dispatch, DocumentHandler, HandlerError};
use crate::document::{Document, DocumentError, DocumentName, EventDescriptor, RunStart, RunUid};
use crate::relay::DocumentSink;
use crate::run_table::{RunReference, RunState, RunTable};

// =============================================================================
// Errors
// =============================================================================

/// Routing failures
///
/// Router state is unchanged when any of them is returned, except
/// [`RouterError::Handler`]: the document was accepted and reached the
/// consumers ahead of the one that failed.
#[derive(Debug, Error)]
pub enum RouterError {
    /// A `start` reused a uid already seen by this router
    #[error("run {uid} has already been started")]
    DuplicateRun {
        /// Offending uid
        uid: RunUid,
    },

    /// A document pointed at a run, descriptor or resource nobody announced
    #[error("no run is known for {reference}")]
    UnknownRun {
        /// What could not be resolved
        reference: RunReference,
    },

    /// A document arrived for a stopped or released run
    #[error("run {uid} is closed; {document} rejected")]
    RunClosed {
        /// Run the document belongs to
        uid: RunUid,
        /// Rejected document kind
        document: DocumentName,
    },

    /// A factory refused to build consumers
    #[error("factory {index} failed for run {uid}: {source}")]
    FactoryFailed {
        /// Run being opened (or whose descriptor triggered a sub-factory)
        uid: RunUid,
        /// Position of the factory in registration order
        index: usize,
        /// Factory error
        source: FactoryError,
    },

    /// A consumer failed while handling a document
    #[error("consumer failed in run {uid}: {source}")]
    Handler {
        /// Run the document belongs to
        uid: RunUid,
        /// Consumer error
        source: HandlerError,
    },

    /// The document body could not be decoded or validated
    #[error("invalid document: {0}")]
    InvalidDocument(#[from] DocumentError),
}

/// Error returned by a factory or sub-factory
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{message}")]
pub struct FactoryError {
    message: String,
}

impl FactoryError {
    /// Create a factory error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

// =============================================================================
// Factories
// =============================================================================

/// Boxed consumer
pub type Consumer = Box<dyn DocumentHandler>;

/// Builds consumers for one event stream of a run
pub trait SubFactory: Send {
    /// Called once for each new descriptor of the run
    fn build(&mut self, descriptor: &EventDescriptor) -> Result<Vec<Consumer>, FactoryError>;
}

impl<F> SubFactory for F
where
    F: FnMut(&EventDescriptor) -> Result<Vec<Consumer>, FactoryError> + Send,
{
    fn build(&mut self, descriptor: &EventDescriptor) -> Result<Vec<Consumer>, FactoryError> {
        self(descriptor)
    }
}

/// What a factory returns for a run
#[derive(Default)]
pub struct ConsumerSet {
    /// Consumers receiving every document of the run
    pub consumers: Vec<Consumer>,
    /// Sub-factories called for each descriptor of the run
    pub subfactories: Vec<Box<dyn SubFactory>>,
}

impl ConsumerSet {
    /// Empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a consumer
    #[must_use]
    pub fn with_consumer(mut self, consumer: impl DocumentHandler + 'static) -> Self {
        self.consumers.push(Box::new(consumer));
        self
    }

    /// Add a sub-factory
    #[must_use]
    pub fn with_subfactory(mut self, subfactory: impl SubFactory + 'static) -> Self {
        self.subfactories.push(Box::new(subfactory));
        self
    }

    /// Append another set, keeping order
    pub fn extend(&mut self, other: ConsumerSet) {
        self.consumers.extend(other.consumers);
        self.subfactories.extend(other.subfactories);
    }

    /// Whether the set holds nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty() && self.subfactories.is_empty()
    }
}

/// Builds the consumers for a new run
pub trait ConsumerFactory: Send {
    /// Called exactly once per run, with its start document
    fn build(&mut self, start: &RunStart) -> Result<ConsumerSet, FactoryError>;
}

impl<F> ConsumerFactory for F
where
    F: FnMut(&RunStart) -> Result<ConsumerSet, FactoryError> + Send,
{
    fn build(&mut self, start: &RunStart) -> Result<ConsumerSet, FactoryError> {
        self(start)
    }
}

/// Resource spec -> handler name, passed through to whoever fills externals
pub type HandlerRegistry = BTreeMap<String, String>;

// =============================================================================
// Consumer Group
// =============================================================================

struct Stream {
    descriptor: String,
    consumers: Vec<Consumer>,
}

/// Consumers owned by one run
pub struct ConsumerGroup {
    start: RunStart,
    consumers: Vec<Consumer>,
    subfactories: Vec<Box<dyn SubFactory>>,
    streams: Vec<Stream>,
}

impl ConsumerGroup {
    fn new(start: RunStart, set: ConsumerSet) -> Self {
        Self {
            start,
            consumers: set.consumers,
            subfactories: set.subfactories,
            streams: Vec::new(),
        }
    }

    /// Start document of the run
    #[must_use]
    pub fn start(&self) -> &RunStart {
        &self.start
    }

    /// Run-wide consumers, in construction order
    #[must_use]
    pub fn consumers(&self) -> &[Consumer] {
        &self.consumers
    }

    /// Consumers built by sub-factories for one descriptor
    #[must_use]
    pub fn stream_consumers(&self, descriptor: &str) -> &[Consumer] {
        self.streams
            .iter()
            .find(|s| s.descriptor == descriptor)
            .map_or(&[][..], |s| s.consumers.as_slice())
    }

    /// Run-wide plus per-stream consumers
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len() + self.streams.iter().map(|s| s.consumers.len()).sum::<usize>()
    }

    fn dispatch(&mut self, document: &Document) -> Result<(), HandlerError> {
        for consumer in &mut self.consumers {
            dispatch(consumer.as_mut(), document)?;
        }

        let stream_key = match document {
            // Stream consumers were handed their descriptor when built.
            Document::Start(_) | Document::Descriptor(_) => return Ok(()),
            Document::Event(e) => Some(e.descriptor.as_str()),
            Document::EventPage(p) => Some(p.descriptor.as_str()),
            _ => None,
        };

        for stream in &mut self.streams {
            if stream_key.is_some_and(|key| key != stream.descriptor) {
                continue;
            }
            for consumer in &mut stream.consumers {
                dispatch(consumer.as_mut(), document)?;
            }
        }
        Ok(())
    }

    fn open_stream(&mut self, descriptor: &EventDescriptor) -> Result<(), (usize, FactoryError)> {
        let mut consumers = Vec::new();
        for (index, subfactory) in self.subfactories.iter_mut().enumerate() {
            consumers.extend(subfactory.build(descriptor).map_err(|e| (index, e))?);
        }
        if consumers.is_empty() {
            return Ok(());
        }
        self.streams.push(Stream {
            descriptor: descriptor.uid.clone(),
            consumers,
        });
        Ok(())
    }

    fn replay_stream(&mut self, descriptor: &EventDescriptor) -> Result<(), HandlerError> {
        let start = Document::Start(self.start.clone());
        let descriptor_doc = Document::Descriptor(descriptor.clone());
        let Some(stream) = self
            .streams
            .iter_mut()
            .find(|s| s.descriptor == descriptor.uid)
        else {
            return Ok(());
        };
        for consumer in &mut stream.consumers {
            dispatch(consumer.as_mut(), &start)?;
            dispatch(consumer.as_mut(), &descriptor_doc)?;
        }
        Ok(())
    }
}

// =============================================================================
// Router
// =============================================================================

/// Per-run consumer lifecycle engine
#[derive(Default)]
pub struct RunRouter {
    factories: Vec<Box<dyn ConsumerFactory>>,
    runs: RunTable<ConsumerGroup>,
    handler_registry: HandlerRegistry,
}

impl RunRouter {
    /// Router with no factories
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Router with the given factories, in order
    #[must_use]
    pub fn with_factories(factories: Vec<Box<dyn ConsumerFactory>>) -> Self {
        Self {
            factories,
            ..Self::default()
        }
    }

    /// Append a factory; it applies to runs started afterwards
    pub fn add_factory(&mut self, factory: impl ConsumerFactory + 'static) {
        self.factories.push(Box::new(factory));
    }

    /// Set the resource spec -> handler map
    pub fn set_handler_registry(&mut self, registry: HandlerRegistry) {
        self.handler_registry = registry;
    }

    /// The resource spec -> handler map
    #[must_use]
    pub fn handler_registry(&self) -> &HandlerRegistry {
        &self.handler_registry
    }

    /// Route one document
    pub fn route(&mut self, document: &Document) -> Result<(), RouterError> {
        if let Document::Start(start) = document {
            return self.open_run(document, start);
        }

        let uid = self.runs.resolve_open(document)?;
        debug!(uid = %uid, document = %document.name(), "Routing document");
        let closed = || RouterError::RunClosed {
            uid: uid.clone(),
            document: document.name(),
        };

        // Sub-factories run before the descriptor is bound, so a failure
        // leaves the stream unknown.
        if let Document::Descriptor(descriptor) = document {
            self.runs
                .group_mut(&uid)
                .ok_or_else(closed)?
                .open_stream(descriptor)
                .map_err(|(index, source)| RouterError::FactoryFailed {
                    uid: uid.clone(),
                    index,
                    source,
                })?;
        }

        self.runs.bind(document, &uid);
        let group = self.runs.group_mut(&uid).ok_or_else(closed)?;

        match document {
            Document::Descriptor(descriptor) => {
                group
                    .replay_stream(descriptor)
                    .map_err(|source| RouterError::Handler {
                        uid: uid.clone(),
                        source,
                    })?;
            }
            Document::Resource(resource) => {
                if !self.handler_registry.is_empty()
                    && !self.handler_registry.contains_key(&resource.spec)
                {
                    warn!(
                        uid = %uid,
                        spec = %resource.spec,
                        "No handler registered for resource spec"
                    );
                }
            }
            _ => {}
        }

        let result = group.dispatch(document).map_err(|source| RouterError::Handler {
            uid: uid.clone(),
            source,
        });

        if let Document::Stop(stop) = document {
            self.runs.close(&uid);
            info!(
                uid = %uid,
                exit_status = %stop.exit_status,
                documents = self.runs.document_count(&uid),
                "Run closed"
            );
        }
        result
    }

    /// Release a run's consumers; later documents for it fail with `RunClosed`
    pub fn evict(&mut self, uid: &RunUid) -> Option<ConsumerGroup> {
        let group = self.runs.evict(uid)?;
        info!(uid = %uid, "Run evicted");
        Some(group)
    }

    /// Release every run
    pub fn evict_all(&mut self) -> usize {
        let uids: Vec<RunUid> = self.runs.uids().cloned().collect();
        uids.iter().filter(|uid| self.evict(uid).is_some()).count()
    }

    /// Consumer group of a run that has not been evicted
    #[must_use]
    pub fn group(&self, uid: &RunUid) -> Option<&ConsumerGroup> {
        self.runs.group(uid)
    }

    /// Lifecycle state, `None` if never seen
    #[must_use]
    pub fn run_state(&self, uid: &RunUid) -> Option<RunState> {
        self.runs.state(uid)
    }

    /// Runs that have not been stopped or evicted, in start order
    pub fn active_runs(&self) -> impl Iterator<Item = &RunUid> {
        self.runs.active_runs()
    }

    /// Runs holding a consumer group, in start order
    pub fn runs(&self) -> impl Iterator<Item = &RunUid> {
        self.runs.uids()
    }

    /// Number of runs holding a consumer group
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Whether no run holds a consumer group
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    fn open_run(&mut self, document: &Document, start: &RunStart) -> Result<(), RouterError> {
        self.runs.ensure_new(&start.uid)?;

        let mut set = ConsumerSet::new();
        for (index, factory) in self.factories.iter_mut().enumerate() {
            let built = factory
                .build(start)
                .map_err(|source| RouterError::FactoryFailed {
                    uid: start.uid.clone(),
                    index,
                    source,
                })?;
            set.extend(built);
        }

        let mut group = ConsumerGroup::new(start.clone(), set);
        let result = group
            .dispatch(document)
            .map_err(|source| RouterError::Handler {
                uid: start.uid.clone(),
                source,
            });

        info!(
            uid = %start.uid,
            scan_id = ?start.scan_id,
            consumers = group.consumer_count(),
            "Run opened"
        );
        self.runs.insert(start.uid.clone(), group);
        result
    }
}

impl DocumentSink for RunRouter {
    type Error = RouterError;

    fn deliver(&mut self, name: &str, document: Value, validate: bool) -> Result<(), RouterError> {
        let Some(document) = Document::decode(name, document)? else {
            debug!(name, "Ignoring unknown document");
            return Ok(());
        };
        if validate {
            document.validate()?;
        }
        self.route(&document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::HandlerResult;
    use crate::document::{EventPage, Resource, RunStop};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Tap {
        tag: String,
        log: Log,
    }

    impl Tap {
        fn boxed(tag: &str, log: &Log) -> Consumer {
            Box::new(Self {
                tag: tag.to_string(),
                log: Arc::clone(log),
            })
        }

        fn push(&self, what: &str) {
            self.log.lock().push(format!("{}:{what}", self.tag));
        }
    }

    impl DocumentHandler for Tap {
        fn start(&mut self, _doc: &RunStart) -> HandlerResult {
            self.push("start");
            Ok(())
        }

        fn descriptor(&mut self, _doc: &EventDescriptor) -> HandlerResult {
            self.push("descriptor");
            Ok(())
        }

        fn event_page(&mut self, doc: &EventPage) -> HandlerResult {
            self.push(&format!("page{:?}", doc.seq_num));
            Ok(())
        }

        fn resource(&mut self, _doc: &Resource) -> HandlerResult {
            self.push("resource");
            Ok(())
        }

        fn stop(&mut self, _doc: &RunStop) -> HandlerResult {
            self.push("stop");
            Ok(())
        }
    }

    fn tapped_router(log: &Log) -> RunRouter {
        let mut router = RunRouter::new();
        let first = Arc::clone(log);
        router.add_factory(move |_: &RunStart| {
            Ok::<_, FactoryError>(ConsumerSet::new().with_consumer(Tap {
                tag: "a".into(),
                log: Arc::clone(&first),
            }))
        });
        let second = Arc::clone(log);
        router.add_factory(move |_: &RunStart| {
            Ok::<_, FactoryError>(ConsumerSet::new().with_consumer(Tap {
                tag: "b".into(),
                log: Arc::clone(&second),
            }))
        });
        router
    }

    fn page(descriptor: &EventDescriptor, seq: u64) -> Document {
        Document::EventPage(EventPage::from_columns(
            descriptor.uid.clone(),
            seq,
            [("x", vec![json!(seq)])],
        ))
    }

    #[test]
    fn test_full_run_lifecycle() {
        let log = Log::default();
        let mut router = tapped_router(&log);
        let run = RunUid::new("r1");
        let descriptor = EventDescriptor::new(&run, "primary");

        router.route(&RunStart::new(run.clone()).into()).unwrap();
        router.route(&descriptor.clone().into()).unwrap();
        router.route(&page(&descriptor, 1)).unwrap();
        router.route(&RunStop::new(&run).into()).unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                "a:start",
                "b:start",
                "a:descriptor",
                "b:descriptor",
                "a:page[1]",
                "b:page[1]",
                "a:stop",
                "b:stop"
            ]
        );
        assert_eq!(router.run_state(&run), Some(RunState::Closed));
        assert!(router.group(&run).is_some());
        assert_eq!(router.active_runs().count(), 0);
    }

    #[test]
    fn test_factory_called_once_per_run() {
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let mut router = RunRouter::new();
        router.add_factory(move |_: &RunStart| {
            *counter.lock() += 1;
            Ok::<_, FactoryError>(ConsumerSet::new())
        });

        let start: Document = RunStart::new("r1").into();
        router.route(&start).unwrap();
        assert!(matches!(
            router.route(&start),
            Err(RouterError::DuplicateRun { .. })
        ));
        assert_eq!(*calls.lock(), 1);
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn test_factory_failure_stores_nothing() {
        let log = Log::default();
        let mut router = tapped_router(&log);
        router.add_factory(|_: &RunStart| Err::<ConsumerSet, _>(FactoryError::new("no figure")));

        let err = router.route(&RunStart::new("r1").into()).unwrap_err();
        assert!(matches!(err, RouterError::FactoryFailed { index: 2, .. }));
        assert!(router.is_empty());
        assert!(log.lock().is_empty());

        let stop: Document = RunStop::new(&RunUid::new("r1")).into();
        assert!(matches!(
            router.route(&stop),
            Err(RouterError::UnknownRun { .. })
        ));
    }

    #[test]
    fn test_event_for_unknown_descriptor() {
        let mut router = RunRouter::new();
        router.route(&RunStart::new("r1").into()).unwrap();
        let stray = EventDescriptor::new(&RunUid::new("r1"), "primary");
        assert!(matches!(
            router.route(&page(&stray, 1)),
            Err(RouterError::UnknownRun {
                reference: RunReference::Descriptor(_)
            })
        ));
    }

    #[test]
    fn test_document_after_stop_rejected() {
        let log = Log::default();
        let mut router = tapped_router(&log);
        let run = RunUid::new("r1");
        let descriptor = EventDescriptor::new(&run, "primary");
        router.route(&RunStart::new(run.clone()).into()).unwrap();
        router.route(&descriptor.clone().into()).unwrap();
        router.route(&RunStop::new(&run).into()).unwrap();
        let before = log.lock().len();

        assert!(matches!(
            router.route(&page(&descriptor, 2)),
            Err(RouterError::RunClosed { .. })
        ));
        assert_eq!(log.lock().len(), before);
    }

    #[test]
    fn test_evicted_uid_stays_reserved() {
        let mut router = RunRouter::new();
        let run = RunUid::new("r1");
        let descriptor = EventDescriptor::new(&run, "primary");
        router.route(&RunStart::new(run.clone()).into()).unwrap();
        router.route(&descriptor.clone().into()).unwrap();
        assert!(router.evict(&run).is_some());
        assert!(router.group(&run).is_none());
        assert_eq!(router.run_state(&run), Some(RunState::Evicted));

        assert!(matches!(
            router.route(&RunStart::new(run.clone()).into()),
            Err(RouterError::DuplicateRun { .. })
        ));
        assert!(matches!(
            router.route(&RunStop::new(&run).into()),
            Err(RouterError::RunClosed { .. })
        ));
        assert!(matches!(
            router.route(&page(&descriptor, 1)),
            Err(RouterError::RunClosed { uid, .. }) if uid == run
        ));
    }

    #[test]
    fn test_failed_subfactory_leaves_descriptor_unbound() {
        let log = Log::default();
        let sub_log = Arc::clone(&log);
        let mut router = RunRouter::new();
        router.add_factory(move |_: &RunStart| {
            let sub_log = Arc::clone(&sub_log);
            Ok::<_, FactoryError>(ConsumerSet::new().with_subfactory(
                move |descriptor: &EventDescriptor| -> Result<Vec<Consumer>, FactoryError> {
                    if descriptor.name.as_deref() == Some("primary") {
                        Ok(vec![Tap::boxed("sub", &sub_log)])
                    } else {
                        Err(FactoryError::new("no axes for this stream"))
                    }
                },
            ))
        });

        let run = RunUid::new("r1");
        let broken = EventDescriptor::new(&run, "monitor");
        router.route(&RunStart::new(run.clone()).into()).unwrap();
        assert!(matches!(
            router.route(&broken.clone().into()),
            Err(RouterError::FactoryFailed { index: 0, .. })
        ));

        assert!(matches!(
            router.route(&page(&broken, 1)),
            Err(RouterError::UnknownRun {
                reference: RunReference::Descriptor(_)
            })
        ));
        assert!(log.lock().is_empty());
        assert_eq!(router.group(&run).unwrap().consumer_count(), 0);

        // The run itself carries on
        let primary = EventDescriptor::new(&run, "primary");
        router.route(&primary.clone().into()).unwrap();
        router.route(&page(&primary, 1)).unwrap();
        assert_eq!(*log.lock(), vec!["sub:start", "sub:descriptor", "sub:page[1]"]);
    }

    #[test]
    fn test_subfactory_consumers_follow_their_stream() {
        let log = Log::default();
        let sub_log = Arc::clone(&log);
        let mut router = RunRouter::new();
        router.add_factory(move |_: &RunStart| {
            let sub_log = Arc::clone(&sub_log);
            Ok::<_, FactoryError>(ConsumerSet::new().with_subfactory(
                move |descriptor: &EventDescriptor| -> Result<Vec<Consumer>, FactoryError> {
                    if descriptor.name.as_deref() == Some("primary") {
                        Ok(vec![Tap::boxed("sub", &sub_log)])
                    } else {
                        Ok(Vec::new())
                    }
                },
            ))
        });

        let run = RunUid::new("r1");
        let primary = EventDescriptor::new(&run, "primary");
        let baseline = EventDescriptor::new(&run, "baseline");
        router.route(&RunStart::new(run.clone()).into()).unwrap();
        router.route(&primary.clone().into()).unwrap();
        router.route(&baseline.clone().into()).unwrap();
        router.route(&page(&baseline, 1)).unwrap();
        router.route(&page(&primary, 1)).unwrap();
        router.route(&RunStop::new(&run).into()).unwrap();

        assert_eq!(
            *log.lock(),
            vec!["sub:start", "sub:descriptor", "sub:page[1]", "sub:stop"]
        );
        let group = router.group(&run).unwrap();
        assert_eq!(group.consumer_count(), 1);
        assert_eq!(group.stream_consumers(&primary.uid).len(), 1);
        assert_eq!(group.stream_consumers(&baseline.uid).len(), 0);
    }

    #[test]
    fn test_deliver_ignores_unknown_names() {
        let mut router = RunRouter::new();
        assert!(router.deliver("bulk_events", json!({}), true).is_ok());
        assert!(router.is_empty());
    }

    #[test]
    fn test_deliver_validates_pages() {
        let mut router = RunRouter::new();
        let run = RunUid::new("r1");
        let descriptor = EventDescriptor::new(&run, "primary");
        router.deliver("start", json!({"uid": "r1"}), true).unwrap();
        router
            .deliver("descriptor", serde_json::to_value(&descriptor).unwrap(), true)
            .unwrap();

        let mut ragged =
            EventPage::from_columns(descriptor.uid.clone(), 1, [("x", vec![json!(1)])]);
        ragged.data.insert("y".into(), vec![]);
        let body = serde_json::to_value(&ragged).unwrap();

        assert!(matches!(
            router.deliver("event_page", body.clone(), true),
            Err(RouterError::InvalidDocument(DocumentError::RaggedPage { .. }))
        ));
        assert!(router.deliver("event_page", body, false).is_ok());
    }

    #[test]
    fn test_handler_error_surfaces() {
        struct Grumpy;
        impl DocumentHandler for Grumpy {
            fn start(&mut self, _doc: &RunStart) -> HandlerResult {
                Err(HandlerError::new("grumpy", DocumentName::Start, "nope"))
            }
        }

        let mut router = RunRouter::new();
        router.add_factory(|_: &RunStart| {
            Ok::<_, FactoryError>(ConsumerSet::new().with_consumer(Grumpy))
        });
        let err = router.route(&RunStart::new("r1").into()).unwrap_err();
        assert!(matches!(err, RouterError::Handler { .. }));
        assert_eq!(router.len(), 1);
    }
}
