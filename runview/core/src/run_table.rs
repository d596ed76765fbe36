//! Run Table
//!
//! Keyed run lifecycle shared by the router (`uid -> consumer group`) and the
//! registry (`uid -> container`). Tracks each run's state, resolves the
//! foreign keys of non-start documents back to a run, and keeps every uid it
//! has seen reserved so a later `start` with the same uid is rejected.
//!
//! ```text
//! start ──> Open ──stop──> Closed
//!             │              │
//!             └────evict─────┴──> Evicted
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::document::{Document, RunUid};
use crate::router::RouterError;

/// Lifecycle state of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Receiving documents
    Open,
    /// `stop` received; the group is kept for inspection
    Closed,
    /// Group released; the uid stays reserved
    Evicted,
}

impl RunState {
    /// Whether documents are still accepted
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }
}

/// What an unresolvable document pointed at
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunReference {
    /// A run uid (`run_start` of a descriptor, resource or stop)
    Run(RunUid),
    /// A descriptor uid (from an event)
    Descriptor(String),
    /// A resource uid (from a datum)
    Resource(String),
}

impl fmt::Display for RunReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run(uid) => write!(f, "run {uid}"),
            Self::Descriptor(uid) => write!(f, "descriptor {uid}"),
            Self::Resource(uid) => write!(f, "resource {uid}"),
        }
    }
}

struct RunEntry<G> {
    state: RunState,
    group: Option<G>,
    documents: u64,
}

/// Run lifecycle table holding one `G` per open or closed run
pub struct RunTable<G> {
    runs: HashMap<RunUid, RunEntry<G>>,
    order: Vec<RunUid>,
    descriptors: HashMap<String, RunUid>,
    resources: HashMap<String, RunUid>,
}

impl<G> Default for RunTable<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G> RunTable<G> {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self {
            runs: HashMap::new(),
            order: Vec::new(),
            descriptors: HashMap::new(),
            resources: HashMap::new(),
        }
    }

    /// Fail with `DuplicateRun` if the uid was ever seen
    pub fn ensure_new(&self, uid: &RunUid) -> Result<(), RouterError> {
        if self.runs.contains_key(uid) {
            return Err(RouterError::DuplicateRun { uid: uid.clone() });
        }
        Ok(())
    }

    /// Store a freshly opened run
    ///
    /// Callers check [`RunTable::ensure_new`] first; inserting a seen uid
    /// replaces its entry.
    pub fn insert(&mut self, uid: RunUid, group: G) {
        self.order.push(uid.clone());
        self.runs.insert(
            uid,
            RunEntry {
                state: RunState::Open,
                group: Some(group),
                documents: 1,
            },
        );
    }

    /// Resolve the run a document belongs to, whatever its state
    pub fn resolve(&self, document: &Document) -> Result<RunUid, RouterError> {
        let known = |uid: &RunUid| {
            if self.runs.contains_key(uid) {
                Ok(uid.clone())
            } else {
                Err(RouterError::UnknownRun {
                    reference: RunReference::Run(uid.clone()),
                })
            }
        };

        match document {
            Document::Start(doc) => Ok(doc.uid.clone()),
            Document::Descriptor(doc) => known(&doc.run_start),
            Document::Stop(doc) => known(&doc.run_start),
            Document::Resource(doc) => match &doc.run_start {
                Some(uid) => known(uid),
                None => Err(RouterError::UnknownRun {
                    reference: RunReference::Resource(doc.uid.clone()),
                }),
            },
            Document::Event(doc) => self.by_descriptor(&doc.descriptor),
            Document::EventPage(doc) => self.by_descriptor(&doc.descriptor),
            Document::Datum(doc) => self.by_resource(&doc.resource),
            Document::DatumPage(doc) => self.by_resource(&doc.resource),
        }
    }

    /// Resolve a non-start document to an open run
    ///
    /// Closed and evicted runs yield `RunClosed`.
    pub fn resolve_open(&self, document: &Document) -> Result<RunUid, RouterError> {
        let uid = self.resolve(document)?;
        match self.state(&uid) {
            Some(RunState::Open) => Ok(uid),
            _ => Err(RouterError::RunClosed {
                uid,
                document: document.name(),
            }),
        }
    }

    /// Cache the foreign keys a document introduces and count it
    pub fn bind(&mut self, document: &Document, uid: &RunUid) {
        match document {
            Document::Descriptor(doc) => {
                self.descriptors.insert(doc.uid.clone(), uid.clone());
            }
            Document::Resource(doc) => {
                self.resources.insert(doc.uid.clone(), uid.clone());
            }
            _ => {}
        }
        if let Some(entry) = self.runs.get_mut(uid) {
            entry.documents += 1;
        }
    }

    /// Mark a run closed; returns false if it was not open
    pub fn close(&mut self, uid: &RunUid) -> bool {
        match self.runs.get_mut(uid) {
            Some(entry) if entry.state.is_open() => {
                entry.state = RunState::Closed;
                true
            }
            _ => false,
        }
    }

    /// Release a run's group, keeping its uid reserved
    ///
    /// Descriptor and resource keys stay mapped so late documents of the
    /// run resolve to it and fail with `RunClosed`.
    pub fn evict(&mut self, uid: &RunUid) -> Option<G> {
        let entry = self.runs.get_mut(uid)?;
        entry.state = RunState::Evicted;
        self.order.retain(|u| u != uid);
        entry.group.take()
    }

    /// State of a run, `None` if never seen
    #[must_use]
    pub fn state(&self, uid: &RunUid) -> Option<RunState> {
        self.runs.get(uid).map(|e| e.state)
    }

    /// Group of a run that has not been evicted
    #[must_use]
    pub fn group(&self, uid: &RunUid) -> Option<&G> {
        self.runs.get(uid).and_then(|e| e.group.as_ref())
    }

    /// Mutable group of a run that has not been evicted
    pub fn group_mut(&mut self, uid: &RunUid) -> Option<&mut G> {
        self.runs.get_mut(uid).and_then(|e| e.group.as_mut())
    }

    /// Documents accepted for a run, including its start
    #[must_use]
    pub fn document_count(&self, uid: &RunUid) -> u64 {
        self.runs.get(uid).map_or(0, |e| e.documents)
    }

    /// Runs holding a group, in start order
    pub fn uids(&self) -> impl Iterator<Item = &RunUid> {
        self.order.iter()
    }

    /// Open runs, in start order
    pub fn active_runs(&self) -> impl Iterator<Item = &RunUid> {
        self.order
            .iter()
            .filter(|uid| self.state(uid).is_some_and(RunState::is_open))
    }

    /// Number of runs holding a group
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no run holds a group
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn by_descriptor(&self, descriptor: &str) -> Result<RunUid, RouterError> {
        self.descriptors
            .get(descriptor)
            .cloned()
            .ok_or_else(|| RouterError::UnknownRun {
                reference: RunReference::Descriptor(descriptor.to_string()),
            })
    }

    fn by_resource(&self, resource: &str) -> Result<RunUid, RouterError> {
        self.resources
            .get(resource)
            .cloned()
            .ok_or_else(|| RouterError::UnknownRun {
                reference: RunReference::Resource(resource.to_string()),
            })
    }
}
