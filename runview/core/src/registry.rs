//! Container Registry
//!
//! Keyed collection of visual containers (tabs, panels, windows). Each
//! container owns its own [`RunRouter`], built from factories supplied per
//! container, and the registry decides which container a new run lands in.
//!
//! # Architecture
//!
//! ```text
//!                    ContainerRegistry
//!          ┌────────────────────────────────────────┐
//!  start ─>│ placement policy ──> ContainerId       │
//!  other ─>│ RunTable<ContainerId> (uid -> id)      │
//!          └──────────┬──────────────────┬──────────┘
//!                     │                  │
//!              ┌──────▼──────┐    ┌──────▼──────┐
//!              │ "Untitled 0"│    │   "fits"    │
//!              │  RunRouter  │    │  RunRouter  │
//!              └─────────────┘    └─────────────┘
//! ```
//!
//! Labels are unique and may be changed; a container's [`ContainerId`] never
//! changes, so run bindings survive a rename.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::document::{Document, RunStart, RunUid};
use crate::relay::DocumentSink;
use crate::router::{ConsumerFactory, HandlerRegistry, RouterError, RunRouter};
use crate::run_table::RunTable;

// =============================================================================
// Errors
// =============================================================================

/// Registry failures
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Another container already uses the label
    #[error("a container labelled '{label}' already exists")]
    NameConflict {
        /// Requested label
        label: String,
    },

    /// Mutation attempted through the read-only view
    #[error("containers view is read-only; {operation} through ContainerRegistry instead")]
    ImmutableView {
        /// Attempted operation
        operation: &'static str,
    },

    /// No container has the label
    #[error("no container labelled '{label}'")]
    UnknownContainer {
        /// Requested label
        label: String,
    },

    /// The container's router refused the document
    #[error(transparent)]
    Router(#[from] RouterError),
}

// =============================================================================
// Identity and policy
// =============================================================================

/// Stable container identity, independent of its label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(u64);

impl ContainerId {
    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "container-{}", self.0)
    }
}

/// Where new runs are placed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlacementMode {
    /// Every run gets a fresh, auto-labelled container
    Paged,
    /// Runs join the current container
    #[default]
    Overplot,
}

impl FromStr for PlacementMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "paged" => Ok(Self::Paged),
            "overplot" => Ok(Self::Overplot),
            other => Err(format!("unknown placement '{other}' (expected paged or overplot)")),
        }
    }
}

/// Which container counts as current for overplotting
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrentContainer {
    /// The focused container; the first one created is focused until
    /// `focus` is called, and destroying it focuses the newest survivor
    #[default]
    Focused,
    /// The most recently created container still alive
    MostRecentlyCreated,
}

/// Placement settings
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementPolicy {
    /// Paged or overplot
    pub mode: PlacementMode,
    /// Current-container rule for overplot
    pub current: CurrentContainer,
}

// =============================================================================
// Host
// =============================================================================

/// Materializes containers on the rendering side
pub trait ContainerHost: Send {
    /// Host-side handle passed to factory providers
    type Handle: Send + 'static;

    /// Create the host-side container
    fn create_container(&mut self, label: &str) -> Self::Handle;

    /// A container's label changed
    fn rename_container(&mut self, _handle: &Self::Handle, _label: &str) {}

    /// A container was destroyed
    fn destroy_container(&mut self, _handle: &Self::Handle) {}
}

/// Builds the factory list for a new container from its host handle
pub type FactoryProvider<Hd> = Box<dyn FnMut(&Hd) -> Vec<Box<dyn ConsumerFactory>> + Send>;

/// One container and the runs rendered into it
pub struct Container<Hd> {
    id: ContainerId,
    label: String,
    handle: Hd,
    router: RunRouter,
    runs: Vec<RunUid>,
}

impl<Hd> Container<Hd> {
    /// Stable identity
    #[must_use]
    pub fn id(&self) -> ContainerId {
        self.id
    }

    /// Current label
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Host-side handle
    #[must_use]
    pub fn handle(&self) -> &Hd {
        &self.handle
    }

    /// This container's router
    #[must_use]
    pub fn router(&self) -> &RunRouter {
        &self.router
    }

    /// Runs placed here, in start order
    #[must_use]
    pub fn runs(&self) -> &[RunUid] {
        &self.runs
    }
}

/// Read-only view over the containers
pub struct ContainersView<'a, Hd> {
    containers: &'a BTreeMap<ContainerId, Container<Hd>>,
    labels: &'a HashMap<String, ContainerId>,
}

impl<'a, Hd> ContainersView<'a, Hd> {
    /// Container by label
    #[must_use]
    pub fn get(&self, label: &str) -> Option<&'a Container<Hd>> {
        self.labels
            .get(label)
            .and_then(|id| self.containers.get(id))
    }

    /// Container by id
    #[must_use]
    pub fn by_id(&self, id: ContainerId) -> Option<&'a Container<Hd>> {
        self.containers.get(&id)
    }

    /// Whether a label is in use
    #[must_use]
    pub fn contains(&self, label: &str) -> bool {
        self.labels.contains_key(label)
    }

    /// Containers in creation order
    pub fn iter(&self) -> std::collections::btree_map::Values<'a, ContainerId, Container<Hd>> {
        self.containers.values()
    }

    /// Labels in creation order
    #[must_use]
    pub fn labels(&self) -> Vec<&'a str> {
        self.containers.values().map(|c| c.label.as_str()).collect()
    }

    /// Number of containers
    #[must_use]
    pub fn len(&self) -> usize {
        self.containers.len()
    }

    /// Whether there are no containers
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    /// Always fails; use [`ContainerRegistry::add_container`]
    pub fn insert(&self, _label: &str) -> Result<(), RegistryError> {
        Err(RegistryError::ImmutableView {
            operation: "add containers",
        })
    }

    /// Always fails; use [`ContainerRegistry::destroy_container`]
    pub fn remove(&self, _label: &str) -> Result<(), RegistryError> {
        Err(RegistryError::ImmutableView {
            operation: "destroy containers",
        })
    }
}

/// Registry counts for logging
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySummary {
    /// Live containers
    pub containers: usize,
    /// Runs holding consumers across all containers
    pub runs: usize,
    /// Runs not yet stopped
    pub active_runs: usize,
    /// Label of the current container, if any
    pub current: Option<String>,
}

// =============================================================================
// Registry
// =============================================================================

/// Containers, their routers and run placement
pub struct ContainerRegistry<H: ContainerHost> {
    host: H,
    provider: FactoryProvider<H::Handle>,
    containers: BTreeMap<ContainerId, Container<H::Handle>>,
    labels: HashMap<String, ContainerId>,
    placement: RunTable<ContainerId>,
    policy: PlacementPolicy,
    focused: Option<ContainerId>,
    next_id: u64,
    handler_registry: HandlerRegistry,
}

impl<H: ContainerHost> ContainerRegistry<H> {
    /// Create an empty registry
    pub fn new<P>(host: H, provider: P) -> Self
    where
        P: FnMut(&H::Handle) -> Vec<Box<dyn ConsumerFactory>> + Send + 'static,
    {
        Self {
            host,
            provider: Box::new(provider),
            containers: BTreeMap::new(),
            labels: HashMap::new(),
            placement: RunTable::new(),
            policy: PlacementPolicy::default(),
            focused: None,
            next_id: 0,
            handler_registry: HandlerRegistry::new(),
        }
    }

    /// Set the placement policy
    #[must_use]
    pub fn with_policy(mut self, policy: PlacementPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the handler registry given to containers created afterwards
    #[must_use]
    pub fn with_handler_registry(mut self, registry: HandlerRegistry) -> Self {
        self.handler_registry = registry;
        self
    }

    /// Change the placement policy
    pub fn set_policy(&mut self, policy: PlacementPolicy) {
        self.policy = policy;
    }

    /// Current placement policy
    #[must_use]
    pub fn policy(&self) -> PlacementPolicy {
        self.policy
    }

    /// The host
    #[must_use]
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Read-only view of the containers
    #[must_use]
    pub fn containers(&self) -> ContainersView<'_, H::Handle> {
        ContainersView {
            containers: &self.containers,
            labels: &self.labels,
        }
    }

    /// Create a container; `None` picks the first free `"Untitled {n}"`
    pub fn add_container(&mut self, label: Option<&str>) -> Result<ContainerId, RegistryError> {
        let label = match label {
            Some(label) if self.labels.contains_key(label) => {
                return Err(RegistryError::NameConflict {
                    label: label.to_string(),
                });
            }
            Some(label) => label.to_string(),
            None => self.untitled_label(),
        };

        let id = ContainerId(self.next_id);
        self.next_id += 1;

        let handle = self.host.create_container(&label);
        let mut router = RunRouter::with_factories((self.provider)(&handle));
        router.set_handler_registry(self.handler_registry.clone());

        info!(container = %label, id = %id, "Container created");
        self.labels.insert(label.clone(), id);
        self.containers.insert(
            id,
            Container {
                id,
                label,
                handle,
                router,
                runs: Vec::new(),
            },
        );
        if self.focused.is_none() {
            self.focused = Some(id);
        }
        Ok(id)
    }

    /// Change a container's label; nothing changes on failure
    pub fn rename(&mut self, old: &str, new: &str) -> Result<(), RegistryError> {
        let id = *self
            .labels
            .get(old)
            .ok_or_else(|| RegistryError::UnknownContainer {
                label: old.to_string(),
            })?;
        if old == new {
            return Ok(());
        }
        if self.labels.contains_key(new) {
            return Err(RegistryError::NameConflict {
                label: new.to_string(),
            });
        }
        let container = self
            .containers
            .get_mut(&id)
            .ok_or_else(|| RegistryError::UnknownContainer {
                label: old.to_string(),
            })?;

        self.labels.remove(old);
        self.labels.insert(new.to_string(), id);
        container.label = new.to_string();
        self.host.rename_container(&container.handle, new);
        info!(id = %id, from = old, to = new, "Container renamed");
        Ok(())
    }

    /// Make a container current for overplotting
    pub fn focus(&mut self, label: &str) -> Result<ContainerId, RegistryError> {
        let id = self.id_of(label)?;
        self.focused = Some(id);
        debug!(container = label, "Container focused");
        Ok(id)
    }

    /// The current container under the active policy
    #[must_use]
    pub fn current(&self) -> Option<ContainerId> {
        match self.policy.current {
            CurrentContainer::Focused => self.focused,
            CurrentContainer::MostRecentlyCreated => self.containers.keys().next_back().copied(),
        }
    }

    /// Container holding a run
    #[must_use]
    pub fn container_of(&self, uid: &RunUid) -> Option<ContainerId> {
        self.placement.group(uid).copied()
    }

    /// Route a document; returns the container it went to
    ///
    /// A `start` is placed by policy; everything else follows its run.
    pub fn route(&mut self, document: &Document) -> Result<ContainerId, RegistryError> {
        if let Document::Start(start) = document {
            self.placement.ensure_new(&start.uid)?;
            let (id, created) = self.place()?;
            let result = self.open_in(id, document, start);
            if created && self.container_of(&start.uid).is_none() {
                debug!(uid = %start.uid, id = %id, "Discarding container of unplaced run");
                self.destroy_container(id);
            }
            return result;
        }

        let uid = self.placement.resolve_open(document)?;
        let id = self
            .placement
            .group(&uid)
            .copied()
            .ok_or_else(|| RouterError::RunClosed {
                uid: uid.clone(),
                document: document.name(),
            })?;

        let container = self
            .containers
            .get_mut(&id)
            .ok_or_else(|| RouterError::RunClosed {
                uid: uid.clone(),
                document: document.name(),
            })?;
        let result = container.router.route(document);
        // Bind what the container's router accepted
        if matches!(result, Ok(()) | Err(RouterError::Handler { .. })) {
            self.placement.bind(document, &uid);
        }
        if matches!(document, Document::Stop(_)) {
            self.placement.close(&uid);
        }
        result?;
        Ok(id)
    }

    /// Route a `start` into the named container, bypassing the policy
    ///
    /// Other documents are routed by their run as usual.
    pub fn route_to(
        &mut self,
        label: &str,
        document: &Document,
    ) -> Result<ContainerId, RegistryError> {
        let Document::Start(start) = document else {
            return self.route(document);
        };
        let id = self.id_of(label)?;
        self.placement.ensure_new(&start.uid)?;
        self.open_in(id, document, start)
    }

    /// Destroy a container and release its runs; returns how many were released
    ///
    /// Unknown ids are ignored. Late documents for released runs fail with
    /// `RunClosed` and their uids stay reserved.
    pub fn destroy_container(&mut self, id: ContainerId) -> usize {
        let Some(mut container) = self.containers.remove(&id) else {
            return 0;
        };
        self.labels.remove(&container.label);
        let released = container.router.evict_all();
        for uid in &container.runs {
            self.placement.evict(uid);
        }
        self.host.destroy_container(&container.handle);

        if self.focused == Some(id) {
            self.focused = self.containers.keys().next_back().copied();
        }
        info!(container = %container.label, id = %id, released, "Container destroyed");
        released
    }

    /// Destroy a container by label
    pub fn destroy_by_label(&mut self, label: &str) -> Result<usize, RegistryError> {
        let id = self.id_of(label)?;
        Ok(self.destroy_container(id))
    }

    /// Counts for logging
    #[must_use]
    pub fn summary(&self) -> RegistrySummary {
        RegistrySummary {
            containers: self.containers.len(),
            runs: self.containers.values().map(|c| c.router.len()).sum(),
            active_runs: self
                .containers
                .values()
                .map(|c| c.router.active_runs().count())
                .sum(),
            current: self
                .current()
                .and_then(|id| self.containers.get(&id))
                .map(|c| c.label.clone()),
        }
    }

    fn id_of(&self, label: &str) -> Result<ContainerId, RegistryError> {
        self.labels
            .get(label)
            .copied()
            .ok_or_else(|| RegistryError::UnknownContainer {
                label: label.to_string(),
            })
    }

    fn untitled_label(&self) -> String {
        let mut n = 0usize;
        loop {
            let label = format!("Untitled {n}");
            if !self.labels.contains_key(&label) {
                return label;
            }
            n += 1;
        }
    }

    /// Container for a new run, and whether it was created for it
    fn place(&mut self) -> Result<(ContainerId, bool), RegistryError> {
        match (self.policy.mode, self.current()) {
            (PlacementMode::Overplot, Some(id)) => Ok((id, false)),
            _ => Ok((self.add_container(None)?, true)),
        }
    }

    fn open_in(
        &mut self,
        id: ContainerId,
        document: &Document,
        start: &RunStart,
    ) -> Result<ContainerId, RegistryError> {
        let container = self
            .containers
            .get_mut(&id)
            .ok_or_else(|| RegistryError::UnknownContainer {
                label: id.to_string(),
            })?;

        let result = container.router.route(document);
        // A failed factory leaves nothing to bind; a failed consumer does.
        if container.router.run_state(&start.uid).is_some() {
            container.runs.push(start.uid.clone());
            self.placement.insert(start.uid.clone(), id);
            info!(uid = %start.uid, container = %container.label, "Run placed");
        }
        result?;
        Ok(id)
    }
}

impl<H: ContainerHost> DocumentSink for ContainerRegistry<H> {
    type Error = RegistryError;

    fn deliver(
        &mut self,
        name: &str,
        document: Value,
        validate: bool,
    ) -> Result<(), RegistryError> {
        let Some(document) = Document::decode(name, document).map_err(RouterError::from)? else {
            debug!(name, "Ignoring unknown document");
            return Ok(());
        };
        if validate {
            document.validate().map_err(RouterError::from)?;
        }
        self.route(&document).map(|_| ())
    }
}
