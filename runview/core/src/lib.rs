//! Runview Core - Live Document Routing for Run Visualization
//!
//! This crate routes the document stream of a data-acquisition process to
//! live visualization consumers. It creates a consumer group per run, places
//! each run in a display container, and keeps every artist's series growing
//! incrementally. It never draws anything itself: a rendering surface plugs
//! in through [`ContainerHost`] and [`RenderHook`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  Acquisition thread(s)       │
//! │  RelayHandle::submit(name,   │
//! │        document, validate)   │
//! └──────────────┬───────────────┘
//!                │  queued (tokio mpsc) or direct (mutex)
//! ┌──────────────┴──────────────────────────────────────────────────┐
//! │  Owning thread (render loop)                                     │
//! │                                                                  │
//! │  RelayReceiver::drain ──▶ ContainerRegistry                      │
//! │                           │  placement: paged / overplot         │
//! │                           ├─ Container "3 [0a1b2c3d]"            │
//! │                           │    └─ RunRouter                      │
//! │                           │         ├─ run A: ConsumerGroup      │
//! │                           │         │    ├─ LineArtist ──▶ hook  │
//! │                           │         │    └─ stream consumers     │
//! │                           │         └─ run B: ConsumerGroup      │
//! │                           └─ Container ...                       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Document`]: the eight document kinds a run is made of
//! - [`DocumentHandler`] / [`dispatch`]: per-kind callbacks with page and
//!   item equivalence
//! - [`RunRouter`]: factories, per-run consumer groups, run lifecycle
//! - [`Relay`]: cross-thread mailbox into the owning thread
//! - [`ContainerRegistry`]: labelled containers and run placement
//! - [`LineArtist`]: incremental x/y series from expressions over pages
//! - [`RunviewConfig`]: TOML plus environment configuration
//!
//! # Module Overview
//!
//! - [`document`]: document types, decoding and validation
//! - [`dispatch`]: handler trait and dispatch
//! - [`run_table`]: run bookkeeping shared by router and registry
//! - [`router`]: the run router
//! - [`relay`]: queued and direct delivery
//! - [`render_loop`]: process-wide owning-thread runtime
//! - [`registry`]: container registry
//! - [`artist`]: incremental artists and render hooks
//! - [`expr`]: sandboxed column expressions
//! - [`label`]: label templates
//! - [`plots`]: configured line plots as a consumer factory
//! - [`config`]: configuration loading

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod artist;
pub mod config;
pub mod dispatch;
pub mod document;
pub mod expr;
pub mod label;
pub mod plots;
pub mod registry;
pub mod relay;
pub mod render_loop;
pub mod router;
pub mod run_table;

// Re-exports for convenience
pub use artist::{
    ArtistError, ArtistOptions, Derive, LineArtist, NoRender, RenderHook, Series, SeriesRecorder,
};
pub use dispatch::{dispatch, DocumentHandler, Granularity, HandlerError, HandlerResult};
pub use document::{
    Datum, DatumPage, Document, DocumentError, DocumentName, Event, EventDescriptor, EventPage,
    Resource, RunStart, RunStop, RunUid,
};
pub use expr::{Expr, ExpressionError};
pub use label::format_label;
pub use plots::{LinePlotFactory, PlotSpec};
pub use run_table::{RunState, RunTable};

// Router exports
pub use router::{
    Consumer, ConsumerFactory, ConsumerGroup, ConsumerSet, FactoryError, HandlerRegistry,
    RouterError, RunRouter, SubFactory,
};

// Relay exports
pub use relay::{
    DocumentSink, DrainReport, Relay, RelayConfig, RelayDelivery, RelayError, RelayHandle,
    RelayMode, RelayReceiver,
};

// Registry exports
pub use registry::{
    Container, ContainerHost, ContainerId, ContainerRegistry, CurrentContainer, PlacementMode,
    PlacementPolicy, RegistryError, RegistrySummary,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, RunviewConfig, RunviewToml,
};
