//! Render Loop
//!
//! Process-wide handle to the event loop that owns consumer-side state. The
//! loop is a current-thread tokio runtime, created on first use and torn
//! down only by an explicit [`shutdown`].
//!
//! ```
//! use runview_core::render_loop;
//!
//! let lp = render_loop::get_or_init().unwrap();
//! assert!(render_loop::is_active());
//! assert_eq!(lp.block_on(async { 2 + 2 }), 4);
//!
//! drop(lp);
//! assert!(render_loop::shutdown());
//! assert!(!render_loop::is_active());
//! ```

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{const_mutex, Mutex};
use tracing::info;

static RENDER_LOOP: Mutex<Option<Arc<RenderLoop>>> = const_mutex(None);

/// The owning event loop
pub struct RenderLoop {
    runtime: tokio::runtime::Runtime,
    name: String,
    started: Instant,
}

impl RenderLoop {
    /// Run a future to completion on the loop
    ///
    /// # Panics
    ///
    /// Panics when called from inside another async runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Name given at creation
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Time since creation
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Return the render loop, creating it if absent
pub fn get_or_init() -> io::Result<Arc<RenderLoop>> {
    get_or_init_named("runview")
}

/// Return the render loop, creating it with `name` if absent
///
/// The name is ignored when the loop already exists.
pub fn get_or_init_named(name: &str) -> io::Result<Arc<RenderLoop>> {
    let mut slot = RENDER_LOOP.lock();
    if let Some(existing) = slot.as_ref() {
        return Ok(Arc::clone(existing));
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .thread_name(name)
        .enable_time()
        .build()?;
    let created = Arc::new(RenderLoop {
        runtime,
        name: name.to_string(),
        started: Instant::now(),
    });
    info!(name, "Render loop started");
    *slot = Some(Arc::clone(&created));
    Ok(created)
}

/// The render loop, if one is active
#[must_use]
pub fn current() -> Option<Arc<RenderLoop>> {
    RENDER_LOOP.lock().as_ref().map(Arc::clone)
}

/// Whether a render loop is active
#[must_use]
pub fn is_active() -> bool {
    RENDER_LOOP.lock().is_some()
}

/// Tear down the render loop; returns false if none was active
///
/// The runtime itself is dropped once the last outstanding
/// [`Arc<RenderLoop>`] goes away, so callers should release theirs first.
/// Must not be called from inside an async context when it holds the last
/// reference.
pub fn shutdown() -> bool {
    let taken = RENDER_LOOP.lock().take();
    match taken {
        Some(lp) => {
            info!(name = %lp.name, uptime_ms = lp.uptime().as_millis(), "Render loop stopped");
            true
        }
        None => false,
    }
}
