//! Runview Headless - Live routing without a display
//!
//! Runs a simulated acquisition on a worker thread, relays its documents to
//! the render loop and logs what every artist would draw. Useful for trying
//! a configuration before pointing a real surface at it.
//!
//! # Usage
//!
//! ```bash
//! # Three scans of twenty points, overplotted
//! runview-headless
//!
//! # One container per scan, with a config file
//! runview-headless --placement paged --config ./runview.toml
//!
//! # Deliver synchronously on the acquisition thread
//! runview-headless --mode direct
//!
//! # Per-document logging
//! RUST_LOG=debug runview-headless
//! ```

mod sim;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use runview_core::artist::{ArtistError, RenderHook, Series, SeriesRecorder};
use runview_core::config::{default_config_path, load_config_from_path, ConfigOverrides};
use runview_core::document::RunStart;
use runview_core::plots::{LinePlotFactory, PlotSpec};
use runview_core::registry::{ContainerHost, ContainerRegistry, PlacementMode};
use runview_core::relay::{Relay, RelayDelivery, RelayMode};
use runview_core::router::ConsumerFactory;
use runview_core::{render_loop, RunviewConfig};

use sim::{ScanPlan, Simulator};

/// Runview Headless - simulated scans routed to logging artists
#[derive(Parser, Debug)]
#[command(name = "runview-headless")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RUNVIEW_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of scans to simulate
    #[arg(short = 'r', long, default_value_t = 3)]
    runs: u32,

    /// Points per scan
    #[arg(short = 'p', long, default_value_t = 20)]
    points: u32,

    /// Relay mode (auto, queued, direct)
    #[arg(short = 'm', long)]
    mode: Option<RelayMode>,

    /// Placement (paged, overplot)
    #[arg(long)]
    placement: Option<PlacementMode>,

    /// Pause between points in milliseconds
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RUNVIEW_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "runview_headless={level},runview_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

// =============================================================================
// Logging surface
// =============================================================================

/// Containers exist only as names in the log
#[derive(Default)]
struct LogHost {
    created: usize,
}

impl ContainerHost for LogHost {
    type Handle = String;

    fn create_container(&mut self, label: &str) -> String {
        self.created += 1;
        info!(container = label, "Figure opened");
        label.to_string()
    }

    fn rename_container(&mut self, handle: &String, label: &str) {
        info!(from = %handle, to = label, "Figure retitled");
    }

    fn destroy_container(&mut self, handle: &String) {
        info!(container = %handle, "Figure closed");
    }
}

/// Logs each update and keeps the final series for the summary
struct LogHook {
    container: String,
    plot: String,
    recorder: SeriesRecorder,
}

impl RenderHook for LogHook {
    fn on_update(&mut self, series: &Series) {
        if let Some((x, y)) = series.last() {
            debug!(
                container = %self.container,
                plot = %self.plot,
                points = series.len(),
                x,
                y,
                "Series updated"
            );
        }
        self.recorder.on_update(series);
    }

    fn on_label(&mut self, label: &str) {
        info!(container = %self.container, plot = %self.plot, label, "Line added");
        self.recorder.on_label(label);
    }

    fn on_error(&mut self, error: &ArtistError) {
        warn!(container = %self.container, plot = %self.plot, error = %error, "Page skipped");
        self.recorder.on_error(error);
    }
}

type Lines = Arc<Mutex<Vec<(String, String, SeriesRecorder)>>>;

fn default_plots() -> Vec<PlotSpec> {
    vec![
        PlotSpec::new("motor", "det"),
        PlotSpec::new("motor", "det / I0"),
        PlotSpec::new("seq_num", "det").with_window(5),
    ]
}

fn build_registry(config: &RunviewConfig, lines: &Lines) -> Result<ContainerRegistry<LogHost>> {
    let plots = if config.plots.is_empty() {
        default_plots()
    } else {
        config.plots.clone()
    };
    for plot in &plots {
        plot.validate()
            .with_context(|| format!("plot {}", plot.title()))?;
    }
    let label_template = config.label_template.clone();
    let lines = Arc::clone(lines);

    let provider = move |container: &String| -> Vec<Box<dyn ConsumerFactory>> {
        let container = container.clone();
        let lines = Arc::clone(&lines);
        let hooks = move |plot: &PlotSpec, _start: &RunStart| -> Box<dyn RenderHook> {
            let recorder = SeriesRecorder::new();
            lines
                .lock()
                .push((container.clone(), plot.title(), recorder.clone()));
            Box::new(LogHook {
                container: container.clone(),
                plot: plot.title(),
                recorder,
            })
        };
        match LinePlotFactory::new(plots.clone(), Some(label_template.clone()), hooks) {
            Ok(factory) => vec![Box::new(factory) as Box<dyn ConsumerFactory>],
            Err(e) => {
                error!(error = %e, "Plot factory unavailable");
                Vec::new()
            }
        }
    };

    Ok(ContainerRegistry::new(LogHost::default(), provider)
        .with_policy(config.placement)
        .with_handler_registry(config.handler_registry.clone()))
}

fn log_summary(registry: &ContainerRegistry<LogHost>, lines: &Lines) {
    let summary = registry.summary();
    info!(
        containers = summary.containers,
        figures_opened = registry.host().created,
        runs = summary.runs,
        active_runs = summary.active_runs,
        current = ?summary.current,
        "Registry summary"
    );
    for (container, plot, recorder) in lines.lock().iter() {
        let recording = recorder.snapshot();
        info!(
            container = %container,
            plot = %plot,
            label = recording.label.as_deref().unwrap_or("?"),
            points = recording.series.len(),
            last = ?recording.series.last(),
            errors = recording.errors.len(),
            "Line"
        );
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("Runview Headless starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(config_path).context("loading configuration")?;
    let mut overrides = ConfigOverrides::new();
    if let Some(mode) = args.mode {
        overrides = overrides.with_relay_mode(mode);
    }
    if let Some(placement) = args.placement {
        overrides = overrides.with_placement(placement);
    }
    overrides.apply(&mut config);
    info!(
        source = %config.source(),
        mode = %config.relay.mode,
        placement = ?config.placement.mode,
        "Configuration resolved"
    );

    if config.relay.mode != RelayMode::Direct {
        render_loop::get_or_init_named("runview-headless")
            .context("starting render loop")?;
    }

    let lines: Lines = Arc::default();
    let registry = build_registry(&config, &lines)?;
    let plan = ScanPlan {
        runs: args.runs,
        points: args.points,
        interval: Duration::from_millis(args.interval_ms),
        ..ScanPlan::default()
    };

    match Relay::with_mode(&config.relay, registry) {
        RelayDelivery::Queued {
            handle,
            mut receiver,
            mut sink,
        } => {
            let lp = render_loop::get_or_init().context("starting render loop")?;
            let producer = thread::Builder::new()
                .name("acquisition".to_string())
                .spawn(move || Simulator::new(plan, rand::thread_rng()).run(&handle))
                .context("spawning acquisition thread")?;

            let report = lp.block_on(receiver.run(&mut sink));
            let produced = producer
                .join()
                .map_err(|_| anyhow::anyhow!("acquisition thread panicked"))??;
            info!(
                submitted = produced.documents,
                delivered = report.delivered,
                failed = report.failed,
                "Relay drained"
            );
            log_summary(&sink, &lines);
        }
        RelayDelivery::Direct { handle, sink } => {
            let produced = Simulator::new(plan, rand::thread_rng()).run(&handle)?;
            info!(submitted = produced.documents, "Delivered directly");
            log_summary(&sink.lock(), &lines);
        }
    }

    render_loop::shutdown();
    info!("Runview Headless finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::rngs::mock::StepRng;

    #[test]
    fn test_registry_draws_default_plots() {
        let lines: Lines = Arc::default();
        let config = RunviewConfig::default();
        let mut registry = build_registry(&config, &lines).unwrap();

        let plan = ScanPlan {
            runs: 1,
            points: 6,
            ..ScanPlan::default()
        };
        for document in Simulator::new(plan, StepRng::new(0, 1)).scan() {
            registry.route(&document).unwrap();
        }

        let lines = lines.lock();
        assert_eq!(lines.len(), 3);
        let points: Vec<usize> = lines
            .iter()
            .map(|(_, _, recorder)| recorder.snapshot().series.len())
            .collect();
        // Baseline readings are filtered out; the average needs 5 rows first
        assert_eq!(points, vec![6, 6, 2]);
        assert!(lines.iter().all(|(c, _, _)| c == "Untitled 0"));
    }

    #[test]
    fn test_bad_configured_plot_fails_early() {
        let mut config = RunviewConfig::default();
        config.plots = vec![PlotSpec::new("motor", "det +")];
        assert!(build_registry(&config, &Arc::default()).is_err());
    }
}
