//! Configured Line Plots
//!
//! A [`LinePlotFactory`] turns a list of [`PlotSpec`]s (usually the
//! `[[plots]]` tables of the config file) into one [`LineArtist`] per plot
//! for every run it sees.
//!
//! ```toml
//! [[plots]]
//! x = "motor"
//! y = "det / I0"
//!
//! [[plots]]
//! x = "seq_num"
//! y = "det"
//! window = 5
//! label = "det (smoothed)"
//! ```

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::artist::{moving_average, ArtistOptions, LineArtist, RenderHook};
use crate::document::RunStart;
use crate::expr::{Expr, ExpressionError};
use crate::label::DEFAULT_TEMPLATE;
use crate::router::{ConsumerFactory, ConsumerSet, FactoryError};

fn default_stream() -> Option<String> {
    Some("primary".to_string())
}

/// One line plot: y expression against x expression
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlotSpec {
    /// x expression
    pub x: String,

    /// y expression
    pub y: String,

    /// Fixed label (overrides any template)
    #[serde(default)]
    pub label: Option<String>,

    /// Per-plot label template
    #[serde(default)]
    pub label_template: Option<String>,

    /// Event stream to plot; empty means every stream
    #[serde(default = "default_stream")]
    pub stream: Option<String>,

    /// Trailing moving-average window over y
    #[serde(default)]
    pub window: Option<usize>,
}

impl PlotSpec {
    /// Plot `y` against `x` on the primary stream
    pub fn new(x: impl Into<String>, y: impl Into<String>) -> Self {
        Self {
            x: x.into(),
            y: y.into(),
            label: None,
            label_template: None,
            stream: default_stream(),
            window: None,
        }
    }

    /// Set a fixed label
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Restrict to a stream, or `None` for all streams
    #[must_use]
    pub fn with_stream(mut self, stream: Option<&str>) -> Self {
        self.stream = stream.map(str::to_string);
        self
    }

    /// Smooth y over `window` rows
    #[must_use]
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = Some(window);
        self
    }

    /// Check that both expressions parse
    pub fn validate(&self) -> Result<(), ExpressionError> {
        Expr::parse(&self.x)?;
        Expr::parse(&self.y)?;
        Ok(())
    }

    /// Short description, e.g. `det vs motor`
    #[must_use]
    pub fn title(&self) -> String {
        match self.window {
            Some(window) => format!("{} vs {} (avg {window})", self.y, self.x),
            None => format!("{} vs {}", self.y, self.x),
        }
    }

    fn options(&self, default_template: &str) -> ArtistOptions {
        ArtistOptions {
            label: self.label.clone(),
            label_template: self
                .label_template
                .clone()
                .unwrap_or_else(|| default_template.to_string()),
            stream: self.stream.clone().filter(|s| !s.is_empty()),
        }
    }

    fn artist(
        &self,
        default_template: &str,
        hook: Box<dyn RenderHook>,
    ) -> Result<LineArtist, ExpressionError> {
        let options = self.options(default_template);
        let artist = match self.window {
            Some(window) => {
                LineArtist::new(moving_average(&self.x, &self.y, window)?, options, hook)
            }
            None => LineArtist::from_expr(&self.x, &self.y, options, hook)?,
        };
        Ok(artist.named(self.title()))
    }
}

type HookFn = Box<dyn FnMut(&PlotSpec, &RunStart) -> Box<dyn RenderHook> + Send>;

/// Factory creating one artist per configured plot
pub struct LinePlotFactory {
    plots: Vec<PlotSpec>,
    label_template: String,
    hooks: HookFn,
}

impl LinePlotFactory {
    /// Build a factory; `hooks` supplies the render hook for each new artist
    ///
    /// Every plot's expressions are checked up front so a typo fails here
    /// rather than on the first run.
    pub fn new<F>(
        plots: Vec<PlotSpec>,
        label_template: Option<String>,
        hooks: F,
    ) -> Result<Self, ExpressionError>
    where
        F: FnMut(&PlotSpec, &RunStart) -> Box<dyn RenderHook> + Send + 'static,
    {
        for plot in &plots {
            plot.validate()?;
        }
        Ok(Self {
            plots,
            label_template: label_template.unwrap_or_else(|| DEFAULT_TEMPLATE.to_string()),
            hooks: Box::new(hooks),
        })
    }

    /// Configured plots
    #[must_use]
    pub fn plots(&self) -> &[PlotSpec] {
        &self.plots
    }
}

impl ConsumerFactory for LinePlotFactory {
    fn build(&mut self, start: &RunStart) -> Result<ConsumerSet, FactoryError> {
        let mut set = ConsumerSet::new();
        for plot in &self.plots {
            let hook = (self.hooks)(plot, start);
            let artist = plot
                .artist(&self.label_template, hook)
                .map_err(|e| FactoryError::new(format!("plot {}: {e}", plot.title())))?;
            set = set.with_consumer(artist);
        }
        debug!(uid = %start.uid, artists = self.plots.len(), "Line plots built");
        Ok(set)
    }
}
