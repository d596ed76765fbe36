//! Incremental Artists
//!
//! An artist turns an open-ended stream of event pages into a growing x/y
//! [`Series`]. Each page is derived once and appended; history is never
//! recomputed, and the series only grows.
//!
//! The artist does not draw. After every change it calls its [`RenderHook`],
//! which is where a rendering surface picks up the new data.
//!
//! ```
//! use runview_core::artist::{ArtistOptions, LineArtist, SeriesRecorder};
//! use runview_core::document::EventPage;
//! use serde_json::json;
//!
//! let recorder = SeriesRecorder::new();
//! let mut artist =
//!     LineArtist::from_expr("seq_num", "I", ArtistOptions::default(), recorder.clone()).unwrap();
//!
//! let page = EventPage::from_columns("d", 0, [("I", vec![json!(1), json!(2), json!(3)])]);
//! artist.apply_page(&page).unwrap();
//!
//! assert_eq!(artist.series().xs(), &[0.0, 1.0, 2.0]);
//! assert_eq!(recorder.snapshot().series.ys(), &[1.0, 2.0, 3.0]);
//! ```

pub mod derive;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::dispatch::{DocumentHandler, HandlerResult};
use crate::document::{EventDescriptor, EventPage, RunStart};
use crate::expr::ExpressionError;
use crate::label::{format_label, DEFAULT_TEMPLATE};

pub use derive::{moving_average, Derive, ExprDerive, MovingAverage};

/// Per-page artist failures; the series is left untouched
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ArtistError {
    /// Derive produced x and y of different lengths
    #[error("derived {xs} x values but {ys} y values")]
    ShapeMismatch {
        /// x count
        xs: usize,
        /// y count
        ys: usize,
    },

    /// An expression failed to evaluate
    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

/// Accumulated points plus the label
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Series {
    xs: Vec<f64>,
    ys: Vec<f64>,
    label: Option<String>,
    updates: u64,
}

impl Series {
    /// x values, in arrival order
    #[must_use]
    pub fn xs(&self) -> &[f64] {
        &self.xs
    }

    /// y values, in arrival order
    #[must_use]
    pub fn ys(&self) -> &[f64] {
        &self.ys
    }

    /// Label, once the run's start has been seen
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Number of points
    #[must_use]
    pub fn len(&self) -> usize {
        self.xs.len()
    }

    /// Whether there are no points
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }

    /// Most recent point
    #[must_use]
    pub fn last(&self) -> Option<(f64, f64)> {
        self.xs.last().copied().zip(self.ys.last().copied())
    }

    /// Pages that added points
    #[must_use]
    pub fn updates(&self) -> u64 {
        self.updates
    }
}

/// Where an artist reports changes
pub trait RenderHook: Send {
    /// Points were appended
    fn on_update(&mut self, series: &Series);

    /// The label was set
    fn on_label(&mut self, _label: &str) {}

    /// A page was skipped
    fn on_error(&mut self, _error: &ArtistError) {}
}

impl<H: RenderHook + ?Sized> RenderHook for Box<H> {
    fn on_update(&mut self, series: &Series) {
        (**self).on_update(series);
    }

    fn on_label(&mut self, label: &str) {
        (**self).on_label(label);
    }

    fn on_error(&mut self, error: &ArtistError) {
        (**self).on_error(error);
    }
}

/// Hook that ignores everything
#[derive(Clone, Copy, Debug, Default)]
pub struct NoRender;

impl RenderHook for NoRender {
    fn on_update(&mut self, _series: &Series) {}
}

/// What a [`SeriesRecorder`] has seen
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Recording {
    /// Series as of the last update
    pub series: Series,
    /// Last label reported
    pub label: Option<String>,
    /// Number of `on_update` calls
    pub updates: usize,
    /// Rendered errors, in order
    pub errors: Vec<String>,
}

/// Cloneable hook keeping the latest series for inspection
#[derive(Clone, Debug, Default)]
pub struct SeriesRecorder {
    inner: Arc<Mutex<Recording>>,
}

impl SeriesRecorder {
    /// Empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of what has been recorded
    #[must_use]
    pub fn snapshot(&self) -> Recording {
        self.inner.lock().clone()
    }
}

impl RenderHook for SeriesRecorder {
    fn on_update(&mut self, series: &Series) {
        let mut inner = self.inner.lock();
        inner.series = series.clone();
        inner.updates += 1;
    }

    fn on_label(&mut self, label: &str) {
        self.inner.lock().label = Some(label.to_string());
    }

    fn on_error(&mut self, error: &ArtistError) {
        self.inner.lock().errors.push(error.to_string());
    }
}

/// Artist settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtistOptions {
    /// Fixed label; overrides the template
    pub label: Option<String>,
    /// Label template rendered against the start document
    pub label_template: String,
    /// Only plot pages from descriptors with this stream name
    pub stream: Option<String>,
}

impl Default for ArtistOptions {
    fn default() -> Self {
        Self {
            label: None,
            label_template: DEFAULT_TEMPLATE.to_string(),
            stream: None,
        }
    }
}

/// Line plot of derived x against derived y
pub struct LineArtist {
    name: String,
    derive: Box<dyn Derive>,
    options: ArtistOptions,
    hook: Box<dyn RenderHook>,
    series: Series,
    descriptors: HashSet<String>,
    errors: u64,
}

impl LineArtist {
    /// Artist with a custom derive function
    pub fn new(
        derive: impl Derive + 'static,
        options: ArtistOptions,
        hook: impl RenderHook + 'static,
    ) -> Self {
        Self {
            name: "line".to_string(),
            derive: Box::new(derive),
            options,
            hook: Box::new(hook),
            series: Series::default(),
            descriptors: HashSet::new(),
            errors: 0,
        }
    }

    /// Artist plotting expression `y` against expression `x`
    pub fn from_expr(
        x: &str,
        y: &str,
        options: ArtistOptions,
        hook: impl RenderHook + 'static,
    ) -> Result<Self, ExpressionError> {
        let mut artist = Self::new(ExprDerive::new(x, y)?, options, hook);
        artist.name = format!("line({y} vs {x})");
        Ok(artist)
    }

    /// Rename for logs
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Accumulated series
    #[must_use]
    pub fn series(&self) -> &Series {
        &self.series
    }

    /// Pages skipped because of errors
    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.errors
    }

    /// Derive one page and append its points; returns how many were added
    ///
    /// On error nothing is appended.
    pub fn apply_page(&mut self, page: &EventPage) -> Result<usize, ArtistError> {
        let (xs, ys) = self.derive.derive(page)?;
        if xs.len() != ys.len() {
            return Err(ArtistError::ShapeMismatch {
                xs: xs.len(),
                ys: ys.len(),
            });
        }
        if xs.is_empty() {
            return Ok(0);
        }

        let added = xs.len();
        self.series.xs.extend(xs);
        self.series.ys.extend(ys);
        self.series.updates += 1;
        self.hook.on_update(&self.series);
        Ok(added)
    }

    fn accepts(&self, page: &EventPage) -> bool {
        self.options.stream.is_none() || self.descriptors.contains(&page.descriptor)
    }
}

impl DocumentHandler for LineArtist {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, doc: &RunStart) -> HandlerResult {
        let label = match &self.options.label {
            Some(label) => label.clone(),
            None => format_label(&self.options.label_template, doc),
        };
        debug!(artist = %self.name, label = %label, "Artist labelled");
        self.hook.on_label(&label);
        self.series.label = Some(label);
        Ok(())
    }

    fn descriptor(&mut self, doc: &EventDescriptor) -> HandlerResult {
        if let Some(stream) = &self.options.stream {
            if doc.name.as_deref() == Some(stream.as_str()) {
                self.descriptors.insert(doc.uid.clone());
            }
        }
        Ok(())
    }

    fn event_page(&mut self, page: &EventPage) -> HandlerResult {
        if !self.accepts(page) {
            return Ok(());
        }
        if let Err(e) = self.apply_page(page) {
            warn!(
                artist = %self.name,
                descriptor = %page.descriptor,
                error = %e,
                "Skipping page"
            );
            self.hook.on_error(&e);
            self.errors += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::dispatch;
    use crate::document::{Document, RunUid};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn page(first_seq: u64, column: &str, values: &[f64]) -> EventPage {
        EventPage::from_columns(
            "d",
            first_seq,
            [(column, values.iter().map(|v| json!(v)).collect())],
        )
    }

    fn artist(x: &str, y: &str, recorder: &SeriesRecorder) -> LineArtist {
        LineArtist::from_expr(x, y, ArtistOptions::default(), recorder.clone()).unwrap()
    }

    #[test]
    fn test_seq_num_round_trip() {
        let recorder = SeriesRecorder::new();
        let mut artist = artist("seq_num", "I", &recorder);
        let added = artist.apply_page(&page(0, "I", &[1.0, 2.0, 3.0])).unwrap();

        assert_eq!(added, 3);
        assert_eq!(artist.series().xs(), &[0.0, 1.0, 2.0]);
        assert_eq!(artist.series().ys(), &[1.0, 2.0, 3.0]);
        assert_eq!(recorder.snapshot().updates, 1);
    }

    #[test]
    fn test_series_grows_monotonically() {
        let recorder = SeriesRecorder::new();
        let mut artist = artist("seq_num", "I * 10", &recorder);
        let mut previous = Vec::new();

        for (i, values) in [vec![1.0], vec![], vec![2.0, 3.0], vec![4.0]].iter().enumerate() {
            artist.apply_page(&page(i as u64 * 10, "I", values)).unwrap();
            let ys = artist.series().ys().to_vec();
            assert!(ys.starts_with(&previous));
            previous = ys;
        }
        assert_eq!(previous, vec![10.0, 20.0, 30.0, 40.0]);
        assert_eq!(artist.series().updates(), 3);
    }

    #[test]
    fn test_empty_derive_does_not_render() {
        let recorder = SeriesRecorder::new();
        let mut artist = artist("seq_num", "I", &recorder);
        assert_eq!(artist.apply_page(&page(0, "I", &[])).unwrap(), 0);
        assert_eq!(recorder.snapshot().updates, 0);
    }

    #[test]
    fn test_shape_mismatch_keeps_prior_data() {
        let recorder = SeriesRecorder::new();
        let mut calls = 0;
        let derive = move |p: &EventPage| -> Result<(Vec<f64>, Vec<f64>), ArtistError> {
            calls += 1;
            if calls == 1 {
                Ok((vec![1.0; p.height()], vec![2.0; p.height()]))
            } else {
                Ok((vec![1.0], vec![2.0, 3.0]))
            }
        };
        let mut artist = LineArtist::new(derive, ArtistOptions::default(), recorder.clone());
        let run = RunUid::new("r1");
        dispatch(&mut artist, &Document::Start(RunStart::new(run))).unwrap();

        let doc = Document::EventPage(page(1, "I", &[5.0]));
        dispatch(&mut artist, &doc).unwrap();
        dispatch(&mut artist, &doc).unwrap();

        assert_eq!(artist.series().len(), 1);
        assert_eq!(artist.error_count(), 1);
        let recording = recorder.snapshot();
        assert_eq!(recording.errors, vec!["derived 1 x values but 2 y values"]);
        assert_eq!(recording.series.len(), 1);
    }

    #[test]
    fn test_expression_error_is_recovered() {
        let recorder = SeriesRecorder::new();
        let mut artist = artist("seq_num", "missing", &recorder);
        let doc = Document::EventPage(page(1, "I", &[5.0]));
        assert!(dispatch(&mut artist, &doc).is_ok());
        assert!(matches!(
            artist.apply_page(&page(1, "I", &[5.0])),
            Err(ArtistError::Expression(ExpressionError::UnknownName { .. }))
        ));
        assert!(artist.series().is_empty());
        assert_eq!(recorder.snapshot().errors.len(), 1);
    }

    #[test]
    fn test_label_from_template_and_override() {
        let recorder = SeriesRecorder::new();
        let mut templated = artist("seq_num", "I", &recorder);
        let start = RunStart::new("0123456789abcdef").with_scan_id(3);
        templated.start(&start).unwrap();
        assert_eq!(templated.series().label(), Some("3 [01234567]"));
        assert_eq!(recorder.snapshot().label.as_deref(), Some("3 [01234567]"));

        let options = ArtistOptions {
            label: Some("fixed".to_string()),
            ..ArtistOptions::default()
        };
        let mut fixed = LineArtist::from_expr("seq_num", "I", options, NoRender).unwrap();
        fixed.start(&start).unwrap();
        assert_eq!(fixed.series().label(), Some("fixed"));
    }

    #[test]
    fn test_stream_filter() {
        let options = ArtistOptions {
            stream: Some("primary".to_string()),
            ..ArtistOptions::default()
        };
        let mut artist = LineArtist::from_expr("seq_num", "I", options, NoRender).unwrap();
        let run = RunUid::new("r1");
        let primary = EventDescriptor::new(&run, "primary");
        let baseline = EventDescriptor::new(&run, "baseline");
        artist.descriptor(&primary).unwrap();
        artist.descriptor(&baseline).unwrap();

        let mut on_primary = page(1, "I", &[1.0]);
        on_primary.descriptor = primary.uid.clone();
        let mut on_baseline = page(1, "I", &[9.0]);
        on_baseline.descriptor = baseline.uid.clone();

        artist.event_page(&on_baseline).unwrap();
        artist.event_page(&on_primary).unwrap();
        assert_eq!(artist.series().ys(), &[1.0]);
    }

    #[test]
    fn test_singleton_events_accumulate() {
        let mut artist = LineArtist::from_expr("seq_num", "I", ArtistOptions::default(), NoRender)
            .unwrap();
        for event in page(1, "I", &[4.0, 5.0]).events() {
            dispatch(&mut artist, &Document::Event(event)).unwrap();
        }
        assert_eq!(artist.series().xs(), &[1.0, 2.0]);
        assert_eq!(artist.series().updates(), 2);
    }

    #[test]
    fn test_moving_average_artist() {
        let avg = moving_average("seq_num", "I", 2).unwrap();
        let mut artist = LineArtist::new(avg, ArtistOptions::default(), NoRender);
        assert_eq!(artist.apply_page(&page(1, "I", &[2.0])).unwrap(), 0);
        assert_eq!(artist.apply_page(&page(2, "I", &[4.0, 8.0])).unwrap(), 2);
        assert_eq!(artist.series().ys(), &[3.0, 6.0]);
    }
}
