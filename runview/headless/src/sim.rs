//! Simulated acquisition
//!
//! Emits step scans the way an acquisition engine does: a `start`, a
//! `baseline` reading, one `primary` event page per motor position and a
//! `stop`. The detector sees a gaussian peak plus noise, normalised by a
//! noisy monitor `I0`.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rand::Rng;
use serde_json::json;
use tracing::{debug, info};

use runview_core::document::{
    DataKey, Document, EventDescriptor, EventPage, RunStart, RunStop, RunUid,
};
use runview_core::relay::RelayHandle;

/// Scan parameters
#[derive(Clone, Debug)]
pub struct ScanPlan {
    /// Number of runs
    pub runs: u32,
    /// Motor positions per run
    pub points: u32,
    /// Pause between points
    pub interval: Duration,
    /// First motor position
    pub start: f64,
    /// Last motor position
    pub stop: f64,
}

impl Default for ScanPlan {
    fn default() -> Self {
        Self {
            runs: 3,
            points: 20,
            interval: Duration::ZERO,
            start: -5.0,
            stop: 5.0,
        }
    }
}

impl ScanPlan {
    /// Motor position of point `i`
    pub fn position(&self, i: u32) -> f64 {
        if self.points <= 1 {
            return self.start;
        }
        let step = (self.stop - self.start) / f64::from(self.points - 1);
        self.start + step * f64::from(i)
    }
}

/// What the simulator submitted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SimReport {
    /// Runs emitted
    pub runs: u32,
    /// Documents submitted
    pub documents: usize,
}

fn now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

fn peak(x: f64, center: f64, width: f64) -> f64 {
    (-((x - center) / width).powi(2) / 2.0).exp()
}

/// Emits scans into a relay
pub struct Simulator<R> {
    plan: ScanPlan,
    rng: R,
    next_scan_id: u64,
}

impl<R: Rng> Simulator<R> {
    /// Simulator starting at scan id 1
    pub fn new(plan: ScanPlan, rng: R) -> Self {
        Self {
            plan,
            rng,
            next_scan_id: 1,
        }
    }

    /// Submit every run of the plan
    pub fn run(&mut self, relay: &RelayHandle) -> Result<SimReport> {
        let mut report = SimReport::default();
        for _ in 0..self.plan.runs {
            for document in self.scan() {
                relay
                    .submit_document(&document, true)
                    .with_context(|| format!("submitting {}", document.name()))?;
                report.documents += 1;
                if matches!(document, Document::EventPage(_)) && !self.plan.interval.is_zero() {
                    thread::sleep(self.plan.interval);
                }
            }
            report.runs += 1;
        }
        info!(runs = report.runs, documents = report.documents, "Simulation finished");
        Ok(report)
    }

    /// Documents of one scan, in emission order
    pub fn scan(&mut self) -> Vec<Document> {
        let scan_id = self.next_scan_id;
        self.next_scan_id += 1;

        let uid = RunUid::generate();
        let center = self.rng.gen_range(self.plan.start..=self.plan.stop) * 0.5;
        let mut start = RunStart::new(uid.clone())
            .with_scan_id(scan_id)
            .with_metadata("plan_name", "scan")
            .with_metadata("motors", json!(["motor"]))
            .with_metadata("detectors", json!(["det", "I0"]));
        start.time = now();
        debug!(uid = %uid, scan_id, center, "Simulating scan");

        let mut baseline = EventDescriptor::new(&uid, "baseline")
            .with_data_key("temperature", DataKey::number("cryostat"));
        baseline.time = now();

        let mut primary = EventDescriptor::new(&uid, "primary")
            .with_data_key("motor", DataKey::number("motor"))
            .with_data_key("det", DataKey::number("det"))
            .with_data_key("I0", DataKey::number("I0"));
        primary.time = now();

        let mut documents = vec![
            Document::from(start),
            Document::from(baseline.clone()),
            Document::from(primary.clone()),
        ];

        let temperature = 293.0 + self.rng.gen_range(-0.5..0.5);
        documents.push(Document::from(EventPage::from_columns(
            baseline.uid.clone(),
            1,
            [("temperature", vec![json!(temperature)])],
        )));

        for i in 0..self.plan.points {
            let x = self.plan.position(i);
            let i0 = 1000.0 + self.rng.gen_range(-20.0..20.0);
            let det = i0 * (0.02 + peak(x, center, 1.0)) + self.rng.gen_range(0.0..5.0);
            let page = EventPage::from_columns(
                primary.uid.clone(),
                u64::from(i) + 1,
                [
                    ("motor", vec![json!(x)]),
                    ("det", vec![json!(det)]),
                    ("I0", vec![json!(i0)]),
                ],
            );
            documents.push(Document::from(page));
        }

        let mut stop = RunStop::new(&uid);
        stop.time = now();
        stop.num_events.insert("baseline".to_string(), 1);
        stop.num_events.insert("primary".to_string(), u64::from(self.plan.points));
        documents.push(Document::from(stop));
        documents
    }
}
