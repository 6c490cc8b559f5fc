//! State shared by every pipeline of a run.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parse_display::Display;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{config::TimingConfig, coordinator::CoordinatorHandle, Backend, DeviceState, DeviceStatus, Metrics};

/// Where a pipeline is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize, JsonSchema)]
#[display(style = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Not started yet.
    Pending,
    /// Starting a job.
    RunningJob,
    /// Watching a job print.
    Monitoring,
    /// Moving the bed clear for ejection.
    Positioning,
    /// Waiting for, or running, an ejection.
    Ejecting,
    /// Cooling down between jobs.
    CoolingDown,
    /// Every job done.
    Done,
    /// Stopped on a failure.
    Failed,
}

/// Live view of one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PipelineSnapshot {
    /// Printer name.
    pub printer: String,
    /// Current stage.
    pub stage: Stage,
    /// Job being worked on.
    pub current_job: Option<String>,
    /// Jobs printed and ejected.
    pub completed_jobs: usize,
    /// Jobs configured.
    pub total_jobs: usize,
    /// State from the latest successful poll.
    pub last_state: Option<DeviceState>,
    /// Progress from the latest successful poll.
    pub last_progress: Option<f64>,
    /// When the latest successful poll happened.
    pub last_polled_at: Option<DateTime<Utc>>,
    /// Why the pipeline failed, if it did.
    pub last_error: Option<String>,
    /// Times the pipeline was relaunched.
    pub relaunches: u32,
}

/// Snapshots of every pipeline, by printer name.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    pipelines: Arc<DashMap<String, PipelineSnapshot>>,
}

impl StatusBoard {
    /// Add a printer, pending.
    pub fn register(&self, printer: &str, total_jobs: usize) {
        self.pipelines.insert(
            printer.to_owned(),
            PipelineSnapshot {
                printer: printer.to_owned(),
                stage: Stage::Pending,
                current_job: None,
                completed_jobs: 0,
                total_jobs,
                last_state: None,
                last_progress: None,
                last_polled_at: None,
                last_error: None,
                relaunches: 0,
            },
        );
    }

    /// Apply `f` to the snapshot of `printer`, if it is registered.
    pub fn update<F>(&self, printer: &str, f: F)
    where
        F: FnOnce(&mut PipelineSnapshot),
    {
        if let Some(mut snapshot) = self.pipelines.get_mut(printer) {
            f(&mut snapshot);
        }
    }

    /// Move `printer` to `stage`.
    pub fn set_stage(&self, printer: &str, stage: Stage) {
        self.update(printer, |s| s.stage = stage);
    }

    /// Record a polled status for `printer`.
    pub fn record_status(&self, printer: &str, status: &DeviceStatus) {
        self.update(printer, |s| {
            s.last_state = Some(status.state);
            s.last_progress = status.progress_percent;
            s.last_polled_at = Some(status.observed_at);
        });
    }

    /// Snapshot of one printer.
    pub fn get(&self, printer: &str) -> Option<PipelineSnapshot> {
        self.pipelines.get(printer).map(|s| s.clone())
    }

    /// Snapshots of every printer, sorted by name.
    pub fn snapshot(&self) -> Vec<PipelineSnapshot> {
        let mut all: Vec<PipelineSnapshot> = self.pipelines.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| a.printer.cmp(&b.printer));
        all
    }
}

/// Everything pipelines share: devices, the ejector coordinator, timing,
/// the status board and metrics. Passed explicitly, never global.
pub struct OrchestratorContext {
    /// Devices.
    pub backend: Arc<dyn Backend>,
    /// The only way to the ejector.
    pub coordinator: CoordinatorHandle,
    /// Delays, thresholds and limits.
    pub timing: TimingConfig,
    /// Live pipeline snapshots.
    pub board: StatusBoard,
    /// Metrics.
    pub metrics: Metrics,
}
