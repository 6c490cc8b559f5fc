//! Status snapshots polled from printers and the ejector.

use chrono::{DateTime, Utc};
use parse_display::{Display, FromStr};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Main state reported by a printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromStr, Serialize, Deserialize, JsonSchema)]
#[display(style = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceState {
    /// Not printing.
    Idle,
    /// Printing.
    Running,
    /// The last job finished.
    Finish,
    /// Printing was paused, usually by a device-side fault.
    Paused,
    /// The job failed.
    Failed,
    /// The backend cannot reach the printer.
    Offline,
    /// Anything we could not interpret.
    Unknown,
}

impl DeviceState {
    /// Parse a wire state, case-insensitively. Unrecognised values become
    /// [DeviceState::Unknown] rather than an error.
    pub fn parse_lossy(s: &str) -> Self {
        s.trim().to_uppercase().parse().unwrap_or(DeviceState::Unknown)
    }

    /// States that end a job without a usable print.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeviceState::Paused | DeviceState::Failed)
    }

    /// States in which a printer can accept a new job.
    pub fn is_ready(&self) -> bool {
        matches!(self, DeviceState::Idle | DeviceState::Finish)
    }
}

/// One polled printer status. Re-fetched on every poll, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DeviceStatus {
    /// Main state.
    pub state: DeviceState,

    /// Free-form description of the current stage, as reported.
    pub stage: Option<String>,

    /// Progress from 0 to 100, when known.
    pub progress_percent: Option<f64>,

    /// Minutes left on the current job, when known.
    pub remaining_minutes: Option<u32>,

    /// When the snapshot was taken.
    pub observed_at: DateTime<Utc>,
}

impl DeviceStatus {
    /// A snapshot with only a state.
    pub fn new(state: DeviceState) -> Self {
        Self {
            state,
            stage: None,
            progress_percent: None,
            remaining_minutes: None,
            observed_at: Utc::now(),
        }
    }

    /// Set the reported progress.
    pub fn with_progress(mut self, progress_percent: f64) -> Self {
        self.progress_percent = Some(progress_percent);
        self
    }

    /// Set the reported remaining time. Negative values mean unknown.
    pub fn with_remaining(mut self, remaining_minutes: i64) -> Self {
        self.remaining_minutes = u32::try_from(remaining_minutes).ok();
        self
    }

    /// Set the reported stage.
    pub fn with_stage(mut self, stage: &str) -> Self {
        self.stage = Some(stage.to_owned());
        self
    }
}

impl From<ottoapi::PrinterStatus> for DeviceStatus {
    fn from(status: ottoapi::PrinterStatus) -> Self {
        Self {
            state: DeviceState::parse_lossy(&status.status),
            stage: status.current_stage,
            progress_percent: status.progress_percent,
            remaining_minutes: status.remaining_time_minutes.and_then(|m| u32::try_from(m).ok()),
            observed_at: Utc::now(),
        }
    }
}

/// One polled ejector status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EjectorStatus {
    /// Status as reported, for instance `ONLINE` or `BUSY`.
    pub status: String,

    /// When the snapshot was taken.
    pub observed_at: DateTime<Utc>,
}

impl EjectorStatus {
    /// A snapshot with the given status.
    pub fn new(status: &str) -> Self {
        Self {
            status: status.to_owned(),
            observed_at: Utc::now(),
        }
    }

    /// The ejector is idle, and ready for the next macro, only when ONLINE.
    pub fn is_idle(&self) -> bool {
        self.status.trim().eq_ignore_ascii_case("ONLINE")
    }
}
