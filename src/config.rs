//! Code for the configuration of the application.
//!
//! The TOML file is parsed into [Config], which mirrors the file, and then
//! validated into a [Plan], which is what the orchestrator runs. Everything
//! that can be checked without talking to a device is checked here.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    time::Duration,
};

use ottoapi::{EjectorRegistration, PrinterRegistration};
use serde::{Deserialize, Serialize};

use crate::{ConfigError, DeviceId, RackOccupancy, RetryPolicy, SlotPolicy};

/// G-code sent to move the bed clear of the ejector before it reaches in.
pub const DEFAULT_EJECT_POSITION_GCODE: &str = "G90\nG1 Z150 F3000";

/// Largest rack a config may describe.
pub const MAX_SHELVES: u32 = 64;

/// The configuration of the application.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Where the backend lives.
    pub backend: BackendConfig,

    /// The shared ejector.
    pub ejector: EjectorConfig,

    /// Delays, thresholds and limits.
    #[serde(default)]
    pub timing: TimingConfig,

    /// Storage racks, by label.
    #[serde(default)]
    pub racks: BTreeMap<String, RackConfig>,

    /// Printers, each with its own job queue.
    #[serde(default)]
    pub printers: Vec<PrinterConfig>,
}

/// The configuration for the backend REST service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Base url, for instance `http://localhost:3000/api`.
    pub url: String,

    /// Timeout for status and registration calls.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Timeout for G-code calls.
    #[serde(default = "default_gcode_timeout_secs")]
    pub gcode_timeout_secs: u64,

    /// Timeout for macro dispatch, which the backend holds open until the
    /// ejector acknowledges.
    #[serde(default = "default_macro_timeout_secs")]
    pub macro_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_gcode_timeout_secs() -> u64 {
    20
}

fn default_macro_timeout_secs() -> u64 {
    45
}

/// The configuration for the ejector.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EjectorConfig {
    /// Backend id, if already registered.
    pub id: Option<DeviceId>,

    /// Registration payload, used when `id` is unset or unknown to the
    /// backend.
    pub registration: Option<EjectorRegistration>,

    /// Names of the printer-independent macros.
    #[serde(default)]
    pub macros: EjectorMacros,

    /// Interval between status polls while waiting for the ejector.
    #[serde(default = "default_idle_poll_secs")]
    pub idle_poll_secs: u64,

    /// How long the ejector may take to come back ONLINE after a macro.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_idle_poll_secs() -> u64 {
    3
}

fn default_idle_timeout_secs() -> u64 {
    180
}

impl EjectorConfig {
    /// Interval between idle polls.
    pub fn idle_poll(&self) -> Duration {
        Duration::from_secs(self.idle_poll_secs)
    }

    /// Bound on each idle wait.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Macro names shared by every printer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EjectorMacros {
    /// Homes the gantry.
    pub home: String,
    /// Parks the gantry out of the way.
    pub park: String,
    /// Prefix of the store macros; the slot (and rack) are appended.
    pub store_prefix: String,
    /// Prefix of the grab macros; the slot (and rack) are appended.
    pub grab_prefix: String,
}

impl Default for EjectorMacros {
    fn default() -> Self {
        Self {
            home: "OTTOEJECT_HOME".to_owned(),
            park: "PARK_OTTOEJECT".to_owned(),
            store_prefix: "STORE_TO_SLOT".to_owned(),
            grab_prefix: "GRAB_FROM_SLOT".to_owned(),
        }
    }
}

/// Delays, thresholds and limits. All durations are in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait after starting the first job of a run, so a stale FINISH from
    /// the previous run clears.
    pub first_job_grace_secs: u64,
    /// Wait after starting every later job.
    pub next_job_grace_secs: u64,
    /// Pause after FINISH before the confirming re-poll.
    pub settle_secs: u64,
    /// Consecutive low-progress IDLE polls tolerated before a job stalls.
    pub stall_threshold: u32,
    /// Pause after the eject-position G-code, while the axes move.
    pub position_delay_secs: u64,
    /// Cool-down between a successful ejection and the next job.
    pub inter_job_delay_secs: u64,
    /// How often the orchestrator checks on its pipelines.
    pub supervisor_interval_secs: u64,
    /// Upper bound on monitoring a single job.
    pub job_timeout_secs: Option<u64>,
    /// Relaunches allowed per printer after an unexpected pipeline exit.
    pub max_relaunches: u32,
    /// Backoff for failed status polls.
    pub poll_retry: RetryPolicy,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            first_job_grace_secs: 120,
            next_job_grace_secs: 10,
            settle_secs: 3,
            stall_threshold: 6,
            position_delay_secs: 5,
            inter_job_delay_secs: 15,
            supervisor_interval_secs: 5,
            job_timeout_secs: None,
            max_relaunches: 3,
            poll_retry: RetryPolicy::default(),
        }
    }
}

/// The configuration for one storage rack.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RackConfig {
    /// Number of slots.
    pub shelves: u32,

    /// Slot replacement plates are always taken from under rotating slots.
    #[serde(default = "default_grab_slot")]
    pub grab_slot: u32,

    /// First store slot under rotating slots.
    #[serde(default = "default_grab_slot")]
    pub start_slot: u32,

    /// Slots holding fresh plates when the run starts.
    #[serde(default)]
    pub loaded_slots: Vec<u32>,
}

fn default_grab_slot() -> u32 {
    1
}

/// Slot policy as written in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotMode {
    /// Jobs name their own slots.
    Explicit,
    /// Store slots rotate through the printer's rack.
    Rotating,
}

/// The configuration for one printer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrinterConfig {
    /// Unique name, used in logs and the status board.
    pub name: String,

    /// Backend id, if already registered.
    pub id: Option<DeviceId>,

    /// Registration payload, used when `id` is unset or unknown to the
    /// backend.
    pub registration: Option<PrinterRegistration>,

    /// Ejector macro that pulls the plate off this printer.
    pub eject_macro: String,

    /// Ejector macro that puts a fresh plate on this printer.
    pub load_macro: String,

    /// Rack finished plates from this printer go to.
    pub rack: Option<String>,

    /// Defaults to rotating when a rack is set, explicit otherwise.
    pub slot_mode: Option<SlotMode>,

    /// G-code that moves the bed clear for ejection.
    #[serde(default = "default_eject_position_gcode")]
    pub eject_position_gcode: String,

    /// Jobs, in the order they print.
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

fn default_eject_position_gcode() -> String {
    DEFAULT_EJECT_POSITION_GCODE.to_owned()
}

/// The configuration for one job.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobConfig {
    /// Job id, defaults to the job's position in the queue.
    pub id: Option<String>,

    /// File on the printer's storage.
    pub filename: String,

    /// Slot the finished plate is stored in.
    pub store_slot: Option<u32>,

    /// Slot to take a replacement plate from. Unset means no replacement.
    pub grab_slot: Option<u32>,
}

impl Config {
    /// Parse a configuration from a toml file.
    pub fn from_file(file: &Path) -> Result<Self, ConfigError> {
        let config = std::fs::read_to_string(file).map_err(|source| ConfigError::Read {
            path: file.display().to_string(),
            source,
        })?;
        Self::from_str(&config)
    }

    /// Parse a configuration from a toml string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(config: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(config)?)
    }

    /// Check the configuration and turn it into a runnable plan.
    pub fn validate(self) -> Result<Plan, ConfigError> {
        if self.printers.is_empty() {
            return Err(ConfigError::NoPrinters);
        }
        if self.ejector.id.is_none() && self.ejector.registration.is_none() {
            return Err(ConfigError::Unidentified {
                device: "ejector".to_owned(),
            });
        }
        validate_timing(&self.ejector, &self.timing)?;

        for (label, rack) in self.racks.iter() {
            if rack.shelves == 0 {
                return Err(ConfigError::EmptyRack(label.clone()));
            }
            if rack.shelves > MAX_SHELVES {
                return Err(ConfigError::Invalid {
                    field: "racks.shelves",
                    reason: format!(
                        "rack {:?} has {} shelves, at most {} are supported",
                        label, rack.shelves, MAX_SHELVES
                    ),
                });
            }
            check_slot("grab", rack.grab_slot, label, rack)?;
            check_slot("start", rack.start_slot, label, rack)?;
            for slot in rack.loaded_slots.iter() {
                check_slot("loaded", *slot, label, rack)?;
            }
        }

        let mut names = BTreeSet::new();
        let mut printers = Vec::with_capacity(self.printers.len());
        for printer in self.printers {
            if !names.insert(printer.name.clone()) {
                return Err(ConfigError::DuplicatePrinter(printer.name));
            }
            printers.push(validate_printer(printer, &self.racks)?);
        }

        check_rack_occupancy(&printers, &self.racks)?;

        Ok(Plan {
            backend: self.backend,
            ejector: self.ejector,
            timing: self.timing,
            racks: self.racks,
            printers,
        })
    }
}

fn validate_timing(ejector: &EjectorConfig, timing: &TimingConfig) -> Result<(), ConfigError> {
    let positive = [
        ("ejector.idle_poll_secs", ejector.idle_poll_secs),
        ("timing.supervisor_interval_secs", timing.supervisor_interval_secs),
        ("timing.poll_retry.initial_delay_secs", timing.poll_retry.initial_delay_secs),
    ];
    for (field, value) in positive {
        if value == 0 {
            return Err(ConfigError::Invalid {
                field,
                reason: "must be greater than zero".to_owned(),
            });
        }
    }
    if timing.poll_retry.max_delay_secs < timing.poll_retry.initial_delay_secs {
        return Err(ConfigError::Invalid {
            field: "timing.poll_retry.max_delay_secs",
            reason: "must not be below initial_delay_secs".to_owned(),
        });
    }
    if timing.poll_retry.max_attempts == 0 {
        tracing::warn!("poll retries are unbounded; an unreachable printer will be polled forever");
    }
    Ok(())
}

fn check_slot(what: &'static str, slot: u32, label: &str, rack: &RackConfig) -> Result<(), ConfigError> {
    if slot == 0 || slot > rack.shelves {
        return Err(ConfigError::SlotOutOfRange {
            what,
            slot,
            rack: label.to_owned(),
            shelves: rack.shelves,
        });
    }
    Ok(())
}

fn validate_printer(printer: PrinterConfig, racks: &BTreeMap<String, RackConfig>) -> Result<PrinterSpec, ConfigError> {
    if printer.id.is_none() && printer.registration.is_none() {
        return Err(ConfigError::Unidentified {
            device: format!("printer {:?}", printer.name),
        });
    }

    let rack = match printer.rack.as_deref() {
        Some(label) => Some((
            label,
            racks.get(label).ok_or_else(|| ConfigError::UnknownRack {
                printer: printer.name.clone(),
                rack: label.to_owned(),
            })?,
        )),
        None => None,
    };

    let mode = printer
        .slot_mode
        .unwrap_or(if rack.is_some() { SlotMode::Rotating } else { SlotMode::Explicit });
    let slots = match (mode, rack) {
        (SlotMode::Explicit, _) => SlotPolicy::Explicit,
        (SlotMode::Rotating, Some((label, _))) => SlotPolicy::Rotating { rack: label.to_owned() },
        (SlotMode::Rotating, None) => return Err(ConfigError::RotatingWithoutRack(printer.name)),
    };

    if printer.jobs.is_empty() {
        tracing::warn!(printer = printer.name, "printer has no jobs");
    }

    let mut jobs = Vec::with_capacity(printer.jobs.len());
    for (index, job) in printer.jobs.into_iter().enumerate() {
        let id = job.id.unwrap_or_else(|| (index + 1).to_string());
        match (&slots, rack) {
            (SlotPolicy::Explicit, rack) => {
                let store_slot = job.store_slot.ok_or_else(|| ConfigError::MissingStoreSlot {
                    printer: printer.name.clone(),
                    job: id.clone(),
                })?;
                let slots = std::iter::once(("store", store_slot)).chain(job.grab_slot.map(|s| ("grab", s)));
                for (what, slot) in slots {
                    match rack {
                        Some((label, rack)) => check_slot(what, slot, label, rack)?,
                        None if slot == 0 => {
                            return Err(ConfigError::Invalid {
                                field: "jobs.store_slot",
                                reason: format!("job {:?} on printer {:?} uses slot 0", id, printer.name),
                            })
                        }
                        None => {}
                    }
                }
            }
            (SlotPolicy::Rotating { rack: label }, rack) => {
                let fixed_grab = rack.map(|(_, r)| r.grab_slot);
                if job.store_slot.is_some() || job.grab_slot.is_some_and(|s| Some(s) != fixed_grab) {
                    tracing::warn!(
                        printer = printer.name,
                        job = id,
                        rack = label,
                        "rotating rack overrides the slots configured on this job"
                    );
                }
            }
        }

        jobs.push(JobSpec {
            id,
            filename: job.filename,
            ejection: EjectionParams {
                store_slot: job.store_slot,
                grab_slot: job.grab_slot,
            },
        });
    }

    Ok(PrinterSpec {
        name: printer.name,
        id: printer.id,
        registration: printer.registration,
        eject_macro: printer.eject_macro,
        load_macro: printer.load_macro,
        rack: printer.rack,
        slots,
        eject_position_gcode: printer.eject_position_gcode,
        jobs,
    })
}

/// Replay every explicit-slot job on a racked printer against a simulated
/// rack. Printers sharing a rack are replayed in config order.
fn check_rack_occupancy(printers: &[PrinterSpec], racks: &BTreeMap<String, RackConfig>) -> Result<(), ConfigError> {
    let mut occupancy: BTreeMap<&str, RackOccupancy> = racks
        .iter()
        .map(|(label, rack)| (label.as_str(), RackOccupancy::new(rack.shelves, &rack.loaded_slots)))
        .collect();

    for printer in printers.iter().filter(|p| p.slots == SlotPolicy::Explicit) {
        let Some(rack) = printer.rack.as_deref().and_then(|label| occupancy.get_mut(label)) else {
            continue;
        };
        for job in printer.jobs.iter() {
            let conflict = |source| ConfigError::RackConflict {
                printer: printer.name.clone(),
                job: job.id.clone(),
                source,
            };
            if let Some(slot) = job.ejection.store_slot {
                rack.store(slot, &format!("{}/{}", printer.name, job.id)).map_err(conflict)?;
            }
            if let Some(slot) = job.ejection.grab_slot {
                rack.grab(slot).map_err(conflict)?;
            }
        }
    }
    Ok(())
}

/// Slots for one ejection. Under a rotating policy the coordinator replaces
/// both with its own choice, and `grab_slot` only says whether a
/// replacement plate is wanted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EjectionParams {
    /// Where the finished plate goes.
    pub store_slot: Option<u32>,
    /// Where the replacement plate comes from, if one is wanted.
    pub grab_slot: Option<u32>,
}

/// One job, validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    /// Job id, unique within its printer.
    pub id: String,
    /// File on the printer's storage.
    pub filename: String,
    /// Slots for the ejection that follows the print.
    pub ejection: EjectionParams,
}

/// One printer, validated.
#[derive(Debug, Clone, PartialEq)]
pub struct PrinterSpec {
    /// Unique name.
    pub name: String,
    /// Configured backend id.
    pub id: Option<DeviceId>,
    /// Registration payload.
    pub registration: Option<PrinterRegistration>,
    /// Eject macro for this printer.
    pub eject_macro: String,
    /// Load macro for this printer.
    pub load_macro: String,
    /// Rack label.
    pub rack: Option<String>,
    /// How slots are chosen.
    pub slots: SlotPolicy,
    /// G-code that moves the bed clear for ejection.
    pub eject_position_gcode: String,
    /// Jobs, in print order.
    pub jobs: Vec<JobSpec>,
}

/// Resolved backend ids for every configured device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceIds {
    /// The ejector.
    pub ejector: DeviceId,
    /// Printers, by name.
    pub printers: BTreeMap<String, DeviceId>,
}

/// A validated configuration, ready to run once device ids are known.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Backend settings.
    pub backend: BackendConfig,
    /// Ejector settings.
    pub ejector: EjectorConfig,
    /// Timing settings.
    pub timing: TimingConfig,
    /// Racks, by label.
    pub racks: BTreeMap<String, RackConfig>,
    /// Printers, in config order.
    pub printers: Vec<PrinterSpec>,
}

impl Plan {
    /// Device ids straight from the config, without asking the backend.
    /// Fails if any device is only known by its registration payload.
    pub fn configured_ids(&self) -> Result<DeviceIds, ConfigError> {
        let ejector = self.ejector.id.ok_or_else(|| ConfigError::Unidentified {
            device: "ejector".to_owned(),
        })?;
        let mut printers = BTreeMap::new();
        for printer in self.printers.iter() {
            let id = printer.id.ok_or_else(|| ConfigError::Unidentified {
                device: format!("printer {:?}", printer.name),
            })?;
            printers.insert(printer.name.clone(), id);
        }
        Ok(DeviceIds { ejector, printers })
    }

    /// Total number of jobs across every printer.
    pub fn job_count(&self) -> usize {
        self.printers.iter().map(|p| p.jobs.len()).sum()
    }

    /// Attach resolved ids to every printer.
    pub fn bind(&self, ids: &DeviceIds) -> Result<Vec<PrinterPlan>, ConfigError> {
        self.printers
            .iter()
            .map(|spec| {
                let id = ids.printers.get(&spec.name).copied().ok_or_else(|| ConfigError::Unidentified {
                    device: format!("printer {:?}", spec.name),
                })?;
                Ok(PrinterPlan { id, spec: spec.clone() })
            })
            .collect()
    }
}

/// A printer with its resolved backend id, ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct PrinterPlan {
    /// Backend id.
    pub id: DeviceId,
    /// What to run on it.
    pub spec: PrinterSpec,
}
