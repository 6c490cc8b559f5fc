#![deny(missing_docs)]
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]
#![deny(unused_import_braces)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

//! This crate drives a small print farm: several printers work through
//! their job queues concurrently, and one shared ejector clears each
//! finished plate into a storage rack before the printer's next job starts.
//!
//! The building blocks, bottom-up:
//!
//! * [monitor::ProgressMonitor] turns status polls into a verdict on a job.
//! * [sequencer::EjectionSequencer] runs the macro sequence for one plate.
//! * [coordinator] owns the ejector and serves one ejection at a time.
//! * [pipeline::PrinterPipeline] loops print, watch, eject for one printer.
//! * [orchestrator::Orchestrator] runs and supervises every pipeline.

mod backend;
pub mod config;
pub mod context;
pub mod coordinator;
mod error;
pub mod metrics;
pub mod monitor;
pub mod orchestrator;
pub mod pipeline;
pub mod preflight;
mod retry;
pub mod sequencer;
pub mod server;
pub mod sim;
mod slots;
mod status;
#[cfg(test)]
mod tests;
mod traits;

pub use backend::HttpBackend;
pub use error::{ConfigError, EjectionError, OccupancyError};
pub use metrics::Metrics;
pub use retry::{Backoff, RetryPolicy};
pub use sim::{MacroResponse, SimulatedBackend};
pub use slots::{RackOccupancy, SlotContent, SlotPolicy, SlotTracker};
pub use status::{DeviceState, DeviceStatus, EjectorStatus};
pub use traits::{Backend, DeviceId, Dispatch, EjectorControl, PrinterControl, Provisioning};
