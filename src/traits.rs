//! Seams between the orchestration engine and the devices it drives.
//!
//! Everything the engine knows about printers and the ejector goes through
//! these traits, so the engine can run against the real backend or against
//! an in-memory [crate::SimulatedBackend].

use anyhow::Result;
use async_trait::async_trait;
use ottoapi::{EjectorRegistration, PrinterRegistration};

use crate::{DeviceStatus, EjectorStatus};

/// Backend assigned device identifier.
pub type DeviceId = u64;

/// How a macro dispatch was acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// The device acknowledged the macro.
    Confirmed,

    /// The acknowledgment was lost, but the macro may be running. Callers
    /// should keep polling the ejector.
    Presumed {
        /// Why the dispatch could not be confirmed.
        reason: String,
    },
}

/// Commands and status for printers.
#[async_trait]
pub trait PrinterControl: Send + Sync {
    /// Poll the current status.
    async fn printer_status(&self, printer: DeviceId) -> Result<DeviceStatus>;

    /// Start printing a file already present on the printer. Success means
    /// the command was dispatched, not that printing began.
    async fn start_print(&self, printer: DeviceId, filename: &str) -> Result<()>;

    /// Send raw G-code, used to move axes out of the way before an ejection.
    async fn send_gcode(&self, printer: DeviceId, gcode: &str) -> Result<()>;
}

/// Commands and status for the ejector.
#[async_trait]
pub trait EjectorControl: Send + Sync {
    /// Poll the current status.
    async fn ejector_status(&self, ejector: DeviceId) -> Result<EjectorStatus>;

    /// Dispatch one named macro. An ambiguous acknowledgment is returned as
    /// [Dispatch::Presumed], never as an error.
    async fn execute_macro(&self, ejector: DeviceId, name: &str) -> Result<Dispatch>;
}

/// One-time device setup.
#[async_trait]
pub trait Provisioning: Send + Sync {
    /// True if the backend knows a printer with this id.
    async fn printer_exists(&self, printer: DeviceId) -> Result<bool>;

    /// Register a printer, returning the id it was given.
    async fn register_printer(&self, registration: &PrinterRegistration) -> Result<DeviceId>;

    /// True if the backend knows an ejector with this id.
    async fn ejector_exists(&self, ejector: DeviceId) -> Result<bool>;

    /// Register an ejector, returning the id it was given.
    async fn register_ejector(&self, registration: &EjectorRegistration) -> Result<DeviceId>;
}

/// Everything the orchestrator needs from the outside world.
pub trait Backend: PrinterControl + EjectorControl + Provisioning {}

impl<T> Backend for T where T: PrinterControl + EjectorControl + Provisioning {}
