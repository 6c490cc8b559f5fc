//! `sim` implements an in-memory [crate::Backend]: scripted printers and an
//! ejector that accept commands and report believable status, with nothing
//! on the other end.

use std::collections::{BTreeMap, VecDeque};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use ottoapi::{EjectorRegistration, PrinterRegistration};
use tokio::{sync::Mutex, time::Instant};

use crate::{
    DeviceId, DeviceState, DeviceStatus, Dispatch, EjectorControl, EjectorStatus, PrinterControl, Provisioning,
};

/// How the simulated ejector answers one macro dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacroResponse {
    /// Acknowledged.
    Confirm,
    /// Acknowledgment lost, macro runs anyway.
    AckTimeout,
    /// Refused; the macro does not run.
    Reject,
}

/// Something a caller asked a simulated device to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// A print was started.
    StartPrint {
        /// Printer id.
        printer: DeviceId,
        /// File name.
        filename: String,
    },
    /// G-code was sent.
    Gcode {
        /// Printer id.
        printer: DeviceId,
        /// The G-code.
        gcode: String,
    },
    /// A macro was dispatched, whether or not it was accepted.
    Macro {
        /// Ejector id.
        ejector: DeviceId,
        /// Macro name.
        name: String,
    },
}

/// A command and when it arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Time the command arrived.
    pub at: Instant,
    /// The command.
    pub command: Command,
}

#[derive(Debug)]
struct SimPrinter {
    scripts: VecDeque<Vec<DeviceStatus>>,
    current: VecDeque<DeviceStatus>,
    last: DeviceStatus,
    failing_polls: u32,
    polls: u32,
    reject_starts: bool,
}

impl SimPrinter {
    fn new(status: DeviceStatus) -> Self {
        Self {
            scripts: VecDeque::new(),
            current: VecDeque::new(),
            last: status,
            failing_polls: 0,
            polls: 0,
            reject_starts: false,
        }
    }

    fn poll(&mut self) -> DeviceStatus {
        if let Some(next) = self.current.pop_front() {
            self.last = next;
        }
        let mut status = self.last.clone();
        status.observed_at = chrono::Utc::now();
        status
    }
}

#[derive(Debug, Default)]
struct SimState {
    printers: BTreeMap<DeviceId, SimPrinter>,
    ejectors: BTreeMap<DeviceId, u32>,
    busy_polls: u32,
    macro_responses: VecDeque<MacroResponse>,
    events: Vec<Event>,
    next_id: DeviceId,
}

/// Simulated printers and ejector.
///
/// Each printer replays one status script per started job; the last status
/// of a script repeats until the next job starts. The ejector reports
/// `BUSY` for a configurable number of polls after every accepted macro.
#[derive(Debug)]
pub struct SimulatedBackend {
    state: Mutex<SimState>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    /// An empty backend.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                next_id: 1000,
                ..Default::default()
            }),
        }
    }

    /// Add a printer reporting `status` until its first job starts.
    pub async fn add_printer(&self, id: DeviceId, status: DeviceStatus) {
        self.state.lock().await.printers.insert(id, SimPrinter::new(status));
    }

    /// Queue the statuses reported after the next job starts on `printer`.
    pub async fn script_job(&self, printer: DeviceId, statuses: Vec<DeviceStatus>) -> Result<()> {
        let mut state = self.state.lock().await;
        let printer = state
            .printers
            .get_mut(&printer)
            .ok_or_else(|| anyhow!("unknown printer {}", printer))?;
        printer.scripts.push_back(statuses);
        Ok(())
    }

    /// Make the next `count` status polls of `printer` fail.
    pub async fn fail_polls(&self, printer: DeviceId, count: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        let printer = state
            .printers
            .get_mut(&printer)
            .ok_or_else(|| anyhow!("unknown printer {}", printer))?;
        printer.failing_polls = count;
        Ok(())
    }

    /// Refuse every start command sent to `printer`.
    pub async fn reject_starts(&self, printer: DeviceId) -> Result<()> {
        let mut state = self.state.lock().await;
        let printer = state
            .printers
            .get_mut(&printer)
            .ok_or_else(|| anyhow!("unknown printer {}", printer))?;
        printer.reject_starts = true;
        Ok(())
    }

    /// Add an ejector, idle.
    pub async fn add_ejector(&self, id: DeviceId) {
        self.state.lock().await.ejectors.insert(id, 0);
    }

    /// Number of `BUSY` polls after each accepted macro.
    pub async fn set_busy_polls(&self, polls: u32) {
        self.state.lock().await.busy_polls = polls;
    }

    /// Queue answers for upcoming macro dispatches. Once the queue is empty
    /// every dispatch is confirmed.
    pub async fn script_macros(&self, responses: impl IntoIterator<Item = MacroResponse>) {
        self.state.lock().await.macro_responses.extend(responses);
    }

    /// Every command received so far, in arrival order.
    pub async fn events(&self) -> Vec<Event> {
        self.state.lock().await.events.clone()
    }

    /// Names of every macro dispatched so far, in order.
    pub async fn macros(&self) -> Vec<String> {
        self.events()
            .await
            .into_iter()
            .filter_map(|e| match e.command {
                Command::Macro { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Status polls answered, successfully or not, for `printer`.
    pub async fn polls(&self, printer: DeviceId) -> u32 {
        self.state.lock().await.printers.get(&printer).map(|p| p.polls).unwrap_or(0)
    }
}

impl SimState {
    fn record(&mut self, command: Command) {
        self.events.push(Event {
            at: Instant::now(),
            command,
        });
    }

    fn printer(&mut self, id: DeviceId) -> Result<&mut SimPrinter> {
        self.printers
            .get_mut(&id)
            .ok_or_else(|| anyhow!("404 Not Found: printer {}", id))
    }
}

#[async_trait]
impl PrinterControl for SimulatedBackend {
    async fn printer_status(&self, printer: DeviceId) -> Result<DeviceStatus> {
        let mut state = self.state.lock().await;
        let printer = state.printer(printer)?;
        printer.polls += 1;
        if printer.failing_polls > 0 {
            printer.failing_polls -= 1;
            bail!("request timed out");
        }
        Ok(printer.poll())
    }

    async fn start_print(&self, printer: DeviceId, filename: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.record(Command::StartPrint {
            printer,
            filename: filename.to_owned(),
        });
        let sim = state.printer(printer)?;
        if sim.reject_starts {
            bail!("printer {} refused to start {}", printer, filename);
        }
        sim.current = sim.scripts.pop_front().unwrap_or_default().into();
        Ok(())
    }

    async fn send_gcode(&self, printer: DeviceId, gcode: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.record(Command::Gcode {
            printer,
            gcode: gcode.to_owned(),
        });
        state.printer(printer)?;
        Ok(())
    }
}

#[async_trait]
impl EjectorControl for SimulatedBackend {
    async fn ejector_status(&self, ejector: DeviceId) -> Result<EjectorStatus> {
        let mut state = self.state.lock().await;
        let busy = state
            .ejectors
            .get_mut(&ejector)
            .ok_or_else(|| anyhow!("404 Not Found: ottoeject {}", ejector))?;
        if *busy > 0 {
            *busy -= 1;
            return Ok(EjectorStatus::new("BUSY"));
        }
        Ok(EjectorStatus::new("ONLINE"))
    }

    async fn execute_macro(&self, ejector: DeviceId, name: &str) -> Result<Dispatch> {
        let mut state = self.state.lock().await;
        state.record(Command::Macro {
            ejector,
            name: name.to_owned(),
        });
        let response = state.macro_responses.pop_front().unwrap_or(MacroResponse::Confirm);
        let busy_polls = state.busy_polls;
        let busy = state
            .ejectors
            .get_mut(&ejector)
            .ok_or_else(|| anyhow!("404 Not Found: ottoeject {}", ejector))?;

        match response {
            MacroResponse::Confirm => {
                *busy = busy_polls;
                Ok(Dispatch::Confirmed)
            }
            MacroResponse::AckTimeout => {
                *busy = busy_polls;
                Ok(Dispatch::Presumed {
                    reason: "device ack timeout".to_owned(),
                })
            }
            MacroResponse::Reject => bail!("500 Internal Server Error: macro {} rejected", name),
        }
    }
}

#[async_trait]
impl Provisioning for SimulatedBackend {
    async fn printer_exists(&self, printer: DeviceId) -> Result<bool> {
        Ok(self.state.lock().await.printers.contains_key(&printer))
    }

    async fn register_printer(&self, registration: &PrinterRegistration) -> Result<DeviceId> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;
        tracing::debug!(name = registration.name, id = id, "simulated printer registered");
        state
            .printers
            .insert(id, SimPrinter::new(DeviceStatus::new(DeviceState::Idle)));
        Ok(id)
    }

    async fn ejector_exists(&self, ejector: DeviceId) -> Result<bool> {
        Ok(self.state.lock().await.ejectors.contains_key(&ejector))
    }

    async fn register_ejector(&self, registration: &EjectorRegistration) -> Result<DeviceId> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;
        tracing::debug!(name = registration.device_name, id = id, "simulated ejector registered");
        state.ejectors.insert(id, 0);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use testresult::TestResult;

    use super::*;

    #[tokio::test]
    async fn test_script_replays_then_repeats() -> TestResult {
        let sim = SimulatedBackend::new();
        sim.add_printer(1, DeviceStatus::new(DeviceState::Idle)).await;
        sim.script_job(
            1,
            vec![
                DeviceStatus::new(DeviceState::Running),
                DeviceStatus::new(DeviceState::Finish),
            ],
        )
        .await?;

        assert_eq!(sim.printer_status(1).await?.state, DeviceState::Idle);
        sim.start_print(1, "a.3mf").await?;
        assert_eq!(sim.printer_status(1).await?.state, DeviceState::Running);
        assert_eq!(sim.printer_status(1).await?.state, DeviceState::Finish);
        assert_eq!(sim.printer_status(1).await?.state, DeviceState::Finish);
        assert_eq!(sim.polls(1).await, 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_ejector_busy_after_macro() -> TestResult {
        let sim = SimulatedBackend::new();
        sim.add_ejector(7).await;
        sim.set_busy_polls(2).await;
        sim.script_macros([MacroResponse::AckTimeout, MacroResponse::Reject]).await;

        assert!(matches!(sim.execute_macro(7, "HOME").await?, Dispatch::Presumed { .. }));
        assert!(!sim.ejector_status(7).await?.is_idle());
        assert!(!sim.ejector_status(7).await?.is_idle());
        assert!(sim.ejector_status(7).await?.is_idle());

        assert!(sim.execute_macro(7, "PARK").await.is_err());
        assert!(sim.ejector_status(7).await?.is_idle());
        assert_eq!(sim.macros().await, vec!["HOME".to_owned(), "PARK".to_owned()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_poll_failures_and_unknown_devices() -> TestResult {
        let sim = SimulatedBackend::new();
        sim.add_printer(1, DeviceStatus::new(DeviceState::Idle)).await;
        sim.fail_polls(1, 1).await?;
        assert!(sim.printer_status(1).await.is_err());
        assert!(sim.printer_status(1).await.is_ok());
        assert!(sim.printer_status(2).await.is_err());
        assert!(!sim.ejector_exists(7).await?);
        Ok(())
    }
}
