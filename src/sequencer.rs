//! The fixed macro sequence that clears one finished plate off a printer.

use std::{sync::Arc, time::Duration};

use parse_display::Display;
use tokio::time::Instant;

use crate::{
    config::{EjectionParams, EjectorConfig, EjectorMacros},
    Backend, DeviceId, Dispatch, EjectionError, SlotPolicy,
};

/// One physical action of the ejector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display(style = "lowercase")]
pub enum StepKind {
    /// Home the gantry.
    Home,
    /// Pull the plate off the printer.
    Eject,
    /// Put the plate in its rack slot.
    Store,
    /// Take a fresh plate from the rack.
    Grab,
    /// Put the fresh plate on the printer.
    Load,
    /// Move the gantry out of the way.
    Park,
}

/// A step and the macro that performs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// What the step does.
    pub kind: StepKind,
    /// Macro dispatched for it.
    pub macro_name: String,
}

/// Everything needed to eject one plate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EjectionRequest {
    /// Printer name.
    pub printer: String,
    /// Job id.
    pub job: String,
    /// Printer-specific eject macro.
    pub eject_macro: String,
    /// Printer-specific load macro.
    pub load_macro: String,
    /// How slot macros are named.
    pub slots: SlotPolicy,
    /// Slots to use.
    pub params: EjectionParams,
}

/// What happened during one ejection sequence.
#[derive(Debug, Default)]
pub struct SequenceReport {
    /// Steps that were dispatched and finished, in order.
    pub completed: Vec<StepKind>,
    /// Macros whose dispatch could only be presumed.
    pub presumed: u32,
    /// Why the sequence stopped early, if it did.
    pub failure: Option<EjectionError>,
}

impl SequenceReport {
    /// A sequence that ended abnormally, with no step known to have finished.
    pub fn aborted(reason: String) -> Self {
        Self {
            completed: Vec::new(),
            presumed: 0,
            failure: Some(EjectionError::Aborted(reason)),
        }
    }

    /// Every step finished.
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// The plate reached its rack slot, even if later steps failed.
    pub fn stored(&self) -> bool {
        self.completed.contains(&StepKind::Store)
    }
}

/// Drives the ejector through home, eject, store, optional grab and load,
/// and park, waiting for the ejector to come back ONLINE after each step.
///
/// Nothing is rolled back on failure: a half-finished ejection needs an
/// operator.
pub struct EjectionSequencer {
    backend: Arc<dyn Backend>,
    ejector: DeviceId,
    macros: EjectorMacros,
    idle_poll: Duration,
    idle_timeout: Duration,
}

impl EjectionSequencer {
    /// A sequencer for the ejector `ejector`.
    pub fn new(backend: Arc<dyn Backend>, ejector: DeviceId, config: &EjectorConfig) -> Self {
        Self {
            backend,
            ejector,
            macros: config.macros.clone(),
            idle_poll: config.idle_poll(),
            idle_timeout: config.idle_timeout(),
        }
    }

    /// The steps `request` will go through. Fails, without touching the
    /// ejector, if there is no store slot.
    pub fn plan(&self, request: &EjectionRequest) -> Result<Vec<Step>, EjectionError> {
        let store_slot = request
            .params
            .store_slot
            .ok_or_else(|| EjectionError::MissingStoreSlot {
                job: request.job.clone(),
            })?;

        let step = |kind, macro_name: String| Step { kind, macro_name };
        let mut steps = vec![
            step(StepKind::Home, self.macros.home.clone()),
            step(StepKind::Eject, request.eject_macro.clone()),
            step(
                StepKind::Store,
                request.slots.slot_macro(&self.macros.store_prefix, store_slot),
            ),
        ];
        if let Some(grab_slot) = request.params.grab_slot {
            steps.push(step(
                StepKind::Grab,
                request.slots.slot_macro(&self.macros.grab_prefix, grab_slot),
            ));
            steps.push(step(StepKind::Load, request.load_macro.clone()));
        }
        steps.push(step(StepKind::Park, self.macros.park.clone()));
        Ok(steps)
    }

    /// Run the whole sequence for `request`, stopping at the first failure.
    #[tracing::instrument(skip_all, fields(printer = %request.printer, job = %request.job))]
    pub async fn run(&self, request: &EjectionRequest) -> SequenceReport {
        let mut report = SequenceReport::default();
        let steps = match self.plan(request) {
            Ok(steps) => steps,
            Err(err) => {
                tracing::error!(error = %err, "cannot plan ejection");
                report.failure = Some(err);
                return report;
            }
        };

        for step in steps {
            tracing::info!(step = %step.kind, macro_name = step.macro_name, "dispatching");
            match self.backend.execute_macro(self.ejector, &step.macro_name).await {
                Ok(Dispatch::Confirmed) => {}
                Ok(Dispatch::Presumed { reason }) => {
                    tracing::warn!(
                        macro_name = step.macro_name,
                        reason = reason,
                        "dispatch not acknowledged, assuming it went through"
                    );
                    report.presumed += 1;
                }
                Err(source) => {
                    tracing::error!(macro_name = step.macro_name, error = format!("{:#}", source), "dispatch failed");
                    report.failure = Some(EjectionError::Dispatch {
                        macro_name: step.macro_name,
                        source,
                    });
                    return report;
                }
            }

            if let Err(err) = self.wait_for_idle(&step.macro_name).await {
                tracing::error!(error = %err, "ejector did not come back");
                report.failure = Some(err);
                return report;
            }
            report.completed.push(step.kind);
        }

        tracing::info!(presumed = report.presumed, "ejection sequence complete");
        report
    }

    /// Poll until the ejector reports ONLINE. Failed polls count as "not
    /// yet"; only the deadline ends the wait.
    pub async fn wait_for_idle(&self, after: &str) -> Result<(), EjectionError> {
        let start = Instant::now();
        loop {
            match self.backend.ejector_status(self.ejector).await {
                Ok(status) if status.is_idle() => {
                    tracing::debug!(macro_name = after, waited = ?start.elapsed(), "ejector idle");
                    return Ok(());
                }
                Ok(status) => {
                    tracing::debug!(macro_name = after, status = status.status, "ejector busy");
                }
                Err(err) => {
                    tracing::warn!(macro_name = after, error = format!("{:#}", err), "could not poll ejector");
                }
            }

            if start.elapsed() >= self.idle_timeout {
                return Err(EjectionError::IdleTimeout {
                    macro_name: after.to_owned(),
                    timeout: self.idle_timeout,
                });
            }
            tokio::time::sleep(self.idle_poll).await;
        }
    }
}
