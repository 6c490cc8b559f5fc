//! The per-printer loop: print, watch, clear the bed, eject, repeat.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context as _, Result};

use crate::{
    config::{JobSpec, PrinterPlan},
    context::{OrchestratorContext, Stage},
    monitor::{MonitorSettings, ProgressMonitor},
    sequencer::EjectionRequest,
};

/// Progress of one printer's queue. Outlives a single pipeline task, so a
/// relaunched pipeline resumes where the last one stopped.
#[derive(Debug)]
pub struct PipelineState {
    /// Printer name.
    pub printer: String,
    active: AtomicBool,
    next_job: AtomicUsize,
    completed_jobs: AtomicUsize,
}

impl PipelineState {
    /// Fresh state for `printer`, active, at the first job.
    pub fn new(printer: &str) -> Self {
        Self {
            printer: printer.to_owned(),
            active: AtomicBool::new(true),
            next_job: AtomicUsize::new(0),
            completed_jobs: AtomicUsize::new(0),
        }
    }

    /// False once the pipeline reached DONE or FAILED.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Mark the pipeline as finished, for good.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Index of the job in flight, or of the next one to start.
    pub fn next_job(&self) -> usize {
        self.next_job.load(Ordering::SeqCst)
    }

    /// Jobs printed and ejected.
    pub fn completed_jobs(&self) -> usize {
        self.completed_jobs.load(Ordering::SeqCst)
    }

    fn job_done(&self, index: usize) {
        self.completed_jobs.fetch_add(1, Ordering::SeqCst);
        self.next_job.store(index + 1, Ordering::SeqCst);
    }
}

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Every job was printed and ejected.
    Done,
    /// A job failed; the rest were left alone.
    Failed {
        /// The job that failed.
        job: String,
        /// Why.
        reason: String,
    },
}

/// Runs one printer's jobs in order. A job only starts after the previous
/// one has been ejected; the first failure stops the pipeline.
pub struct PrinterPipeline {
    plan: Arc<PrinterPlan>,
    state: Arc<PipelineState>,
    ctx: Arc<OrchestratorContext>,
    monitor: ProgressMonitor,
}

impl PrinterPipeline {
    /// A pipeline for `plan`, picking up from `state`.
    pub fn new(plan: Arc<PrinterPlan>, state: Arc<PipelineState>, ctx: Arc<OrchestratorContext>) -> Self {
        let monitor = ProgressMonitor::new(ctx.backend.clone(), MonitorSettings::from(&ctx.timing));
        Self {
            plan,
            state,
            ctx,
            monitor,
        }
    }

    fn name(&self) -> &str {
        &self.plan.spec.name
    }

    /// Work through the remaining jobs.
    #[tracing::instrument(skip_all, fields(printer = %self.plan.spec.name))]
    pub async fn run(&self) -> PipelineOutcome {
        let jobs = &self.plan.spec.jobs;
        let board = &self.ctx.board;

        loop {
            let index = self.state.next_job();
            let Some(job) = jobs.get(index) else {
                break;
            };

            tracing::info!(job = job.id, filename = job.filename, "starting job {}/{}", index + 1, jobs.len());
            board.update(self.name(), |s| {
                s.current_job = Some(job.id.clone());
                s.last_error = None;
            });

            if let Err(err) = self.run_job(index, job).await {
                let reason = format!("{:#}", err);
                tracing::error!(job = job.id, error = reason, "job failed, stopping this printer");
                self.ctx.metrics.job_failed(self.name());
                self.state.deactivate();
                board.update(self.name(), |s| {
                    s.stage = Stage::Failed;
                    s.last_error = Some(reason.clone());
                });
                return PipelineOutcome::Failed {
                    job: job.id.clone(),
                    reason,
                };
            }

            self.state.job_done(index);
            self.ctx.metrics.job_completed(self.name());
            board.update(self.name(), |s| s.completed_jobs = self.state.completed_jobs());
            tracing::info!(job = job.id, "job printed and ejected");

            if index + 1 < jobs.len() {
                board.set_stage(self.name(), Stage::CoolingDown);
                tokio::time::sleep(Duration::from_secs(self.ctx.timing.inter_job_delay_secs)).await;
            }
        }

        tracing::info!(jobs = jobs.len(), "all jobs done");
        self.state.deactivate();
        board.update(self.name(), |s| {
            s.stage = Stage::Done;
            s.current_job = None;
        });
        PipelineOutcome::Done
    }

    async fn run_job(&self, index: usize, job: &JobSpec) -> Result<()> {
        let backend = &self.ctx.backend;
        let board = &self.ctx.board;
        let timing = &self.ctx.timing;
        let id = self.plan.id;

        board.set_stage(self.name(), Stage::RunningJob);
        backend
            .start_print(id, &job.filename)
            .await
            .with_context(|| format!("could not start {}", job.filename))?;
        self.ctx.metrics.job_started(self.name());

        board.set_stage(self.name(), Stage::Monitoring);
        let grace = Duration::from_secs(if index == 0 {
            timing.first_job_grace_secs
        } else {
            timing.next_job_grace_secs
        });
        let verdict = self
            .monitor
            .watch(self.name(), id, grace, |status| board.record_status(self.name(), status))
            .await;
        if !verdict.is_success() {
            return Err(anyhow!("print {}", verdict));
        }

        board.set_stage(self.name(), Stage::Positioning);
        backend
            .send_gcode(id, &self.plan.spec.eject_position_gcode)
            .await
            .context("could not position for ejection")?;
        tokio::time::sleep(Duration::from_secs(timing.position_delay_secs)).await;

        board.set_stage(self.name(), Stage::Ejecting);
        let outcome = self
            .ctx
            .coordinator
            .eject(EjectionRequest {
                printer: self.name().to_owned(),
                job: job.id.clone(),
                eject_macro: self.plan.spec.eject_macro.clone(),
                load_macro: self.plan.spec.load_macro.clone(),
                slots: self.plan.spec.slots.clone(),
                params: job.ejection,
            })
            .await?;

        self.ctx
            .metrics
            .ejection(self.name(), outcome.report.is_success(), outcome.report.presumed);
        match outcome.report.failure {
            Some(failure) => Err(anyhow::Error::new(failure).context("ejection failed")),
            None => {
                tracing::info!(
                    job = job.id,
                    store_slot = ?outcome.store_slot,
                    grab_slot = ?outcome.grab_slot,
                    "plate ejected"
                );
                Ok(())
            }
        }
    }
}
