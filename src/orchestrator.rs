//! Supervising one pipeline per printer until every one of them is retired.

use std::{sync::Arc, time::Duration};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::{
    config::{DeviceIds, Plan, PrinterPlan},
    context::{OrchestratorContext, Stage, StatusBoard},
    coordinator,
    pipeline::{PipelineOutcome, PipelineState, PrinterPipeline},
    sequencer::EjectionSequencer,
    Backend, ConfigError, Metrics,
};

/// Final tally for one printer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PrinterSummary {
    /// Printer name.
    pub printer: String,
    /// Jobs printed and ejected.
    pub completed: usize,
    /// Jobs configured.
    pub total: usize,
    /// Stage the pipeline ended in.
    pub stage: Stage,
    /// Times the pipeline was relaunched.
    pub relaunches: u32,
    /// Why it failed, if it did.
    pub error: Option<String>,
}

/// Final tally for the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RunSummary {
    /// Per-printer results, in config order.
    pub printers: Vec<PrinterSummary>,
}

impl RunSummary {
    /// Jobs printed and ejected, across every printer.
    pub fn completed_jobs(&self) -> usize {
        self.printers.iter().map(|p| p.completed).sum()
    }

    /// Jobs configured, across every printer.
    pub fn total_jobs(&self) -> usize {
        self.printers.iter().map(|p| p.total).sum()
    }

    /// Every configured job was printed and ejected.
    pub fn all_succeeded(&self) -> bool {
        self.completed_jobs() == self.total_jobs()
    }
}

struct Supervised {
    plan: Arc<PrinterPlan>,
    state: Arc<PipelineState>,
    task: Option<JoinHandle<PipelineOutcome>>,
    relaunches: u32,
}

/// Runs every printer's pipeline concurrently. Its only decisions are to
/// relaunch a pipeline that exited while still active, or to retire it.
pub struct Orchestrator {
    ctx: Arc<OrchestratorContext>,
    plans: Vec<Arc<PrinterPlan>>,
}

impl Orchestrator {
    /// An orchestrator for `plans`, sharing `ctx`.
    pub fn new(ctx: Arc<OrchestratorContext>, plans: Vec<PrinterPlan>) -> Self {
        for plan in plans.iter() {
            ctx.board.register(&plan.spec.name, plan.spec.jobs.len());
        }
        Self {
            ctx,
            plans: plans.into_iter().map(Arc::new).collect(),
        }
    }

    /// Wire the ejector coordinator and the shared context for `plan`,
    /// using the device ids resolved by preflight. Must be called from
    /// within a tokio runtime.
    pub fn from_plan(backend: Arc<dyn Backend>, plan: &Plan, ids: &DeviceIds, metrics: Metrics) -> Result<Self, ConfigError> {
        let plans = plan.bind(ids)?;
        let sequencer = EjectionSequencer::new(backend.clone(), ids.ejector, &plan.ejector);
        let (coordinator, _task) = coordinator::spawn(sequencer, &plan.racks);
        let ctx = Arc::new(OrchestratorContext {
            backend,
            coordinator,
            timing: plan.timing.clone(),
            board: StatusBoard::default(),
            metrics,
        });
        Ok(Self::new(ctx, plans))
    }

    /// The context shared by every pipeline.
    pub fn context(&self) -> &Arc<OrchestratorContext> {
        &self.ctx
    }

    fn launch(&self, plan: &Arc<PrinterPlan>, state: &Arc<PipelineState>) -> JoinHandle<PipelineOutcome> {
        let pipeline = PrinterPipeline::new(plan.clone(), state.clone(), self.ctx.clone());
        tokio::spawn(async move { pipeline.run().await })
    }

    /// Run until every pipeline is retired.
    pub async fn run(self) -> RunSummary {
        let mut supervised: Vec<Supervised> = self
            .plans
            .iter()
            .map(|plan| {
                let state = Arc::new(PipelineState::new(&plan.spec.name));
                let task = self.launch(plan, &state);
                self.ctx.metrics.pipeline_started();
                tracing::info!(printer = plan.spec.name, jobs = plan.spec.jobs.len(), "pipeline launched");
                Supervised {
                    plan: plan.clone(),
                    state,
                    task: Some(task),
                    relaunches: 0,
                }
            })
            .collect();

        let mut interval = tokio::time::interval(Duration::from_secs(self.ctx.timing.supervisor_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while supervised.iter().any(|s| s.task.is_some()) {
            interval.tick().await;

            for entry in supervised.iter_mut() {
                let Some(task) = entry.task.take_if(|t| t.is_finished()) else {
                    continue;
                };
                let name = entry.plan.spec.name.as_str();

                match task.await {
                    Ok(PipelineOutcome::Done) => tracing::info!(printer = name, "pipeline done"),
                    Ok(PipelineOutcome::Failed { job, reason }) => {
                        tracing::error!(printer = name, job = job, reason = reason, "pipeline failed")
                    }
                    Err(err) => tracing::error!(printer = name, error = %err, "pipeline task died"),
                }

                if !entry.state.is_active() {
                    tracing::info!(printer = name, "retiring pipeline");
                    self.ctx.metrics.pipeline_retired();
                    continue;
                }

                if entry.relaunches < self.ctx.timing.max_relaunches {
                    entry.relaunches += 1;
                    let relaunches = entry.relaunches;
                    tracing::warn!(
                        printer = name,
                        relaunch = relaunches,
                        resume_at = entry.state.next_job(),
                        "pipeline exited while active, relaunching"
                    );
                    self.ctx.board.update(name, |s| s.relaunches = relaunches);
                    entry.task = Some(self.launch(&entry.plan, &entry.state));
                } else {
                    tracing::error!(printer = name, relaunches = entry.relaunches, "relaunch limit reached, retiring pipeline");
                    entry.state.deactivate();
                    self.ctx.board.update(name, |s| {
                        s.stage = Stage::Failed;
                        s.last_error = Some("pipeline kept exiting unexpectedly".to_owned());
                    });
                    self.ctx.metrics.pipeline_retired();
                }
            }
        }

        let summary = RunSummary {
            printers: supervised
                .iter()
                .map(|entry| {
                    let snapshot = self.ctx.board.get(&entry.plan.spec.name);
                    PrinterSummary {
                        printer: entry.plan.spec.name.clone(),
                        completed: entry.state.completed_jobs(),
                        total: entry.plan.spec.jobs.len(),
                        stage: snapshot.as_ref().map(|s| s.stage).unwrap_or(Stage::Failed),
                        relaunches: entry.relaunches,
                        error: snapshot.and_then(|s| s.last_error),
                    }
                })
                .collect(),
        };
        tracing::info!(
            completed = summary.completed_jobs(),
            total = summary.total_jobs(),
            "all pipelines retired"
        );
        summary
    }
}
