use std::sync::Arc;

use anyhow::{anyhow, Result};
use ottoloop::{
    config::{Config, DeviceIds, Plan},
    orchestrator::{Orchestrator, RunSummary},
    preflight, server, Backend, DeviceState, DeviceStatus, HttpBackend, Metrics, PrinterControl, SimulatedBackend,
};
use prometheus_client::registry::Registry;

use super::Cli;

fn load(cli: &Cli) -> Result<Plan> {
    let plan = Config::from_file(&cli.config)?.validate()?;
    tracing::info!(
        config = %cli.config.display(),
        printers = plan.printers.len(),
        jobs = plan.job_count(),
        "config loaded"
    );
    Ok(plan)
}

/// Validate the config and print the plan.
pub fn check(cli: &Cli) -> Result<i32> {
    let plan = load(cli)?;
    for printer in plan.printers.iter() {
        println!(
            "{} (id {}, rack {}, {:?})",
            printer.name,
            printer.id.map(|id| id.to_string()).unwrap_or_else(|| "to register".to_owned()),
            printer.rack.as_deref().unwrap_or("none"),
            printer.slots,
        );
        for job in printer.jobs.iter() {
            println!(
                "  job {}: {} store={:?} grab={:?}",
                job.id, job.filename, job.ejection.store_slot, job.ejection.grab_slot
            );
        }
    }
    println!("{} printers, {} jobs", plan.printers.len(), plan.job_count());
    Ok(0)
}

/// Check every device against the backend.
pub async fn preflight(cli: &Cli) -> Result<i32> {
    let plan = load(cli)?;
    let backend: Arc<dyn Backend> = Arc::new(HttpBackend::new(&plan.backend)?);
    let ids = preflight::preflight(backend, &plan).await?;
    println!("{}", serde_json::to_string_pretty(&ids_json(&ids))?);
    Ok(0)
}

fn ids_json(ids: &DeviceIds) -> serde_json::Value {
    serde_json::json!({
        "ejector": ids.ejector,
        "printers": ids.printers,
    })
}

/// Poll one printer once.
pub async fn status(cli: &Cli, printer: &str) -> Result<i32> {
    let plan = load(cli)?;
    let spec = plan
        .printers
        .iter()
        .find(|p| p.name == printer)
        .ok_or_else(|| anyhow!("no printer named {} in {}", printer, cli.config.display()))?;
    let id = spec
        .id
        .ok_or_else(|| anyhow!("printer {} has no id yet; run preflight first", printer))?;

    let backend = HttpBackend::new(&plan.backend)?;
    let status = backend.printer_status(id).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(0)
}

/// Simulated devices that accept every job and finish it quickly.
async fn dry_run_backend(plan: &mut Plan) -> Arc<SimulatedBackend> {
    let sim = Arc::new(SimulatedBackend::new());
    for printer in plan.printers.iter() {
        if let Some(id) = printer.id {
            sim.add_printer(id, DeviceStatus::new(DeviceState::Idle)).await;
        }
    }
    if let Some(id) = plan.ejector.id {
        sim.add_ejector(id).await;
    }
    sim.set_busy_polls(1).await;

    let timing = &mut plan.timing;
    timing.first_job_grace_secs = 1;
    timing.next_job_grace_secs = 1;
    timing.settle_secs = 1;
    timing.position_delay_secs = 1;
    timing.inter_job_delay_secs = 1;
    timing.supervisor_interval_secs = 1;
    plan.ejector.idle_poll_secs = 1;
    sim
}

/// Run every job to completion.
pub async fn run(cli: &Cli, bind: Option<&str>, skip_preflight: bool, dry_run: bool) -> Result<i32> {
    let mut plan = load(cli)?;

    let (backend, sim): (Arc<dyn Backend>, Option<Arc<SimulatedBackend>>) = if dry_run {
        tracing::info!("dry run, using simulated devices");
        let sim = dry_run_backend(&mut plan).await;
        (sim.clone(), Some(sim))
    } else {
        (Arc::new(HttpBackend::new(&plan.backend)?), None)
    };

    let ids = if skip_preflight {
        tracing::warn!("skipping the device check");
        plan.configured_ids()?
    } else {
        preflight::preflight(backend.clone(), &plan).await?
    };

    if let Some(sim) = sim.as_ref() {
        for printer in plan.printers.iter() {
            let id = ids.printers.get(&printer.name).copied().unwrap_or_default();
            for _ in printer.jobs.iter() {
                sim.script_job(
                    id,
                    vec![
                        DeviceStatus::new(DeviceState::Running)
                            .with_progress(50.0)
                            .with_remaining(0),
                        DeviceStatus::new(DeviceState::Finish).with_progress(100.0),
                    ],
                )
                .await?;
            }
        }
    }

    let mut registry = Registry::default();
    let metrics = Metrics::register(&mut registry);
    let orchestrator = Orchestrator::from_plan(backend, &plan, &ids, metrics)?;

    let server = match bind {
        Some(bind) => {
            let ctx = orchestrator.context();
            let (server, _) = server::create_server(
                bind,
                ctx.board.clone(),
                ctx.coordinator.clone(),
                Arc::new(registry),
                server::create_logger("ottoloop", cli.json, cli.debug),
            )?;
            Some(server)
        }
        None => None,
    };

    let summary = orchestrator.run().await;
    log_summary(&summary);

    if let Some(server) = server {
        server.close().await.map_err(|e| anyhow!("closing the server failed: {}", e))?;
    }

    Ok(if summary.all_succeeded() { 0 } else { 1 })
}

fn log_summary(summary: &RunSummary) {
    for printer in summary.printers.iter() {
        match &printer.error {
            Some(error) => tracing::error!(
                printer = printer.printer,
                completed = printer.completed,
                total = printer.total,
                stage = %printer.stage,
                relaunches = printer.relaunches,
                error = error,
                "printer stopped early"
            ),
            None => tracing::info!(
                printer = printer.printer,
                completed = printer.completed,
                total = printer.total,
                stage = %printer.stage,
                relaunches = printer.relaunches,
                "printer finished"
            ),
        }
    }
    tracing::info!(
        completed = summary.completed_jobs(),
        total = summary.total_jobs(),
        "run finished"
    );
}
