use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use ottoapi::{EjectorRegistration, PrinterRegistration};
use pretty_assertions::assert_eq;
use prometheus_client::registry::Registry;
use test_context::{test_context, AsyncTestContext};
use testresult::TestResult;

use crate::{
    config::Config,
    context::Stage,
    orchestrator::{Orchestrator, RunSummary},
    sim::Command,
    Backend, DeviceId, DeviceState, DeviceStatus, Dispatch, EjectorControl, EjectorStatus, Metrics, PrinterControl,
    Provisioning, SimulatedBackend,
};

const EJECTOR: &str = r#"
    [backend]
    url = "http://localhost:3000/api"

    [ejector]
    id = 7
"#;

fn running() -> DeviceStatus {
    DeviceStatus::new(DeviceState::Running).with_progress(40.0)
}

fn finish() -> DeviceStatus {
    DeviceStatus::new(DeviceState::Finish).with_progress(100.0)
}

async fn run(backend: Arc<dyn Backend>, printers: &str) -> Result<RunSummary> {
    let plan = Config::from_str(&format!("{}\n{}", EJECTOR, printers))?.validate()?;
    let ids = plan.configured_ids()?;
    let orchestrator = Orchestrator::from_plan(backend, &plan, &ids, Metrics::default())?;
    Ok(orchestrator.run().await)
}

async fn farm(printers: &[DeviceId]) -> Arc<SimulatedBackend> {
    let sim = Arc::new(SimulatedBackend::new());
    for id in printers {
        sim.add_printer(*id, DeviceStatus::new(DeviceState::Idle)).await;
    }
    sim.add_ejector(7).await;
    sim.set_busy_polls(2).await;
    sim
}

#[tokio::test(start_paused = true)]
async fn test_one_job_prints_and_ejects_with_replacement_plate() -> TestResult {
    let sim = farm(&[1]).await;
    sim.script_job(1, vec![running(), running(), finish()]).await?;

    let summary = run(
        sim.clone(),
        r#"
        [[printers]]
        name = "p1"
        id = 1
        eject_macro = "EJECT_FROM_P1"
        load_macro = "LOAD_ONTO_P1"
        jobs = [{ filename = "part.3mf", store_slot = 3, grab_slot = 2 }]
    "#,
    )
    .await?;

    assert!(summary.all_succeeded());
    assert_eq!(summary.printers[0].stage, Stage::Done);
    assert_eq!(
        sim.macros().await,
        vec![
            "OTTOEJECT_HOME",
            "EJECT_FROM_P1",
            "STORE_TO_SLOT_3",
            "GRAB_FROM_SLOT_2",
            "LOAD_ONTO_P1",
            "PARK_OTTOEJECT",
        ]
    );

    // Start, position, then the ejection.
    let events = sim.events().await;
    assert_eq!(
        events[0].command,
        Command::StartPrint {
            printer: 1,
            filename: "part.3mf".to_owned()
        }
    );
    assert_eq!(
        events[1].command,
        Command::Gcode {
            printer: 1,
            gcode: "G90\nG1 Z150 F3000".to_owned()
        }
    );
    assert!(events[2].at - events[1].at >= std::time::Duration::from_secs(5));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_paused_print_fails_without_ejection() -> TestResult {
    let sim = farm(&[1]).await;
    sim.script_job(1, vec![running(), DeviceStatus::new(DeviceState::Paused)])
        .await?;

    let summary = run(
        sim.clone(),
        r#"
        [[printers]]
        name = "p1"
        id = 1
        eject_macro = "EJECT_FROM_P1"
        load_macro = "LOAD_ONTO_P1"
        jobs = [{ filename = "part.3mf", store_slot = 3, grab_slot = 2 }]
    "#,
    )
    .await?;

    assert!(!summary.all_succeeded());
    let p1 = &summary.printers[0];
    assert_eq!(p1.stage, Stage::Failed);
    assert_eq!(p1.completed, 0);
    assert!(p1.error.as_deref().unwrap_or_default().contains("PAUSED"));
    assert!(sim.macros().await.is_empty());
    assert!(!sim
        .events()
        .await
        .iter()
        .any(|e| matches!(e.command, Command::Gcode { .. })));
    Ok(())
}

const TWO_RACKS: &str = r#"
    [racks.A]
    shelves = 4

    [racks.B]
    shelves = 4

    [[printers]]
    name = "p1"
    id = 1
    eject_macro = "EJECT_FROM_P1"
    load_macro = "LOAD_ONTO_P1"
    rack = "A"
    jobs = [{ filename = "a.3mf", grab_slot = 1 }]

    [[printers]]
    name = "p2"
    id = 2
    eject_macro = "EJECT_FROM_P2"
    load_macro = "LOAD_ONTO_P2"
    rack = "B"
    jobs = [{ filename = "b.3mf", grab_slot = 1 }]
"#;

#[tokio::test(start_paused = true)]
async fn test_shared_ejector_serves_simultaneous_finishes_one_at_a_time() -> TestResult {
    let sim = farm(&[1, 2]).await;
    sim.script_job(1, vec![running(), finish()]).await?;
    sim.script_job(2, vec![running(), finish()]).await?;

    let plan = Config::from_str(&format!("{}\n{}", EJECTOR, TWO_RACKS))?.validate()?;
    let orchestrator = Orchestrator::from_plan(sim.clone(), &plan, &plan.configured_ids()?, Metrics::default())?;
    let ctx = orchestrator.context().clone();
    let summary = orchestrator.run().await;

    assert!(summary.all_succeeded());
    assert_eq!(summary.completed_jobs(), 2);

    let macros = sim.macros().await;
    assert_eq!(macros.len(), 12);
    let (first, second) = macros.split_at(6);
    for sequence in [first, second] {
        assert_eq!(sequence[0], "OTTOEJECT_HOME");
        assert_eq!(sequence[5], "PARK_OTTOEJECT");
        // Every macro of a sequence targets the same printer and rack.
        let printer = &sequence[1]["EJECT_FROM_".len()..];
        let rack = if printer == "P1" { "A" } else { "B" };
        assert_eq!(sequence[2], format!("STORE_TO_SLOT_{}_1", rack));
        assert_eq!(sequence[3], format!("GRAB_FROM_SLOT_{}_1", rack));
        assert_eq!(sequence[4], format!("LOAD_ONTO_{}", printer));
    }
    assert_ne!(first[1], second[1]);

    let state = ctx.coordinator.state();
    assert_eq!(state.sequences, 2);
    assert_eq!(state.next_slots["A"], 2);
    assert_eq!(state.next_slots["B"], 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failed_printer_does_not_stop_the_others() -> TestResult {
    let sim = farm(&[1, 2]).await;
    sim.reject_starts(1).await?;
    sim.script_job(2, vec![running(), finish()]).await?;

    let summary = run(sim.clone(), TWO_RACKS).await?;

    assert_eq!(summary.printers[0].stage, Stage::Failed);
    assert_eq!(summary.printers[0].relaunches, 0);
    assert_eq!(summary.printers[1].stage, Stage::Done);
    assert_eq!(summary.completed_jobs(), 1);
    assert_eq!(summary.total_jobs(), 2);
    assert!(sim.macros().await.contains(&"EJECT_FROM_P2".to_owned()));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_jobs_run_in_order_with_cool_down() -> TestResult {
    let sim = farm(&[1]).await;
    sim.script_job(1, vec![running(), finish()]).await?;
    sim.script_job(1, vec![running(), finish()]).await?;

    let summary = run(
        sim.clone(),
        r#"
        [racks.A]
        shelves = 2
        grab_slot = 2

        [[printers]]
        name = "p1"
        id = 1
        eject_macro = "EJECT_FROM_P1"
        load_macro = "LOAD_ONTO_P1"
        rack = "A"
        jobs = [
            { id = "first", filename = "a.3mf" },
            { id = "second", filename = "b.3mf" },
        ]
    "#,
    )
    .await?;

    assert!(summary.all_succeeded());
    let starts: Vec<_> = sim
        .events()
        .await
        .into_iter()
        .filter(|e| matches!(e.command, Command::StartPrint { .. }))
        .collect();
    assert_eq!(starts.len(), 2);
    assert!(starts[1].at - starts[0].at > std::time::Duration::from_secs(120 + 15));

    let macros = sim.macros().await;
    assert!(macros.contains(&"STORE_TO_SLOT_A_1".to_owned()));
    assert!(macros.contains(&"STORE_TO_SLOT_A_2".to_owned()));
    assert!(!macros.iter().any(|m| m.starts_with("GRAB_FROM_SLOT")));
    Ok(())
}

/// Delegates to a [SimulatedBackend], but panics on the first print start.
/// Where [PanicOnce] crashes.
enum PanicAt {
    StartPrint,
    Macro(&'static str),
}

struct PanicOnce {
    inner: Arc<SimulatedBackend>,
    at: PanicAt,
    panicked: AtomicBool,
}

#[async_trait]
impl PrinterControl for PanicOnce {
    async fn printer_status(&self, printer: DeviceId) -> Result<DeviceStatus> {
        self.inner.printer_status(printer).await
    }

    async fn start_print(&self, printer: DeviceId, filename: &str) -> Result<()> {
        if matches!(self.at, PanicAt::StartPrint) && !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("pipeline task crashed");
        }
        self.inner.start_print(printer, filename).await
    }

    async fn send_gcode(&self, printer: DeviceId, gcode: &str) -> Result<()> {
        self.inner.send_gcode(printer, gcode).await
    }
}

#[async_trait]
impl EjectorControl for PanicOnce {
    async fn ejector_status(&self, ejector: DeviceId) -> Result<EjectorStatus> {
        self.inner.ejector_status(ejector).await
    }

    async fn execute_macro(&self, ejector: DeviceId, name: &str) -> Result<Dispatch> {
        if matches!(self.at, PanicAt::Macro(target) if target == name) && !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("ejection crashed");
        }
        self.inner.execute_macro(ejector, name).await
    }
}

#[async_trait]
impl Provisioning for PanicOnce {
    async fn printer_exists(&self, printer: DeviceId) -> Result<bool> {
        self.inner.printer_exists(printer).await
    }

    async fn register_printer(&self, registration: &PrinterRegistration) -> Result<DeviceId> {
        self.inner.register_printer(registration).await
    }

    async fn ejector_exists(&self, ejector: DeviceId) -> Result<bool> {
        self.inner.ejector_exists(ejector).await
    }

    async fn register_ejector(&self, registration: &EjectorRegistration) -> Result<DeviceId> {
        self.inner.register_ejector(registration).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_crashed_pipeline_is_relaunched() -> TestResult {
    let sim = farm(&[1]).await;
    sim.script_job(1, vec![running(), finish()]).await?;
    let backend = Arc::new(PanicOnce {
        inner: sim.clone(),
        at: PanicAt::StartPrint,
        panicked: AtomicBool::new(false),
    });

    let summary = run(
        backend,
        r#"
        [[printers]]
        name = "p1"
        id = 1
        eject_macro = "EJECT_FROM_P1"
        load_macro = "LOAD_ONTO_P1"
        jobs = [{ filename = "part.3mf", store_slot = 1 }]
    "#,
    )
    .await?;

    assert!(summary.all_succeeded());
    assert_eq!(summary.printers[0].relaunches, 1);
    assert_eq!(summary.printers[0].stage, Stage::Done);
    assert_eq!(sim.macros().await.len(), 4);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_crashed_ejection_fails_only_its_printer() -> TestResult {
    let sim = farm(&[1, 2]).await;
    sim.script_job(1, vec![running(), finish()]).await?;
    sim.script_job(2, vec![running(), running(), running(), finish()]).await?;
    let backend = Arc::new(PanicOnce {
        inner: sim.clone(),
        at: PanicAt::Macro("EJECT_FROM_P1"),
        panicked: AtomicBool::new(false),
    });

    let summary = run(
        backend,
        r#"
        [[printers]]
        name = "p1"
        id = 1
        eject_macro = "EJECT_FROM_P1"
        load_macro = "LOAD_ONTO_P1"
        jobs = [{ filename = "a.3mf", store_slot = 1 }]

        [[printers]]
        name = "p2"
        id = 2
        eject_macro = "EJECT_FROM_P2"
        load_macro = "LOAD_ONTO_P2"
        jobs = [{ filename = "b.3mf", store_slot = 2 }]
    "#,
    )
    .await?;

    let p1 = &summary.printers[0];
    assert_eq!(p1.stage, Stage::Failed);
    assert!(p1.error.as_deref().unwrap_or_default().contains("aborted"), "{:?}", p1.error);

    let p2 = &summary.printers[1];
    assert_eq!(p2.stage, Stage::Done);
    assert_eq!(p2.completed, 1);
    assert!(sim.macros().await.contains(&"EJECT_FROM_P2".to_owned()));
    Ok(())
}

struct ServerContext {
    address: String,
    server: dropshot::HttpServer<Arc<crate::server::Context>>,
    client: reqwest::Client,
}

impl ServerContext {
    pub async fn new() -> Result<Self> {
        // Find an unused port.
        let port = portpicker::pick_unused_port().ok_or_else(|| anyhow::anyhow!("no port available"))?;
        let address = format!("127.0.0.1:{}", port);

        let sim = farm(&[1]).await;
        let plan = Config::from_str(&format!(
            "{}\n{}",
            EJECTOR,
            r#"
            [[printers]]
            name = "p1"
            id = 1
            eject_macro = "EJECT_FROM_P1"
            load_macro = "LOAD_ONTO_P1"
            jobs = [{ filename = "part.3mf", store_slot = 1 }]
        "#
        ))?
        .validate()?;

        let mut registry = Registry::default();
        let metrics = Metrics::register(&mut registry);
        metrics.job_started("p1");
        let orchestrator = Orchestrator::from_plan(sim, &plan, &plan.configured_ids()?, metrics)?;
        let ctx = orchestrator.context();

        let (server, _context) = crate::server::create_server(
            &address,
            ctx.board.clone(),
            ctx.coordinator.clone(),
            Arc::new(registry),
            crate::server::create_logger("ottoloop-test", false, true),
        )?;

        Ok(ServerContext {
            address,
            server,
            client: reqwest::Client::new(),
        })
    }

    pub async fn stop(self) -> Result<()> {
        self.server
            .close()
            .await
            .map_err(|e| anyhow::anyhow!("closing the server failed: {}", e))
    }

    pub fn get_url(&self, path: &str) -> String {
        format!("http://{}/{}", self.address, path.trim_start_matches('/'))
    }
}

impl AsyncTestContext for ServerContext {
    async fn setup() -> Self {
        ServerContext::new().await.unwrap()
    }

    async fn teardown(self) {
        self.stop().await.unwrap();
    }
}

#[test]
fn test_openapi() -> TestResult {
    let mut api = crate::server::create_api_description()?;
    let schema = crate::server::get_openapi(&mut api)?;

    assert_eq!(schema["info"]["title"], "ottoloop");
    for path in ["/ping", "/status", "/status/{printer}", "/metrics"] {
        assert!(schema["paths"].get(path).is_some(), "missing {}", path);
    }
    Ok(())
}

#[test_context(ServerContext)]
#[tokio::test]
async fn test_ping(ctx: &mut ServerContext) -> TestResult {
    let response = ctx.client.get(ctx.get_url("ping")).send().await?;

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let pong: crate::server::endpoints::Pong = response.json().await?;
    assert_eq!(pong.message, "pong");
    Ok(())
}

#[test_context(ServerContext)]
#[tokio::test]
async fn test_status(ctx: &mut ServerContext) -> TestResult {
    let response = ctx.client.get(ctx.get_url("status")).send().await?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let status: crate::server::endpoints::RunStatus = response.json().await?;
    assert_eq!(status.pipelines.len(), 1);
    assert_eq!(status.pipelines[0].printer, "p1");
    assert_eq!(status.pipelines[0].stage, Stage::Pending);
    assert_eq!(status.pipelines[0].total_jobs, 1);
    assert_eq!(status.ejector.serving, None);
    assert_eq!(status.ejector.sequences, 0);

    let response = ctx.client.get(ctx.get_url("status/p1")).send().await?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let response = ctx.client.get(ctx.get_url("status/nope")).send().await?;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    Ok(())
}

#[test_context(ServerContext)]
#[tokio::test]
async fn test_metrics(ctx: &mut ServerContext) -> TestResult {
    let response = ctx.client.get(ctx.get_url("metrics")).send().await?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let text = response.text().await?;
    assert!(text.contains(r#"ottoloop_jobs_started_total{printer="p1"} 1"#), "{}", text);
    assert!(text.contains("ottoloop_active_pipelines"), "{}", text);
    Ok(())
}
