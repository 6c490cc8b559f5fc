//! Prometheus metrics for the run.

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PrinterLabels {
    printer: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct EjectionLabels {
    printer: String,
    result: String,
}

/// Handles to every metric the orchestrator updates. Clones share the same
/// underlying series.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    jobs_started: Family<PrinterLabels, Counter>,
    jobs_completed: Family<PrinterLabels, Counter>,
    jobs_failed: Family<PrinterLabels, Counter>,
    ejections: Family<EjectionLabels, Counter>,
    presumed_dispatches: Counter,
    active_pipelines: Gauge,
}

impl Metrics {
    /// Create the metrics and register them under `ottoloop_`.
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        let registry = registry.sub_registry_with_prefix("ottoloop");
        registry.register("jobs_started", "Print jobs started", metrics.jobs_started.clone());
        registry.register(
            "jobs_completed",
            "Print jobs printed and ejected",
            metrics.jobs_completed.clone(),
        );
        registry.register("jobs_failed", "Print jobs that failed", metrics.jobs_failed.clone());
        registry.register("ejections", "Ejection sequences run", metrics.ejections.clone());
        registry.register(
            "presumed_dispatches",
            "Ejector macros whose dispatch was never acknowledged",
            metrics.presumed_dispatches.clone(),
        );
        registry.register(
            "active_pipelines",
            "Printer pipelines currently running",
            metrics.active_pipelines.clone(),
        );
        metrics
    }

    fn printer(printer: &str) -> PrinterLabels {
        PrinterLabels {
            printer: printer.to_owned(),
        }
    }

    /// A job was started on `printer`.
    pub fn job_started(&self, printer: &str) {
        self.jobs_started.get_or_create(&Self::printer(printer)).inc();
    }

    /// A job on `printer` was printed and ejected.
    pub fn job_completed(&self, printer: &str) {
        self.jobs_completed.get_or_create(&Self::printer(printer)).inc();
    }

    /// A job on `printer` failed.
    pub fn job_failed(&self, printer: &str) {
        self.jobs_failed.get_or_create(&Self::printer(printer)).inc();
    }

    /// An ejection sequence for `printer` ended.
    pub fn ejection(&self, printer: &str, success: bool, presumed: u32) {
        let labels = EjectionLabels {
            printer: printer.to_owned(),
            result: if success { "success" } else { "failure" }.to_owned(),
        };
        self.ejections.get_or_create(&labels).inc();
        self.presumed_dispatches.inc_by(u64::from(presumed));
    }

    /// A pipeline task started.
    pub fn pipeline_started(&self) {
        self.active_pipelines.inc();
    }

    /// A pipeline was retired.
    pub fn pipeline_retired(&self) {
        self.active_pipelines.dec();
    }
}

/// Render `registry` in the Prometheus text format.
pub fn encode(registry: &Registry) -> Result<String, std::fmt::Error> {
    let mut body = String::new();
    prometheus_client::encoding::text::encode(&mut body, registry)?;
    Ok(body)
}
