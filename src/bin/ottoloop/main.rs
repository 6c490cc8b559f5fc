use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{trace::SdkTracerProvider, Resource};
use tracing_subscriber::{prelude::*, EnvFilter};

mod cmd_run;

/// Run print jobs across a farm of printers sharing one plate ejector.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "ottoloop")]
struct Cli {
    /// Config file to use
    #[arg(long, short, default_value = "ottoloop.toml", global = true)]
    config: PathBuf,

    /// Print logs as json
    #[arg(long, short, global = true)]
    json: bool,

    /// Print debug info
    #[arg(long, short, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured job to completion.
    Run {
        /// `host:port` to serve status and metrics on.
        #[arg(long, short)]
        bind: Option<String>,

        /// Trust the configured device ids and skip the device check.
        #[arg(long)]
        skip_preflight: bool,

        /// Run against simulated devices instead of the backend.
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate the config file and print the plan.
    Check,

    /// Check, and register if needed, every configured device.
    Preflight,

    /// Poll the status of one configured printer.
    Status {
        /// Printer name, as configured.
        printer: String,
    },
}

async fn handle_signals() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).map_err(|e| {
            tracing::error!(error = format!("{:?}", e), "Failed to set up SIGINT handler");
            e
        })?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
            tracing::error!(error = format!("{:?}", e), "Failed to set up SIGTERM handler");
            e
        })?;

        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await.map_err(|e| {
            tracing::error!(error = format!("{:?}", e), "Failed to set up Ctrl+C handler");
            anyhow::Error::new(e)
        })?;

        tracing::info!("received Ctrl+C (SIGINT)");
    }

    // Devices finish whatever command they were given last.
    tracing::warn!("stopping with jobs unfinished; check printers and the ejector before the next run");
    std::process::exit(1);
}

/// Export spans over OTLP, only when a collector is configured.
fn otlp_provider() -> Result<Option<SdkTracerProvider>> {
    let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") else {
        return Ok(None);
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(Resource::builder().with_service_name("ottoloop").build())
        .build();
    opentelemetry::global::set_tracer_provider(provider.clone());
    Ok(Some(provider))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::spawn(async { handle_signals().await });

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let provider = otlp_provider()?;
    let telemetry = provider
        .as_ref()
        .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer("ottoloop")));

    // Initialize tracing.
    tracing_subscriber::registry()
        .with(filter)
        .with(cli.json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!cli.json).then(tracing_subscriber::fmt::layer))
        .with(telemetry)
        .init();

    let result = match cli.command {
        Commands::Run {
            ref bind,
            skip_preflight,
            dry_run,
        } => cmd_run::run(&cli, bind.as_deref(), skip_preflight, dry_run).await,
        Commands::Check => cmd_run::check(&cli),
        Commands::Preflight => cmd_run::preflight(&cli).await,
        Commands::Status { ref printer } => cmd_run::status(&cli, printer).await,
    };

    if let Some(provider) = provider {
        if let Err(err) = provider.shutdown() {
            tracing::warn!(error = %err, "failed to flush spans");
        }
    }

    let code = result?;
    std::process::exit(code);
}
