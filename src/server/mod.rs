//! Read-only HTTP view of a run: pipeline snapshots, ejector state and
//! metrics.

mod context;
pub mod endpoints;
mod raw;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use dropshot::{ApiDescription, ConfigDropshot, HttpServer, ServerBuilder};
use prometheus_client::registry::Registry;
use slog::Drain;

pub use context::Context;

use crate::{context::StatusBoard, coordinator::CoordinatorHandle};

/// Create an API description for the server.
pub fn create_api_description() -> Result<ApiDescription<Arc<Context>>> {
    let mut api = ApiDescription::new();
    api.register(endpoints::ping)
        .map_err(|err| anyhow!("failed to register ping: {}", err))?;
    api.register(endpoints::api_get_schema)
        .map_err(|err| anyhow!("failed to register api_get_schema: {}", err))?;
    api.register(endpoints::get_status)
        .map_err(|err| anyhow!("failed to register get_status: {}", err))?;
    api.register(endpoints::get_printer_status)
        .map_err(|err| anyhow!("failed to register get_printer_status: {}", err))?;
    api.register(endpoints::get_metrics)
        .map_err(|err| anyhow!("failed to register get_metrics: {}", err))?;
    Ok(api)
}

/// Get the OpenAPI specification for the server.
pub fn get_openapi(api: &mut ApiDescription<Arc<Context>>) -> Result<serde_json::Value> {
    let mut definition = api.openapi("ottoloop", env!("CARGO_PKG_VERSION").parse()?);
    definition
        .description("Live status of the print farm loop")
        .json()
        .map_err(|e| e.into())
}

/// Build the root logger for the server, as JSON or for a terminal.
pub fn create_logger(app: &str, json: bool, debug: bool) -> slog::Logger {
    if json {
        let drain = slog_json::Json::default(std::io::stderr()).fuse();
        async_root_logger(drain, app, debug)
    } else {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        async_root_logger(drain, app, debug)
    }
}

fn async_root_logger<T>(drain: T, app: &str, debug: bool) -> slog::Logger
where
    T: slog::Drain + Send + 'static,
    <T as slog::Drain>::Err: std::fmt::Debug,
{
    let level = if debug { slog::Level::Debug } else { slog::Level::Info };

    let level_drain = slog::LevelFilter(drain, level).fuse();
    let async_drain = slog_async::Async::new(level_drain).build().fuse();
    slog::Logger::root(async_drain, slog::o!("app" => app.to_owned()))
}

/// Start serving on `bind`. The returned server runs until closed or
/// dropped along with the runtime.
pub fn create_server(
    bind: &str,
    board: StatusBoard,
    coordinator: CoordinatorHandle,
    registry: Arc<Registry>,
    logger: slog::Logger,
) -> Result<(HttpServer<Arc<Context>>, Arc<Context>)> {
    let mut api = create_api_description()?;
    let schema = get_openapi(&mut api)?;

    let config_dropshot = ConfigDropshot {
        bind_address: bind.parse()?,
        ..Default::default()
    };

    let dropshot_logger = logger.new(slog::o!("component" => "dropshot"));
    let api_context = Arc::new(Context {
        schema,
        logger,
        board,
        coordinator,
        registry,
    });

    let server = ServerBuilder::new(api, api_context.clone(), dropshot_logger)
        .config(config_dropshot)
        .start()
        .map_err(|error| anyhow!("failed to create server: {}", error))?;
    tracing::info!(bind = bind, "status server listening");

    Ok((server, api_context))
}
