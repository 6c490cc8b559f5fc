//! HTTP endpoints.

use std::{collections::BTreeMap, sync::Arc};

use dropshot::{endpoint, Body, HttpError, HttpResponseOk, Path, RequestContext};
use http::Response;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{raw::TextResponseOk, Context};
use crate::context::PipelineSnapshot;

/// Return the OpenAPI schema in JSON format.
#[endpoint {
    method = GET,
    path = "/",
    tags = ["meta"],
}]
pub async fn api_get_schema(
    rqctx: RequestContext<Arc<Context>>,
) -> Result<HttpResponseOk<serde_json::Value>, HttpError> {
    Ok(HttpResponseOk(rqctx.context().schema.clone()))
}

/// The response from the `/ping` endpoint.
#[derive(Deserialize, Debug, JsonSchema, Serialize)]
pub struct Pong {
    /// The pong response.
    pub message: String,
}

/** Return pong. */
#[endpoint {
    method = GET,
    path = "/ping",
    tags = ["meta"],
}]
pub async fn ping(_rqctx: RequestContext<Arc<Context>>) -> Result<HttpResponseOk<Pong>, HttpError> {
    Ok(HttpResponseOk(Pong {
        message: "pong".to_string(),
    }))
}

/// What the ejector coordinator is doing.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EjectorView {
    /// Printer currently holding the ejector, if any.
    pub serving: Option<String>,
    /// Next store slot of every rotating rack.
    pub next_slots: BTreeMap<String, u32>,
    /// Ejection sequences run so far.
    pub sequences: u64,
}

/// Live state of the whole run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunStatus {
    /// Every printer pipeline, sorted by printer name.
    pub pipelines: Vec<PipelineSnapshot>,
    /// The shared ejector.
    pub ejector: EjectorView,
}

/// Return the state of every pipeline and of the ejector.
#[endpoint {
    method = GET,
    path = "/status",
    tags = ["status"],
}]
pub async fn get_status(rqctx: RequestContext<Arc<Context>>) -> Result<HttpResponseOk<RunStatus>, HttpError> {
    let ctx = rqctx.context();
    let coordinator = ctx.coordinator.state();
    Ok(HttpResponseOk(RunStatus {
        pipelines: ctx.board.snapshot(),
        ejector: EjectorView {
            serving: coordinator.serving,
            next_slots: coordinator.next_slots,
            sequences: coordinator.sequences,
        },
    }))
}

/// The path parameters for endpoints scoped to one printer.
#[derive(Deserialize, Debug, JsonSchema, Serialize)]
pub struct PrinterPathParams {
    /// Printer name, as configured.
    pub printer: String,
}

/// Return the state of one printer's pipeline.
#[endpoint {
    method = GET,
    path = "/status/{printer}",
    tags = ["status"],
}]
pub async fn get_printer_status(
    rqctx: RequestContext<Arc<Context>>,
    path_params: Path<PrinterPathParams>,
) -> Result<HttpResponseOk<PipelineSnapshot>, HttpError> {
    let printer = path_params.into_inner().printer;
    match rqctx.context().board.get(&printer) {
        Some(snapshot) => Ok(HttpResponseOk(snapshot)),
        None => Err(HttpError::for_not_found(None, format!("printer {} not found", printer))),
    }
}

/// Return metrics in the Prometheus text format.
#[endpoint {
    method = GET,
    path = "/metrics",
    tags = ["meta"],
}]
pub async fn get_metrics(rqctx: RequestContext<Arc<Context>>) -> Result<Response<Body>, HttpError> {
    let text = crate::metrics::encode(&rqctx.context().registry)
        .map_err(|e| HttpError::for_internal_error(format!("encoding metrics: {}", e)))?;
    TextResponseOk(text).into()
}
