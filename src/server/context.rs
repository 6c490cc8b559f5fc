use std::sync::Arc;

use prometheus_client::registry::Registry;

use crate::{context::StatusBoard, coordinator::CoordinatorHandle};

/**
 * Application-specific context (state shared by handler functions)
 */
pub struct Context {
    /// OpenAPI description of the server.
    pub schema: serde_json::Value,
    /// Server logger.
    pub logger: slog::Logger,
    /// Live pipeline snapshots.
    pub board: StatusBoard,
    /// Read-only view of the ejector coordinator.
    pub coordinator: CoordinatorHandle,
    /// Metrics to export.
    pub registry: Arc<Registry>,
}
