//! One-time device check and registration before any pipeline starts.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{bail, Context as _, Result};

use crate::{
    config::{DeviceIds, Plan, PrinterSpec},
    sequencer::EjectionSequencer,
    Backend, DeviceId, DeviceState,
};

/// Pause after registering a printer, while the backend connects to it.
const REGISTRATION_SETTLE: Duration = Duration::from_secs(5);

/// Check that every configured device exists and is ready, registering the
/// ones that are missing. Returns the ids to run with.
///
/// Every printer is checked even after one fails, so a single run reports
/// every problem.
pub async fn preflight(backend: Arc<dyn Backend>, plan: &Plan) -> Result<DeviceIds> {
    tracing::info!(printers = plan.printers.len(), "checking devices");

    let mut printers = BTreeMap::new();
    let mut problems = 0;
    for spec in plan.printers.iter() {
        match check_printer(backend.as_ref(), spec).await {
            Ok(id) => {
                printers.insert(spec.name.clone(), id);
            }
            Err(err) => {
                tracing::error!(printer = spec.name, error = format!("{:#}", err), "printer not ready");
                problems += 1;
            }
        }
    }

    let ejector = check_ejector(backend, plan).await?;
    if problems > 0 {
        bail!("{} of {} printers failed the device check", problems, plan.printers.len());
    }

    tracing::info!(ejector = ejector, "all devices ready");
    Ok(DeviceIds { ejector, printers })
}

async fn check_printer(backend: &dyn Backend, spec: &PrinterSpec) -> Result<DeviceId> {
    if let Some(id) = spec.id {
        if backend.printer_exists(id).await? {
            let status = backend
                .printer_status(id)
                .await
                .with_context(|| format!("printer {} exists but its status is unavailable", id))?;
            tracing::info!(printer = spec.name, id = id, state = %status.state, "found printer");
            return match status.state {
                state if state.is_ready() => Ok(id),
                DeviceState::Offline | DeviceState::Unknown => bail!("printer {} is {}", id, status.state),
                state => bail!(
                    "printer {} is busy ({}, stage {}); needs manual intervention",
                    id,
                    state,
                    status.stage.as_deref().unwrap_or("N/A")
                ),
            };
        }
        tracing::info!(printer = spec.name, id = id, "printer not known to the backend");
    }

    let Some(registration) = spec.registration.as_ref() else {
        bail!("printer is not registered and has no registration payload");
    };
    let id = backend.register_printer(registration).await.context("registration failed")?;
    tracing::info!(printer = spec.name, id = id, "printer registered");

    tokio::time::sleep(REGISTRATION_SETTLE).await;
    let status = backend
        .printer_status(id)
        .await
        .with_context(|| format!("registered printer {} but could not read its status", id))?;
    match status.state {
        // A fresh registration may still be connecting.
        DeviceState::Idle | DeviceState::Finish | DeviceState::Offline | DeviceState::Unknown => Ok(id),
        state => bail!("newly registered printer {} is in unexpected state {}", id, state),
    }
}

async fn check_ejector(backend: Arc<dyn Backend>, plan: &Plan) -> Result<DeviceId> {
    let existing = match plan.ejector.id {
        Some(id) if backend.ejector_exists(id).await? => Some(id),
        _ => None,
    };

    let id = match (existing, plan.ejector.registration.as_ref()) {
        (Some(id), _) => id,
        (None, Some(registration)) => {
            let id = backend
                .register_ejector(registration)
                .await
                .context("ejector registration failed")?;
            tracing::info!(id = id, name = registration.device_name, "ejector registered");
            id
        }
        (None, None) => bail!("ejector is not registered and has no registration payload"),
    };

    EjectionSequencer::new(backend, id, &plan.ejector)
        .wait_for_idle("preflight")
        .await
        .with_context(|| format!("ejector {} never came ONLINE", id))?;
    Ok(id)
}
