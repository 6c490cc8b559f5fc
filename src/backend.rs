//! The device backend reached over HTTP.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use ottoapi::{Client, EjectorRegistration, MacroDispatch, MacroRequest, PrinterRegistration};

use crate::{
    config::BackendConfig, DeviceId, DeviceStatus, Dispatch, EjectorControl, EjectorStatus, PrinterControl,
    Provisioning,
};

/// [crate::Backend] implementation talking to the device backend.
#[derive(Clone, Debug)]
pub struct HttpBackend {
    client: Client,
}

impl HttpBackend {
    /// Build a backend client from its configuration.
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = Client::new(&config.url)?.with_timeouts(
            Duration::from_secs(config.request_timeout_secs),
            Duration::from_secs(config.gcode_timeout_secs),
            Duration::from_secs(config.macro_timeout_secs),
        );
        Ok(Self { client })
    }

    /// The underlying API client.
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl PrinterControl for HttpBackend {
    async fn printer_status(&self, printer: DeviceId) -> Result<DeviceStatus> {
        Ok(self.client.printer_status(printer).await?.into())
    }

    async fn start_print(&self, printer: DeviceId, filename: &str) -> Result<()> {
        let ack = self.client.start_print(printer, filename).await?;
        if !ack.is_dispatched() {
            bail!(
                "printer {} did not confirm the start of {} ({}: {})",
                printer,
                filename,
                ack.status,
                ack.message.unwrap_or_default()
            );
        }
        Ok(())
    }

    async fn send_gcode(&self, printer: DeviceId, gcode: &str) -> Result<()> {
        let ack = self.client.send_gcode(printer, gcode).await?;
        if !ack.is_dispatched() {
            bail!("printer {} did not accept G-code ({})", printer, ack.status);
        }
        Ok(())
    }
}

#[async_trait]
impl EjectorControl for HttpBackend {
    async fn ejector_status(&self, ejector: DeviceId) -> Result<EjectorStatus> {
        let status = self.client.ejector_status(ejector).await?;
        Ok(EjectorStatus::new(&status.status))
    }

    async fn execute_macro(&self, ejector: DeviceId, name: &str) -> Result<Dispatch> {
        match self.client.execute_macro(ejector, &MacroRequest::new(name)).await? {
            MacroDispatch::Accepted { status } => {
                tracing::debug!(ejector = ejector, name = name, status = %status, "macro accepted");
                Ok(Dispatch::Confirmed)
            }
            MacroDispatch::AckTimeout { message } => Ok(Dispatch::Presumed { reason: message }),
        }
    }
}

#[async_trait]
impl Provisioning for HttpBackend {
    async fn printer_exists(&self, printer: DeviceId) -> Result<bool> {
        Ok(self.client.printer(printer).await?.is_some())
    }

    async fn register_printer(&self, registration: &PrinterRegistration) -> Result<DeviceId> {
        Ok(self.client.register_printer(registration).await?.id)
    }

    async fn ejector_exists(&self, ejector: DeviceId) -> Result<bool> {
        Ok(self.client.ottoeject(ejector).await?.is_some())
    }

    async fn register_ejector(&self, registration: &EjectorRegistration) -> Result<DeviceId> {
        Ok(self.client.register_ottoeject(registration).await?.id)
    }
}
