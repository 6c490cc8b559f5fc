use std::collections::BTreeMap;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Client, Error, Result};

/// Live status of a printer, as relayed by the backend.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct PrinterStatus {
    /// Main state, for instance `RUNNING`, `FINISH` or `IDLE`.
    pub status: String,

    /// Free-form description of what the printer is doing right now.
    #[serde(default)]
    pub current_stage: Option<String>,

    /// Print progress from 0 to 100, when known.
    #[serde(default)]
    pub progress_percent: Option<f64>,

    /// Estimated minutes left on the current print, when known.
    #[serde(default)]
    pub remaining_time_minutes: Option<i64>,

    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

/// Body used to register a printer with the backend.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct PrinterRegistration {
    /// Display name.
    pub name: String,
    /// Manufacturer, for instance `Bambu Lab`.
    pub brand: String,
    /// Model, for instance `P1P`.
    pub model: String,
    /// Printer technology or integration type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Address the backend connects to.
    pub ip_address: String,
    /// LAN access code, for printers that need one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_code: Option<String>,
    /// Serial number, for printers that need one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

/// A device as stored by the backend. Only the id is interpreted.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DeviceRecord {
    /// Backend assigned identifier.
    pub id: u64,

    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

impl DeviceRecord {
    /// Return a named field of the record, if present.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.other.get(key)
    }
}

/// Acknowledgment of a printer command. The backend either answers with a
/// message mentioning that the command was sent, or with a bare 202.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandAck {
    /// Status code of the response.
    pub status: StatusCode,
    /// Message returned by the backend, if any.
    pub message: Option<String>,
}

impl CommandAck {
    /// True when the backend reported the command as dispatched to the
    /// device. Dispatch says nothing about completion.
    pub fn is_dispatched(&self) -> bool {
        self.status == StatusCode::ACCEPTED
            || self
                .message
                .as_deref()
                .map(|m| m.to_lowercase().contains("sent"))
                .unwrap_or(false)
    }
}

#[derive(Serialize)]
struct StartPrint<'a> {
    filename: &'a str,
}

#[derive(Serialize)]
struct SendGcode<'a> {
    gcode: &'a str,
}

impl Client {
    /// Poll the live status of a printer.
    pub async fn printer_status(&self, id: u64) -> Result<PrinterStatus> {
        self.get_json(&format!("printers/{}/status", id)).await
    }

    /// Fetch a printer record, or `None` if the backend does not know it.
    pub async fn printer(&self, id: u64) -> Result<Option<DeviceRecord>> {
        self.get_optional(&format!("printers/{}", id)).await
    }

    /// Register a new printer. Returns the stored record, including its id.
    pub async fn register_printer(&self, registration: &PrinterRegistration) -> Result<DeviceRecord> {
        tracing::info!(name = registration.name, "registering printer");
        self.post_json("printers/", registration).await
    }

    /// Ask the printer to start printing a file already on its storage.
    pub async fn start_print(&self, id: u64, filename: &str) -> Result<CommandAck> {
        let path = format!("printers/{}/start-print", id);
        let raw = self
            .post_raw(&path, &StartPrint { filename }, self.request_timeout)
            .await?;
        self.command_ack(&path, raw)
    }

    /// Send raw G-code to a printer.
    pub async fn send_gcode(&self, id: u64, gcode: &str) -> Result<CommandAck> {
        let path = format!("printers/{}/send-gcode", id);
        let raw = self.post_raw(&path, &SendGcode { gcode }, self.gcode_timeout).await?;
        self.command_ack(&path, raw)
    }

    fn command_ack(&self, path: &str, raw: crate::RawResponse) -> Result<CommandAck> {
        if !raw.status.is_success() {
            return Err(Error::status(&self.url(path), raw.status, &raw.body));
        }
        let message = serde_json::from_str::<Value>(&raw.body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_owned))
            .or_else(|| (!raw.body.is_empty()).then(|| raw.body.clone()));
        Ok(CommandAck {
            status: raw.status,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_deserialize_printer_status_with_nulls() {
        let payload = r#"{"status":"RUNNING","current_stage":"printing","progress_percent":null,"remaining_time_minutes":null,"nozzle_temp":210}"#;
        let status: PrinterStatus = serde_json::from_str(payload).unwrap();
        assert_eq!(status.status, "RUNNING");
        assert_eq!(status.current_stage.as_deref(), Some("printing"));
        assert_eq!(status.progress_percent, None);
        assert_eq!(status.remaining_time_minutes, None);
    }

    #[test]
    fn test_deserialize_printer_status_minimal() {
        let status: PrinterStatus = serde_json::from_str(r#"{"status":"IDLE","progress_percent":100}"#).unwrap();
        assert_eq!(status.progress_percent, Some(100.0));
        assert_eq!(status.current_stage, None);
    }

    #[test]
    fn test_serialize_registration() {
        let registration = PrinterRegistration {
            name: "Bambu_P1P".to_owned(),
            brand: "Bambu Lab".to_owned(),
            model: "P1P".to_owned(),
            kind: "bambu".to_owned(),
            ip_address: "192.168.1.100".to_owned(),
            access_code: Some("1234".to_owned()),
            serial_number: None,
        };
        let value = serde_json::to_value(&registration).unwrap();
        assert_eq!(value["type"], "bambu");
        assert!(value.get("serial_number").is_none());
    }

    #[test]
    fn test_command_ack_dispatched() {
        let sent = CommandAck {
            status: StatusCode::OK,
            message: Some("Print command sent to printer".to_owned()),
        };
        let accepted = CommandAck {
            status: StatusCode::ACCEPTED,
            message: None,
        };
        let ok_but_silent = CommandAck {
            status: StatusCode::OK,
            message: Some("queued".to_owned()),
        };
        assert!(sent.is_dispatched());
        assert!(accepted.is_dispatched());
        assert!(!ok_but_silent.is_dispatched());
    }

    #[test]
    fn test_device_record_keeps_other_fields() {
        let record: DeviceRecord = serde_json::from_str(r#"{"id":7,"name":"P1S"}"#).unwrap();
        assert_eq!(record.id, 7);
        assert_eq!(record.field("name").and_then(|v| v.as_str()), Some("P1S"));
    }
}
