use std::collections::BTreeMap;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::body_message, Client, DeviceRecord, Error, Result};

/// Live status of an ejector. `ONLINE` means idle and ready for a macro.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct EjectorStatus {
    /// Main state, for instance `ONLINE` or `BUSY`.
    pub status: String,

    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

/// Body used to register an ejector with the backend.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct EjectorRegistration {
    /// Display name.
    pub device_name: String,
    /// Address of the ejector's Moonraker instance.
    pub ip_address: String,
}

/// Request to run one named macro on the ejector.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MacroRequest {
    /// Macro name, as defined in the ejector firmware configuration.
    #[serde(rename = "macro")]
    pub name: String,

    /// Optional macro parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<BTreeMap<String, Value>>,
}

impl MacroRequest {
    /// A macro request without parameters.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            params: None,
        }
    }
}

/// How a macro dispatch was acknowledged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MacroDispatch {
    /// The backend confirmed the macro was handed to the device.
    Accepted {
        /// Status code of the confirming response.
        status: StatusCode,
    },

    /// The acknowledgment was lost to a timeout somewhere between us and the
    /// device. The macro may well be running; callers should poll the
    /// ejector status rather than give up.
    AckTimeout {
        /// What we know about the lost acknowledgment.
        message: String,
    },
}

/// Messages that mean the device acknowledgment timed out rather than the
/// command being refused.
fn indicates_ack_timeout(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("timeout") || message.contains("timed out") || message.contains("econnaborted")
        || message.contains("connection aborted")
}

/// Interpret a macro dispatch response.
///
/// Any 2xx is a confirmed dispatch. A 502 whose message says the device
/// acknowledgment timed out is a dispatch we presume happened. Everything
/// else is a hard failure.
pub fn classify_macro_response(url: &str, status: StatusCode, body: &str) -> Result<MacroDispatch> {
    if status.is_success() {
        return Ok(MacroDispatch::Accepted { status });
    }

    if status == StatusCode::BAD_GATEWAY {
        if let Ok(value) = serde_json::from_str::<Value>(body) {
            if let Some(message) = value.get("message").and_then(|m| m.as_str()) {
                if indicates_ack_timeout(message) {
                    return Ok(MacroDispatch::AckTimeout {
                        message: message.to_owned(),
                    });
                }
            }
        } else {
            tracing::warn!(url = url, body = body_message(body), "502 from macro dispatch was not json");
        }
    }

    Err(Error::status(url, status, body))
}

impl Client {
    /// Poll the live status of an ejector.
    pub async fn ejector_status(&self, id: u64) -> Result<EjectorStatus> {
        self.get_json(&format!("ottoeject/{}/status", id)).await
    }

    /// Fetch an ejector record, or `None` if the backend does not know it.
    pub async fn ottoeject(&self, id: u64) -> Result<Option<DeviceRecord>> {
        self.get_optional(&format!("ottoeject/{}", id)).await
    }

    /// Register a new ejector. Returns the stored record, including its id.
    pub async fn register_ottoeject(&self, registration: &EjectorRegistration) -> Result<DeviceRecord> {
        tracing::info!(name = registration.device_name, "registering ottoeject");
        self.post_json("ottoeject/", registration).await
    }

    /// Dispatch a macro on the ejector.
    ///
    /// A client-side timeout is reported as [MacroDispatch::AckTimeout]: the
    /// backend may have already forwarded the macro before we gave up.
    pub async fn execute_macro(&self, id: u64, request: &MacroRequest) -> Result<MacroDispatch> {
        let path = format!("ottoeject/{}/macros", id);
        let url = self.url(&path);

        match self.post_raw(&path, request, self.macro_timeout).await {
            Ok(raw) => classify_macro_response(&url, raw.status, &raw.body),
            Err(Error::Timeout { .. }) => {
                tracing::warn!(url = url, macro_name = request.name, "macro dispatch timed out client-side");
                Ok(MacroDispatch::AckTimeout {
                    message: format!("request to {} timed out", url),
                })
            }
            Err(Error::Transport { source, .. }) if indicates_ack_timeout(&format!("{:?}", source)) => {
                Ok(MacroDispatch::AckTimeout {
                    message: source.to_string(),
                })
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    const URL: &str = "http://localhost:3000/api/ottoeject/1/macros";

    #[test]
    fn test_classify_accepted() {
        assert_eq!(
            classify_macro_response(URL, StatusCode::ACCEPTED, r#"{"message":"Macro sent"}"#).unwrap(),
            MacroDispatch::Accepted {
                status: StatusCode::ACCEPTED
            }
        );
    }

    #[test]
    fn test_classify_bad_gateway_ack_timeout() {
        assert_eq!(
            classify_macro_response(URL, StatusCode::BAD_GATEWAY, r#"{"message":"device ack timeout"}"#).unwrap(),
            MacroDispatch::AckTimeout {
                message: "device ack timeout".to_owned()
            }
        );
    }

    #[test]
    fn test_classify_bad_gateway_econnaborted() {
        let dispatch = classify_macro_response(
            URL,
            StatusCode::BAD_GATEWAY,
            r#"{"message":"Error communicating with Moonraker: ECONNABORTED"}"#,
        )
        .unwrap();
        assert!(matches!(dispatch, MacroDispatch::AckTimeout { .. }));
    }

    #[test]
    fn test_classify_bad_gateway_other_message_fails() {
        let err = classify_macro_response(URL, StatusCode::BAD_GATEWAY, r#"{"message":"klipper not ready"}"#)
            .unwrap_err();
        assert_eq!(err.status_code(), Some(StatusCode::BAD_GATEWAY));
    }

    #[test]
    fn test_classify_bad_gateway_not_json_fails() {
        assert!(classify_macro_response(URL, StatusCode::BAD_GATEWAY, "upstream timeout").is_err());
    }

    #[test]
    fn test_classify_other_errors_fail_even_with_timeout_message() {
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::NOT_FOUND,
            StatusCode::BAD_REQUEST,
        ] {
            let err = classify_macro_response(URL, status, r#"{"message":"timeout"}"#).unwrap_err();
            assert_eq!(err.status_code(), Some(status));
        }
    }

    #[test]
    fn test_macro_request_wire_format() {
        let value = serde_json::to_value(MacroRequest::new("OTTOEJECT_HOME")).unwrap();
        assert_eq!(value, serde_json::json!({"macro": "OTTOEJECT_HOME"}));

        let mut params = BTreeMap::new();
        params.insert("SLOT".to_owned(), Value::from(3));
        let value = serde_json::to_value(MacroRequest {
            name: "STORE".to_owned(),
            params: Some(params),
        })
        .unwrap();
        assert_eq!(value, serde_json::json!({"macro": "STORE", "params": {"SLOT": 3}}));
    }

    #[test]
    fn test_ejector_status_ignores_extra_fields() {
        let status: EjectorStatus = serde_json::from_str(r#"{"status":"ONLINE","ip_address":"10.0.0.2"}"#).unwrap();
        assert_eq!(status.status, "ONLINE");
    }

    /// Accept one connection, read the whole request and answer with
    /// `response`, or hold the connection open without answering.
    async fn serve_once(response: Option<String>) -> std::io::Result<Client> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            // The macro request body is a json object.
            while !request.ends_with(b"}") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            match response {
                Some(response) => {
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.flush().await;
                }
                None => tokio::time::sleep(Duration::from_secs(30)).await,
            }
        });

        let client = Client::new(&format!("http://{}/api", addr))
            .map_err(std::io::Error::other)?
            .with_timeouts(Duration::from_secs(5), Duration::from_secs(5), Duration::from_millis(300));
        Ok(client)
    }

    fn response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        )
    }

    #[tokio::test]
    async fn test_execute_macro_accepted() {
        let client = serve_once(Some(response("202 Accepted", r#"{"message":"Macro sent"}"#)))
            .await
            .unwrap();
        let dispatch = client.execute_macro(1, &MacroRequest::new("OTTOEJECT_HOME")).await.unwrap();
        assert_eq!(
            dispatch,
            MacroDispatch::Accepted {
                status: StatusCode::ACCEPTED
            }
        );
    }

    #[tokio::test]
    async fn test_execute_macro_client_timeout_is_ack_timeout() {
        let client = serve_once(None).await.unwrap();
        let dispatch = client.execute_macro(1, &MacroRequest::new("OTTOEJECT_HOME")).await.unwrap();
        match dispatch {
            MacroDispatch::AckTimeout { message } => assert!(message.contains("timed out"), "{}", message),
            other => panic!("expected an ack timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_execute_macro_bad_gateway_ack_timeout() {
        let client = serve_once(Some(response("502 Bad Gateway", r#"{"message":"device ack timeout"}"#)))
            .await
            .unwrap();
        let dispatch = client.execute_macro(1, &MacroRequest::new("PARK_OTTOEJECT")).await.unwrap();
        assert_eq!(
            dispatch,
            MacroDispatch::AckTimeout {
                message: "device ack timeout".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn test_execute_macro_server_error_fails() {
        let client = serve_once(Some(response("500 Internal Server Error", r#"{"message":"timeout"}"#)))
            .await
            .unwrap();
        let err = client
            .execute_macro(1, &MacroRequest::new("PARK_OTTOEJECT"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[tokio::test]
    async fn test_execute_macro_connection_refused_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = Client::new(&format!("http://{}/api", addr)).unwrap();
        let result = client.execute_macro(1, &MacroRequest::new("OTTOEJECT_HOME")).await;
        assert!(result.is_err(), "{:?}", result);
    }
}
