#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]
#![deny(unused_import_braces)]
#![deny(unused_qualifications)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

//! This crate implements a typed client for the OttoMat3D backend api, which
//! proxies status queries and commands to 3D printers and to the OttoEject
//! plate ejector.

mod error;
mod ottoeject;
mod printer;

use std::time::Duration;

pub use error::{Error, Result};
pub use ottoeject::{classify_macro_response, EjectorRegistration, EjectorStatus, MacroDispatch, MacroRequest};
pub use printer::{CommandAck, DeviceRecord, PrinterRegistration, PrinterStatus};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_GCODE_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_MACRO_TIMEOUT: Duration = Duration::from_secs(45);

/// Client is a handle to a running backend instance.
#[derive(Clone, Debug)]
pub struct Client {
    pub(crate) url_base: String,
    http: reqwest::Client,
    pub(crate) request_timeout: Duration,
    pub(crate) gcode_timeout: Duration,
    pub(crate) macro_timeout: Duration,
}

/// Status code and body of a response, before any interpretation.
#[derive(Clone, Debug)]
pub(crate) struct RawResponse {
    pub status: StatusCode,
    pub body: String,
}

impl Client {
    /// Create a new Client talking to the backend rooted at `url_base`
    /// (for instance `http://localhost:3000/api`).
    pub fn new(url_base: &str) -> Result<Self> {
        let http = reqwest::Client::builder().build().map_err(Error::Client)?;
        Ok(Self {
            url_base: url_base.trim_end_matches('/').to_owned(),
            http,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            gcode_timeout: DEFAULT_GCODE_TIMEOUT,
            macro_timeout: DEFAULT_MACRO_TIMEOUT,
        })
    }

    /// Override the client-side timeouts. `request` applies to status and
    /// registration calls, `macro_dispatch` to ejector macro calls, which the
    /// backend may hold open while it waits for the device to acknowledge.
    pub fn with_timeouts(mut self, request: Duration, gcode: Duration, macro_dispatch: Duration) -> Self {
        self.request_timeout = request;
        self.gcode_timeout = gcode;
        self.macro_timeout = macro_dispatch;
        self
    }

    /// Return the base url this client talks to.
    pub fn url_base(&self) -> &str {
        &self.url_base
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}", self.url_base, path.trim_start_matches('/'))
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let raw = self.get_raw(path).await?;
        decode(&self.url(path), raw)
    }

    /// GET a device record, mapping a 404 to `None`.
    pub(crate) async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let raw = self.get_raw(path).await?;
        if raw.status == StatusCode::NOT_FOUND {
            tracing::debug!(url = self.url(path), "device not found");
            return Ok(None);
        }
        decode(&self.url(path), raw).map(Some)
    }

    async fn get_raw(&self, path: &str) -> Result<RawResponse> {
        let url = self.url(path);
        tracing::debug!(url = url, "GET");
        let resp = self
            .http
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| Error::from_reqwest(&url, e))?;
        read_raw(&url, resp).await
    }

    /// POST a JSON body, returning whatever came back without judging the
    /// status code. Callers decide what counts as success.
    pub(crate) async fn post_raw<B>(&self, path: &str, body: &B, timeout: Duration) -> Result<RawResponse>
    where
        B: Serialize + ?Sized,
    {
        let url = self.url(path);
        tracing::debug!(url = url, "POST");
        let resp = self
            .http
            .post(&url)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::from_reqwest(&url, e))?;
        read_raw(&url, resp).await
    }

    pub(crate) async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let raw = self.post_raw(path, body, self.request_timeout).await?;
        decode(&self.url(path), raw)
    }
}

async fn read_raw(url: &str, resp: reqwest::Response) -> Result<RawResponse> {
    let status = resp.status();
    let body = resp.text().await.map_err(|e| Error::from_reqwest(url, e))?;
    Ok(RawResponse { status, body })
}

pub(crate) fn decode<T: DeserializeOwned>(url: &str, raw: RawResponse) -> Result<T> {
    if !raw.status.is_success() {
        return Err(Error::status(url, raw.status, &raw.body));
    }
    serde_json::from_str(&raw.body).map_err(|source| Error::Decode {
        url: url.to_owned(),
        source,
    })
}
