use dropshot::{Body, HttpCodedResponse, HttpError};
use http::{Response, StatusCode};

/// Content type of the Prometheus text exposition format.
const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// A plain text 200, for bodies dropshot has no typed response for.
pub struct TextResponseOk(pub String);

impl HttpCodedResponse for TextResponseOk {
    type Body = String;

    const STATUS_CODE: StatusCode = StatusCode::OK;
    const DESCRIPTION: &'static str = "successful operation";
}

impl From<TextResponseOk> for Result<Response<Body>, HttpError> {
    fn from(text: TextResponseOk) -> Result<Response<Body>, HttpError> {
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(http::header::CONTENT_TYPE, PROMETHEUS_TEXT)
            .body(Body::from(text.0))?)
    }
}
