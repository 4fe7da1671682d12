//! HTTP and HTTPS retrieval with `reqwest`.
//!
//! Credentials travel as basic auth; response statuses map onto
//! [`FetchErrorKind`](crate::error::FetchErrorKind).

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};

use super::{TransferHandler, TransferRequest};
use crate::config::TransferConfig;
use crate::error::{DriverError, DriverResult, FetchErrorKind};

/// GET-based retrieval for http and https locations.
pub struct HttpHandler {
    client: Client,
}

impl HttpHandler {
    pub fn new(config: &TransferConfig) -> DriverResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.read_timeout())
            .build()
            .map_err(|e| DriverError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TransferHandler for HttpHandler {
    async fn fetch(&self, request: &TransferRequest) -> DriverResult<Bytes> {
        let uri = request.redacted();

        let mut url = request.url().clone();
        let _ = url.set_username("");
        let _ = url.set_password(None);
        let mut get = self.client.get(url);
        if let Some(creds) = request.credentials() {
            get = get.basic_auth(creds.user, Some(creds.password.as_str()));
        }

        let response = get.send().await.map_err(|e| classify(&uri, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DriverError::fetch(status_kind(status), &uri, format!("HTTP {status}")));
        }

        response.bytes().await.map_err(|e| classify(&uri, e))
    }
}

fn status_kind(status: StatusCode) -> FetchErrorKind {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => FetchErrorKind::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchErrorKind::AuthFailed,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => FetchErrorKind::Timeout,
        _ => FetchErrorKind::ServerError,
    }
}

fn classify(uri: &str, e: reqwest::Error) -> DriverError {
    let kind = if e.is_timeout() {
        FetchErrorKind::Timeout
    } else if e.is_connect() || e.is_request() {
        FetchErrorKind::Unreachable
    } else {
        FetchErrorKind::ServerError
    };
    DriverError::fetch(kind, uri, e.to_string())
}
