use async_trait::async_trait;
use serde::Serialize;

use crate::platform::PlatformInfo;
use crate::types::{AuthHeader, LogMessage};

/// Path appended to the collector origin.
pub const LOG_ENDPOINT_PATH: &str = "/loupe/log";

/// Request body posted to the collector.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryBody<'a> {
    pub log_messages: &'a [LogMessage],
    pub session: SessionInfo,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub client: PlatformInfo,
    pub current_agent_session_id: String,
}

/// A fully prepared POST to the collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRequest {
    pub url: String,
    /// JSON body.
    pub body: String,
    /// Extra headers besides `Content-Type`.
    pub headers: Vec<(String, String)>,
}

impl DeliveryRequest {
    pub fn new(url: String, body: String, auth_header: Option<&AuthHeader>) -> Self {
        let headers = auth_header
            .map(|h| vec![(h.name.clone(), h.value.clone())])
            .unwrap_or_default();
        Self { url, body, headers }
    }
}

/// What came back. `status` is 0 when no response was received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub status_text: String,
}

impl TransportResponse {
    pub fn new(status: u16, status_text: impl Into<String>) -> Self {
        Self {
            status,
            status_text: status_text.into(),
        }
    }

    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self::new(0, reason)
    }
}

/// Performs the network call for one batch.
///
/// Implementations never fail: connectivity problems are reported as
/// status 0. Request timeouts are whatever the implementation uses natively.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: DeliveryRequest) -> TransportResponse;
}

/// `<origin without one trailing slash>/loupe/log`
pub fn log_endpoint(origin: &str) -> String {
    let origin = origin.strip_suffix('/').unwrap_or(origin);
    format!("{}{}", origin, LOG_ENDPOINT_PATH)
}

/// Transport over `reqwest`.
#[cfg(feature = "http")]
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: DeliveryRequest) -> TransportResponse {
        let mut builder = self
            .client
            .post(&request.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(request.body);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        match builder.send().await {
            Ok(response) => {
                let status = response.status();
                TransportResponse::new(
                    status.as_u16(),
                    status.canonical_reason().unwrap_or_default(),
                )
            }
            Err(err) => {
                tracing::debug!(url = %request.url, error = %err, "Delivery request failed");
                TransportResponse::unreachable(err.to_string())
            }
        }
    }
}
