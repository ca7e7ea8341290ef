//! reqwest-backed transport for talking to a relay over HTTPS.

use super::{Endpoint, Method, Transport, TransportError, TransportResponse};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// HTTP client for the Manylla relay.
pub struct HttpTransport {
    client: reqwest::Client,
    relay_url: String,
}

impl HttpTransport {
    /// Create a new transport for `relay_url` (e.g. `https://manylla.com/qual`).
    pub fn new(relay_url: &str) -> Result<Self, TransportError> {
        Self::with_timeout(relay_url, Duration::from_secs(30))
    }

    pub fn with_timeout(relay_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Failed(format!("HTTP client setup failed: {}", e)))?;

        Ok(Self {
            client,
            relay_url: relay_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_connect() || e.is_timeout() {
        TransportError::Offline(e.to_string())
    } else {
        TransportError::Failed(e.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(
        &self,
        endpoint: Endpoint,
        method: Method,
        body: Option<Value>,
    ) -> Result<TransportResponse, TransportError> {
        let url = format!("{}{}", self.relay_url, endpoint.path());

        let mut request = match method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };
        if let Some(body) = &body {
            request = request.json(body);
        }

        let resp = request.send().await.map_err(classify)?;
        let status = resp.status();
        debug!("{} {} -> {}", method, endpoint.name(), status);

        let bytes = resp.bytes().await.map_err(classify)?;
        // Error pages are not always JSON; keep the status and drop the body
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

        Ok(TransportResponse::new(status.is_success(), json))
    }
}
