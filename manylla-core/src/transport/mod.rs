//! Network collaborator: one request/response call against the relay.
//!
//! The engine never looks past `{ok, json}`. Connectivity failures are
//! reported as [`TransportError::Offline`] so the engine can queue work
//! instead of burning retries.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use http::HttpTransport;

/// HTTP-style method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => f.write_str("GET"),
            Self::Post => f.write_str("POST"),
        }
    }
}

/// Relay endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Push,
    Pull { sync_id: String, since: Option<i64> },
    Health,
    CreateInvite,
    ValidateInvite { code: String },
    ShareCreate,
    ShareAccess { code: String },
}

impl Endpoint {
    /// Relative path including the query string.
    pub fn path(&self) -> String {
        match self {
            Self::Push => "/api/sync/push".to_string(),
            Self::Pull { sync_id, since } => match since {
                Some(since) => format!("/api/sync/pull?sync_id={}&since={}", sync_id, since),
                None => format!("/api/sync/pull?sync_id={}", sync_id),
            },
            Self::Health => "/api/sync/health".to_string(),
            Self::CreateInvite => "/api/sync/invite".to_string(),
            Self::ValidateInvite { code } => format!("/api/sync/invite/{}", code),
            Self::ShareCreate => "/api/share".to_string(),
            Self::ShareAccess { code } => format!("/api/share/{}", code),
        }
    }

    /// Method the relay expects for this endpoint.
    pub fn method(&self) -> Method {
        match self {
            Self::Push | Self::CreateInvite | Self::ShareCreate => Method::Post,
            Self::Pull { .. } | Self::Health | Self::ValidateInvite { .. } | Self::ShareAccess { .. } => {
                Method::Get
            }
        }
    }

    /// Short name for log lines. Never includes identifiers.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull { .. } => "pull",
            Self::Health => "health",
            Self::CreateInvite => "create_invite",
            Self::ValidateInvite { .. } => "validate_invite",
            Self::ShareCreate => "share_create",
            Self::ShareAccess { .. } => "share_access",
        }
    }
}

/// Relay reply: transport-level success plus the parsed JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub ok: bool,
    pub json: Value,
}

impl TransportResponse {
    pub fn new(ok: bool, json: Value) -> Self {
        Self { ok, json }
    }

    /// `success` field of the body, `false` when missing.
    pub fn success(&self) -> bool {
        self.json.get("success").and_then(Value::as_bool).unwrap_or(false)
    }

    /// `error` field of the body, if any.
    pub fn error(&self) -> Option<&str> {
        self.json.get("error").and_then(Value::as_str)
    }
}

/// Transport failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No connectivity: DNS, connect or timeout failures.
    #[error("offline: {0}")]
    Offline(String),

    /// The request reached the network but did not complete.
    #[error("request failed: {0}")]
    Failed(String),
}

/// Request/response call against the relay.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(
        &self,
        endpoint: Endpoint,
        method: Method,
        body: Option<Value>,
    ) -> Result<TransportResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn endpoint_paths() {
        assert_eq!(Endpoint::Push.path(), "/api/sync/push");
        assert_eq!(
            Endpoint::Pull {
                sync_id: "abc".into(),
                since: Some(42)
            }
            .path(),
            "/api/sync/pull?sync_id=abc&since=42"
        );
        assert_eq!(
            Endpoint::Pull {
                sync_id: "abc".into(),
                since: None
            }
            .path(),
            "/api/sync/pull?sync_id=abc"
        );
        assert_eq!(
            Endpoint::ShareAccess { code: "ABCD-EFGH".into() }.path(),
            "/api/share/ABCD-EFGH"
        );
    }

    #[test]
    fn endpoint_methods() {
        assert_eq!(Endpoint::Push.method(), Method::Post);
        assert_eq!(Endpoint::Health.method(), Method::Get);
        assert_eq!(Endpoint::ShareCreate.method(), Method::Post);
        assert_eq!(Method::Post.to_string(), "POST");
    }

    #[test]
    fn response_accessors() {
        let resp = TransportResponse::new(true, json!({"success": false, "error": "No data found"}));
        assert!(!resp.success());
        assert_eq!(resp.error(), Some("No data found"));

        let empty = TransportResponse::new(false, Value::Null);
        assert!(!empty.success());
        assert_eq!(empty.error(), None);
    }
}
