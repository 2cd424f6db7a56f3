//! Remote service client.
//!
//! The query engine only sees the [`RemoteService`] trait. [`HttpService`] is
//! the production implementation: every operation is a JSON `POST` to
//! `{endpoint}/{operation}`.


use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{Map, Value};
use thiserror::Error;

const USER_AGENT: &str = concat!("reposcope/", env!("CARGO_PKG_VERSION"));

/// Failure reported by the transport, with a machine-readable code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct TransportError {
    pub code: String,
    pub message: String,
}

impl TransportError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// A service that executes named operations.
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn invoke(
        &self,
        operation: &str,
        args: &Map<String, Value>,
    ) -> Result<Value, TransportError>;
}

pub struct HttpService {
    client: reqwest::Client,
    endpoint: String,
    api_token: Option<String>,
}

impl HttpService {
    pub fn new(endpoint: &str, api_token: Option<String>, timeout: Duration) -> Result<Self> {
        if endpoint.trim().is_empty() {
            anyhow::bail!("No service endpoint configured");
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_token: api_token.filter(|t| !t.is_empty()),
        })
    }

    fn operation_url(&self, operation: &str) -> String {
        format!("{}/{}", self.endpoint, operation)
    }
}

#[async_trait]
impl RemoteService for HttpService {
    async fn invoke(
        &self,
        operation: &str,
        args: &Map<String, Value>,
    ) -> Result<Value, TransportError> {
        let mut request = self
            .client
            .post(self.operation_url(operation))
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(token) = &self.api_token {
            request = request.header(reqwest::header::AUTHORIZATION, format!("Bearer {token}"));
        }

        let body = simd_json::to_vec(args)
            .map_err(|e| TransportError::new("SerializationError", e.to_string()))?;

        let response = request
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::new("NetworkError", e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Object(Map::new()));
        }
        if status.is_success() {
            return read_json(response).await;
        }

        let body = response.text().await.unwrap_or_default();
        Err(parse_error_body(status, &body))
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value, TransportError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| TransportError::new("InvalidResponse", e.to_string()))?;
    let mut bytes = bytes.to_vec();
    simd_json::from_slice(&mut bytes).map_err(|e| TransportError::new("InvalidResponse", e.to_string()))
}

/// Build a transport error from a non-success response.
///
/// Services report errors as `{"code": ..., "message": ...}` or in the
/// `{"__type": "ns#Code", "Message": ...}` shape; anything else falls back to
/// the HTTP status.
fn parse_error_body(status: StatusCode, body: &str) -> TransportError {
    if body.trim().starts_with('{')
        && let Ok(Value::Object(json)) = serde_json::from_str::<Value>(body)
    {
        let code = ["code", "__type", "error"]
            .iter()
            .find_map(|k| json.get(*k).and_then(Value::as_str))
            .map(|c| c.rsplit('#').next().unwrap_or(c).to_string());
        let message = ["message", "Message"]
            .iter()
            .find_map(|k| json.get(*k).and_then(Value::as_str))
            .map(str::to_string);

        if code.is_some() || message.is_some() {
            return TransportError::new(
                code.unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
                message.unwrap_or_default(),
            );
        }
    }

    let message = if body.trim().is_empty() {
        status.canonical_reason().unwrap_or("Unknown error").to_string()
    } else {
        body.trim().to_string()
    };
    TransportError::new(format!("HTTP {}", status.as_u16()), message)
}
