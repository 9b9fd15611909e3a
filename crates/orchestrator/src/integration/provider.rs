//! External integration providers.
//!
//! A provider fronts one integration type (e-signature, document handling).
//! Errors are classified transient or permanent; the invoker's retry policy
//! keys off that classification.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::store::IntegrationKind;

#[derive(Debug, Error)]
pub enum IntegrationError {
    /// Worth retrying: network failures, timeouts, 5xx responses.
    #[error("transient integration failure: {0}")]
    Transient(String),
    /// Retrying cannot help: bad config, rejected request, unknown employee.
    #[error("permanent integration failure: {0}")]
    Permanent(String),
}

impl IntegrationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, IntegrationError::Transient(_))
    }
}

impl From<IntegrationError> for crate::Error {
    fn from(e: IntegrationError) -> Self {
        match e {
            IntegrationError::Transient(detail) => crate::Error::IntegrationTransient(detail),
            IntegrationError::Permanent(detail) => crate::Error::IntegrationPermanent(detail),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IntegrationRequest {
    pub workflow_id: Uuid,
    pub step_id: Uuid,
    pub integration_type: IntegrationKind,
    pub payload: JsonValue,
}

#[derive(Debug, Clone)]
pub struct SendResponse {
    pub external_id: String,
    pub status: String,
    pub payload: JsonValue,
}

#[async_trait]
pub trait IntegrationProvider: Send + Sync {
    async fn send(&self, request: &IntegrationRequest)
        -> Result<SendResponse, IntegrationError>;
    async fn get_status(&self, external_id: &str) -> Result<String, IntegrationError>;
    async fn void(&self, external_id: &str, reason: &str) -> Result<(), IntegrationError>;
}

/// Providers keyed by integration type.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<IntegrationKind, Arc<dyn IntegrationProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: IntegrationKind, provider: Arc<dyn IntegrationProvider>) {
        self.providers.insert(kind, provider);
    }

    pub fn get(&self, kind: IntegrationKind) -> Option<Arc<dyn IntegrationProvider>> {
        self.providers.get(&kind).cloned()
    }
}

/// HTTP-backed provider speaking a small JSON protocol:
/// `POST {base}/integrations/{kind}/send`, `GET .../status/{id}`,
/// `POST .../{id}/void`.
pub struct HttpIntegrationProvider {
    client: reqwest::Client,
    base_url: String,
    kind: IntegrationKind,
}

impl HttpIntegrationProvider {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, kind: IntegrationKind) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            kind,
        }
    }

    fn classify(e: reqwest::Error) -> IntegrationError {
        if e.is_timeout() || e.is_connect() {
            IntegrationError::Transient(e.to_string())
        } else {
            IntegrationError::Permanent(e.to_string())
        }
    }

    fn classify_status(status: reqwest::StatusCode, body: String) -> IntegrationError {
        let detail = format!("{}: {}", status, body);
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            IntegrationError::Transient(detail)
        } else {
            IntegrationError::Permanent(detail)
        }
    }
}

#[async_trait]
impl IntegrationProvider for HttpIntegrationProvider {
    async fn send(
        &self,
        request: &IntegrationRequest,
    ) -> Result<SendResponse, IntegrationError> {
        let url = format!("{}/integrations/{}/send", self.base_url, self.kind);
        debug!("Sending integration request for step {}", request.step_id);

        let response = self
            .client
            .post(&url)
            .json(&request.payload)
            .send()
            .await
            .map_err(Self::classify)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, body));
        }

        let body: JsonValue = response
            .json()
            .await
            .map_err(|e| IntegrationError::Permanent(format!("malformed response: {}", e)))?;
        let external_id = body
            .get("external_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                IntegrationError::Permanent("response missing external_id".to_string())
            })?
            .to_string();
        let provider_status = body
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("accepted")
            .to_string();

        Ok(SendResponse {
            external_id,
            status: provider_status,
            payload: body,
        })
    }

    async fn get_status(&self, external_id: &str) -> Result<String, IntegrationError> {
        let url = format!(
            "{}/integrations/{}/status/{}",
            self.base_url, self.kind, external_id
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(Self::classify)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, body));
        }

        let body: JsonValue = response
            .json()
            .await
            .map_err(|e| IntegrationError::Permanent(format!("malformed response: {}", e)))?;
        Ok(body
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string())
    }

    async fn void(&self, external_id: &str, reason: &str) -> Result<(), IntegrationError> {
        let url = format!(
            "{}/integrations/{}/{}/void",
            self.base_url, self.kind, external_id
        );

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "reason": reason }))
            .send()
            .await
            .map_err(Self::classify)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, body));
        }
        Ok(())
    }
}
