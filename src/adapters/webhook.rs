//! HTTP webhook delivery.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;

use super::{CollaboratorError, CollaboratorResult, WebhookRequest, WebhookTransport};
use crate::domain::WebhookMethod;

/// reqwest-backed webhook transport
pub struct HttpWebhookTransport {
    /// HTTP client
    client: reqwest::Client,
}

impl HttpWebhookTransport {
    /// Create a transport with a per-request timeout
    pub fn new(timeout: Duration) -> CollaboratorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| CollaboratorError::Permanent(format!("http_client:{}", e)))?;
        Ok(Self { client })
    }

    fn method(method: WebhookMethod) -> Method {
        match method {
            WebhookMethod::Post => Method::POST,
            WebhookMethod::Put => Method::PUT,
            WebhookMethod::Patch => Method::PATCH,
        }
    }
}

#[async_trait]
impl WebhookTransport for HttpWebhookTransport {
    async fn deliver(&self, request: &WebhookRequest) -> CollaboratorResult<u16> {
        let mut builder = self
            .client
            .request(Self::method(request.method), &request.url)
            .json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(classify)?;
        Ok(response.status().as_u16())
    }
}

/// Timeouts and connection failures are transient; anything else is not.
fn classify(err: reqwest::Error) -> CollaboratorError {
    if err.is_timeout() {
        CollaboratorError::Transient("webhook_timeout".to_string())
    } else if err.is_connect() {
        CollaboratorError::Transient("webhook_connect".to_string())
    } else if err.is_builder() {
        CollaboratorError::Permanent("webhook_request".to_string())
    } else {
        CollaboratorError::Transient("webhook_io".to_string())
    }
}
