// transport.rs

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use url::Url;

use crate::config::EngineConfig;
use crate::error::{MonicaError, Result};
use crate::protocol::{form_action, Form};

/// Carries one form-encoded request to the server and returns its JSON body.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, form: Form) -> Result<Value>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: Url,
}

impl HttpTransport {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| MonicaError::ConnectionError {
                message: "Failed to create HTTP client".to_string(),
                context: config.server_name.clone(),
                source: Some(Box::new(e)),
            })?;

        Ok(Self {
            client,
            endpoint: config.endpoint()?,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, form: Form) -> Result<Value> {
        let action = form_action(&form).unwrap_or("unknown").to_string();

        let response = self
            .client
            .post(self.endpoint.clone())
            .form(&form)
            .send()
            .await
            .map_err(|e| MonicaError::ConnectionError {
                message: e.to_string(),
                context: action.clone(),
                source: Some(Box::new(e)),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.ok();
            return Err(MonicaError::ServerError {
                message: format!("'{}' request failed", action),
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<Value>().await?)
    }
}
