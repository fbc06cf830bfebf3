// config.rs

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::constants::*;
use crate::error::{MonicaError, Result};
use crate::types::AuthData;

/// Settings for one engine / server connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// The MoniCA server the web interface should talk to.
    pub server_name: String,
    pub protocol: String,
    /// Host serving the JSON interface script.
    pub webserver_name: String,
    pub webserver_path: String,
    #[serde(with = "humantime_serde")]
    pub update_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Fetch missing point descriptions at the start of every poll cycle.
    pub auto_descriptions: bool,
    /// Zero disables periodic alarm polling.
    #[serde(with = "humantime_serde")]
    pub alarm_poll_period: Duration,
    pub alarm_auth: AuthData,
    /// Fetch the server's RSA key on connect and encrypt set-point credentials.
    pub require_encryption: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_name: DEFAULT_SERVER_NAME.to_string(),
            protocol: DEFAULT_PROTOCOL.to_string(),
            webserver_name: DEFAULT_WEBSERVER_NAME.to_string(),
            webserver_path: DEFAULT_WEBSERVER_PATH.to_string(),
            update_interval: DEFAULT_UPDATE_INTERVAL,
            request_timeout: DEFAULT_TIMEOUT,
            auto_descriptions: false,
            alarm_poll_period: DEFAULT_ALARM_POLL_PERIOD,
            alarm_auth: AuthData::default(),
            require_encryption: false,
        }
    }
}

impl EngineConfig {
    pub fn for_server(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            ..Default::default()
        }
    }

    /// Parses a JSON document; absent keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.server_name.is_empty() {
            errors.push("server_name cannot be empty".to_string());
        }
        if self.webserver_name.is_empty() {
            errors.push("webserver_name cannot be empty".to_string());
        }
        if self.update_interval.is_zero() {
            errors.push("update_interval must be greater than zero".to_string());
        }
        if let Err(e) = self.endpoint() {
            errors.push(format!("endpoint is not a valid URL: {}", e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MonicaError::InvalidConfig {
                message: errors.join("; "),
            })
        }
    }

    /// The full URL of the JSON interface.
    pub fn endpoint(&self) -> Result<Url> {
        let path = self.webserver_path.trim_start_matches('/');
        Ok(Url::parse(&format!(
            "{}://{}/{}",
            self.protocol, self.webserver_name, path
        ))?)
    }

    pub fn alarm_polling_enabled(&self) -> bool {
        !self.alarm_poll_period.is_zero()
    }
}
