// error.rs

use std::error::Error as StdError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonicaError {
    #[error("Connection error: {message} (context: {context})")]
    ConnectionError {
        message: String,
        context: String,
        source: Option<Box<dyn StdError + Send + Sync>>,
    },

    #[error("Server error: {message} (status: {status})")]
    ServerError {
        message: String,
        status: u16,
        body: Option<String>,
    },

    #[error("Invalid request: {message}")]
    InvalidRequest {
        message: String,
        context: String,
        validation_errors: Vec<String>,
    },

    #[error("Invalid response to '{action}': {message}")]
    InvalidResponse { message: String, action: String },

    #[error("{message}")]
    Rejected { message: String },

    #[error("Incomplete alarm state for '{point}': missing {}", .missing.join(", "))]
    IncompleteAlarmState {
        point: String,
        missing: Vec<&'static str>,
    },

    #[error("Encryption error: {message}")]
    Encryption { message: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Engine is no longer available")]
    EngineGone,

    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),

    #[error(transparent)]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    UrlError(#[from] url::ParseError),
}

impl MonicaError {
    /// Returns true if the request never produced a usable response from the server.
    pub fn is_transport_failure(&self) -> bool {
        match self {
            Self::ConnectionError { .. } => true,
            Self::ServerError { .. } => true,
            Self::ReqwestError(_) => true,
            _ => false,
        }
    }

    /// Returns true if the error was raised locally before anything was sent.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest { .. }
                | Self::InvalidConfig { .. }
                | Self::Encryption { .. }
                | Self::UrlError(_)
        )
    }

    /// Creates a new ConnectionError
    pub fn connection_error<T: Into<String>>(message: T, context: T) -> Self {
        Self::ConnectionError {
            message: message.into(),
            context: context.into(),
            source: None,
        }
    }

    /// Creates a new InvalidRequest from a list of failed checks
    pub fn invalid_request<T: Into<String>>(
        message: T,
        context: T,
        validation_errors: Vec<String>,
    ) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            context: context.into(),
            validation_errors,
        }
    }

    /// Creates a new InvalidResponse
    pub fn invalid_response<T: Into<String>>(action: T, message: T) -> Self {
        Self::InvalidResponse {
            message: message.into(),
            action: action.into(),
        }
    }

    /// Creates a generic rejection
    pub fn rejected<T: Into<String>>(message: T) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Adds context to an existing error
    pub fn with_context<T: Into<String>>(self, context: T) -> Self {
        match self {
            Self::ConnectionError {
                message, source, ..
            } => Self::ConnectionError {
                message,
                context: context.into(),
                source,
            },
            Self::InvalidRequest {
                message,
                validation_errors,
                ..
            } => Self::InvalidRequest {
                message,
                context: context.into(),
                validation_errors,
            },
            _ => self,
        }
    }
}

/// Result type alias for MonicaError
pub type Result<T> = std::result::Result<T, MonicaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_is_transport_failure() {
        let err = MonicaError::connection_error("Failed to connect", "names");
        assert!(err.is_transport_failure());
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_invalid_request_is_client_error() {
        let err = MonicaError::invalid_request(
            "Missing fields",
            "setpoints",
            vec!["user is required".to_string()],
        );
        assert!(err.is_client_error());
        assert!(!err.is_transport_failure());
    }

    #[test]
    fn test_with_context_replaces_context() {
        let err = MonicaError::connection_error("refused", "names").with_context("points");
        match err {
            MonicaError::ConnectionError { context, .. } => assert_eq!(context, "points"),
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_incomplete_alarm_state_lists_fields() {
        let err = MonicaError::IncompleteAlarmState {
            point: "site.alarm".to_string(),
            missing: vec!["priority", "guidance"],
        };
        assert_eq!(
            err.to_string(),
            "Incomplete alarm state for 'site.alarm': missing priority, guidance"
        );
    }

    #[test]
    fn test_rejected_message_is_verbatim() {
        let err = MonicaError::rejected("Error while setting point value.");
        assert_eq!(err.to_string(), "Error while setting point value.");
    }
}
