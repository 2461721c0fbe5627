pub mod client;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use crate::models::chat::{ Message, OutgoingMessage };

pub use client::BackendClient;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {}", .detail.as_deref().unwrap_or("no detail"))]
    Status {
        status: reqwest::StatusCode,
        detail: Option<String>,
    },

    #[error("invalid API url: {0}")]
    Url(#[from] url::ParseError),

    #[error("failed to read avatar file '{path}': {source}")]
    Avatar {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ApiError {
    /// Most specific message the server gave, if any.
    pub fn detail(&self) -> Option<&str> {
        match self {
            ApiError::Status { detail, .. } => detail.as_deref(),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            ApiError::Status { status, .. }
                if *status == reqwest::StatusCode::UNAUTHORIZED ||
                    *status == reqwest::StatusCode::FORBIDDEN
        )
    }
}

/// Chat endpoints the transport controller depends on.
#[async_trait]
pub trait MessageApi: Send + Sync {
    async fn fetch_messages(&self, room: &str) -> Result<Vec<Message>, ApiError>;

    async fn post_message(
        &self,
        room: &str,
        message: &OutgoingMessage
    ) -> Result<Message, ApiError>;
}

const DETAIL_KEYS: [&str; 3] = ["detail", "username", "email"];

/// Pulls a human readable error out of a DRF-style error body.
pub fn extract_detail(body: &str) -> Option<String> {
    let value: JsonValue = serde_json::from_str(body).ok()?;
    DETAIL_KEYS.iter().find_map(|key| {
        match value.get(key)? {
            JsonValue::String(text) if !text.is_empty() => Some(text.clone()),
            JsonValue::Array(items) => {
                let parts: Vec<&str> = items
                    .iter()
                    .filter_map(JsonValue::as_str)
                    .collect();
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join(" "))
                }
            }
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_takes_precedence() {
        let body = r#"{"detail":"Invalid credentials","username":["taken"]}"#;
        assert_eq!(extract_detail(body).as_deref(), Some("Invalid credentials"));
    }

    #[test]
    fn field_errors_are_joined() {
        let body = r#"{"username":["A user with that username already exists.","Try another."]}"#;
        assert_eq!(
            extract_detail(body).as_deref(),
            Some("A user with that username already exists. Try another.")
        );
        assert_eq!(
            extract_detail(r#"{"email":["Enter a valid email address."]}"#).as_deref(),
            Some("Enter a valid email address.")
        );
    }

    #[test]
    fn no_detail_in_unrelated_bodies() {
        assert_eq!(extract_detail("<html>502</html>"), None);
        assert_eq!(extract_detail(r#"{"password":["too short"]}"#), None);
        assert_eq!(extract_detail(r#"{"detail":""}"#), None);
    }

    #[test]
    fn status_error_exposes_detail() {
        let err = ApiError::Status {
            status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
            detail: Some("Unable to save the message right now.".to_string()),
        };
        assert_eq!(err.detail(), Some("Unable to save the message right now."));
        assert!(!err.is_unauthorized());
        assert!(err.to_string().contains("503"));
    }
}
