//! Request-path error taxonomy and the wire envelope.
//!
//! Startup errors live in [`crate::registry::RegistryError`] and
//! `flotilla_bootstrap::ConfigError`; everything that flows through a
//! mounted operation or a remote call is a [`ServiceError`].

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("{resource} '{id}' not found")]
    NotFound { resource: String, id: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("{0}")]
    Conflict(String),

    #[error("key '{0}' not found")]
    KeyNotFound(String),

    #[error("{0}")]
    Internal(String),

    /// An error received over the wire from a remote service, preserved
    /// with its original status and code so re-serialization round-trips.
    #[error("{message}")]
    Wire {
        status: u16,
        code: String,
        message: String,
    },
}

impl ServiceError {
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } | Self::KeyNotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Wire { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::KeyNotFound(_) => "key_not_found",
            Self::Internal(_) => "internal_error",
            Self::Wire { code, .. } => code,
        }
    }

    /// Message safe to expose to a client. Internal detail stays in the
    /// server-side log only.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }

    /// Reconstruct a local error value from a remote error envelope.
    pub fn from_wire(status: u16, code: &str, message: &str) -> Self {
        match code {
            "validation_error" => Self::Validation(message.to_string()),
            "unauthorized" => Self::Unauthorized,
            "forbidden" => Self::Forbidden,
            "conflict" => Self::Conflict(message.to_string()),
            "key_not_found" => Self::KeyNotFound(message.to_string()),
            _ => Self::Wire {
                status,
                code: code.to_string(),
                message: message.to_string(),
            },
        }
    }
}

/// `{"success":true,"data":…}` / `{"success":false,"error":{…}}` bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl Envelope {
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(err: &ServiceError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: err.code().to_string(),
                message: err.public_message(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_the_error_table() {
        assert_eq!(
            ServiceError::Validation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::not_found("user", "42").status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ServiceError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ServiceError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ServiceError::Conflict("dup".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::Internal("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_detail_is_not_exposed() {
        let err = ServiceError::Internal("password was hunter2".into());
        assert_eq!(err.public_message(), "internal server error");
        let env = Envelope::failure(&err);
        assert!(!serde_json::to_string(&env).unwrap().contains("hunter2"));
    }

    #[test]
    fn wire_round_trip_preserves_status_and_code() {
        let original = ServiceError::not_found("user", "42");
        let env = Envelope::failure(&original);
        let body = env.error.unwrap();
        let rebuilt = ServiceError::from_wire(404, &body.code, &body.message);
        assert_eq!(rebuilt.status(), StatusCode::NOT_FOUND);
        assert_eq!(rebuilt.code(), "not_found");
        assert_eq!(rebuilt.to_string(), "user '42' not found");
    }
}
