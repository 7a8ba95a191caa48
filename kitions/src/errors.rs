use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error as ThisError;
use uuid::Uuid;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Authentication required but not provided, or the credentials were rejected
    #[error("Not authenticated")]
    Unauthenticated { message: Option<String> },

    /// The user's role is missing or not one of the routable roles
    #[error("User has invalid role {role:?}")]
    InvalidRole { role: Option<String> },

    /// The identity record exists but one or more dependent profile rows do not
    #[error("User {user_id} created but profile rows failed: {failed_tables:?}")]
    SignUpPartialFailure { user_id: Uuid, failed_tables: Vec<String> },

    /// Profile storage (row insert) failure
    #[error("Storage operation on {table} failed: {message}")]
    Storage { table: String, message: String },

    /// Non-success response from the identity service
    #[error("Identity service returned {status}: {message}")]
    Identity { status: u16, message: String },

    /// Invalid request data or business rule violation
    #[error("{message}")]
    BadRequest { message: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Error::InvalidRole { .. } => StatusCode::FORBIDDEN,
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::Identity { status, .. } => match *status {
                400 | 422 => StatusCode::BAD_REQUEST,
                401 | 403 => StatusCode::UNAUTHORIZED,
                429 => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::BAD_GATEWAY,
            },
            Error::SignUpPartialFailure { .. } | Error::Storage { .. } | Error::Internal { .. } | Error::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Unauthenticated { message } => message.clone().unwrap_or_else(|| "Authentication required".to_string()),
            Error::InvalidRole { .. } => "Your account does not have a valid role.".to_string(),
            Error::SignUpPartialFailure { .. } => {
                "Your account was created but its profile setup is incomplete. Please contact support.".to_string()
            }
            Error::Identity { status, message } => match *status {
                400 | 422 => message.clone(),
                401 | 403 => "Invalid email or password".to_string(),
                429 => "Too many requests, please try again later".to_string(),
                _ => "Authentication service unavailable".to_string(),
            },
            Error::BadRequest { message } => message.clone(),
            Error::Storage { .. } | Error::Internal { .. } | Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::SignUpPartialFailure { user_id, failed_tables } => {
                // Left in place for manual reconciliation
                tracing::error!(%user_id, ?failed_tables, "Sign-up left an incomplete account");
            }
            Error::Storage { .. } | Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Identity { status, .. } if *status >= 500 => {
                tracing::error!("Identity service error: {}", self);
            }
            Error::Unauthenticated { .. } | Error::InvalidRole { .. } | Error::Identity { .. } => {
                tracing::info!("Authentication error: {}", self);
            }
            Error::BadRequest { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        (self.status_code(), self.user_message()).into_response()
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Identity {
            status: e.status().map(|s| s.as_u16()).unwrap_or(502),
            message: format!("request failed: {e}"),
        }
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
