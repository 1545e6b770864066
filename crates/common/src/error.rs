use serde::Serialize;
use thiserror::Error;

/// Common error type for the router with clear taxonomy
#[derive(Error, Debug)]
pub enum Error {
    /// Client request errors (4xx)
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Model not found: {0}")]
    UnknownModel(String),

    /// Routing hit a slot whose backend process is gone
    #[error("No model loaded: {0}")]
    ModelNotLoaded(String),

    /// Backend subprocess failed to spawn or never became ready
    #[error("Backend failed to start: {reason}")]
    BackendStartFailed {
        reason: String,
        exit_code: Option<i32>,
    },

    /// Backend answered with a non-2xx status; passed through to the client
    #[error("{message}")]
    BackendError {
        message: String,
        status_code: u16,
        response: serde_json::Value,
    },

    /// Transport failure talking to a live backend
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("No free port found scanning from {seed}")]
    NoFreePort { seed: u16 },

    /// Internal misuse of RecipeOptions::inherit across recipes
    #[error("Recipe mismatch: expected {expected}, got {actual}")]
    RecipeMismatch { expected: String, actual: String },

    #[error("Catalog error: {0}")]
    CatalogError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// IO and serialization errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Get HTTP status code for the error
    pub fn status_code(&self) -> u16 {
        match self {
            // 4xx Client Errors
            Error::BadRequest(_) => 400,
            Error::UnknownModel(_) => 404,

            // 5xx Server Errors
            Error::ModelNotLoaded(_) => 503,
            Error::BackendStartFailed { .. } => 500,
            Error::BackendError { status_code, .. } => *status_code,
            Error::NetworkError(_) => 502,
            Error::NoFreePort { .. } => 500,
            Error::RecipeMismatch { .. } => 500,
            Error::CatalogError(_) => 500,
            Error::ConfigError(_) => 500,
            Error::Io(_) => 500,
            Error::Serialization(_) => 500,
        }
    }

    /// Get error type for responses and logging
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::BadRequest(_) => "bad_request",
            Error::UnknownModel(_) => "model_not_found",
            Error::ModelNotLoaded(_) => "model_not_loaded",
            Error::BackendStartFailed { .. } => "backend_error",
            Error::BackendError { .. } => "backend_error",
            Error::NetworkError(_) => "network_error",
            Error::NoFreePort { .. } => "no_free_port",
            Error::RecipeMismatch { .. } => "recipe_mismatch",
            Error::CatalogError(_) => "catalog_error",
            Error::ConfigError(_) => "config_error",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
        }
    }

    /// Check if retrying the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ModelNotLoaded(_) | Error::NetworkError(_) | Error::NoFreePort { .. }
        )
    }

    /// The `{"error":{…}}` envelope as a JSON value, for paths that return
    /// backend-shaped JSON bodies instead of propagating errors
    pub fn to_response_value(&self) -> serde_json::Value {
        serde_json::to_value(ErrorResponse::from(self)).unwrap_or_else(|_| {
            serde_json::json!({
                "error": {
                    "message": self.to_string(),
                    "type": self.error_type(),
                    "code": self.status_code(),
                }
            })
        })
    }

    /// Duplicate an error so one failure can be fanned out to several
    /// waiters. Lossy for variants wrapping non-clonable sources.
    pub fn duplicate(&self) -> Error {
        match self {
            Error::BadRequest(m) => Error::BadRequest(m.clone()),
            Error::UnknownModel(m) => Error::UnknownModel(m.clone()),
            Error::ModelNotLoaded(m) => Error::ModelNotLoaded(m.clone()),
            Error::BackendStartFailed { reason, exit_code } => Error::BackendStartFailed {
                reason: reason.clone(),
                exit_code: *exit_code,
            },
            Error::BackendError {
                message,
                status_code,
                response,
            } => Error::BackendError {
                message: message.clone(),
                status_code: *status_code,
                response: response.clone(),
            },
            Error::NetworkError(m) => Error::NetworkError(m.clone()),
            Error::NoFreePort { seed } => Error::NoFreePort { seed: *seed },
            Error::RecipeMismatch { expected, actual } => Error::RecipeMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            },
            Error::CatalogError(m) => Error::CatalogError(m.clone()),
            Error::ConfigError(m) => Error::ConfigError(m.clone()),
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::Serialization(e) => Error::ConfigError(e.to_string()),
        }
    }
}

/// Error response for HTTP API
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    pub r#type: String,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl From<&Error> for ErrorResponse {
    fn from(err: &Error) -> Self {
        let (status_code, response) = match err {
            Error::BackendError {
                status_code,
                response,
                ..
            } => (Some(*status_code), Some(response.clone())),
            _ => (None, None),
        };
        let exit_code = match err {
            Error::BackendStartFailed { exit_code, .. } => *exit_code,
            _ => None,
        };

        ErrorResponse {
            error: ErrorDetail {
                message: err.to_string(),
                r#type: err.error_type().to_string(),
                code: err.status_code(),
                status_code,
                response,
                exit_code,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
