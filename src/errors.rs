//! Error handling for the AGIdentity gateway
//!
//! One crate-wide error type covers the failure classes of the message
//! pipeline (authentication, transport, signing, tool execution, integrity,
//! fatal model failures) plus the infrastructure errors underneath them.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Main error type for the gateway
#[derive(Error, Debug)]
pub enum AgidError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Authentication failed: {reason}")]
    Auth { reason: String },

    #[error("Transport operation failed: {operation} - {message}")]
    Transport { operation: String, message: String },

    #[error("Signing capability failed: {operation} - {message}")]
    Signing { operation: String, message: String },

    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Integrity check failed: {message}")]
    Integrity { message: String },

    #[error("Model call failed: {message}")]
    Fatal { message: String },

    #[error("Database operation failed: {operation} - {source}")]
    Database {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Serialization failed: {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Cryptographic operation failed: {message}")]
    Crypto { message: String },

    #[error("I/O operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Resource not found: {resource} - {id}")]
    NotFound { resource: String, id: String },

    #[error("Operation timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    #[error("Too many requests: {message}")]
    RateLimited { message: String },

    #[error("Mutex lock failed: {resource}")]
    MutexPoisoned { resource: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result alias used throughout the crate
pub type AgidResult<T> = Result<T, AgidError>;

impl AgidError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn auth(reason: impl Into<String>) -> Self {
        Self::Auth {
            reason: reason.into(),
        }
    }

    pub fn transport(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn signing(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Signing {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    pub fn database(
        operation: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Database {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            source,
        }
    }

    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable tag for the error class, used as `errorType` in progress events.
    pub fn kind(&self) -> &'static str {
        match self {
            AgidError::Config { .. } => "config",
            AgidError::Auth { .. } => "auth",
            AgidError::Transport { .. } => "transport",
            AgidError::Signing { .. } => "signing",
            AgidError::ToolExecution { .. } => "tool_execution",
            AgidError::Integrity { .. } => "integrity",
            AgidError::Fatal { .. } => "fatal",
            AgidError::Database { .. } => "database",
            AgidError::Serialization { .. } => "serialization",
            AgidError::Crypto { .. } => "crypto",
            AgidError::Io { .. } => "io",
            AgidError::Validation { .. } => "validation",
            AgidError::NotFound { .. } => "not_found",
            AgidError::Timeout { .. } => "timeout",
            AgidError::RateLimited { .. } => "rate_limited",
            AgidError::MutexPoisoned { .. } => "mutex_poisoned",
            AgidError::Internal { .. } => "internal",
        }
    }

    /// Whether the signing capability was the failing component.
    pub fn is_signing_failure(&self) -> bool {
        matches!(self, AgidError::Signing { .. })
            || matches!(
                self,
                AgidError::Timeout { operation, .. } if operation.starts_with("signer.")
            )
    }
}

impl IntoResponse for AgidError {
    fn into_response(self) -> Response {
        let status = match self {
            AgidError::Config { .. }
            | AgidError::Serialization { .. }
            | AgidError::Validation { .. }
            | AgidError::Crypto { .. } => StatusCode::BAD_REQUEST,
            AgidError::Auth { .. } => StatusCode::UNAUTHORIZED,
            AgidError::NotFound { .. } => StatusCode::NOT_FOUND,
            AgidError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AgidError::Transport { .. } | AgidError::Fatal { .. } => StatusCode::BAD_GATEWAY,
            AgidError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AgidError::Signing { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AgidError::Database { .. }
            | AgidError::ToolExecution { .. }
            | AgidError::Integrity { .. }
            | AgidError::Io { .. }
            | AgidError::MutexPoisoned { .. }
            | AgidError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}

/// Lock a std mutex, mapping poison to an error instead of panicking.
pub trait SafeLock<T: ?Sized> {
    fn safe_lock(&self) -> AgidResult<std::sync::MutexGuard<'_, T>>;
}

impl<T: ?Sized> SafeLock<T> for std::sync::Mutex<T> {
    fn safe_lock(&self) -> AgidResult<std::sync::MutexGuard<'_, T>> {
        self.lock().map_err(|_| AgidError::MutexPoisoned {
            resource: "mutex".to_string(),
        })
    }
}

pub trait SafeReadLock<T: ?Sized> {
    fn safe_read(&self) -> AgidResult<std::sync::RwLockReadGuard<'_, T>>;
}

impl<T: ?Sized> SafeReadLock<T> for std::sync::RwLock<T> {
    fn safe_read(&self) -> AgidResult<std::sync::RwLockReadGuard<'_, T>> {
        self.read().map_err(|_| AgidError::MutexPoisoned {
            resource: "rwlock_read".to_string(),
        })
    }
}

pub trait SafeWriteLock<T: ?Sized> {
    fn safe_write(&self) -> AgidResult<std::sync::RwLockWriteGuard<'_, T>>;
}

impl<T: ?Sized> SafeWriteLock<T> for std::sync::RwLock<T> {
    fn safe_write(&self) -> AgidResult<std::sync::RwLockWriteGuard<'_, T>> {
        self.write().map_err(|_| AgidError::MutexPoisoned {
            resource: "rwlock_write".to_string(),
        })
    }
}

impl From<sled::Error> for AgidError {
    fn from(err: sled::Error) -> Self {
        AgidError::database("sled_operation", err)
    }
}

impl From<serde_json::Error> for AgidError {
    fn from(err: serde_json::Error) -> Self {
        AgidError::serialization("json_operation", err)
    }
}

impl From<std::io::Error> for AgidError {
    fn from(err: std::io::Error) -> Self {
        AgidError::io("io_operation", err)
    }
}

impl From<reqwest::Error> for AgidError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AgidError::fatal(format!("model request timed out: {err}"))
        } else {
            AgidError::fatal(format!("model request failed: {err}"))
        }
    }
}

impl From<figment::Error> for AgidError {
    fn from(err: figment::Error) -> Self {
        AgidError::config(err.to_string())
    }
}
