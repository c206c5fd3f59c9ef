//! Error type definitions for the stream checker
//!
//! This module defines all error types used throughout the service,
//! providing a hierarchical error system that makes debugging and error
//! handling more straightforward.

use thiserror::Error;

/// Top-level application error type
///
/// This enum represents all possible errors that can occur in the service.
/// It uses `thiserror` to provide automatic error trait implementations and
/// proper error chaining.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Probe execution errors
    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    /// Unexpected response shape from the external system
    #[error("Unexpected data shape from {context}: {message}")]
    DataShape { context: String, message: String },

    /// External service errors
    #[error("External service error: {endpoint} - {message}")]
    ExternalService { endpoint: String, message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Probe execution specific errors
#[derive(Error, Debug)]
pub enum ProbeError {
    /// The analysis tool binary is missing or could not be spawned
    #[error("Failed to spawn {tool}: {message}")]
    Spawn { tool: String, message: String },

    /// The analysis subprocess exceeded its deadline
    #[error("{tool} timed out after {seconds}s")]
    Timeout { tool: String, seconds: u64 },

    /// The tool produced output that could not be parsed
    #[error("Failed to parse {tool} output: {message}")]
    ParseFailed { tool: String, message: String },
}

/// Convenience methods for creating common error types
impl AppError {
    /// Create a data shape error for an unexpected response
    pub fn data_shape<C: Into<String>, M: Into<String>>(context: C, message: M) -> Self {
        Self::DataShape {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Create an external service error
    pub fn external_service<E: Into<String>, M: Into<String>>(endpoint: E, message: M) -> Self {
        Self::ExternalService {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl ProbeError {
    /// Create a spawn failure for a tool invocation
    pub fn spawn<T: Into<String>, M: Into<String>>(tool: T, message: M) -> Self {
        Self::Spawn {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error for a tool invocation
    pub fn timeout<T: Into<String>>(tool: T, seconds: u64) -> Self {
        Self::Timeout {
            tool: tool.into(),
            seconds,
        }
    }

    /// Create a parse failure for tool output
    pub fn parse_failed<T: Into<String>, M: Into<String>>(tool: T, message: M) -> Self {
        Self::ParseFailed {
            tool: tool.into(),
            message: message.into(),
        }
    }
}
