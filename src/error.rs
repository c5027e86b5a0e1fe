//! Error types for wa-dispatch.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Row source error: {0}")]
    Source(#[from] SourceError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Errors from the messaging provider transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Request to {endpoint} failed: {reason}")]
    RequestFailed { endpoint: String, reason: String },

    #[error("Provider rejected request: {code} {message}")]
    Rejected { code: u16, message: String },

    #[error("Request to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("Media error: {0}")]
    Media(String),
}

/// Template selection / rendering errors.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Unknown template choice: {0}")]
    UnknownChoice(String),

    #[error("Template {template} requires column {column}")]
    MissingColumn { template: String, column: String },

    #[error("Template body for {0} not available")]
    BodyUnavailable(String),
}

/// Row source errors.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Failed to open row source {locator}: {reason}")]
    Open { locator: String, reason: String },

    #[error("Failed to parse row source {locator}: {reason}")]
    Parse { locator: String, reason: String },
}

/// Report artifact errors.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Failed to write artifact {key}: {reason}")]
    Write { key: String, reason: String },

    #[error("Failed to read artifact {key}: {reason}")]
    Read { key: String, reason: String },

    #[error("Artifact not found: {0}")]
    NotFound(String),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
