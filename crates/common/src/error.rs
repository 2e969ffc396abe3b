//! Error types for Sitelink

use thiserror::Error;

/// Result type alias using Sitelink Error
pub type Result<T> = std::result::Result<T, Error>;

/// Sitelink error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Required tool not installed: {program}")]
    NotInstalled { program: String },

    #[error("Not initialized: {0}")]
    NotInitialized(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind} with id {id}")]
    AlreadyExists { kind: String, id: String },

    #[error("No free tunnel address left in {subnet}")]
    AddressExhausted { subnet: String },

    #[error("{program} exited with {status}: {stderr}")]
    ProcessFailure {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{program} timed out after {seconds}s")]
    Timeout { program: String, seconds: u64 },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Fieldless classification of an [`Error`], stable for callers that branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotInstalled,
    NotInitialized,
    AlreadyExists,
    NotFound,
    AddressExhausted,
    ProcessFailure,
    Timeout,
    InvalidInput,
    InvalidStateTransition,
    Io,
    Database,
    Serialization,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::NotInstalled => "not_installed",
            ErrorKind::NotInitialized => "not_initialized",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AddressExhausted => "address_exhausted",
            ErrorKind::ProcessFailure => "process_failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::InvalidStateTransition => "invalid_state_transition",
            ErrorKind::Io => "io",
            ErrorKind::Database => "database",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::Database(_) => ErrorKind::Database,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::NotInstalled { .. } => ErrorKind::NotInstalled,
            Error::NotInitialized(_) => ErrorKind::NotInitialized,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Error::AddressExhausted { .. } => ErrorKind::AddressExhausted,
            Error::ProcessFailure { .. } => ErrorKind::ProcessFailure,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether re-invoking the failed step can succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::ProcessFailure { .. })
    }

    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    pub fn already_exists(kind: &str, id: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind: kind.to_string(),
            id: id.into(),
        }
    }
}
