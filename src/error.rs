//! Structured error types for the provcert library.
//!
//! Every public library function returns [`Result<T>`] which carries a
//! domain-specific [`ProvcertError`].  Callers that need a coarse view (the
//! CLI exit status, audit tooling) use [`ProvcertError::class`].

use thiserror::Error;

use crate::model::{BatchId, CertificateId, Mode};

// ---------------------------------------------------------------------------
// Primary error enum
// ---------------------------------------------------------------------------

/// Domain-specific error type for the provcert library.
#[derive(Error, Debug)]
pub enum ProvcertError {
    /// A looked-up record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: RecordKind, id: String },

    /// A referenced entity (custodian, issuer, prover) is not registered.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// A referenced batch does not exist.
    #[error("unknown batch: {0}")]
    UnknownBatch(BatchId),

    #[error("entity already registered: {0}")]
    DuplicateEntity(String),

    #[error("invalid mode '{0}' (expected ISSUER, PROVER or VERIFIER)")]
    InvalidMode(String),

    #[error("invalid status '{0}' for this deployment's pipeline")]
    InvalidStatus(String),

    #[error("batch {batch_id}: stage {requested} precedes already certified stage {reached}")]
    StageRegression {
        batch_id: BatchId,
        requested: String,
        reached: String,
    },

    #[error("entity {id} has mode {mode}, ISSUER required")]
    NotIssuer { id: String, mode: Mode },

    #[error("custodian {id} has mode {mode}, PROVER required")]
    NotProver { id: String, mode: Mode },

    #[error("caller {caller} is not authorized to {action}")]
    Unauthorized { caller: String, action: &'static str },

    #[error("validation: {0}")]
    Validation(String),

    #[error("ledger: {0}")]
    Ledger(String),

    #[error("journal: {0}")]
    Journal(String),

    #[error("signing: {0}")]
    Signing(String),

    #[error("config: {0}")]
    Config(String),

    /// Direct database errors (auto-converted via `?` in the ledger module).
    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),

    /// Catch-all for errors that do not fit a specific domain.
    #[error("{0}")]
    Other(String),
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, ProvcertError>;

/// The kind of record a [`ProvcertError::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Entity,
    Batch,
    Certificate,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entity => write!(f, "entity"),
            Self::Batch => write!(f, "batch"),
            Self::Certificate => write!(f, "certificate"),
        }
    }
}

impl ProvcertError {
    pub(crate) fn entity_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: RecordKind::Entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn batch_not_found(id: BatchId) -> Self {
        Self::NotFound {
            kind: RecordKind::Batch,
            id: id.to_string(),
        }
    }

    pub(crate) fn certificate_not_found(id: CertificateId) -> Self {
        Self::NotFound {
            kind: RecordKind::Certificate,
            id: id.to_string(),
        }
    }

    /// Coarse classification of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound { .. } | Self::UnknownEntity(_) | Self::UnknownBatch(_) => {
                ErrorClass::NotFound
            }
            Self::DuplicateEntity(_)
            | Self::InvalidMode(_)
            | Self::InvalidStatus(_)
            | Self::StageRegression { .. }
            | Self::Validation(_) => ErrorClass::Validation,
            Self::NotIssuer { .. } | Self::NotProver { .. } | Self::Unauthorized { .. } => {
                ErrorClass::Authorization
            }
            Self::Ledger(_)
            | Self::Journal(_)
            | Self::Signing(_)
            | Self::Config(_)
            | Self::Database(_)
            | Self::Other(_) => ErrorClass::Internal,
        }
    }
}

// ---------------------------------------------------------------------------
// Error classes
// ---------------------------------------------------------------------------

/// Error classes, with the process exit status the CLI uses for each.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NotFound = 3,
    Validation = 4,
    Authorization = 5,
    Internal = 70,
}

impl ErrorClass {
    pub fn exit_code(self) -> i32 {
        self as i32
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not-found"),
            Self::Validation => write!(f, "validation"),
            Self::Authorization => write!(f, "authorization"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

// ---------------------------------------------------------------------------
// Context extension trait
// ---------------------------------------------------------------------------

/// Extension trait that adds domain-specific context to any `Result<T, E>`.
///
/// Usage mirrors `anyhow::Context` but tags the error with the originating
/// subsystem so that callers can categorise failures.
///
/// ```ignore
/// std::fs::read(path).ctx_ledger("read export file")?;
/// ```
pub trait ResultExt<T> {
    fn ctx_ledger(self, msg: &str) -> Result<T>;
    fn ctx_journal(self, msg: &str) -> Result<T>;
    fn ctx_signing(self, msg: &str) -> Result<T>;
    fn ctx_config(self, msg: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn ctx_ledger(self, msg: &str) -> Result<T> {
        self.map_err(|e| ProvcertError::Ledger(format!("{msg}: {e}")))
    }
    fn ctx_journal(self, msg: &str) -> Result<T> {
        self.map_err(|e| ProvcertError::Journal(format!("{msg}: {e}")))
    }
    fn ctx_signing(self, msg: &str) -> Result<T> {
        self.map_err(|e| ProvcertError::Signing(format!("{msg}: {e}")))
    }
    fn ctx_config(self, msg: &str) -> Result<T> {
        self.map_err(|e| ProvcertError::Config(format!("{msg}: {e}")))
    }
}

/// Same as [`ResultExt`] but for `Option<T>` (converts `None` into an error).
pub trait OptionExt<T> {
    fn required_signing(self, msg: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required_signing(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| ProvcertError::Signing(msg.to_string()))
    }
}
