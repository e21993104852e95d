#![forbid(unsafe_code)]

use formvault_contracts::form::FormId;
use formvault_contracts::ContractViolation;
use formvault_engines::field_codec::EncryptionError;
use formvault_engines::payload::ValidationError;
use formvault_engines::schema_registry::SchemaError;
use formvault_storage::store::StorageError;
use formvault_storage::table_manager::TableError;
use tracing::{error, warn};
use uuid::Uuid;

/// Opaque id tying a generic user-facing failure to its detailed log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        CorrelationId(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Every failure a caller of the engine can observe. Messages of the storage
/// and integrity variants carry only a correlation id; the detail goes to the log.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] ContractViolation),
    #[error("form schema conflict: {reason}")]
    SchemaConflict { reason: String },
    #[error("form storage could not be prepared (ref {correlation_id})")]
    TableCreation { correlation_id: CorrelationId },
    #[error("storage failure (ref {correlation_id})")]
    Storage { correlation_id: CorrelationId },
    #[error("protected field could not be processed (ref {correlation_id})")]
    Encryption { correlation_id: CorrelationId },
    #[error("integrity failure (ref {correlation_id})")]
    IdSyncViolation { correlation_id: CorrelationId },
    #[error("parent submission not found")]
    ParentNotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("form {0} not found")]
    FormNotFound(FormId),
    #[error("form {0} already exists")]
    FormAlreadyExists(FormId),
    #[error("submission still has sub-form records")]
    HasDependents,
}

impl EngineError {
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            EngineError::TableCreation { correlation_id }
            | EngineError::Storage { correlation_id }
            | EngineError::Encryption { correlation_id }
            | EngineError::IdSyncViolation { correlation_id } => Some(*correlation_id),
            _ => None,
        }
    }

    pub(crate) fn from_storage(op: &'static str, err: StorageError) -> Self {
        let correlation_id = CorrelationId::new();
        match err {
            StorageError::IdSyncViolation {
                ledger_id,
                dynamic_id,
            } => {
                error!(
                    %correlation_id,
                    op,
                    ?ledger_id,
                    ?dynamic_id,
                    "ledger and dynamic row identifiers diverged"
                );
                EngineError::IdSyncViolation { correlation_id }
            }
            other => {
                error!(%correlation_id, op, error = %other, "storage operation failed");
                EngineError::Storage { correlation_id }
            }
        }
    }

    pub(crate) fn from_encryption(op: &'static str, err: EncryptionError) -> Self {
        let correlation_id = CorrelationId::new();
        error!(%correlation_id, op, error = %err, "field encryption failed");
        EngineError::Encryption { correlation_id }
    }

    pub(crate) fn from_table(op: &'static str, err: TableError) -> Self {
        match err {
            TableError::TableCreation { reason } => {
                let correlation_id = CorrelationId::new();
                error!(%correlation_id, op, %reason, "table creation failed");
                EngineError::TableCreation { correlation_id }
            }
            TableError::SchemaConflict { column, reason } => {
                warn!(op, %column, reason, "table schema conflict");
                EngineError::SchemaConflict {
                    reason: reason.to_string(),
                }
            }
            TableError::Storage(e) => Self::from_storage(op, e),
        }
    }

    pub(crate) fn integrity(op: &'static str, detail: &str) -> Self {
        let correlation_id = CorrelationId::new();
        error!(%correlation_id, op, detail, "ledger and dynamic rows diverged");
        EngineError::IdSyncViolation { correlation_id }
    }
}

impl From<SchemaError> for EngineError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::Conflict { first, second, .. } => EngineError::SchemaConflict {
                reason: format!("fields '{first}' and '{second}' cannot be told apart"),
            },
            SchemaError::Contract(v) => EngineError::InvalidRequest(v),
        }
    }
}

/// Result of a gated single-row operation. Denial and absence are ordinary
/// outcomes, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Done(T),
    AccessDenied,
    NotFound,
}

impl<T> Outcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Done(v) => Outcome::Done(f(v)),
            Outcome::AccessDenied => Outcome::AccessDenied,
            Outcome::NotFound => Outcome::NotFound,
        }
    }

    pub fn done(self) -> Option<T> {
        match self {
            Outcome::Done(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Outcome::Done(_))
    }
}
