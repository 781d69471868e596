//! Tagged error taxonomy shared by every blobdb crate.
//!
//! Modeled on `syncstorage-db-common::error::CommonDbError`: a single
//! concrete error struct wrapping a private `thiserror` enum, plus an
//! introspection trait so callers can branch on error category without
//! matching the enum directly.

use std::collections::BTreeMap;
use std::fmt;

use backtrace::Backtrace;
use thiserror::Error;

/// The tagged error kinds recognised across the workspace. Kept as a
/// private enum behind `DbError` so the public surface is the struct, not
/// the variant names.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("document not found: {0}")]
    DocumentNotFound(String),
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("collection not found: {0}")]
    CollectionNotFound(String),
    #[error("file I/O error: {0}")]
    FileIoError(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("invalid file format: {0}")]
    InvalidFileFormat(String),
    #[error("lock timeout: {0}")]
    LockTimeout(String),
    #[error("lock acquisition failure: {0}")]
    LockAcquisitionFailure(String),
    #[error("modification conflict: {0}")]
    ModificationConflict(String),
    #[error("conflict: {0}")]
    ConflictError(String),
    #[error("coordination timeout: {0}")]
    CoordinationTimeout(String),
    #[error("master index error: {0}")]
    MasterIndexError(String),
    #[error("configuration error: {0}")]
    ConfigurationError(String),
    #[error("operation error: {0}")]
    OperationError(String),
}

/// `{kind, message, context}` plus a lazily-captured backtrace for
/// `ReportableError::error_backtrace`.
#[derive(Debug, Clone)]
pub struct DbError {
    kind: ErrorKind,
    context: BTreeMap<String, String>,
}

macro_rules! constructors {
    ($($fn_name:ident => $variant:ident),* $(,)?) => {
        $(
            pub fn $fn_name(message: impl Into<String>) -> Self {
                ErrorKind::$variant(message.into()).into()
            }
        )*
    };
}

impl DbError {
    constructors! {
        invalid_argument => InvalidArgument,
        invalid_query => InvalidQuery,
        document_not_found => DocumentNotFound,
        duplicate_key => DuplicateKey,
        collection_not_found => CollectionNotFound,
        file_io_error => FileIoError,
        file_not_found => FileNotFound,
        permission_denied => PermissionDenied,
        quota_exceeded => QuotaExceeded,
        invalid_file_format => InvalidFileFormat,
        lock_timeout => LockTimeout,
        lock_acquisition_failure => LockAcquisitionFailure,
        modification_conflict => ModificationConflict,
        conflict_error => ConflictError,
        coordination_timeout => CoordinationTimeout,
        master_index_error => MasterIndexError,
        configuration_error => ConfigurationError,
        operation_error => OperationError,
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    /// Attach a diagnostic field; returns `self` for chaining at the call site.
    pub fn with_context(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self.kind, ErrorKind::InvalidArgument(_))
    }

    pub fn is_invalid_query(&self) -> bool {
        matches!(self.kind, ErrorKind::InvalidQuery(_))
    }

    pub fn is_document_not_found(&self) -> bool {
        matches!(self.kind, ErrorKind::DocumentNotFound(_))
    }

    pub fn is_duplicate_key(&self) -> bool {
        matches!(self.kind, ErrorKind::DuplicateKey(_))
    }

    pub fn is_collection_not_found(&self) -> bool {
        matches!(self.kind, ErrorKind::CollectionNotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::ModificationConflict(_) | ErrorKind::ConflictError(_)
        )
    }

    pub fn is_quota(&self) -> bool {
        matches!(self.kind, ErrorKind::QuotaExceeded(_))
    }

    pub fn is_operation_error(&self) -> bool {
        matches!(self.kind, ErrorKind::OperationError(_))
    }

    pub fn is_lock_failure(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::LockTimeout(_) | ErrorKind::LockAcquisitionFailure(_)
        )
    }

    /// Transient object-store failures the retry adapter should retry.
    pub fn is_transient_store_error(&self) -> bool {
        matches!(self.kind, ErrorKind::FileIoError(_) | ErrorKind::QuotaExceeded(_))
    }
}

impl From<ErrorKind> for DbError {
    fn from(kind: ErrorKind) -> Self {
        DbError {
            kind,
            context: BTreeMap::new(),
        }
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if !self.context.is_empty() {
            write!(f, " (")?;
            for (i, (k, v)) in self.context.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}={}", k, v)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for DbError {}

/// Implemented by every blobdb error type so a hosting application can wire
/// metrics/error-reporting without the core depending on a specific backend.
pub trait ReportableError: std::error::Error {
    fn error_backtrace(&self) -> String;
    fn is_sentry_event(&self) -> bool;
    fn metric_label(&self) -> Option<String>;
}

impl ReportableError for DbError {
    fn error_backtrace(&self) -> String {
        format!("{:#?}", Backtrace::new())
    }

    fn is_sentry_event(&self) -> bool {
        // conflicts are expected, routine occurrences under optimistic
        // concurrency; everything else is worth a report.
        !self.is_conflict()
    }

    fn metric_label(&self) -> Option<String> {
        match &self.kind {
            ErrorKind::ModificationConflict(_) | ErrorKind::ConflictError(_) => {
                Some("blobdb.conflict".to_owned())
            }
            ErrorKind::LockTimeout(_) | ErrorKind::LockAcquisitionFailure(_) => {
                Some("blobdb.lock_failure".to_owned())
            }
            ErrorKind::QuotaExceeded(_) => Some("blobdb.quota".to_owned()),
            _ => None,
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;
