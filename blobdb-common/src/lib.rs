//! Shared error taxonomy, document value model, retry policy, and logging
//! bootstrap used by every blobdb crate.

pub mod document;
pub mod error;
pub mod logging;
pub mod retry;

pub use document::{deep_clone, deep_equal, document_deep_equal, DocValue, Document, ID_FIELD};
pub use error::{DbError, DbResult, ErrorKind, ReportableError};
pub use retry::RetryPolicy;
