//! The document database core: the MasterIndex registry, Collection CRUD
//! surface, the coordination protocol that wraps every mutation, and the
//! Database façade that ties them together over a pair of external
//! collaborators (an object store and a property bag).

#[macro_use]
extern crate slog_scope;

pub mod collection;
pub mod coordinator;
pub mod database;
pub mod document_ops;
pub mod ids;
pub mod master_index;
pub mod settings;

pub use blobdb_common::{DbError, DbResult, DocValue, Document, ErrorKind};
pub use collection::{Collection, DeleteOneResult, InsertOneResult, UpdateOneResult};
pub use database::{Database, IndexBlob, IndexCollectionEntry};
pub use master_index::{
    CollectionMetadata, CollectionMetadataPatch, ConflictResolution, ConflictStrategy, LockStatus,
    MasterIndex, MasterIndexRecord, ModificationHistoryEntry,
};
pub use settings::Settings;
