//! Lazy-loaded, dirty-tracked document container exposing a
//! MongoDB-compatible CRUD surface.
//!
//! A `Collection` has no back-reference to the owning [`crate::database::Database`]:
//! the cyclic ownership the component design describes (Database owns
//! Collections, Collections need the shared collaborators Database holds)
//! is broken by giving each Collection its own clone of the object-store
//! handle and query configuration at construction, rather than a pointer
//! back to its parent. The Database remains the sole owner of the
//! Collection map; nothing ever needs to walk from a Collection back to
//! the façade.

use std::cell::RefCell;

use blobdb_common::document::{document_from_json, document_to_json};
use blobdb_common::{DbError, DbResult, DocValue, Document, ID_FIELD};
use blobdb_query::QueryEngineConfig;
use blobdb_store::ObjectStoreClient;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::document_ops;
use crate::ids;

/// The metadata stored inside the collection blob itself (distinct from
/// [`crate::master_index::CollectionMetadata`], which additionally carries
/// lock state that only the MasterIndex needs).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub document_count: u64,
    pub modification_token: String,
}

impl BlobMetadata {
    pub fn fresh() -> Self {
        let now = Utc::now();
        BlobMetadata {
            created: now,
            last_updated: now,
            document_count: 0,
            modification_token: ids::new_id(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InsertOneResult {
    pub inserted_id: String,
    pub acknowledged: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateOneResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub acknowledged: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeleteOneResult {
    pub deleted_count: u64,
    pub acknowledged: bool,
}

struct CollectionState {
    documents: Option<Vec<Document>>,
    metadata: BlobMetadata,
    dirty: bool,
}

pub struct Collection<S> {
    name: String,
    file_id: String,
    object_store: S,
    query_config: QueryEngineConfig,
    state: RefCell<CollectionState>,
}

impl<S: ObjectStoreClient> Collection<S> {
    pub fn new_empty(
        name: impl Into<String>,
        file_id: impl Into<String>,
        object_store: S,
        query_config: QueryEngineConfig,
    ) -> Self {
        Collection {
            name: name.into(),
            file_id: file_id.into(),
            object_store,
            query_config,
            state: RefCell::new(CollectionState {
                documents: Some(Vec::new()),
                metadata: BlobMetadata::fresh(),
                dirty: true,
            }),
        }
    }

    pub fn attach(
        name: impl Into<String>,
        file_id: impl Into<String>,
        object_store: S,
        query_config: QueryEngineConfig,
    ) -> Self {
        Collection {
            name: name.into(),
            file_id: file_id.into(),
            object_store,
            query_config,
            state: RefCell::new(CollectionState {
                documents: None,
                metadata: BlobMetadata::fresh(),
                dirty: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn metadata(&self) -> BlobMetadata {
        self.state.borrow().metadata.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.borrow().dirty
    }

    fn ensure_loaded(&self) -> DbResult<()> {
        if self.state.borrow().documents.is_some() {
            return Ok(());
        }
        self.load()
    }

    /// Discard any in-memory state and reload from the blob, used by the
    /// coordinator before every mutating operation.
    pub fn force_reload(&self) -> DbResult<()> {
        self.load()
    }

    fn load(&self) -> DbResult<()> {
        let raw = self.object_store.read_file(&self.file_id)?;
        let value = parse_blob(&raw)?;
        let data = collection_data_from_json(&value)?;
        let mut state = self.state.borrow_mut();
        state.documents = Some(data.0);
        state.metadata = data.1;
        state.dirty = false;
        Ok(())
    }

    pub fn save(&self) -> DbResult<()> {
        let mut state = self.state.borrow_mut();
        if !state.dirty {
            return Ok(());
        }
        state.metadata.modification_token = ids::new_id();
        state.metadata.last_updated = Utc::now();
        let documents = state.documents.clone().unwrap_or_default();
        let metadata = state.metadata.clone();
        let payload = collection_data_to_json(&documents, &metadata).to_string();
        drop(state);
        self.object_store.update_file(&self.file_id, &payload)?;
        self.state.borrow_mut().dirty = false;
        Ok(())
    }

    fn validate_public_filter(filter: &DocValue) -> DbResult<()> {
        match filter {
            DocValue::Object(map) if map.is_empty() => Ok(()),
            DocValue::Object(map)
                if map.len() == 1
                    && matches!(map.get(ID_FIELD), Some(DocValue::String(_))) =>
            {
                Ok(())
            }
            _ => Err(DbError::operation_error(
                "Collection only accepts {} or {_id: <string>} filters; use the blobdb-query crate directly for richer matching",
            )),
        }
    }

    pub fn insert_one(&self, doc: Document) -> DbResult<InsertOneResult> {
        self.ensure_loaded()?;
        let mut state = self.state.borrow_mut();
        let documents = state.documents.as_mut().expect("ensure_loaded populated documents");
        let inserted_id = document_ops::insert(documents, doc)?;
        state.metadata.document_count = documents.len() as u64;
        state.metadata.last_updated = Utc::now();
        state.dirty = true;
        Ok(InsertOneResult {
            inserted_id,
            acknowledged: true,
        })
    }

    pub fn find_one(&self, filter: &DocValue) -> DbResult<Option<Document>> {
        Self::validate_public_filter(filter)?;
        self.ensure_loaded()?;
        let state = self.state.borrow();
        let documents = state.documents.as_ref().expect("ensure_loaded populated documents");
        document_ops::find_one(documents, filter, &self.query_config)
    }

    pub fn find(&self, filter: &DocValue) -> DbResult<Vec<Document>> {
        Self::validate_public_filter(filter)?;
        self.ensure_loaded()?;
        let state = self.state.borrow();
        let documents = state.documents.as_ref().expect("ensure_loaded populated documents");
        document_ops::find(documents, filter, &self.query_config)
    }

    pub fn count_documents(&self, filter: &DocValue) -> DbResult<u64> {
        Self::validate_public_filter(filter)?;
        self.ensure_loaded()?;
        let state = self.state.borrow();
        let documents = state.documents.as_ref().expect("ensure_loaded populated documents");
        Ok(document_ops::count(documents, filter, &self.query_config)? as u64)
    }

    pub fn update_one(&self, filter: &DocValue, update: &Document) -> DbResult<UpdateOneResult> {
        Self::validate_public_filter(filter)?;
        self.ensure_loaded()?;
        let mut state = self.state.borrow_mut();
        let documents = state.documents.as_mut().expect("ensure_loaded populated documents");
        let (matched, modified) = document_ops::update_one(documents, filter, update, &self.query_config)?;
        if modified > 0 {
            state.metadata.last_updated = Utc::now();
            state.dirty = true;
        }
        Ok(UpdateOneResult {
            matched_count: matched,
            modified_count: modified,
            acknowledged: true,
        })
    }

    pub fn delete_one(&self, filter: &DocValue) -> DbResult<DeleteOneResult> {
        Self::validate_public_filter(filter)?;
        self.ensure_loaded()?;
        let mut state = self.state.borrow_mut();
        let documents = state.documents.as_mut().expect("ensure_loaded populated documents");
        let deleted = document_ops::delete_one(documents, filter, &self.query_config)?;
        if deleted > 0 {
            state.metadata.document_count = documents.len() as u64;
            state.metadata.last_updated = Utc::now();
            state.dirty = true;
        }
        Ok(DeleteOneResult {
            deleted_count: deleted,
            acknowledged: true,
        })
    }
}

fn parse_blob(raw: &str) -> DbResult<Json> {
    match serde_json::from_str::<Json>(raw) {
        Ok(value) => Ok(value),
        Err(parse_err) => {
            let trimmed = raw.trim();
            let looks_structured = trimmed.starts_with('{') && trimmed.ends_with('}');
            let hint = if looks_structured {
                " (content already looks like a structured object; check for double JSON-encoding upstream)"
            } else {
                ""
            };
            Err(DbError::operation_error(format!(
                "failed to parse collection blob: {parse_err}{hint}"
            )))
        }
    }
}

fn collection_data_to_json(documents: &[Document], metadata: &BlobMetadata) -> Json {
    let mut documents_map = serde_json::Map::new();
    for doc in documents {
        let id = doc.get(ID_FIELD).and_then(DocValue::as_str).unwrap_or_default().to_owned();
        documents_map.insert(id, document_to_json(doc));
    }
    let metadata_json = serde_json::to_value(metadata).expect("BlobMetadata always serialises");
    serde_json::json!({ "documents": Json::Object(documents_map), "metadata": metadata_json })
}

fn collection_data_from_json(value: &Json) -> DbResult<(Vec<Document>, BlobMetadata)> {
    let obj = value
        .as_object()
        .ok_or_else(|| DbError::invalid_file_format("collection blob is not a JSON object"))?;
    let documents_value = obj
        .get("documents")
        .ok_or_else(|| DbError::invalid_file_format("collection blob missing 'documents'"))?;
    let documents_obj = documents_value
        .as_object()
        .ok_or_else(|| DbError::invalid_file_format("collection blob 'documents' is not an object"))?;
    let mut documents = Vec::with_capacity(documents_obj.len());
    for doc_json in documents_obj.values() {
        let doc = document_from_json(doc_json)
            .ok_or_else(|| DbError::invalid_file_format("document is not a JSON object"))?;
        documents.push(doc);
    }
    let metadata_value = obj
        .get("metadata")
        .ok_or_else(|| DbError::invalid_file_format("collection blob missing 'metadata'"))?;
    let metadata: BlobMetadata = serde_json::from_value(metadata_value.clone())
        .map_err(|e| DbError::invalid_file_format(format!("malformed collection metadata: {e}")))?;
    Ok((documents, metadata))
}
