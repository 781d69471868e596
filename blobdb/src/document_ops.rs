//! Primitive CRUD over an in-memory, insertion-ordered document list.
//! Kept separate from [`crate::collection::Collection`] so the lazy-load/
//! dirty-tracking lifecycle and the pure document manipulation can be
//! tested independently of each other.

use blobdb_common::document::document_deep_equal;
use blobdb_common::{DbError, DbResult, DocValue, Document, ID_FIELD};
use blobdb_query::{matches_document, QueryEngineConfig};
use blobdb_update::apply_update;

use crate::ids;

pub fn insert(documents: &mut Vec<Document>, mut doc: Document) -> DbResult<String> {
    let id = match doc.get(ID_FIELD) {
        Some(DocValue::String(s)) => s.clone(),
        Some(_) => return Err(DbError::invalid_argument("_id must be a string")),
        None => {
            let id = ids::new_id();
            doc.insert(ID_FIELD.to_owned(), DocValue::from(id.clone()));
            id
        }
    };
    if documents.iter().any(|d| id_of(d) == Some(id.as_str())) {
        return Err(DbError::duplicate_key(id));
    }
    documents.push(doc);
    Ok(id)
}

fn id_of(doc: &Document) -> Option<&str> {
    doc.get(ID_FIELD).and_then(DocValue::as_str)
}

pub fn find_one(
    documents: &[Document],
    filter: &DocValue,
    config: &QueryEngineConfig,
) -> DbResult<Option<Document>> {
    for doc in documents {
        if matches_document(doc, filter, config)? {
            return Ok(Some(doc.clone()));
        }
    }
    Ok(None)
}

pub fn find(documents: &[Document], filter: &DocValue, config: &QueryEngineConfig) -> DbResult<Vec<Document>> {
    let mut matched = Vec::new();
    for doc in documents {
        if matches_document(doc, filter, config)? {
            matched.push(doc.clone());
        }
    }
    Ok(matched)
}

pub fn count(documents: &[Document], filter: &DocValue, config: &QueryEngineConfig) -> DbResult<usize> {
    let mut total = 0;
    for doc in documents {
        if matches_document(doc, filter, config)? {
            total += 1;
        }
    }
    Ok(total)
}

fn find_match_index(documents: &[Document], filter: &DocValue, config: &QueryEngineConfig) -> DbResult<Option<usize>> {
    for (i, doc) in documents.iter().enumerate() {
        if matches_document(doc, filter, config)? {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

/// Returns `(matchedCount, modifiedCount)`.
pub fn update_one(
    documents: &mut [Document],
    filter: &DocValue,
    update: &Document,
    query_config: &QueryEngineConfig,
) -> DbResult<(u64, u64)> {
    let index = match find_match_index(documents, filter, query_config)? {
        Some(i) => i,
        None => return Ok((0, 0)),
    };
    let original = documents[index].clone();
    let is_replacement = !update.keys().any(|k| k.starts_with('$'));
    let replaced = if is_replacement {
        let mut replacement = update.clone();
        let original_id = original.get(ID_FIELD).cloned().unwrap_or(DocValue::Null);
        replacement.insert(ID_FIELD.to_owned(), original_id);
        replacement
    } else {
        apply_update(&original, update, query_config)?
    };
    let modified = !document_deep_equal(&original, &replaced);
    documents[index] = replaced;
    Ok((1, if modified { 1 } else { 0 }))
}

pub fn delete_one(documents: &mut Vec<Document>, filter: &DocValue, query_config: &QueryEngineConfig) -> DbResult<u64> {
    match find_match_index(documents, filter, query_config)? {
        Some(i) => {
            documents.remove(i);
            Ok(1)
        }
        None => Ok(0),
    }
}
