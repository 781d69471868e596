//! Object-store client interface plus an in-memory reference
//! implementation.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use blobdb_common::{DbError, DbResult};

/// Typed wrapper over a raw blob-storage API. Implementors own the
/// transient-failure/retry policy for their own transport; this crate's
/// [`crate::RetryingObjectStore`] additionally layers the shared retry
/// policy shape on top of any implementation.
pub trait ObjectStoreClient {
    fn create_file(&self, folder_id: Option<&str>, name: &str, content: &str) -> DbResult<String>;
    fn read_file(&self, file_id: &str) -> DbResult<String>;
    fn update_file(&self, file_id: &str, content: &str) -> DbResult<()>;
    fn delete_file(&self, file_id: &str) -> DbResult<()>;
    fn file_exists(&self, file_id: &str) -> DbResult<bool>;
}

#[derive(Debug, Clone)]
struct StoredFile {
    #[allow(dead_code)]
    name: String,
    content: String,
}

/// A process-local stand-in for the real object store, used by this
/// workspace's tests and available to embedders without a real backend.
#[derive(Debug, Default, Clone)]
pub struct InMemoryObjectStore {
    files: Rc<RefCell<HashMap<String, StoredFile>>>,
    next_id: Rc<Cell<u64>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        InMemoryObjectStore::default()
    }

    fn fresh_id(&self) -> String {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        format!("file-{id:08}")
    }
}

impl ObjectStoreClient for InMemoryObjectStore {
    fn create_file(&self, _folder_id: Option<&str>, name: &str, content: &str) -> DbResult<String> {
        let id = self.fresh_id();
        self.files.borrow_mut().insert(
            id.clone(),
            StoredFile {
                name: name.to_owned(),
                content: content.to_owned(),
            },
        );
        Ok(id)
    }

    fn read_file(&self, file_id: &str) -> DbResult<String> {
        self.files
            .borrow()
            .get(file_id)
            .map(|f| f.content.clone())
            .ok_or_else(|| DbError::file_not_found(file_id))
    }

    fn update_file(&self, file_id: &str, content: &str) -> DbResult<()> {
        let mut files = self.files.borrow_mut();
        match files.get_mut(file_id) {
            Some(f) => {
                f.content = content.to_owned();
                Ok(())
            }
            None => Err(DbError::file_not_found(file_id)),
        }
    }

    fn delete_file(&self, file_id: &str) -> DbResult<()> {
        match self.files.borrow_mut().remove(file_id) {
            Some(_) => Ok(()),
            None => Err(DbError::file_not_found(file_id)),
        }
    }

    fn file_exists(&self, file_id: &str) -> DbResult<bool> {
        Ok(self.files.borrow().contains_key(file_id))
    }
}
