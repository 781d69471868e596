//! Wraps any [`ObjectStoreClient`] with the shared retry/backoff policy
//! shape, retrying only the transient members of the object-store error
//! taxonomy.

use blobdb_common::{DbResult, RetryPolicy};

use crate::object_store::ObjectStoreClient;

#[derive(Clone)]
pub struct RetryingObjectStore<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C: ObjectStoreClient> RetryingObjectStore<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        RetryingObjectStore { inner, policy }
    }
}

impl<C: ObjectStoreClient> ObjectStoreClient for RetryingObjectStore<C> {
    fn create_file(&self, folder_id: Option<&str>, name: &str, content: &str) -> DbResult<String> {
        self.policy
            .run(|| self.inner.create_file(folder_id, name, content), |e| e.is_transient_store_error())
    }

    fn read_file(&self, file_id: &str) -> DbResult<String> {
        self.policy
            .run(|| self.inner.read_file(file_id), |e| e.is_transient_store_error())
    }

    fn update_file(&self, file_id: &str, content: &str) -> DbResult<()> {
        self.policy
            .run(|| self.inner.update_file(file_id, content), |e| e.is_transient_store_error())
    }

    fn delete_file(&self, file_id: &str) -> DbResult<()> {
        self.policy
            .run(|| self.inner.delete_file(file_id), |e| e.is_transient_store_error())
    }

    fn file_exists(&self, file_id: &str) -> DbResult<bool> {
        self.policy
            .run(|| self.inner.file_exists(file_id), |e| e.is_transient_store_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::InMemoryObjectStore;

    #[test]
    fn passes_through_to_inner_store() {
        let store = RetryingObjectStore::new(InMemoryObjectStore::new(), RetryPolicy::new(3, 1, 1.0));
        let id = store.create_file(None, "f.json", "{}").unwrap();
        assert_eq!(store.read_file(&id).unwrap(), "{}");
    }
}
