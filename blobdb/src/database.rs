//! The composition root: owns the collection directory, the MasterIndex,
//! and the shared object-store handle, and exposes collection lifecycle
//! operations plus the index-file recovery path.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use blobdb_common::{DbError, DbResult};
use blobdb_query::QueryEngineConfig;
use blobdb_store::{ObjectStoreClient, PropertyBagClient};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collection::Collection;
use crate::coordinator;
use crate::ids;
use crate::master_index::{CollectionMetadata, MasterIndex};
use crate::settings::Settings;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexCollectionEntry {
    pub file_id: String,
    pub last_updated: DateTime<Utc>,
    pub document_count: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexBlob {
    pub version: u32,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub collections: BTreeMap<String, IndexCollectionEntry>,
}

impl IndexBlob {
    fn empty() -> Self {
        IndexBlob {
            version: 1,
            last_updated: Utc::now(),
            collections: BTreeMap::new(),
        }
    }
}

pub struct Database<S, P> {
    settings: Settings,
    object_store: S,
    master_index: MasterIndex<P>,
    collections: RefCell<BTreeMap<String, Rc<Collection<S>>>>,
    index_file_id: RefCell<Option<String>>,
}

impl<S: ObjectStoreClient + Clone, P: PropertyBagClient> Database<S, P> {
    pub fn new(settings: Settings, object_store: S, property_bag: P) -> Self {
        let master_index = MasterIndex::new(property_bag, settings.master_index_key.clone(), settings.lock_timeout());
        Database {
            settings,
            object_store,
            master_index,
            collections: RefCell::new(BTreeMap::new()),
            index_file_id: RefCell::new(None),
        }
    }

    /// Creates the MasterIndex record and the index blob if they don't
    /// already exist. Safe to call more than once. When
    /// `backup_on_initialise` is set, also writes a fresh backup copy of
    /// the index blob once it exists.
    pub fn initialise(&self) -> DbResult<()> {
        self.master_index.initialise()?;
        if self.index_file_id.borrow().is_none() {
            let blob = IndexBlob::empty();
            let content = serde_json::to_string(&blob).expect("IndexBlob always serialises");
            let file_id = self.object_store.create_file(self.settings.root_folder_id.as_deref(), "index.json", &content)?;
            *self.index_file_id.borrow_mut() = Some(file_id);
        }
        if self.settings.backup_on_initialise {
            self.backup_index_to_drive()?;
        }
        Ok(())
    }

    fn query_engine_config(&self) -> QueryEngineConfig {
        QueryEngineConfig {
            max_nested_depth: self.settings.query_engine_max_nested_depth,
            supported_operators: self.settings.query_engine_supported_operators.clone(),
            logical_operators: self.settings.query_engine_logical_operators.clone(),
        }
    }

    fn validate_collection_name(&self, name: &str) -> DbResult<String> {
        if name.is_empty() {
            return Err(DbError::invalid_argument("collection name must be non-empty"));
        }
        let is_disallowed = |c: char| c == '/' || c == '\\' || c.is_control();
        if !name.chars().any(is_disallowed) {
            return Ok(name.to_owned());
        }
        if !self.settings.strip_disallowed_collection_name_characters {
            return Err(DbError::invalid_argument(format!(
                "collection name '{name}' contains disallowed characters"
            )));
        }
        let stripped: String = name.chars().filter(|c| !is_disallowed(*c)).collect();
        if stripped.is_empty() {
            return Err(DbError::invalid_argument(
                "collection name has no valid characters once disallowed characters are stripped",
            ));
        }
        Ok(stripped)
    }

    pub fn create_collection(&self, name: &str) -> DbResult<Rc<Collection<S>>> {
        let name = self.validate_collection_name(name)?;
        if self.collections.borrow().contains_key(&name) || self.master_index.get_collection(&name)?.is_some() {
            return Err(DbError::invalid_argument(format!("collection already exists: {name}")));
        }
        let file_id = self.object_store.create_file(self.settings.root_folder_id.as_deref(), &format!("{name}.json"), "{}")?;
        let collection = Rc::new(Collection::new_empty(
            name.clone(),
            file_id.clone(),
            self.object_store.clone(),
            self.query_engine_config(),
        ));
        collection.save()?;
        let mut metadata = CollectionMetadata::new(name.clone(), file_id);
        metadata.modification_token = collection.metadata().modification_token;
        self.master_index.add_collection(&name, metadata)?;
        if self.settings.cache_enabled {
            self.collections.borrow_mut().insert(name.clone(), collection.clone());
        }
        self.sync_index_blob()?;
        Ok(collection)
    }

    pub fn get_collection(&self, name: &str) -> DbResult<Rc<Collection<S>>> {
        let name = self.validate_collection_name(name)?;
        if self.settings.cache_enabled {
            if let Some(existing) = self.collections.borrow().get(&name) {
                return Ok(existing.clone());
            }
        }
        match self.master_index.get_collection(&name)? {
            Some(metadata) => {
                let collection = Rc::new(Collection::attach(
                    name.clone(),
                    metadata.file_id,
                    self.object_store.clone(),
                    self.query_engine_config(),
                ));
                if self.settings.cache_enabled {
                    self.collections.borrow_mut().insert(name, collection.clone());
                }
                Ok(collection)
            }
            None if self.settings.auto_create_collections => self.create_collection(&name),
            None => Err(DbError::collection_not_found(name)),
        }
    }

    pub fn drop_collection(&self, name: &str) -> DbResult<bool> {
        let name = self.validate_collection_name(name)?;
        let metadata = self.master_index.get_collection(&name)?;
        let removed = self.master_index.remove_collection(&name)?;
        if let Some(metadata) = metadata {
            self.object_store.delete_file(&metadata.file_id)?;
        }
        self.collections.borrow_mut().remove(&name);
        if removed {
            self.sync_index_blob()?;
        }
        Ok(removed)
    }

    pub fn list_collections(&self) -> DbResult<Vec<String>> {
        Ok(self.master_index.get_collections()?.into_keys().collect())
    }

    pub fn load_index(&self) -> DbResult<IndexBlob> {
        let file_id = self
            .index_file_id
            .borrow()
            .clone()
            .ok_or_else(|| DbError::operation_error("database has not been initialised"))?;
        let raw = self.object_store.read_file(&file_id)?;
        serde_json::from_str(&raw).map_err(|e| DbError::invalid_file_format(format!("malformed index blob: {e}")))
    }

    fn sync_index_blob(&self) -> DbResult<()> {
        let file_id = match self.index_file_id.borrow().clone() {
            Some(id) => id,
            None => return Ok(()),
        };
        let collections = self.master_index.get_collections()?;
        let entries = collections
            .into_iter()
            .map(|(name, metadata)| {
                (
                    name,
                    IndexCollectionEntry {
                        file_id: metadata.file_id,
                        last_updated: metadata.last_updated,
                        document_count: metadata.document_count,
                    },
                )
            })
            .collect();
        let blob = IndexBlob {
            version: 1,
            last_updated: Utc::now(),
            collections: entries,
        };
        let content = serde_json::to_string(&blob).expect("IndexBlob always serialises");
        self.object_store.update_file(&file_id, &content)
    }

    /// Writes a copy of the current index blob under a fresh file id,
    /// returning that id so it can later be passed to `recover_database`.
    pub fn backup_index_to_drive(&self) -> DbResult<String> {
        let index = self.load_index()?;
        let content = serde_json::to_string(&index).expect("IndexBlob always serialises");
        self.object_store.create_file(self.settings.root_folder_id.as_deref(), "index-backup.json", &content)
    }

    /// Rewrites the MasterIndex record's collection directory to match a
    /// backup index blob. Drops any cached Collection handles so the next
    /// `get_collection` re-attaches against the recovered file ids.
    pub fn recover_database(&self, backup_id: &str) -> DbResult<()> {
        let raw = self.object_store.read_file(backup_id)?;
        let value: serde_json::Value =
            serde_json::from_str(&raw).map_err(|e| DbError::invalid_file_format(format!("malformed backup: {e}")))?;
        if value.get("collections").and_then(|v| v.as_object()).is_none() {
            return Err(DbError::invalid_file_format("backup is missing a 'collections' map"));
        }
        let backup: IndexBlob =
            serde_json::from_value(value).map_err(|e| DbError::invalid_file_format(format!("malformed backup: {e}")))?;

        let mut record = self.master_index.initialise()?;
        record.collections.clear();
        for (name, entry) in &backup.collections {
            record.collections.insert(
                name.clone(),
                CollectionMetadata {
                    name: name.clone(),
                    file_id: entry.file_id.clone(),
                    created: entry.last_updated,
                    last_updated: entry.last_updated,
                    document_count: entry.document_count,
                    modification_token: ids::new_id(),
                    lock_status: Default::default(),
                },
            );
        }
        record.last_updated = Utc::now();
        self.master_index.save(&record)?;
        self.collections.borrow_mut().clear();
        *self.index_file_id.borrow_mut() = Some(backup_id.to_owned());
        Ok(())
    }

    /// Runs `mutate` against `collection` under the full lock/token/reload
    /// protocol described for the CollectionCoordinator.
    pub fn coordinated<T>(
        &self,
        collection: &Collection<S>,
        operation_label: &str,
        mutate: impl FnOnce(&Collection<S>) -> DbResult<T>,
    ) -> DbResult<T> {
        coordinator::run_mutation(collection, &self.master_index, &self.settings, operation_label, mutate)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobdb_common::{DocValue, Document};
    use blobdb_store::{InMemoryObjectStore, InMemoryPropertyBag};
    use std::collections::BTreeMap as Map;

    fn doc(fields: &[(&str, DocValue)]) -> Document {
        fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn new_database() -> Database<InMemoryObjectStore, InMemoryPropertyBag> {
        let db = Database::new(Settings::default(), InMemoryObjectStore::new(), InMemoryPropertyBag::new());
        db.initialise().unwrap();
        db
    }

    #[test]
    fn create_then_list_then_drop() {
        let db = new_database();
        db.create_collection("widgets").unwrap();
        assert_eq!(db.list_collections().unwrap(), vec!["widgets".to_string()]);
        assert!(db.drop_collection("widgets").unwrap());
        assert!(db.list_collections().unwrap().is_empty());
    }

    #[test]
    fn get_collection_auto_creates_when_enabled() {
        let db = new_database();
        let collection = db.get_collection("widgets").unwrap();
        assert_eq!(collection.name(), "widgets");
        assert_eq!(db.list_collections().unwrap(), vec!["widgets".to_string()]);
    }

    #[test]
    fn backup_on_initialise_writes_a_backup_blob() {
        let mut settings = Settings::default();
        settings.backup_on_initialise = true;
        let store = InMemoryObjectStore::new();
        let db = Database::new(settings, store.clone(), InMemoryPropertyBag::new());
        db.initialise().unwrap();
        let index = db.load_index().unwrap();
        // index.json plus at least one index-backup.json.
        assert!(store.file_exists(&db.index_file_id.borrow().clone().unwrap()).unwrap());
        assert_eq!(index.collections.len(), 0);
    }

    #[test]
    fn get_collection_returns_the_same_handle_when_cached() {
        let db = new_database();
        db.create_collection("widgets").unwrap();
        let a = db.get_collection("widgets").unwrap();
        let b = db.get_collection("widgets").unwrap();
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn get_collection_attaches_fresh_handles_when_cache_disabled() {
        let mut settings = Settings::default();
        settings.cache_enabled = false;
        let db = Database::new(settings, InMemoryObjectStore::new(), InMemoryPropertyBag::new());
        db.initialise().unwrap();
        db.create_collection("widgets").unwrap();
        let a = db.get_collection("widgets").unwrap();
        let b = db.get_collection("widgets").unwrap();
        assert!(!Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn get_collection_errors_when_auto_create_disabled() {
        let mut settings = Settings::default();
        settings.auto_create_collections = false;
        let db = Database::new(settings, InMemoryObjectStore::new(), InMemoryPropertyBag::new());
        db.initialise().unwrap();
        let err = db.get_collection("widgets").unwrap_err();
        assert!(err.is_collection_not_found());
    }

    #[test]
    fn rejects_collection_names_with_path_separators() {
        let db = new_database();
        let err = db.create_collection("a/b").unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn coordinated_mutation_round_trips_through_the_database() {
        let db = new_database();
        let collection = db.create_collection("widgets").unwrap();
        db.coordinated(&collection, "insertOne", |c| {
            c.insert_one(doc(&[("_id", DocValue::from("a")), ("n", DocValue::Number(1.0))]))
        })
        .unwrap();
        assert_eq!(collection.count_documents(&DocValue::Object(Map::new())).unwrap(), 1);
    }

    #[test]
    fn backup_and_recover_round_trip() {
        let db = new_database();
        db.create_collection("widgets").unwrap();
        let backup_id = db.backup_index_to_drive().unwrap();
        db.drop_collection("widgets").unwrap();
        assert!(db.list_collections().unwrap().is_empty());
        db.recover_database(&backup_id).unwrap();
        assert_eq!(db.list_collections().unwrap(), vec!["widgets".to_string()]);
    }

    #[test]
    fn recover_rejects_malformed_backup() {
        let db = new_database();
        let file_id = db
            .object_store
            .create_file(None, "bad.json", "{\"nope\": true}")
            .unwrap();
        let err = db.recover_database(&file_id).unwrap_err();
        assert!(matches!(err.kind(), blobdb_common::ErrorKind::InvalidFileFormat(_)));
    }
}
