//! Property-bag client interface plus an in-memory reference
//! implementation. The real backend's contract is atomic replacement of a
//! single key's value per call; the MasterIndex (in the `blobdb` crate)
//! relies on that guarantee but never on compare-and-set.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use blobdb_common::DbResult;

pub trait PropertyBagClient {
    fn get_property(&self, key: &str) -> DbResult<Option<String>>;
    fn set_property(&self, key: &str, value: &str) -> DbResult<()>;
    fn delete_property(&self, key: &str) -> DbResult<()>;
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryPropertyBag {
    properties: Rc<RefCell<HashMap<String, String>>>,
}

impl InMemoryPropertyBag {
    pub fn new() -> Self {
        InMemoryPropertyBag::default()
    }
}

impl PropertyBagClient for InMemoryPropertyBag {
    fn get_property(&self, key: &str) -> DbResult<Option<String>> {
        Ok(self.properties.borrow().get(key).cloned())
    }

    fn set_property(&self, key: &str, value: &str) -> DbResult<()> {
        self.properties
            .borrow_mut()
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn delete_property(&self, key: &str) -> DbResult<()> {
        self.properties.borrow_mut().remove(key);
        Ok(())
    }
}
