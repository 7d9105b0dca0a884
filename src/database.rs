//! Database handle.

use std::sync::Arc;

use bson::Document;

use crate::collection::Collection;
use crate::error::Result;
use crate::session::ServerVersion;
use crate::store::{DocumentStore, Ns};

/// A value representing one named database on the store.
#[derive(Clone)]
pub struct Database {
    store: Arc<dyn DocumentStore>,
    name: String,
    version: Option<ServerVersion>,
    max_batch_size: usize,
}

impl Database {
    pub(crate) fn new(
        store: Arc<dyn DocumentStore>,
        name: &str,
        version: Option<ServerVersion>,
        max_batch_size: usize,
    ) -> Self {
        Database {
            store,
            name: name.to_string(),
            version,
            max_batch_size,
        }
    }

    /// Returns a handle on the named collection.
    pub fn c(&self, collection: &str) -> Collection {
        Collection::new(self.clone(), Ns::new(self.name.clone(), collection))
    }

    /// Runs a database command and returns the raw reply.
    pub fn run(&self, cmd: Document) -> Result<Document> {
        Ok(self.store.run_command(&self.name, &cmd)?)
    }

    /// Names of the collections in this database.
    pub fn collection_names(&self) -> Result<Vec<String>> {
        Ok(self.store.list_collection_names(&self.name)?)
    }

    /// Removes the entire database and all of its contents.
    pub fn drop_database(&self) -> Result<()> {
        Ok(self.store.drop_database(&self.name)?)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Server version cached at connect time, if known.
    pub fn version(&self) -> Option<ServerVersion> {
        self.version
    }

    pub(crate) fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub(crate) fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}
