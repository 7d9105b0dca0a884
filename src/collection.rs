//! Collection surface.
//!
//! Single-document updates resolve transparently between whole-document
//! replacement and operator-based update: the replace attempt runs first,
//! and the one store rejection that identifies operator keys in the
//! replacement document triggers the operator-update path with the same
//! selector and upsert flag. Any other error is terminal.

use std::sync::Arc;

use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use tracing::debug;

use crate::bulk::Bulk;
use crate::database::Database;
use crate::error::{Error, Result};
use crate::index::{index_from_raw, Index};
use crate::pipe::Pipe;
use crate::query::{ChangeInfo, Collation, Query};
use crate::store::{CreateCollectionOptions, DocumentStore, Ns, StoreError, WriteOutcome};

/// Options for explicit collection creation.
#[derive(Debug, Clone, Default)]
pub struct CollectionInfo {
    /// New documents replace old ones when the collection is full.
    /// `max_bytes` must also be set to define the wrap-around size;
    /// `max_docs` optionally bounds the document count.
    pub capped: bool,
    pub max_bytes: i64,
    pub max_docs: i64,
    /// Validation expression documents must satisfy.
    pub validator: Option<Document>,
    /// "strict" (default), "moderate", or "off".
    pub validation_level: Option<String>,
    /// "error" (default) or "warn".
    pub validation_action: Option<String>,
    /// Storage engine options, keyed by engine name.
    pub storage_engine: Option<Document>,
    pub collation: Option<Collation>,
}

/// A handle on one collection of the store.
#[derive(Clone)]
pub struct Collection {
    db: Database,
    ns: Ns,
}

impl Collection {
    pub(crate) fn new(db: Database, ns: Ns) -> Self {
        Collection { db, ns }
    }

    pub fn name(&self) -> &str {
        &self.ns.coll
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }

    pub(crate) fn ns(&self) -> &Ns {
        &self.ns
    }

    pub(crate) fn store(&self) -> &Arc<dyn DocumentStore> {
        self.db.store()
    }

    /// Starts a query with the given filter; `None` matches everything.
    pub fn find(&self, filter: impl Into<Option<Document>>) -> Query {
        Query::new(self.clone(), filter.into())
    }

    /// Starts a query matching the document with the given `_id`. A string
    /// id that parses as an ObjectId hex is converted.
    pub fn find_id(&self, id: impl Into<Bson>) -> Query {
        self.find(doc! {"_id": query_id(id.into())})
    }

    /// Inserts the provided documents.
    pub fn insert(&self, documents: &[Document]) -> Result<()> {
        self.insert_with_result(documents).map(|_| ())
    }

    /// Inserts the provided documents and returns their ids, generated
    /// where absent.
    pub fn insert_with_result(&self, documents: &[Document]) -> Result<Vec<Bson>> {
        Ok(self.store().insert_many(&self.ns, documents)?)
    }

    /// Updates a single matching document; `NotFound` when the selector
    /// matches nothing.
    pub fn update(&self, selector: impl Into<Option<Document>>, update: Document) -> Result<()> {
        self.update_one_with_result(selector.into(), update, false)
            .map(|_| ())
    }

    /// Updates the document with the given `_id`.
    pub fn update_id(&self, id: impl Into<Bson>, update: Document) -> Result<()> {
        self.update(doc! {"_id": query_id(id.into())}, update)
    }

    /// Updates all matching documents with operator semantics. Zero
    /// matches is a valid outcome reported through the counters, never
    /// `NotFound`.
    pub fn update_all(
        &self,
        selector: impl Into<Option<Document>>,
        update: Document,
    ) -> Result<ChangeInfo> {
        let selector = selector.into().unwrap_or_default();
        let outcome = self
            .store()
            .update(&self.ns, &selector, &update, false, true)?;
        Ok(change_info_from(outcome))
    }

    /// Updates a single matching document, inserting one when the selector
    /// matches nothing.
    pub fn upsert(
        &self,
        selector: impl Into<Option<Document>>,
        update: Document,
    ) -> Result<ChangeInfo> {
        let outcome = self.update_one_with_result(selector.into(), update, true)?;
        Ok(change_info_from(outcome))
    }

    /// Upserts the document with the given `_id`.
    pub fn upsert_id(&self, id: impl Into<Bson>, update: Document) -> Result<ChangeInfo> {
        self.upsert(doc! {"_id": query_id(id.into())}, update)
    }

    /// Replace-or-update resolution: attempt a whole-document replacement,
    /// fall back to an operator update when (and only when) the store
    /// reports operator keys in the replacement. Zero documents affected
    /// without an upsert surfaces as `NotFound`.
    fn update_one_with_result(
        &self,
        selector: Option<Document>,
        update: Document,
        upsert: bool,
    ) -> Result<WriteOutcome> {
        let selector = selector.unwrap_or_default();
        let outcome = match self.store().replace_one(&self.ns, &selector, &update, upsert) {
            Ok(outcome) => outcome,
            Err(StoreError::OperatorKeysInReplacement) => {
                debug!(ns = %self.ns, "replace rejected operator keys, retrying as update");
                self.store().update(&self.ns, &selector, &update, upsert, false)?
            }
            Err(e) => return Err(e.into()),
        };
        if outcome.upserted_id.is_none() && outcome.matched == 0 {
            return Err(Error::NotFound);
        }
        Ok(outcome)
    }

    /// Removes a single matching document. Removing nothing is not an
    /// error.
    pub fn remove(&self, selector: impl Into<Option<Document>>) -> Result<()> {
        let selector = selector.into().unwrap_or_default();
        self.store().delete(&self.ns, &selector, false)?;
        Ok(())
    }

    /// Removes the document with the given `_id`.
    pub fn remove_id(&self, id: impl Into<Bson>) -> Result<()> {
        self.remove(doc! {"_id": query_id(id.into())})
    }

    /// Removes all matching documents, reporting how many went away.
    pub fn remove_all(&self, selector: impl Into<Option<Document>>) -> Result<ChangeInfo> {
        let selector = selector.into().unwrap_or_default();
        let outcome = self.store().delete(&self.ns, &selector, true)?;
        Ok(ChangeInfo {
            removed: outcome.deleted,
            ..ChangeInfo::default()
        })
    }

    /// Number of documents in the collection.
    pub fn count(&self) -> Result<i64> {
        self.count_by(None)
    }

    /// Number of documents matching the selector.
    pub fn count_by(&self, selector: impl Into<Option<Document>>) -> Result<i64> {
        let selector = selector.into().unwrap_or_default();
        Ok(self
            .store()
            .count_documents(&self.ns, &selector, &Default::default())?)
    }

    /// Starts an aggregation pipeline on this collection.
    pub fn pipe(&self, pipeline: Vec<Document>) -> Pipe {
        Pipe::new(self.clone(), pipeline)
    }

    /// Starts an empty bulk session, ordered by default.
    pub fn bulk(&self) -> Bulk {
        Bulk::new(self.clone())
    }

    /// Ensures an index described by `index` exists, creating it when
    /// needed. The index name, once derived or assigned, identifies the
    /// index for drop operations.
    pub fn ensure_index(&self, index: Index) -> Result<()> {
        let (keys, options) = index.to_create_request()?;
        self.store().create_index(&self.ns, &keys, &options)?;
        Ok(())
    }

    /// Ensures an index exists over the given key tokens with default
    /// options.
    pub fn ensure_index_key<S: AsRef<str>>(&self, key: &[S]) -> Result<()> {
        self.ensure_index(Index {
            key: key.iter().map(|s| s.as_ref().to_string()).collect(),
            ..Index::default()
        })
    }

    /// Drops the index matching the given key tokens, comparing key sets
    /// regardless of token order.
    pub fn drop_index<S: AsRef<str>>(&self, key: &[S]) -> Result<()> {
        let mut wanted: Vec<String> = key.iter().map(|s| s.as_ref().to_string()).collect();
        wanted.sort();
        let wanted = wanted.join("_");

        let mut name = None;
        for index in self.indexes()? {
            let mut tokens = index.key.clone();
            tokens.sort();
            if tokens.join("_") == wanted {
                name = index.name;
                break;
            }
        }
        match name {
            Some(name) => self.drop_index_name(&name),
            None => Err(Error::IndexNotFound),
        }
    }

    /// Drops the index with the given stored name.
    pub fn drop_index_name(&self, name: &str) -> Result<()> {
        Ok(self.store().drop_index(&self.ns, name)?)
    }

    /// Drops every user-created index on the collection.
    pub fn drop_all_indexes(&self) -> Result<()> {
        Ok(self.store().drop_all_indexes(&self.ns)?)
    }

    /// Lists the collection's indexes in the legacy token vocabulary,
    /// sorted by name.
    pub fn indexes(&self) -> Result<Vec<Index>> {
        let mut indexes = Vec::new();
        for raw in self.store().list_indexes(&self.ns)? {
            indexes.push(index_from_raw(raw)?);
        }
        indexes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(indexes)
    }

    /// Explicitly creates the collection with the given options.
    pub fn create(&self, info: &CollectionInfo) -> Result<()> {
        let mut options = CreateCollectionOptions {
            validator: info.validator.clone(),
            validation_level: info.validation_level.clone(),
            validation_action: info.validation_action.clone(),
            storage_engine: info.storage_engine.clone(),
            ..CreateCollectionOptions::default()
        };
        if info.capped {
            if info.max_bytes < 1 {
                return Err(Error::Usage(
                    "Collection.create: with capped, max_bytes must also be set",
                ));
            }
            options.capped = true;
            options.max_bytes = info.max_bytes;
            if info.max_docs > 0 {
                options.max_docs = info.max_docs;
            }
        }
        if let Some(collation) = &info.collation {
            options.collation = Some(bson::to_document(collation)?);
        }
        Ok(self.store().create_collection(&self.ns, &options)?)
    }

    /// Removes the collection and all of its documents and indexes.
    pub fn drop_collection(&self) -> Result<()> {
        Ok(self.store().drop_collection(&self.ns)?)
    }
}

/// Routes string ids that parse as ObjectId hex through `ObjectId`; any
/// other value is used as-is.
fn query_id(id: Bson) -> Bson {
    if let Bson::String(s) = &id {
        if let Ok(oid) = ObjectId::parse_str(s) {
            return Bson::ObjectId(oid);
        }
    }
    id
}

fn change_info_from(outcome: WriteOutcome) -> ChangeInfo {
    ChangeInfo {
        updated: outcome.modified,
        removed: 0,
        matched: outcome.matched,
        upserted_id: outcome.upserted_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_object_ids_are_converted() {
        let hex = "507f1f77bcf86cd799439011";
        match query_id(Bson::String(hex.to_string())) {
            Bson::ObjectId(oid) => assert_eq!(oid.to_hex(), hex),
            other => panic!("expected ObjectId, got {:?}", other),
        }
        assert_eq!(
            query_id(Bson::String("plain".to_string())),
            Bson::String("plain".to_string())
        );
        assert_eq!(query_id(Bson::Int32(7)), Bson::Int32(7));
    }
}
