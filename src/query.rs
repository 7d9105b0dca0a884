//! Query builder and terminal operations.
//!
//! A [`Query`] accumulates filter, projection, sort, pagination, hint, and
//! cross-cutting settings as pure in-memory state; terminal calls compile
//! the accumulated state into the option shape each store operation takes
//! and perform the I/O. Chain calls consume and return the builder by
//! value, so a query cannot be accidentally shared mid-chain.

use std::marker::PhantomData;
use std::time::Duration;

use bson::{doc, Bson, Document};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::collection::Collection;
use crate::error::{Error, Result};
use crate::index::parse_index_key;
use crate::sort::parse_sort_fields;
use crate::store::{FindAndModify, FindOptions, StoreError};

/// Language-specific string comparison rules, forwarded verbatim to the
/// store for queries and index creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Collation {
    pub locale: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_level: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_first: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strength: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numeric_ordering: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_variable: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backwards: Option<bool>,
}

/// Accumulated per-operation state.
#[derive(Debug, Clone, Default)]
pub(crate) struct Op {
    pub filter: Option<Document>,
    pub selector: Option<Document>,
    pub sort: Option<Document>,
    pub limit: i64,
    pub skip: i64,
    pub comment: Option<String>,
    pub hint: Option<Document>,
}

impl Op {
    /// A `nil` filter means "match everything" and is normalized to the
    /// empty document, never sent as a literal null.
    pub fn filter_or_empty(&self) -> Document {
        self.filter.clone().unwrap_or_default()
    }
}

/// A one-shot descriptor for an atomic find-and-modify operation.
#[derive(Debug, Clone, Default)]
pub struct Change {
    /// The update document. Required unless `remove` is set.
    pub update: Option<Document>,
    /// Insert in case the document isn't found.
    pub upsert: bool,
    /// Remove the matched document rather than updating it. Takes
    /// precedence over `update`.
    pub remove: bool,
    /// Return the modified document rather than the old one.
    pub return_new: bool,
}

/// Counters reported by update, upsert, remove, and apply calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeInfo {
    /// Number of existing documents modified.
    pub updated: i64,
    /// Number of documents removed.
    pub removed: i64,
    /// Number of documents matched but not necessarily changed.
    pub matched: i64,
    /// Upserted `_id`, when the store generated one.
    pub upserted_id: Option<Bson>,
}

/// A chained query builder bound to one collection.
pub struct Query {
    coll: Collection,
    pub(crate) op: Op,
    collation: Option<Collation>,
    max_time: Option<Duration>,
    allow_disk: bool,
    /// A hint key that failed to compile parks here and surfaces from
    /// every terminal call.
    bad_hint: Option<String>,
}

impl Query {
    pub(crate) fn new(coll: Collection, filter: Option<Document>) -> Self {
        Query {
            coll,
            op: Op {
                filter,
                ..Op::default()
            },
            collation: None,
            max_time: None,
            allow_disk: false,
            bad_hint: None,
        }
    }

    /// Orders the results by the given sort tokens; a later call replaces
    /// the whole sort specification.
    ///
    /// # Panics
    ///
    /// Panics if a field name is empty after stripping markers.
    pub fn sort<S: AsRef<str>>(mut self, fields: &[S]) -> Self {
        self.op.sort = Some(parse_sort_fields(fields));
        self
    }

    /// Restricts the fields returned by the query.
    pub fn select(mut self, selector: Document) -> Self {
        self.op.selector = Some(selector);
        self
    }

    /// Skips over `n` initial documents. Zero or negative means unset.
    pub fn skip(mut self, n: i64) -> Self {
        self.op.skip = n;
        self
    }

    /// Caps the number of documents returned. Zero or negative means unset.
    pub fn limit(mut self, n: i64) -> Self {
        self.op.limit = n;
        self
    }

    pub fn batch(self, n: i64) -> Self {
        self.limit(n)
    }

    /// Asks the store to use the index identified by the given key tokens.
    /// A malformed key parks the error and surfaces it from the next
    /// terminal call.
    pub fn hint<S: AsRef<str>>(mut self, index_key: &[S]) -> Self {
        match parse_index_key(index_key) {
            Ok(info) => self.op.hint = Some(info.key),
            Err(Error::InvalidIndexKey { raw }) => self.bad_hint = Some(raw),
            Err(_) => self.bad_hint = Some(String::new()),
        }
        self
    }

    /// Attaches a free-text comment to the operation for profiling.
    pub fn comment(mut self, comment: &str) -> Self {
        self.op.comment = Some(comment.to_string());
        self
    }

    pub fn collation(mut self, collation: Collation) -> Self {
        self.collation = Some(collation);
        self
    }

    /// Caps the server-side execution time of the terminal operation.
    pub fn set_max_time(mut self, d: Duration) -> Self {
        self.max_time = Some(d);
        self
    }

    /// Lets the server spill query stages to disk. Honored only when the
    /// connected server version is within the supported range (>= 3.2,
    /// <= 4.4); a silent no-op otherwise.
    pub fn allow_disk_use(mut self) -> Self {
        if self
            .coll
            .db()
            .version()
            .is_some_and(|v| v.supports_allow_disk_use())
        {
            self.allow_disk = true;
        }
        self
    }

    fn check(&self) -> Result<()> {
        if let Some(raw) = &self.bad_hint {
            return Err(Error::InvalidIndexKey { raw: raw.clone() });
        }
        Ok(())
    }

    fn collation_doc(&self) -> Option<Document> {
        self.collation
            .as_ref()
            .and_then(|c| bson::to_document(c).ok())
    }

    fn to_find_options(&self) -> FindOptions {
        let mut opts = self.to_find_one_options();
        if self.op.limit > 0 {
            opts.limit = Some(self.op.limit);
        }
        opts.allow_disk_use = self.allow_disk;
        opts
    }

    fn to_find_one_options(&self) -> FindOptions {
        let mut opts = FindOptions {
            collation: self.collation_doc(),
            max_time: self.max_time,
            ..FindOptions::default()
        };
        if self.op.skip > 0 {
            opts.skip = Some(self.op.skip);
        }
        opts.hint = self.op.hint.clone();
        opts.comment = self.op.comment.clone();
        opts.projection = self.op.selector.clone();
        opts.sort = self.op.sort.clone();
        opts
    }

    fn to_count_options(&self) -> FindOptions {
        let mut opts = FindOptions {
            collation: self.collation_doc(),
            max_time: self.max_time,
            ..FindOptions::default()
        };
        if self.op.skip > 0 {
            opts.skip = Some(self.op.skip);
        }
        if self.op.limit > 0 {
            opts.limit = Some(self.op.limit);
        }
        opts.hint = self.op.hint.clone();
        opts
    }

    fn to_distinct_options(&self) -> FindOptions {
        FindOptions {
            collation: self.collation_doc(),
            max_time: self.max_time,
            ..FindOptions::default()
        }
    }

    fn to_find_and_modify_options(&self) -> FindOptions {
        FindOptions {
            collation: self.collation_doc(),
            max_time: self.max_time,
            hint: self.op.hint.clone(),
            projection: self.op.selector.clone(),
            sort: self.op.sort.clone(),
            ..FindOptions::default()
        }
    }

    /// Fetches and decodes a single matching document; `NotFound` when the
    /// filter matches nothing.
    pub fn one<T: DeserializeOwned>(&self) -> Result<T> {
        self.check()?;
        let doc = self
            .coll
            .store()
            .find_one(
                self.coll.ns(),
                &self.op.filter_or_empty(),
                &self.to_find_one_options(),
            )?
            .ok_or(Error::NotFound)?;
        Ok(bson::from_document(doc)?)
    }

    /// Reports whether the filter matches at least one document. The
    /// decoding-free form of the legacy "One with a nil sink" call.
    pub fn exists(&self) -> Result<bool> {
        self.check()?;
        let found = self.coll.store().find_one(
            self.coll.ns(),
            &self.op.filter_or_empty(),
            &self.to_find_one_options(),
        )?;
        Ok(found.is_some())
    }

    /// Fetches and decodes every matching document. The result is grown as
    /// documents arrive, not pre-sized from the limit.
    pub fn all<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        self.check()?;
        let docs = self.coll.store().find(
            self.coll.ns(),
            &self.op.filter_or_empty(),
            &self.to_find_options(),
        )?;
        let mut result = Vec::new();
        for doc in docs {
            result.push(bson::from_document(doc)?);
        }
        Ok(result)
    }

    /// Counts the documents matching the accumulated filter, honoring
    /// skip, limit, and hint.
    pub fn count(&self) -> Result<i64> {
        self.check()?;
        Ok(self.coll.store().count_documents(
            self.coll.ns(),
            &self.op.filter_or_empty(),
            &self.to_count_options(),
        )?)
    }

    /// Returns the distinct values of `key` among matching documents. The
    /// element type governs conversion.
    pub fn distinct<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>> {
        self.check()?;
        let values = self.coll.store().distinct(
            self.coll.ns(),
            key,
            &self.op.filter_or_empty(),
            &self.to_distinct_options(),
        )?;
        let mut result = Vec::with_capacity(values.len());
        for value in values {
            result.push(bson::from_bson(value)?);
        }
        Ok(result)
    }

    /// Asks the engine for the plan and statistics of the accumulated
    /// find, via the `explain` command.
    pub fn explain(&self) -> Result<Document> {
        self.check()?;
        let mut find_cmd = doc! {
            "find": self.coll.ns().coll.clone(),
            "filter": self.op.filter_or_empty(),
        };
        if self.op.limit > 0 {
            find_cmd.insert("limit", self.op.limit);
        }
        self.coll.db().run(doc! {"explain": find_cmd})
    }

    /// Returns an iterator over decoded matching documents.
    pub fn iter<T: DeserializeOwned>(&self) -> Iter<T> {
        if let Err(err) = self.check() {
            return Iter::failed(err);
        }
        match self.coll.store().find(
            self.coll.ns(),
            &self.op.filter_or_empty(),
            &self.to_find_options(),
        ) {
            Ok(docs) => Iter::over(docs),
            Err(e) => Iter::failed(e.into()),
        }
    }

    /// Runs an atomic find-and-modify described by `change` and decodes
    /// the affected document, when one is available.
    ///
    /// With `remove` set this is find-and-delete; otherwise it is a
    /// find-and-replace that transparently falls back to an operator
    /// update when the change document carries operator keys.
    ///
    /// # Panics
    ///
    /// Panics if `change` neither removes nor carries an update document.
    pub fn apply<T: DeserializeOwned>(&self, change: Change) -> Result<(ChangeInfo, Option<T>)> {
        self.check()?;
        let filter = self.op.filter_or_empty();
        let options = self.to_find_and_modify_options();

        if change.remove {
            let removed = self
                .coll
                .store()
                .find_and_modify(self.coll.ns(), &filter, &FindAndModify::Delete, &options)?
                .ok_or(Error::NotFound)?;
            let decoded = bson::from_document(removed)?;
            return Ok((
                ChangeInfo {
                    removed: 1,
                    matched: 1,
                    ..ChangeInfo::default()
                },
                Some(decoded),
            ));
        }

        let update = change
            .update
            .unwrap_or_else(|| panic!("Apply: Change.update not set"));

        let replace = FindAndModify::Replace {
            replacement: update.clone(),
            upsert: change.upsert,
            return_new: change.return_new,
        };
        let outcome = match self
            .coll
            .store()
            .find_and_modify(self.coll.ns(), &filter, &replace, &options)
        {
            Err(StoreError::OperatorKeysInReplacement) => {
                debug!(ns = %self.coll.ns(), "find-and-replace rejected operator keys, retrying as update");
                let fallback = FindAndModify::Update {
                    update,
                    upsert: change.upsert,
                    return_new: change.return_new,
                };
                self.coll
                    .store()
                    .find_and_modify(self.coll.ns(), &filter, &fallback, &options)?
            }
            Err(e) => return Err(e.into()),
            Ok(outcome) => outcome,
        };

        match outcome {
            Some(doc) => Ok((
                ChangeInfo {
                    updated: 1,
                    ..ChangeInfo::default()
                },
                Some(bson::from_document(doc)?),
            )),
            // No image: either nothing matched, or an upsert created a
            // document and the pre-image was requested.
            None if change.upsert => Ok((
                ChangeInfo {
                    updated: 1,
                    ..ChangeInfo::default()
                },
                None,
            )),
            None => Err(Error::NotFound),
        }
    }
}

/// Iterator over the decoded results of a query or pipeline.
pub struct Iter<T> {
    docs: std::vec::IntoIter<Document>,
    err: Option<Error>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Iter<T> {
    pub(crate) fn over(docs: Vec<Document>) -> Self {
        Iter {
            docs: docs.into_iter(),
            err: None,
            _marker: PhantomData,
        }
    }

    pub(crate) fn failed(err: Error) -> Self {
        Iter {
            docs: Vec::new().into_iter(),
            err: Some(err),
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Iterator for Iter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.err.take() {
            return Some(Err(err));
        }
        let doc = self.docs.next()?;
        Some(bson::from_document(doc).map_err(Into::into))
    }
}
