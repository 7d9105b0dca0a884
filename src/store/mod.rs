//! Document store boundary.
//!
//! Everything durable lives behind [`DocumentStore`]: an abstract capability
//! set covering CRUD, find-and-modify, aggregation, bulk writes, index DDL,
//! and command execution. The compatibility layer owns no persistent state
//! of its own and treats every store error as terminal for the call that
//! produced it.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use bson::{Bson, Document};
use thiserror::Error;

pub mod mem;

/// A `database.collection` pair addressing one collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ns {
    pub db: String,
    pub coll: String,
}

impl Ns {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Ns {
            db: db.into(),
            coll: coll.into(),
        }
    }
}

impl fmt::Display for Ns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// Classified document store failures.
///
/// The classification is deliberately typed: the update/replace resolution
/// protocol dispatches on [`StoreError::OperatorKeysInReplacement`] rather
/// than matching a rejection message string.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// A unique-index violation.
    #[error("{message}")]
    Duplicate { message: String },

    /// A replacement document contained operator keys (keys beginning
    /// with `$`), which only operator updates may carry.
    #[error("replacement document cannot contain keys beginning with '$'")]
    OperatorKeysInReplacement,

    /// Any other failure, propagated verbatim.
    #[error("{message}")]
    Failed { code: i32, message: String },
}

impl StoreError {
    pub fn failed(code: i32, message: impl Into<String>) -> Self {
        StoreError::Failed {
            code,
            message: message.into(),
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::Duplicate { .. })
    }
}

/// Options forwarded to read operations. Unsupported settings are ignored
/// by operations that have no use for them.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub projection: Option<Document>,
    pub sort: Option<Document>,
    pub skip: Option<i64>,
    pub limit: Option<i64>,
    pub hint: Option<Document>,
    pub comment: Option<String>,
    pub collation: Option<Document>,
    pub max_time: Option<Duration>,
    pub allow_disk_use: bool,
}

/// Options for index creation, mirroring the stored descriptor fields.
#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    pub name: Option<String>,
    pub unique: bool,
    pub background: bool,
    pub sparse: bool,
    pub partial_filter: Option<Document>,
    pub expire_after_seconds: Option<i32>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub bits: Option<i32>,
    pub bucket_size: Option<f64>,
    pub default_language: Option<String>,
    pub language_override: Option<String>,
    pub weights: Option<Document>,
    pub collation: Option<Document>,
}

/// Options for collection creation.
#[derive(Debug, Clone, Default)]
pub struct CreateCollectionOptions {
    pub capped: bool,
    pub max_bytes: i64,
    pub max_docs: i64,
    pub validator: Option<Document>,
    pub validation_level: Option<String>,
    pub validation_action: Option<String>,
    pub storage_engine: Option<Document>,
    pub collation: Option<Document>,
}

/// Counters reported by a single write primitive.
#[derive(Debug, Clone, Default)]
pub struct WriteOutcome {
    pub matched: i64,
    pub modified: i64,
    pub deleted: i64,
    pub upserted_id: Option<Bson>,
}

/// Atomic find-and-modify variants.
#[derive(Debug, Clone)]
pub enum FindAndModify {
    Update {
        update: Document,
        upsert: bool,
        return_new: bool,
    },
    Replace {
        replacement: Document,
        upsert: bool,
        return_new: bool,
    },
    Delete,
}

/// One write intent inside a bulk submission.
#[derive(Debug, Clone)]
pub enum BulkOp {
    Insert(Document),
    RemoveOne(Document),
    RemoveMany(Document),
    UpdateOne { selector: Document, update: Document },
    UpdateMany { selector: Document, update: Document },
    Upsert { selector: Document, update: Document },
}

/// Aggregate counters for a bulk submission. `upserted_ids` is keyed by the
/// operation's index within the submitted batch.
#[derive(Debug, Clone, Default)]
pub struct BulkCounters {
    pub matched: i64,
    pub modified: i64,
    pub inserted: i64,
    pub deleted: i64,
    pub upserted: i64,
    pub upserted_ids: HashMap<usize, Bson>,
}

/// One failed operation inside a bulk submission. `index` is relative to
/// the submitted batch, not to any larger caller-side sequence.
#[derive(Debug, Clone)]
pub struct WriteFailure {
    pub index: usize,
    pub error: StoreError,
}

/// Outcome of a bulk submission: whatever was applied, plus every
/// per-operation failure. Both can be non-empty at once.
#[derive(Debug, Clone, Default)]
pub struct BulkReport {
    pub counters: BulkCounters,
    pub failures: Vec<WriteFailure>,
}

/// The capability set this layer requires from a document store.
///
/// Implementations provide durable storage and query execution; connection
/// management, authentication, and wire encoding are theirs entirely.
pub trait DocumentStore: Send + Sync {
    fn insert_many(&self, ns: &Ns, docs: &[Document]) -> Result<Vec<Bson>, StoreError>;

    fn find(
        &self,
        ns: &Ns,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError>;

    fn find_one(
        &self,
        ns: &Ns,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<Option<Document>, StoreError>;

    fn count_documents(
        &self,
        ns: &Ns,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<i64, StoreError>;

    fn distinct(
        &self,
        ns: &Ns,
        key: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<Vec<Bson>, StoreError>;

    /// Operator-based update of one (`multi == false`) or all matching
    /// documents.
    fn update(
        &self,
        ns: &Ns,
        filter: &Document,
        update: &Document,
        upsert: bool,
        multi: bool,
    ) -> Result<WriteOutcome, StoreError>;

    /// Whole-document replacement of one matching document. Must reject a
    /// replacement containing operator keys with
    /// [`StoreError::OperatorKeysInReplacement`].
    fn replace_one(
        &self,
        ns: &Ns,
        filter: &Document,
        replacement: &Document,
        upsert: bool,
    ) -> Result<WriteOutcome, StoreError>;

    fn delete(&self, ns: &Ns, filter: &Document, multi: bool) -> Result<WriteOutcome, StoreError>;

    /// Atomic find-and-modify. Returns the pre- or post-image per the
    /// variant's `return_new`, or `None` when nothing matched (and, for
    /// upserting replacements returning the pre-image, when no pre-image
    /// exists).
    fn find_and_modify(
        &self,
        ns: &Ns,
        filter: &Document,
        action: &FindAndModify,
        options: &FindOptions,
    ) -> Result<Option<Document>, StoreError>;

    fn aggregate(
        &self,
        ns: &Ns,
        pipeline: &[Document],
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError>;

    /// Executes a batch of write intents. Ordered execution stops at the
    /// first failing operation; unordered execution applies every
    /// independent operation and reports all failures. Failure indices are
    /// relative to `ops`.
    fn bulk_write(&self, ns: &Ns, ops: &[BulkOp], ordered: bool) -> Result<BulkReport, StoreError>;

    fn list_indexes(&self, ns: &Ns) -> Result<Vec<Document>, StoreError>;

    fn create_index(
        &self,
        ns: &Ns,
        keys: &Document,
        options: &IndexOptions,
    ) -> Result<String, StoreError>;

    fn drop_index(&self, ns: &Ns, name: &str) -> Result<(), StoreError>;

    fn drop_all_indexes(&self, ns: &Ns) -> Result<(), StoreError>;

    fn run_command(&self, db: &str, cmd: &Document) -> Result<Document, StoreError>;

    fn list_collection_names(&self, db: &str) -> Result<Vec<String>, StoreError>;

    fn create_collection(
        &self,
        ns: &Ns,
        options: &CreateCollectionOptions,
    ) -> Result<(), StoreError>;

    fn drop_collection(&self, ns: &Ns) -> Result<(), StoreError>;

    fn drop_database(&self, db: &str) -> Result<(), StoreError>;
}
