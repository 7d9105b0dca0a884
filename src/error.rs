//! Error taxonomy for the compatibility layer.
//!
//! Usage errors (odd selector/update pair counts, empty sort field names)
//! are programmer errors and panic at the call site; everything the backend
//! can produce at runtime flows through [`Error`].

use thiserror::Error;

use crate::bulk::BulkError;
use crate::store::StoreError;

/// Compatibility layer errors.
#[derive(Error, Debug)]
pub enum Error {
    /// The selector matched no document. Distinct from "the operation
    /// failed": raised only by single-document update/replace and
    /// find-and-modify flows.
    #[error("not found")]
    NotFound,

    /// Malformed call arguments detected synchronously at the call site.
    #[error("{0}")]
    Usage(&'static str),

    /// An index key token violated the `[$<kind>:][-]<field name>` grammar.
    #[error(r#"invalid index key: want "[$<kind>:][-]<field name>", got {raw:?}"#)]
    InvalidIndexKey { raw: String },

    /// An index key list with no usable fields.
    #[error("invalid index key: no fields provided")]
    EmptyIndexKey,

    /// `drop_index` could not match the given key tokens to a stored index.
    #[error("index not found")]
    IndexNotFound,

    /// A unique-index violation reported by the document store.
    #[error("{message}")]
    Duplicate { message: String },

    /// Aggregated per-operation failures from a bulk run.
    #[error(transparent)]
    Bulk(#[from] BulkError),

    /// Any other document store failure, propagated verbatim.
    #[error(transparent)]
    Store(StoreError),

    /// A reply document could not be decoded into the caller's type.
    #[error("decode error: {0}")]
    Decode(#[from] bson::de::Error),

    /// A value could not be encoded as a document.
    #[error("encode error: {0}")]
    Encode(#[from] bson::ser::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Duplicate { message } => Error::Duplicate { message },
            other => Error::Store(other),
        }
    }
}

/// Reports whether the error is entirely attributable to duplicate-key
/// violations. For a [`BulkError`] this requires every constituent case to
/// be a duplicate-key error; a single non-duplicate case forces `false`.
pub fn is_dup(err: &Error) -> bool {
    match err {
        Error::Duplicate { .. } => true,
        Error::Bulk(bulk) => {
            !bulk.cases().is_empty() && bulk.cases().iter().all(|c| is_dup(&c.err))
        }
        _ => false,
    }
}
