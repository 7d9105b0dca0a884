//! Legacy mgo-style query/index vocabulary over a pluggable document store.
//!
//! This crate provides drop-in compatibility with the string-driven query
//! and index vocabulary of the classic mgo driver family:
//!
//! - index and sort keys written as `"field"`, `"-field"`, `"$text:field"`
//! - chained query builders (`find(..).sort(..).skip(..).limit(..)`)
//! - transparent replace-or-update resolution with upsert semantics
//! - ordered/unordered bulk writes with aggregated, deduplicated errors
//!
//! Transport, wire encoding, and durable storage are delegated to a
//! [`store::DocumentStore`] backend. An in-memory backend suitable for
//! tests and embedding ships as [`store::mem::MemStore`].
//!
//! # Usage
//!
//! ```rust
//! use luma_mgo::{Session, SessionConfig};
//! use luma_mgo::store::mem::MemStore;
//! use bson::doc;
//!
//! let store = std::sync::Arc::new(MemStore::new());
//! let session = Session::connect(store, SessionConfig::default()).unwrap();
//! let coll = session.db("mydb").c("mycoll");
//!
//! coll.insert(&[doc! {"_id": 1, "n": 10}]).unwrap();
//! let got: bson::Document = coll.find(doc! {"n": 10}).one().unwrap();
//! assert_eq!(got.get_i32("_id").unwrap(), 1);
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod bulk;
pub mod collection;
pub mod config;
pub mod database;
pub mod error;
pub mod index;
pub mod pipe;
pub mod query;
pub mod session;
pub mod sort;
pub mod store;

pub use bulk::{Bulk, BulkError, BulkErrorCase, BulkResult};
pub use collection::{Collection, CollectionInfo};
pub use config::SessionConfig;
pub use database::Database;
pub use error::{is_dup, Error, Result};
pub use index::{Index, IndexKeyInfo};
pub use pipe::Pipe;
pub use query::{Change, ChangeInfo, Collation, Iter, Query};
pub use session::{BuildInfo, ServerVersion, Session};
