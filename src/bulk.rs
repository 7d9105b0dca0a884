//! Bulk write coordinator.
//!
//! A [`Bulk`] session accumulates heterogeneous write intents and submits
//! them in one `run`: ordered execution stops at the first failure and
//! guarantees a prefix of applied operations, unordered execution applies
//! every independent operation and collects every failure. Submissions
//! larger than the configured batch size are split, and failure indices
//! and upsert-id keys re-based to the caller's original submission order.

use std::collections::HashMap;
use std::fmt;

use bson::{Bson, Document};
use tracing::{debug, warn};

use crate::collection::Collection;
use crate::error::Error;
use crate::store::BulkOp;

/// Counters for one bulk run. `upsert_ids` maps the index of each
/// upserting operation that created a document to the generated id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkResult {
    pub matched: i64,
    pub modified: i64,
    pub inserted: i64,
    pub deleted: i64,
    pub upserted: i64,
    pub upsert_ids: HashMap<usize, Bson>,
}

/// One failed operation. `index` is the operation's position in the
/// original submission, or `None` when the store cannot report it.
#[derive(Debug)]
pub struct BulkErrorCase {
    pub index: Option<usize>,
    pub err: Error,
}

/// An aggregate of per-operation failures, in submission order.
#[derive(Debug, Default)]
pub struct BulkError {
    cases: Vec<BulkErrorCase>,
}

impl BulkError {
    pub fn cases(&self) -> &[BulkErrorCase] {
        &self.cases
    }
}

impl fmt::Display for BulkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cases.is_empty() {
            return f.write_str("invalid BulkError instance: no errors");
        }
        if self.cases.len() == 1 {
            return write!(f, "{}", self.cases[0].err);
        }
        let mut msgs: Vec<String> = Vec::with_capacity(self.cases.len());
        for case in &self.cases {
            let msg = case.err.to_string();
            if !msgs.contains(&msg) {
                msgs.push(msg);
            }
        }
        if msgs.len() == 1 {
            return f.write_str(&msgs[0]);
        }
        f.write_str("multiple errors in bulk operation:\n")?;
        for msg in &msgs {
            writeln!(f, "  - {}", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for BulkError {}

/// An accumulating bulk session over one collection.
pub struct Bulk {
    coll: Collection,
    ops: Vec<BulkOp>,
    ordered: bool,
}

impl Bulk {
    pub(crate) fn new(coll: Collection) -> Self {
        Bulk {
            coll,
            ops: Vec::new(),
            ordered: true,
        }
    }

    /// Switches the session to unordered execution. May be called at any
    /// point before `run`.
    pub fn unordered(&mut self) -> &mut Self {
        self.ordered = false;
        self
    }

    /// Queues one insert per document, in argument order.
    pub fn insert(&mut self, docs: &[Document]) -> &mut Self {
        for doc in docs {
            self.ops.push(BulkOp::Insert(doc.clone()));
        }
        self
    }

    /// Queues a single-document removal per selector.
    pub fn remove(&mut self, selectors: &[Document]) -> &mut Self {
        for selector in selectors {
            self.ops.push(BulkOp::RemoveOne(selector.clone()));
        }
        self
    }

    /// Queues a multi-document removal per selector.
    pub fn remove_all(&mut self, selectors: &[Document]) -> &mut Self {
        for selector in selectors {
            self.ops.push(BulkOp::RemoveMany(selector.clone()));
        }
        self
    }

    /// Queues one single-document update per (selector, update) pair.
    ///
    /// # Panics
    ///
    /// Panics when given an odd number of documents.
    pub fn update(&mut self, pairs: &[Document]) -> &mut Self {
        if pairs.len() % 2 != 0 {
            panic!("Bulk.update requires an even number of parameters");
        }
        for pair in pairs.chunks(2) {
            self.ops.push(BulkOp::UpdateOne {
                selector: pair[0].clone(),
                update: pair[1].clone(),
            });
        }
        self
    }

    /// Queues one multi-document update per (selector, update) pair.
    ///
    /// # Panics
    ///
    /// Panics when given an odd number of documents.
    pub fn update_all(&mut self, pairs: &[Document]) -> &mut Self {
        if pairs.len() % 2 != 0 {
            panic!("Bulk.update_all requires an even number of parameters");
        }
        for pair in pairs.chunks(2) {
            self.ops.push(BulkOp::UpdateMany {
                selector: pair[0].clone(),
                update: pair[1].clone(),
            });
        }
        self
    }

    /// Queues one upserting update per (selector, update) pair.
    ///
    /// # Panics
    ///
    /// Panics when given an odd number of documents.
    pub fn upsert(&mut self, pairs: &[Document]) -> &mut Self {
        if pairs.len() % 2 != 0 {
            panic!("Bulk.upsert requires an even number of parameters");
        }
        for pair in pairs.chunks(2) {
            self.ops.push(BulkOp::Upsert {
                selector: pair[0].clone(),
                update: pair[1].clone(),
            });
        }
        self
    }

    /// Submits the accumulated operations. The result always reflects
    /// whatever was applied; under unordered execution a populated result
    /// and an error can co-occur (partial success).
    pub fn run(&mut self) -> (BulkResult, Option<BulkError>) {
        let mut result = BulkResult::default();
        let mut cases = Vec::new();
        let max_batch = self.coll.db().max_batch_size().max(1);

        debug!(ns = %self.coll.ns(), ops = self.ops.len(), ordered = self.ordered, "running bulk");

        let mut offset = 0;
        for chunk in self.ops.chunks(max_batch) {
            match self
                .coll
                .store()
                .bulk_write(self.coll.ns(), chunk, self.ordered)
            {
                Ok(report) => {
                    result.matched += report.counters.matched;
                    result.modified += report.counters.modified;
                    result.inserted += report.counters.inserted;
                    result.deleted += report.counters.deleted;
                    result.upserted += report.counters.upserted;
                    for (index, id) in report.counters.upserted_ids {
                        result.upsert_ids.insert(offset + index, id);
                    }
                    let failed = !report.failures.is_empty();
                    for failure in report.failures {
                        cases.push(BulkErrorCase {
                            index: Some(offset + failure.index),
                            err: failure.error.into(),
                        });
                    }
                    if failed && self.ordered {
                        break;
                    }
                }
                Err(e) => {
                    // The store could not attribute the failure to any
                    // single operation. Ordered mode stops here; unordered
                    // mode still submits the remaining batches.
                    cases.push(BulkErrorCase {
                        index: None,
                        err: e.into(),
                    });
                    if self.ordered {
                        break;
                    }
                }
            }
            offset += chunk.len();
        }

        if cases.is_empty() {
            (result, None)
        } else {
            warn!(ns = %self.coll.ns(), failures = cases.len(), "bulk run reported failures");
            (result, Some(BulkError { cases }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dup(msg: &str) -> BulkErrorCase {
        BulkErrorCase {
            index: Some(0),
            err: Error::Duplicate {
                message: msg.to_string(),
            },
        }
    }

    #[test]
    fn empty_error_is_invalid_state() {
        let err = BulkError::default();
        assert_eq!(err.to_string(), "invalid BulkError instance: no errors");
    }

    #[test]
    fn single_case_renders_verbatim() {
        let err = BulkError {
            cases: vec![dup("E11000 boom")],
        };
        assert_eq!(err.to_string(), "E11000 boom");
    }

    #[test]
    fn identical_messages_collapse() {
        let err = BulkError {
            cases: vec![dup("same"), dup("same"), dup("same")],
        };
        assert_eq!(err.to_string(), "same");
    }

    #[test]
    fn distinct_messages_render_bulleted() {
        let err = BulkError {
            cases: vec![dup("one"), dup("two"), dup("one")],
        };
        assert_eq!(
            err.to_string(),
            "multiple errors in bulk operation:\n  - one\n  - two\n"
        );
    }
}
