//! Aggregation pipeline builder.

use std::time::Duration;

use bson::{doc, Document};
use serde::de::DeserializeOwned;

use crate::collection::Collection;
use crate::error::{Error, Result};
use crate::query::{Collation, Iter};
use crate::store::FindOptions;

/// A prepared aggregation over one collection.
pub struct Pipe {
    coll: Collection,
    pipeline: Vec<Document>,
    batch: i64,
    collation: Option<Collation>,
    max_time: Option<Duration>,
    allow_disk: bool,
}

impl Pipe {
    pub(crate) fn new(coll: Collection, pipeline: Vec<Document>) -> Self {
        Pipe {
            coll,
            pipeline,
            batch: 0,
            collation: None,
            max_time: None,
            allow_disk: false,
        }
    }

    /// Lets the server spill pipeline stages to disk.
    pub fn allow_disk_use(mut self) -> Self {
        self.allow_disk = true;
        self
    }

    /// Sets the cursor batch size.
    pub fn batch(mut self, n: i64) -> Self {
        self.batch = n;
        self
    }

    pub fn collation(mut self, collation: Collation) -> Self {
        self.collation = Some(collation);
        self
    }

    pub fn set_max_time(mut self, d: Duration) -> Self {
        self.max_time = Some(d);
        self
    }

    fn to_aggregate_options(&self) -> FindOptions {
        let mut opts = FindOptions {
            max_time: self.max_time,
            allow_disk_use: self.allow_disk,
            ..FindOptions::default()
        };
        if self.batch > 0 {
            opts.limit = Some(self.batch);
        }
        opts.collation = self
            .collation
            .as_ref()
            .and_then(|c| bson::to_document(c).ok());
        opts
    }

    fn aggregate(&self) -> Result<Vec<Document>> {
        Ok(self
            .coll
            .store()
            .aggregate(self.coll.ns(), &self.pipeline, &self.to_aggregate_options())?)
    }

    /// Runs the pipeline and decodes every resulting document.
    pub fn all<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let mut result = Vec::new();
        for doc in self.aggregate()? {
            result.push(bson::from_document(doc)?);
        }
        Ok(result)
    }

    /// Runs the pipeline and decodes the first resulting document;
    /// `NotFound` when the pipeline produces nothing.
    pub fn one<T: DeserializeOwned>(&self) -> Result<T> {
        let mut iter = self.iter();
        iter.next().unwrap_or(Err(Error::NotFound))
    }

    /// Returns an iterator over the decoded pipeline results.
    pub fn iter<T: DeserializeOwned>(&self) -> Iter<T> {
        match self.aggregate() {
            Ok(docs) => Iter::over(docs),
            Err(e) => Iter::failed(e),
        }
    }

    /// Asks the engine for the pipeline's execution plan.
    pub fn explain(&self) -> Result<Document> {
        self.coll.db().run(doc! {
            "aggregate": self.coll.name(),
            "pipeline": self.pipeline.clone(),
            "explain": true,
        })
    }
}
