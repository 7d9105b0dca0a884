//! In-memory document store.
//!
//! A [`MemStore`] keeps databases of collections of BSON documents in
//! process memory and implements the full [`DocumentStore`] capability
//! set: filter matching with the common comparison operators, operator
//! and replacement updates, unique-index enforcement, a useful subset of
//! the aggregation stages, and bulk writes with ordered/unordered
//! semantics. Suitable for tests and for embedding.

use std::cmp::Ordering;
use std::collections::HashMap;

use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use dashmap::DashMap;
use tracing::debug;

use super::{
    BulkOp, BulkReport, CreateCollectionOptions, DocumentStore, FindAndModify, FindOptions,
    IndexOptions, Ns, StoreError, WriteFailure, WriteOutcome,
};
use crate::index::id_index_key;

#[derive(Debug, Clone)]
struct MemIndex {
    name: String,
    keys: Document,
    unique: bool,
    descriptor: Document,
}

impl MemIndex {
    fn id_index() -> Self {
        MemIndex {
            name: "_id_".to_string(),
            keys: id_index_key(),
            unique: true,
            descriptor: doc! {"v": 2, "key": id_index_key(), "name": "_id_"},
        }
    }
}

#[derive(Debug)]
struct MemCollection {
    documents: Vec<Document>,
    indexes: Vec<MemIndex>,
}

impl Default for MemCollection {
    fn default() -> Self {
        MemCollection {
            documents: Vec::new(),
            indexes: vec![MemIndex::id_index()],
        }
    }
}

#[derive(Debug, Default)]
struct MemDatabase {
    collections: HashMap<String, MemCollection>,
}

/// An in-memory [`DocumentStore`].
pub struct MemStore {
    databases: DashMap<String, MemDatabase>,
    version: String,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::with_version("4.2.14")
    }

    /// Creates a store reporting the given version from `buildInfo`.
    pub fn with_version(version: &str) -> Self {
        MemStore {
            databases: DashMap::new(),
            version: version.to_string(),
        }
    }

    fn with_coll<R>(&self, ns: &Ns, f: impl FnOnce(Option<&MemCollection>) -> R) -> R {
        match self.databases.get(&ns.db) {
            Some(db) => f(db.collections.get(&ns.coll)),
            None => f(None),
        }
    }

    fn with_coll_mut<R>(&self, ns: &Ns, f: impl FnOnce(&Ns, &mut MemCollection) -> R) -> R {
        let mut db = self.databases.entry(ns.db.clone()).or_default();
        let coll = db.collections.entry(ns.coll.clone()).or_default();
        f(ns, coll)
    }
}

// ---- value helpers ----------------------------------------------------

fn numeric(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(f) => Some(*f),
        _ => None,
    }
}

fn is_integral(value: &Bson) -> bool {
    matches!(value, Bson::Int32(_) | Bson::Int64(_))
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        other => numeric(other).is_some_and(|n| n != 0.0),
    }
}

/// Cross-type comparison: numeric types compare by value, otherwise only
/// like types are ordered.
fn compare(a: &Bson, b: &Bson) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (numeric(a), numeric(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        _ => (a == b).then_some(Ordering::Equal),
    }
}

fn bson_eq(actual: Option<&Bson>, expected: &Bson) -> bool {
    match actual {
        Some(actual) => compare(actual, expected) == Some(Ordering::Equal),
        None => matches!(expected, Bson::Null),
    }
}

/// Resolves a possibly dotted field path.
fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut current = doc;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        let value = current.get(part)?;
        if parts.peek().is_none() {
            return Some(value);
        }
        current = value.as_document()?;
    }
    None
}

fn insert_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, Document::new());
            }
            if let Some(Bson::Document(sub)) = doc.get_mut(head) {
                insert_path(sub, rest, value);
            }
        }
    }
}

fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(sub)) = doc.get_mut(head) {
                remove_path(sub, rest);
            }
        }
    }
}

// ---- filter matching --------------------------------------------------

fn is_operator_doc(doc: &Document) -> bool {
    doc.keys().next().is_some_and(|k| k.starts_with('$'))
}

fn matches_filter(doc: &Document, filter: &Document) -> bool {
    for (key, expected) in filter {
        let actual = lookup(doc, key);
        match expected {
            Bson::Document(ops) if is_operator_doc(ops) => {
                for (op, operand) in ops {
                    let ok = match op.as_str() {
                        "$eq" => bson_eq(actual, operand),
                        "$ne" => !bson_eq(actual, operand),
                        "$gt" => actual
                            .and_then(|a| compare(a, operand))
                            .is_some_and(|o| o == Ordering::Greater),
                        "$gte" => actual
                            .and_then(|a| compare(a, operand))
                            .is_some_and(|o| o != Ordering::Less),
                        "$lt" => actual
                            .and_then(|a| compare(a, operand))
                            .is_some_and(|o| o == Ordering::Less),
                        "$lte" => actual
                            .and_then(|a| compare(a, operand))
                            .is_some_and(|o| o != Ordering::Greater),
                        "$in" => operand
                            .as_array()
                            .is_some_and(|arr| arr.iter().any(|v| bson_eq(actual, v))),
                        "$nin" => operand
                            .as_array()
                            .is_some_and(|arr| !arr.iter().any(|v| bson_eq(actual, v))),
                        "$exists" => truthy(operand) == actual.is_some(),
                        // Unsupported operators do not constrain the match.
                        _ => true,
                    };
                    if !ok {
                        return false;
                    }
                }
            }
            _ => {
                if !bson_eq(actual, expected) {
                    return false;
                }
            }
        }
    }
    true
}

// ---- projection and sorting -------------------------------------------

fn apply_projection(doc: &Document, projection: &Document) -> Document {
    if projection.is_empty() {
        return doc.clone();
    }
    // A projection touching only `_id` is inclusive when `_id` is truthy,
    // exclusive when it suppresses `_id`.
    let inclusive = if projection.keys().any(|k| k != "_id") {
        projection.iter().any(|(k, v)| k != "_id" && truthy(v))
    } else {
        projection.get("_id").is_some_and(truthy)
    };
    if inclusive {
        let mut out = Document::new();
        let id_excluded = projection.get("_id").is_some_and(|v| !truthy(v));
        if !id_excluded {
            if let Some(id) = doc.get("_id") {
                out.insert("_id", id.clone());
            }
        }
        for (key, include) in projection {
            if key != "_id" && truthy(include) {
                if let Some(value) = lookup(doc, key) {
                    out.insert(key, value.clone());
                }
            }
        }
        out
    } else {
        let mut out = doc.clone();
        for (key, include) in projection {
            if !truthy(include) {
                remove_path(&mut out, key);
            }
        }
        out
    }
}

fn doc_cmp(a: &Document, b: &Document, sort: &Document) -> Ordering {
    for (field, direction) in sort {
        let ord = match (lookup(a, field), lookup(b, field)) {
            (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        };
        // Meta-sort entries and missing directions sort ascending.
        let ord = if numeric(direction).is_some_and(|d| d < 0.0) {
            ord.reverse()
        } else {
            ord
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn sort_documents(docs: &mut [Document], sort: &Document) {
    docs.sort_by(|a, b| doc_cmp(a, b, sort));
}

// ---- updates ----------------------------------------------------------

fn apply_update_operators(doc: &mut Document, update: &Document) -> Result<(), StoreError> {
    for (op, fields) in update {
        let fields = match fields.as_document() {
            Some(fields) => fields,
            None => continue,
        };
        match op.as_str() {
            "$set" => {
                for (key, value) in fields {
                    insert_path(doc, key, value.clone());
                }
            }
            "$unset" => {
                for (key, _) in fields {
                    remove_path(doc, key);
                }
            }
            "$inc" => {
                for (key, delta) in fields {
                    let current = lookup(doc, key).cloned();
                    let base = current.as_ref().and_then(numeric).unwrap_or(0.0);
                    let step = numeric(delta).unwrap_or(0.0);
                    let integral =
                        current.as_ref().map_or(true, is_integral) && is_integral(delta);
                    if integral {
                        insert_path(doc, key, Bson::Int64((base + step) as i64));
                    } else {
                        insert_path(doc, key, Bson::Double(base + step));
                    }
                }
            }
            "$push" => {
                for (key, value) in fields {
                    match lookup(doc, key) {
                        Some(Bson::Array(existing)) => {
                            let mut arr = existing.clone();
                            arr.push(value.clone());
                            insert_path(doc, key, Bson::Array(arr));
                        }
                        _ => insert_path(doc, key, Bson::Array(vec![value.clone()])),
                    }
                }
            }
            "$pull" => {
                for (key, value) in fields {
                    if let Some(Bson::Array(existing)) = lookup(doc, key) {
                        let arr: Vec<Bson> = existing
                            .iter()
                            .filter(|v| !bson_eq(Some(v), value))
                            .cloned()
                            .collect();
                        insert_path(doc, key, Bson::Array(arr));
                    }
                }
            }
            "$addToSet" => {
                for (key, value) in fields {
                    match lookup(doc, key) {
                        Some(Bson::Array(existing)) => {
                            if !existing.iter().any(|v| bson_eq(Some(v), value)) {
                                let mut arr = existing.clone();
                                arr.push(value.clone());
                                insert_path(doc, key, Bson::Array(arr));
                            }
                        }
                        _ => insert_path(doc, key, Bson::Array(vec![value.clone()])),
                    }
                }
            }
            other => {
                return Err(StoreError::failed(
                    9,
                    format!("unknown modifier: {}", other),
                ))
            }
        }
    }
    Ok(())
}

/// Produces the post-update version of `original`. An update document
/// without operator keys is replacement-style: it becomes the new
/// document, keeping the original `_id`.
fn updated_version(original: &Document, update: &Document) -> Result<Document, StoreError> {
    if is_operator_doc(update) {
        let mut out = original.clone();
        apply_update_operators(&mut out, update)?;
        Ok(out)
    } else {
        let mut out = update.clone();
        if out.get("_id").is_none() {
            if let Some(id) = original.get("_id") {
                let id = id.clone();
                out.insert("_id", id);
            }
        }
        Ok(out)
    }
}

/// Builds the document an upsert inserts when nothing matched: the plain
/// equality fields of the filter, with the update applied on top.
fn synthesize_upsert(filter: &Document, update: &Document) -> Result<Document, StoreError> {
    let mut base = Document::new();
    for (key, value) in filter {
        match value {
            Bson::Document(ops) if is_operator_doc(ops) => {
                if let Some(eq) = ops.get("$eq") {
                    base.insert(key, eq.clone());
                }
            }
            _ => {
                base.insert(key, value.clone());
            }
        }
    }
    updated_version(&base, update)
}

fn ensure_id(doc: &mut Document) -> Bson {
    match doc.get("_id") {
        Some(id) => id.clone(),
        None => {
            let id = Bson::ObjectId(ObjectId::new());
            doc.insert("_id", id.clone());
            id
        }
    }
}

// ---- unique indexes ---------------------------------------------------

fn index_key_values(doc: &Document, keys: &Document) -> Vec<Bson> {
    keys.keys()
        .map(|field| lookup(doc, field).cloned().unwrap_or(Bson::Null))
        .collect()
}

/// Checks `candidate` against every unique index, skipping the document
/// at `exclude` (the one being rewritten).
fn unique_violation(
    ns: &Ns,
    coll: &MemCollection,
    candidate: &Document,
    exclude: Option<usize>,
) -> Option<StoreError> {
    for index in &coll.indexes {
        if !index.unique {
            continue;
        }
        let values = index_key_values(candidate, &index.keys);
        for (i, existing) in coll.documents.iter().enumerate() {
            if Some(i) == exclude {
                continue;
            }
            let existing_values = index_key_values(existing, &index.keys);
            let clash = values
                .iter()
                .zip(&existing_values)
                .all(|(a, b)| compare(a, b) == Some(Ordering::Equal));
            if clash {
                let mut key_doc = Document::new();
                for (field, value) in index.keys.keys().zip(&values) {
                    key_doc.insert(field, value.clone());
                }
                return Some(StoreError::Duplicate {
                    message: format!(
                        "E11000 duplicate key error collection: {} index: {} dup key: {}",
                        ns, index.name, key_doc
                    ),
                });
            }
        }
    }
    None
}

fn insert_doc(ns: &Ns, coll: &mut MemCollection, doc: &Document) -> Result<Bson, StoreError> {
    let mut doc = doc.clone();
    let id = ensure_id(&mut doc);
    if let Some(err) = unique_violation(ns, coll, &doc, None) {
        return Err(err);
    }
    coll.documents.push(doc);
    Ok(id)
}

// ---- aggregation ------------------------------------------------------

fn field_values(docs: &[Document], operand: &Bson) -> Vec<Bson> {
    match operand.as_str().and_then(|s| s.strip_prefix('$')) {
        Some(field) => docs
            .iter()
            .filter_map(|d| lookup(d, field).cloned())
            .collect(),
        None => Vec::new(),
    }
}

fn apply_group(docs: &[Document], group: &Document) -> Result<Document, StoreError> {
    let mut result = doc! {"_id": group.get("_id").cloned().unwrap_or(Bson::Null)};
    for (key, accumulator) in group {
        if key == "_id" {
            continue;
        }
        let accumulator = accumulator.as_document().ok_or_else(|| {
            StoreError::failed(40234, format!("the field '{}' must be an accumulator object", key))
        })?;
        for (op, operand) in accumulator {
            match op.as_str() {
                "$sum" => {
                    if let Some(n) = numeric(operand) {
                        result.insert(key, docs.len() as f64 * n);
                    } else {
                        let sum: f64 = field_values(docs, operand)
                            .iter()
                            .filter_map(numeric)
                            .sum();
                        result.insert(key, sum);
                    }
                }
                "$avg" => {
                    let values: Vec<f64> = field_values(docs, operand)
                        .iter()
                        .filter_map(numeric)
                        .collect();
                    if values.is_empty() {
                        result.insert(key, Bson::Null);
                    } else {
                        result.insert(key, values.iter().sum::<f64>() / values.len() as f64);
                    }
                }
                "$min" | "$max" => {
                    let mut best: Option<Bson> = None;
                    for value in field_values(docs, operand) {
                        let better = match &best {
                            None => true,
                            Some(current) => {
                                let ord = compare(&value, current).unwrap_or(Ordering::Equal);
                                if op == "$min" {
                                    ord == Ordering::Less
                                } else {
                                    ord == Ordering::Greater
                                }
                            }
                        };
                        if better {
                            best = Some(value);
                        }
                    }
                    result.insert(key, best.unwrap_or(Bson::Null));
                }
                "$first" => {
                    result.insert(
                        key,
                        field_values(docs, operand).into_iter().next().unwrap_or(Bson::Null),
                    );
                }
                "$last" => {
                    result.insert(
                        key,
                        field_values(docs, operand).into_iter().last().unwrap_or(Bson::Null),
                    );
                }
                other => {
                    return Err(StoreError::failed(
                        15952,
                        format!("unknown group operator '{}'", other),
                    ))
                }
            }
        }
    }
    Ok(result)
}

// ---- trait implementation ---------------------------------------------

impl DocumentStore for MemStore {
    fn insert_many(&self, ns: &Ns, docs: &[Document]) -> Result<Vec<Bson>, StoreError> {
        self.with_coll_mut(ns, |ns, coll| {
            let mut ids = Vec::with_capacity(docs.len());
            for doc in docs {
                ids.push(insert_doc(ns, coll, doc)?);
            }
            Ok(ids)
        })
    }

    fn find(
        &self,
        ns: &Ns,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError> {
        let mut docs: Vec<Document> = self.with_coll(ns, |coll| {
            coll.map(|c| {
                c.documents
                    .iter()
                    .filter(|d| matches_filter(d, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
        });
        if let Some(sort) = &options.sort {
            if !sort.is_empty() {
                sort_documents(&mut docs, sort);
            }
        }
        if let Some(skip) = options.skip {
            if skip > 0 {
                let skip = (skip as usize).min(docs.len());
                docs.drain(..skip);
            }
        }
        if let Some(limit) = options.limit {
            if limit > 0 {
                docs.truncate(limit as usize);
            }
        }
        if let Some(projection) = &options.projection {
            if !projection.is_empty() {
                docs = docs.iter().map(|d| apply_projection(d, projection)).collect();
            }
        }
        Ok(docs)
    }

    fn find_one(
        &self,
        ns: &Ns,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<Option<Document>, StoreError> {
        let mut options = options.clone();
        options.limit = Some(1);
        Ok(self.find(ns, filter, &options)?.into_iter().next())
    }

    fn count_documents(
        &self,
        ns: &Ns,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<i64, StoreError> {
        let mut options = options.clone();
        options.projection = None;
        Ok(self.find(ns, filter, &options)?.len() as i64)
    }

    fn distinct(
        &self,
        ns: &Ns,
        key: &str,
        filter: &Document,
        _options: &FindOptions,
    ) -> Result<Vec<Bson>, StoreError> {
        let docs = self.find(ns, filter, &FindOptions::default())?;
        let mut values: Vec<Bson> = Vec::new();
        for doc in &docs {
            if let Some(value) = lookup(doc, key) {
                if !values.iter().any(|v| bson_eq(Some(v), value)) {
                    values.push(value.clone());
                }
            }
        }
        Ok(values)
    }

    fn update(
        &self,
        ns: &Ns,
        filter: &Document,
        update: &Document,
        upsert: bool,
        multi: bool,
    ) -> Result<WriteOutcome, StoreError> {
        if multi && !is_operator_doc(update) {
            return Err(StoreError::failed(
                9,
                "multi update is not supported for replacement-style update",
            ));
        }
        self.with_coll_mut(ns, |ns, coll| {
            let mut outcome = WriteOutcome::default();
            let matching: Vec<usize> = coll
                .documents
                .iter()
                .enumerate()
                .filter(|(_, d)| matches_filter(d, filter))
                .map(|(i, _)| i)
                .collect();
            let take = if multi { matching.len() } else { 1 };
            for &i in matching.iter().take(take) {
                let updated = updated_version(&coll.documents[i], update)?;
                if let Some(err) = unique_violation(ns, coll, &updated, Some(i)) {
                    return Err(err);
                }
                outcome.matched += 1;
                if updated != coll.documents[i] {
                    outcome.modified += 1;
                    coll.documents[i] = updated;
                }
            }
            if outcome.matched == 0 && upsert {
                let mut new_doc = synthesize_upsert(filter, update)?;
                let id = ensure_id(&mut new_doc);
                if let Some(err) = unique_violation(ns, coll, &new_doc, None) {
                    return Err(err);
                }
                coll.documents.push(new_doc);
                outcome.upserted_id = Some(id);
            }
            Ok(outcome)
        })
    }

    fn replace_one(
        &self,
        ns: &Ns,
        filter: &Document,
        replacement: &Document,
        upsert: bool,
    ) -> Result<WriteOutcome, StoreError> {
        if is_operator_doc(replacement) {
            return Err(StoreError::OperatorKeysInReplacement);
        }
        self.with_coll_mut(ns, |ns, coll| {
            let mut outcome = WriteOutcome::default();
            let matched = coll
                .documents
                .iter()
                .position(|d| matches_filter(d, filter));
            match matched {
                Some(i) => {
                    let new_doc = updated_version(&coll.documents[i], replacement)?;
                    if let Some(err) = unique_violation(ns, coll, &new_doc, Some(i)) {
                        return Err(err);
                    }
                    outcome.matched = 1;
                    if new_doc != coll.documents[i] {
                        outcome.modified = 1;
                        coll.documents[i] = new_doc;
                    }
                }
                None if upsert => {
                    let mut new_doc = synthesize_upsert(filter, replacement)?;
                    let id = ensure_id(&mut new_doc);
                    if let Some(err) = unique_violation(ns, coll, &new_doc, None) {
                        return Err(err);
                    }
                    coll.documents.push(new_doc);
                    outcome.upserted_id = Some(id);
                }
                None => {}
            }
            Ok(outcome)
        })
    }

    fn delete(&self, ns: &Ns, filter: &Document, multi: bool) -> Result<WriteOutcome, StoreError> {
        self.with_coll_mut(ns, |_, coll| {
            let before = coll.documents.len();
            if multi {
                coll.documents.retain(|d| !matches_filter(d, filter));
            } else if let Some(pos) = coll
                .documents
                .iter()
                .position(|d| matches_filter(d, filter))
            {
                coll.documents.remove(pos);
            }
            Ok(WriteOutcome {
                deleted: (before - coll.documents.len()) as i64,
                ..WriteOutcome::default()
            })
        })
    }

    fn find_and_modify(
        &self,
        ns: &Ns,
        filter: &Document,
        action: &FindAndModify,
        options: &FindOptions,
    ) -> Result<Option<Document>, StoreError> {
        if let FindAndModify::Replace { replacement, .. } = action {
            if is_operator_doc(replacement) {
                return Err(StoreError::OperatorKeysInReplacement);
            }
        }
        self.with_coll_mut(ns, |ns, coll| {
            let mut matching: Vec<usize> = coll
                .documents
                .iter()
                .enumerate()
                .filter(|(_, d)| matches_filter(d, filter))
                .map(|(i, _)| i)
                .collect();
            if let Some(sort) = &options.sort {
                if !sort.is_empty() {
                    matching
                        .sort_by(|&a, &b| doc_cmp(&coll.documents[a], &coll.documents[b], sort));
                }
            }
            let target = matching.first().copied();

            let project = |doc: Document| match &options.projection {
                Some(projection) if !projection.is_empty() => apply_projection(&doc, projection),
                _ => doc,
            };

            match action {
                FindAndModify::Delete => match target {
                    Some(i) => {
                        let removed = coll.documents.remove(i);
                        Ok(Some(project(removed)))
                    }
                    None => Ok(None),
                },
                FindAndModify::Replace {
                    replacement,
                    upsert,
                    return_new,
                }
                | FindAndModify::Update {
                    update: replacement,
                    upsert,
                    return_new,
                } => match target {
                    Some(i) => {
                        let before = coll.documents[i].clone();
                        let after = updated_version(&before, replacement)?;
                        if let Some(err) = unique_violation(ns, coll, &after, Some(i)) {
                            return Err(err);
                        }
                        coll.documents[i] = after.clone();
                        Ok(Some(project(if *return_new { after } else { before })))
                    }
                    None if *upsert => {
                        let mut new_doc = synthesize_upsert(filter, replacement)?;
                        ensure_id(&mut new_doc);
                        if let Some(err) = unique_violation(ns, coll, &new_doc, None) {
                            return Err(err);
                        }
                        coll.documents.push(new_doc.clone());
                        if *return_new {
                            Ok(Some(project(new_doc)))
                        } else {
                            Ok(None)
                        }
                    }
                    None => Ok(None),
                },
            }
        })
    }

    fn aggregate(
        &self,
        ns: &Ns,
        pipeline: &[Document],
        _options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError> {
        let mut docs: Vec<Document> = self.with_coll(ns, |coll| {
            coll.map(|c| c.documents.clone()).unwrap_or_default()
        });
        for stage in pipeline {
            if let Ok(filter) = stage.get_document("$match") {
                docs.retain(|d| matches_filter(d, filter));
            } else if let Ok(projection) = stage.get_document("$project") {
                docs = docs.iter().map(|d| apply_projection(d, projection)).collect();
            } else if let Ok(sort) = stage.get_document("$sort") {
                sort_documents(&mut docs, sort);
            } else if let Some(limit) = stage.get("$limit").and_then(numeric) {
                docs.truncate(limit as usize);
            } else if let Some(skip) = stage.get("$skip").and_then(numeric) {
                let skip = (skip as usize).min(docs.len());
                docs.drain(..skip);
            } else if let Ok(group) = stage.get_document("$group") {
                docs = vec![apply_group(&docs, group)?];
            } else if let Ok(field) = stage.get_str("$count") {
                docs = vec![doc! {field: docs.len() as i64}];
            } else {
                let stage_name = stage.keys().next().cloned().unwrap_or_default();
                return Err(StoreError::failed(
                    40324,
                    format!("unrecognized pipeline stage name: '{}'", stage_name),
                ));
            }
        }
        Ok(docs)
    }

    fn bulk_write(&self, ns: &Ns, ops: &[BulkOp], ordered: bool) -> Result<BulkReport, StoreError> {
        let mut report = BulkReport::default();
        for (i, op) in ops.iter().enumerate() {
            let outcome: Result<(), StoreError> = match op {
                BulkOp::Insert(doc) => self
                    .insert_many(ns, std::slice::from_ref(doc))
                    .map(|_| report.counters.inserted += 1),
                BulkOp::RemoveOne(selector) => self
                    .delete(ns, selector, false)
                    .map(|o| report.counters.deleted += o.deleted),
                BulkOp::RemoveMany(selector) => self
                    .delete(ns, selector, true)
                    .map(|o| report.counters.deleted += o.deleted),
                BulkOp::UpdateOne { selector, update } => {
                    self.update(ns, selector, update, false, false).map(|o| {
                        report.counters.matched += o.matched;
                        report.counters.modified += o.modified;
                    })
                }
                BulkOp::UpdateMany { selector, update } => {
                    self.update(ns, selector, update, false, true).map(|o| {
                        report.counters.matched += o.matched;
                        report.counters.modified += o.modified;
                    })
                }
                BulkOp::Upsert { selector, update } => {
                    self.update(ns, selector, update, true, false).map(|o| {
                        report.counters.matched += o.matched;
                        report.counters.modified += o.modified;
                        if let Some(id) = o.upserted_id {
                            report.counters.upserted += 1;
                            report.counters.upserted_ids.insert(i, id);
                        }
                    })
                }
            };
            if let Err(error) = outcome {
                report.failures.push(WriteFailure { index: i, error });
                if ordered {
                    break;
                }
            }
        }
        Ok(report)
    }

    fn list_indexes(&self, ns: &Ns) -> Result<Vec<Document>, StoreError> {
        Ok(self.with_coll(ns, |coll| {
            coll.map(|c| c.indexes.iter().map(|i| i.descriptor.clone()).collect())
                .unwrap_or_default()
        }))
    }

    fn create_index(
        &self,
        ns: &Ns,
        keys: &Document,
        options: &IndexOptions,
    ) -> Result<String, StoreError> {
        self.with_coll_mut(ns, |_, coll| {
            let name = match &options.name {
                Some(name) => name.clone(),
                None => default_index_name(keys),
            };
            if let Some(existing) = coll.indexes.iter().find(|i| i.name == name) {
                if existing.keys == *keys {
                    return Ok(name);
                }
                return Err(StoreError::failed(
                    85,
                    format!(
                        "an existing index has the same name as the requested index: {}",
                        name
                    ),
                ));
            }

            let mut descriptor = doc! {"v": 2, "key": keys.clone(), "name": name.clone()};
            if options.unique {
                descriptor.insert("unique", true);
            }
            if options.background {
                descriptor.insert("background", true);
            }
            if options.sparse {
                descriptor.insert("sparse", true);
            }
            if let Some(expire) = options.expire_after_seconds {
                descriptor.insert("expireAfterSeconds", i64::from(expire));
            }
            if let Some(filter) = &options.partial_filter {
                descriptor.insert("partialFilterExpression", filter.clone());
            }
            if let Some(min) = options.min {
                descriptor.insert("min", min);
            }
            if let Some(max) = options.max {
                descriptor.insert("max", max);
            }
            if let Some(bits) = options.bits {
                descriptor.insert("bits", bits);
            }
            if let Some(bucket_size) = options.bucket_size {
                descriptor.insert("bucketSize", bucket_size);
            }
            if let Some(language) = &options.default_language {
                descriptor.insert("default_language", language.clone());
            }
            if let Some(field) = &options.language_override {
                descriptor.insert("language_override", field.clone());
            }
            if let Some(weights) = &options.weights {
                descriptor.insert("weights", weights.clone());
                descriptor.insert("textIndexVersion", 3);
            }
            if let Some(collation) = &options.collation {
                descriptor.insert("collation", collation.clone());
            }

            debug!(index = %name, "created index");
            coll.indexes.push(MemIndex {
                name: name.clone(),
                keys: keys.clone(),
                unique: options.unique,
                descriptor,
            });
            Ok(name)
        })
    }

    fn drop_index(&self, ns: &Ns, name: &str) -> Result<(), StoreError> {
        if name == "_id_" {
            return Err(StoreError::failed(72, "cannot drop _id index"));
        }
        self.with_coll_mut(ns, |_, coll| {
            match coll.indexes.iter().position(|i| i.name == name) {
                Some(pos) => {
                    coll.indexes.remove(pos);
                    Ok(())
                }
                None => Err(StoreError::failed(
                    27,
                    format!("index not found with name [{}]", name),
                )),
            }
        })
    }

    fn drop_all_indexes(&self, ns: &Ns) -> Result<(), StoreError> {
        self.with_coll_mut(ns, |_, coll| {
            coll.indexes.retain(|i| i.name == "_id_");
            Ok(())
        })
    }

    fn run_command(&self, db: &str, cmd: &Document) -> Result<Document, StoreError> {
        let command = match cmd.keys().next() {
            Some(command) => command.as_str(),
            None => return Err(StoreError::failed(59, "empty command document")),
        };
        match command {
            "buildInfo" => Ok(doc! {
                "version": self.version.clone(),
                "gitVersion": "memstore",
                "bits": 64_i32,
                "debug": false,
                "maxBsonObjectSize": 16_777_216_i32,
                "ok": 1,
            }),
            "ping" => Ok(doc! {"ok": 1}),
            "listDatabases" => {
                let mut names: Vec<String> =
                    self.databases.iter().map(|e| e.key().clone()).collect();
                names.sort();
                let databases: Vec<Bson> = names
                    .into_iter()
                    .map(|name| Bson::Document(doc! {"name": name}))
                    .collect();
                Ok(doc! {"databases": databases, "ok": 1})
            }
            "explain" => {
                let inner = cmd.get_document("explain").ok().cloned().unwrap_or_default();
                let coll = inner.get_str("find").unwrap_or_default();
                let filter = inner.get_document("filter").ok().cloned().unwrap_or_default();
                Ok(doc! {
                    "queryPlanner": {
                        "namespace": format!("{}.{}", db, coll),
                        "parsedQuery": filter,
                        "winningPlan": {"stage": "COLLSCAN"},
                    },
                    "ok": 1,
                })
            }
            "aggregate" if cmd.get_bool("explain").unwrap_or(false) => {
                let coll = cmd.get_str("aggregate").unwrap_or_default();
                let stages = cmd.get_array("pipeline").ok().cloned().unwrap_or_default();
                Ok(doc! {
                    "queryPlanner": {
                        "namespace": format!("{}.{}", db, coll),
                        "winningPlan": {"stage": "COLLSCAN"},
                    },
                    "stages": stages,
                    "ok": 1,
                })
            }
            other => Err(StoreError::failed(
                59,
                format!("no such command: '{}'", other),
            )),
        }
    }

    fn list_collection_names(&self, db: &str) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = match self.databases.get(db) {
            Some(database) => database.collections.keys().cloned().collect(),
            None => Vec::new(),
        };
        names.sort();
        Ok(names)
    }

    fn create_collection(
        &self,
        ns: &Ns,
        _options: &CreateCollectionOptions,
    ) -> Result<(), StoreError> {
        let mut db = self.databases.entry(ns.db.clone()).or_default();
        if db.collections.contains_key(&ns.coll) {
            return Err(StoreError::failed(
                48,
                format!("a collection '{}' already exists", ns),
            ));
        }
        db.collections.insert(ns.coll.clone(), MemCollection::default());
        Ok(())
    }

    fn drop_collection(&self, ns: &Ns) -> Result<(), StoreError> {
        if let Some(mut db) = self.databases.get_mut(&ns.db) {
            db.collections.remove(&ns.coll);
        }
        Ok(())
    }

    fn drop_database(&self, db: &str) -> Result<(), StoreError> {
        self.databases.remove(db);
        Ok(())
    }
}

fn default_index_name(keys: &Document) -> String {
    let mut name = String::new();
    for (field, value) in keys {
        if !name.is_empty() {
            name.push('_');
        }
        name.push_str(field);
        name.push('_');
        match value {
            Bson::String(kind) => name.push_str(kind),
            other => name.push_str(&numeric(other).unwrap_or(1.0).to_string()),
        }
    }
    name
}
