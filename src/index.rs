//! Index key compiler.
//!
//! Index keys use the legacy token vocabulary: a bare field name is an
//! ascending key, `-field` is descending, `$<kind>:field` selects a special
//! index kind (`2d`, `2dsphere`, `geoHaystack`, `text`, ...), and `@field`
//! is the legacy alias for `$2d:field`. Tokens parse into an explicit
//! tagged variant so the grammar's edge cases stay testable, instead of the
//! historic nested character-prefix inspection.

use std::collections::BTreeMap;
use std::time::Duration;

use bson::{doc, Bson, Document};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::query::Collation;
use crate::store::IndexOptions;

/// Parsed form of one index key token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    Ascending,
    Descending,
    /// A named index kind such as `2d`, `2dsphere`, or `geoHaystack`.
    Spatial(String),
    /// A text index field, weighted rather than ordered.
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyToken {
    pub field: String,
    pub kind: KeyKind,
}

/// Parses one token of the `[$<kind>:][-]<field name>` grammar.
///
/// A kind marker combined with a descending marker is inconsistent and
/// rejected; `+` is an explicit ascending marker and compatible with any
/// kind.
pub fn parse_key_token(raw: &str) -> Result<KeyToken> {
    let invalid = || Error::InvalidIndexKey {
        raw: raw.to_string(),
    };

    let mut rest = raw;
    let mut kind: Option<&str> = None;
    if let Some(stripped) = rest.strip_prefix('$') {
        let c = stripped.find(':').ok_or_else(invalid)?;
        if c < 1 || c + 1 >= stripped.len() {
            return Err(invalid());
        }
        kind = Some(&stripped[..c]);
        rest = &stripped[c + 1..];
    } else if let Some(stripped) = rest.strip_prefix('@') {
        kind = Some("2d");
        rest = stripped;
    }

    let mut descending = false;
    if let Some(stripped) = rest.strip_prefix('-') {
        descending = true;
        rest = stripped;
    } else if let Some(stripped) = rest.strip_prefix('+') {
        rest = stripped;
    }
    if rest.is_empty() {
        return Err(invalid());
    }

    let kind = match (kind, descending) {
        (None, false) => KeyKind::Ascending,
        (None, true) => KeyKind::Descending,
        (Some(_), true) => return Err(invalid()),
        (Some("text"), false) => KeyKind::Text,
        (Some(k), false) => KeyKind::Spatial(k.to_string()),
    };
    Ok(KeyToken {
        field: rest.to_string(),
        kind,
    })
}

/// Compiled index key: the ordered key document, the derived name, and the
/// text weights (empty unless the key has text fields).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexKeyInfo {
    pub name: String,
    pub key: Document,
    pub weights: Document,
}

/// Compiles an ordered token list into an [`IndexKeyInfo`].
///
/// The `_fts`/`_ftsx` pair is injected exactly once, on the first text
/// field; every text field lands in the weights with default weight 1. The
/// derived name joins per-field `field_suffix` fragments with `_`, where
/// the suffix is the numeric order or the kind string.
pub fn parse_index_key<S: AsRef<str>>(key: &[S]) -> Result<IndexKeyInfo> {
    let mut info = IndexKeyInfo::default();
    let mut is_text = false;
    for raw in key {
        let token = parse_key_token(raw.as_ref())?;
        if !info.name.is_empty() {
            info.name.push('_');
        }
        match token.kind {
            KeyKind::Ascending => {
                info.name.push_str(&token.field);
                info.name.push_str("_1");
                info.key.insert(token.field, 1_i32);
            }
            KeyKind::Descending => {
                info.name.push_str(&token.field);
                info.name.push_str("_-1");
                info.key.insert(token.field, -1_i32);
            }
            KeyKind::Spatial(kind) => {
                info.name.push_str(&token.field);
                info.name.push('_');
                info.name.push_str(&kind);
                info.key.insert(token.field, kind);
            }
            KeyKind::Text => {
                info.name.push_str(&token.field);
                info.name.push_str("_text");
                if !is_text {
                    info.key.insert("_fts", "text");
                    info.key.insert("_ftsx", 1_i32);
                    is_text = true;
                }
                info.weights.insert(token.field, 1_i32);
            }
        }
    }
    if info.name.is_empty() {
        return Err(Error::EmptyIndexKey);
    }
    Ok(info)
}

/// Decompiles a stored key document back into the token vocabulary, so
/// listed indexes compare against what `ensure_index` accepted.
pub fn simple_index_key(real_key: &Document) -> Result<Vec<String>> {
    let mut key = Vec::with_capacity(real_key.len());
    for (field, value) in real_key {
        let order = match value {
            Bson::Int32(n) => i64::from(*n),
            Bson::Int64(n) => *n,
            Bson::Double(f) => *f as i64,
            Bson::String(kind) => {
                key.push(format!("${}:{}", kind, field));
                continue;
            }
            _ => {
                return Err(Error::InvalidIndexKey {
                    raw: field.to_string(),
                })
            }
        };
        match order {
            1 => key.push(field.to_string()),
            -1 => key.push(format!("-{}", field)),
            _ => {
                return Err(Error::InvalidIndexKey {
                    raw: field.to_string(),
                })
            }
        }
    }
    Ok(key)
}

/// User-facing index description.
#[derive(Debug, Clone, Default)]
pub struct Index {
    /// Index key tokens; prefix a name with `-` for descending order.
    pub key: Vec<String>,
    /// Prevent two documents from sharing the same index key.
    pub unique: bool,
    /// Build in background and return immediately.
    pub background: bool,
    /// Only index documents containing the key fields.
    pub sparse: bool,
    /// Partial index filter expression.
    pub partial_filter: Option<Document>,
    /// Periodically delete documents whose indexed time value is older
    /// than the given delta.
    pub expire_after: Option<Duration>,
    /// Stored index name. Computed from the key when unset.
    pub name: Option<String>,

    // Spatial index properties.
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub bits: Option<i32>,
    pub bucket_size: Option<f64>,

    // Text index properties.
    pub default_language: Option<String>,
    pub language_override: Option<String>,
    /// Significance of each field relative to the other indexed fields.
    /// Fields without an explicit entry weigh 1.
    pub weights: BTreeMap<String, i32>,

    pub collation: Option<Collation>,
}

impl Index {
    /// Compiles the index into the key document and creation options the
    /// store consumes. The derived name is used unless one was assigned.
    pub fn to_create_request(&self) -> Result<(Document, IndexOptions)> {
        let info = parse_index_key(&self.key)?;

        let mut weights = info.weights;
        for (field, weight) in &self.weights {
            weights.insert(field, *weight);
        }

        let mut options = IndexOptions {
            name: Some(self.name.clone().unwrap_or(info.name)),
            unique: self.unique,
            background: self.background,
            sparse: self.sparse,
            partial_filter: self.partial_filter.clone(),
            min: self.min,
            max: self.max,
            bits: self.bits,
            bucket_size: self.bucket_size,
            default_language: self.default_language.clone(),
            language_override: self.language_override.clone(),
            ..IndexOptions::default()
        };
        if let Some(expire) = self.expire_after {
            if expire.as_secs() > 0 {
                options.expire_after_seconds = Some(expire.as_secs() as i32);
            }
        }
        if !weights.is_empty() {
            options.weights = Some(weights);
        }
        if let Some(collation) = &self.collation {
            options.collation = Some(bson::to_document(collation)?);
        }
        Ok((info.key, options))
    }
}

#[derive(Debug, Deserialize)]
struct RawIndexSpec {
    name: String,
    #[serde(default)]
    key: Document,
    #[serde(default)]
    unique: bool,
    #[serde(default)]
    background: bool,
    #[serde(default)]
    sparse: bool,
    #[serde(default)]
    bits: i32,
    #[serde(default)]
    min: f64,
    #[serde(default)]
    max: f64,
    #[serde(default, rename = "bucketSize")]
    bucket_size: f64,
    #[serde(default, rename = "expireAfterSeconds")]
    expire_after_seconds: i64,
    #[serde(default)]
    weights: Document,
    #[serde(default)]
    default_language: String,
    #[serde(default)]
    language_override: String,
    #[serde(default, rename = "textIndexVersion")]
    text_index_version: i32,
    #[serde(default, rename = "partialFilterExpression")]
    partial_filter_expression: Option<Document>,
    #[serde(default)]
    collation: Option<Collation>,
}

/// Rebuilds an [`Index`] from a stored raw descriptor. Text indexes
/// reconstruct their `$text:field` tokens from the stored weights.
pub(crate) fn index_from_raw(raw: Document) -> Result<Index> {
    let spec: RawIndexSpec = bson::from_document(raw)?;
    let mut index = Index {
        key: simple_index_key(&spec.key)?,
        unique: spec.unique,
        background: spec.background,
        sparse: spec.sparse,
        partial_filter: spec.partial_filter_expression,
        name: Some(spec.name),
        ..Index::default()
    };
    if spec.expire_after_seconds > 0 {
        index.expire_after = Some(Duration::from_secs(spec.expire_after_seconds as u64));
    }
    if spec.min != 0.0 || spec.max != 0.0 {
        index.min = Some(spec.min);
        index.max = Some(spec.max);
    }
    if spec.bits > 0 {
        index.bits = Some(spec.bits);
    }
    if spec.bucket_size > 0.0 {
        index.bucket_size = Some(spec.bucket_size);
    }
    if !spec.default_language.is_empty() {
        index.default_language = Some(spec.default_language);
    }
    if !spec.language_override.is_empty() {
        index.language_override = Some(spec.language_override);
    }
    index.collation = spec.collation;
    if spec.text_index_version > 0 {
        index.key = Vec::with_capacity(spec.weights.len());
        for (field, weight) in &spec.weights {
            index.key.push(format!("$text:{}", field));
            if let Some(w) = weight.as_i32().or_else(|| weight.as_i64().map(|w| w as i32)) {
                index.weights.insert(field.to_string(), w);
            }
        }
    }
    Ok(index)
}

/// The `_id` index key document every collection carries.
pub(crate) fn id_index_key() -> Document {
    doc! {"_id": 1_i32}
}
