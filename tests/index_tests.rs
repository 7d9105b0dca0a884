//! Index vocabulary behavior end to end: token compilation, derived
//! names, text key injection, and index DDL.

use std::sync::Arc;
use std::time::Duration;

use bson::doc;

use luma_mgo::store::mem::MemStore;
use luma_mgo::{Collection, CollectionInfo, Error, Index, Session, SessionConfig};

fn collection() -> Collection {
    Session::new(Arc::new(MemStore::new()), SessionConfig::default()).c("items")
}

#[test]
fn ensure_index_key_derives_the_legacy_name() -> anyhow::Result<()> {
    let coll = collection();
    coll.ensure_index_key(&["-b"])?;

    let indexes = coll.indexes()?;
    let created = indexes
        .iter()
        .find(|i| i.name.as_deref() == Some("b_-1"))
        .expect("descending index missing");
    assert_eq!(created.key, vec!["-b"]);
    Ok(())
}

#[test]
fn compound_and_kind_keys_round_trip() -> anyhow::Result<()> {
    let coll = collection();
    coll.ensure_index_key(&["a", "-b", "$2dsphere:loc"])?;

    let indexes = coll.indexes()?;
    let created = indexes
        .iter()
        .find(|i| i.name.as_deref() == Some("a_1_b_-1_loc_2dsphere"))
        .expect("compound index missing");
    assert_eq!(created.key, vec!["a", "-b", "$2dsphere:loc"]);
    Ok(())
}

#[test]
fn at_prefix_is_a_2d_alias() -> anyhow::Result<()> {
    let coll = collection();
    coll.ensure_index_key(&["@loc"])?;

    let indexes = coll.indexes()?;
    assert!(indexes
        .iter()
        .any(|i| i.name.as_deref() == Some("loc_2d") && i.key == vec!["$2d:loc"]));
    Ok(())
}

#[test]
fn text_indexes_surface_their_weights() -> anyhow::Result<()> {
    let coll = collection();
    let mut index = Index {
        key: vec!["$text:title".to_string(), "$text:body".to_string()],
        ..Index::default()
    };
    index.weights.insert("title".to_string(), 5);
    coll.ensure_index(index)?;

    let indexes = coll.indexes()?;
    let created = indexes
        .iter()
        .find(|i| i.key.contains(&"$text:title".to_string()))
        .expect("text index missing");
    assert!(created.key.contains(&"$text:body".to_string()));
    assert_eq!(created.weights.get("title"), Some(&5));
    assert_eq!(created.weights.get("body"), Some(&1));
    Ok(())
}

#[test]
fn ensure_index_carries_options_through() -> anyhow::Result<()> {
    let coll = collection();
    coll.ensure_index(Index {
        key: vec!["expiry".to_string()],
        unique: true,
        sparse: true,
        expire_after: Some(Duration::from_secs(3600)),
        ..Index::default()
    })?;

    let indexes = coll.indexes()?;
    let created = indexes
        .iter()
        .find(|i| i.name.as_deref() == Some("expiry_1"))
        .expect("ttl index missing");
    assert!(created.unique);
    assert!(created.sparse);
    assert_eq!(created.expire_after, Some(Duration::from_secs(3600)));
    Ok(())
}

#[test]
fn unique_index_is_enforced_on_insert() -> anyhow::Result<()> {
    let coll = collection();
    coll.ensure_index(Index {
        key: vec!["email".to_string()],
        unique: true,
        ..Index::default()
    })?;

    coll.insert(&[doc! {"email": "a@b.c"}])?;
    let err = coll.insert(&[doc! {"email": "a@b.c"}]).unwrap_err();
    assert!(luma_mgo::is_dup(&err));
    Ok(())
}

#[test]
fn drop_index_matches_keys_in_any_order() -> anyhow::Result<()> {
    let coll = collection();
    coll.ensure_index_key(&["a", "-b"])?;

    // The same key set given in a different order still identifies the
    // index.
    coll.drop_index(&["-b", "a"])?;
    assert!(coll.indexes()?.iter().all(|i| i.key != vec!["a", "-b"]));

    let err = coll.drop_index(&["missing"]).unwrap_err();
    assert!(matches!(err, Error::IndexNotFound));
    Ok(())
}

#[test]
fn the_id_index_cannot_be_dropped() {
    let coll = collection();
    coll.insert(&[doc! {"_id": 1}]).unwrap();

    assert!(coll.drop_index_name("_id_").is_err());
    coll.drop_all_indexes().unwrap();
    let indexes = coll.indexes().unwrap();
    assert_eq!(indexes.len(), 1);
    assert_eq!(indexes[0].name.as_deref(), Some("_id_"));
}

#[test]
fn ensure_index_is_idempotent() -> anyhow::Result<()> {
    let coll = collection();
    coll.ensure_index_key(&["a"])?;
    coll.ensure_index_key(&["a"])?;
    assert_eq!(
        coll.indexes()?
            .iter()
            .filter(|i| i.name.as_deref() == Some("a_1"))
            .count(),
        1
    );
    Ok(())
}

#[test]
fn degenerate_keys_are_rejected_not_panicked() {
    let coll = collection();
    for key in ["", "-", "@", "$text:", "$:a", "@-loc", "$2d:-loc"] {
        let err = coll.ensure_index_key(&[key]).unwrap_err();
        assert!(
            matches!(err, Error::InvalidIndexKey { .. } | Error::EmptyIndexKey),
            "key {:?} produced {:?}",
            key,
            err
        );
    }
}

#[test]
fn create_collection_validates_capped_options() {
    let coll = collection();
    let err = coll
        .create(&CollectionInfo {
            capped: true,
            ..CollectionInfo::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::Usage(_)));

    coll.create(&CollectionInfo {
        capped: true,
        max_bytes: 4096,
        ..CollectionInfo::default()
    })
    .unwrap();

    // Creating the same collection twice is a store-level failure.
    assert!(coll.create(&CollectionInfo::default()).is_err());
}
