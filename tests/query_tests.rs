//! End-to-end query and write behavior against the in-memory store.

use std::sync::Arc;

use bson::{doc, Bson, Document};
use serde::Deserialize;

use luma_mgo::store::mem::MemStore;
use luma_mgo::{Change, Collection, Error, Session, SessionConfig};

fn harness() -> (Session, Collection) {
    let session = Session::new(Arc::new(MemStore::new()), SessionConfig::default());
    let coll = session.c("items");
    (session, coll)
}

fn seed(coll: &Collection) {
    coll.insert(&[
        doc! {"_id": 1, "n": 10, "tag": "a"},
        doc! {"_id": 2, "n": 20, "tag": "b"},
        doc! {"_id": 3, "n": 30, "tag": "a"},
        doc! {"_id": 4, "n": 40, "tag": "c"},
    ])
    .unwrap();
}

#[derive(Debug, Deserialize, PartialEq)]
struct Item {
    #[serde(rename = "_id")]
    id: i64,
    n: i64,
}

#[test]
fn find_sort_skip_limit_select() -> anyhow::Result<()> {
    let (_session, coll) = harness();
    seed(&coll);

    let items: Vec<Item> = coll
        .find(None)
        .sort(&["-n"])
        .skip(1)
        .limit(2)
        .select(doc! {"n": 1})
        .all()?;
    assert_eq!(
        items,
        vec![Item { id: 3, n: 30 }, Item { id: 2, n: 20 }]
    );
    Ok(())
}

#[test]
fn one_reports_not_found() {
    let (_session, coll) = harness();
    seed(&coll);

    let found: Item = coll.find(doc! {"n": 20}).one().unwrap();
    assert_eq!(found, Item { id: 2, n: 20 });

    let missing = coll.find(doc! {"n": 999}).one::<Item>();
    assert!(matches!(missing, Err(Error::NotFound)));
}

#[test]
fn exists_does_not_decode() -> anyhow::Result<()> {
    let (_session, coll) = harness();
    seed(&coll);
    assert!(coll.find(doc! {"tag": "b"}).exists()?);
    assert!(!coll.find(doc! {"tag": "z"}).exists()?);
    Ok(())
}

#[test]
fn count_honors_skip_and_limit() -> anyhow::Result<()> {
    let (_session, coll) = harness();
    seed(&coll);
    assert_eq!(coll.count()?, 4);
    assert_eq!(coll.find(doc! {"tag": "a"}).count()?, 2);
    assert_eq!(coll.find(None).skip(3).count()?, 1);
    assert_eq!(coll.find(None).limit(2).count()?, 2);
    Ok(())
}

#[test]
fn distinct_preserves_first_seen_order() -> anyhow::Result<()> {
    let (_session, coll) = harness();
    seed(&coll);
    let tags: Vec<String> = coll.find(None).distinct("tag")?;
    assert_eq!(tags, vec!["a", "b", "c"]);
    Ok(())
}

#[test]
fn iter_yields_decoded_documents() -> anyhow::Result<()> {
    let (_session, coll) = harness();
    seed(&coll);
    let mut total = 0;
    for item in coll.find(None).sort(&["n"]).iter::<Item>() {
        total += item?.n;
    }
    assert_eq!(total, 100);
    Ok(())
}

#[test]
fn bad_hint_surfaces_from_terminal_calls() {
    let (_session, coll) = harness();
    seed(&coll);
    let query = coll.find(None).hint(&["$bogus:"]);
    let err = query.count().unwrap_err();
    assert!(matches!(err, Error::InvalidIndexKey { .. }));
}

#[test]
fn find_id_converts_hex_strings() -> anyhow::Result<()> {
    let (_session, coll) = harness();
    let id = bson::oid::ObjectId::new();
    coll.insert(&[doc! {"_id": id, "n": 7}])?;

    let found: Document = coll.find_id(id.to_hex()).one()?;
    assert_eq!(found.get_object_id("_id").unwrap(), id);
    Ok(())
}

#[test]
fn update_replaces_and_falls_back_to_operators() -> anyhow::Result<()> {
    let (_session, coll) = harness();
    seed(&coll);

    // Plain document: whole-document replacement.
    coll.update(doc! {"_id": 1}, doc! {"n": 11, "tag": "a"})?;
    let replaced: Document = coll.find_id(1).one()?;
    assert_eq!(replaced.get_i32("n")?, 11);

    // Operator document: the replace attempt is rejected by the store and
    // retried as an operator update.
    coll.update(doc! {"_id": 2}, doc! {"$inc": {"n": 5}})?;
    let bumped: Document = coll.find_id(2).one()?;
    assert_eq!(bumped.get_i64("n")?, 25);
    assert_eq!(bumped.get_str("tag")?, "b");
    Ok(())
}

#[test]
fn update_reports_not_found() {
    let (_session, coll) = harness();
    seed(&coll);
    let err = coll.update(doc! {"_id": 99}, doc! {"$set": {"n": 0}});
    assert!(matches!(err, Err(Error::NotFound)));

    let err = coll.update_id(99, doc! {"n": 0});
    assert!(matches!(err, Err(Error::NotFound)));
}

#[test]
fn update_all_never_reports_not_found() -> anyhow::Result<()> {
    let (_session, coll) = harness();
    seed(&coll);

    let info = coll.update_all(doc! {"tag": "a"}, doc! {"$set": {"seen": true}})?;
    assert_eq!(info.updated, 2);
    assert_eq!(info.matched, 2);

    let info = coll.update_all(doc! {"tag": "z"}, doc! {"$set": {"seen": true}})?;
    assert_eq!(info.updated, 0);
    assert_eq!(info.matched, 0);
    Ok(())
}

#[test]
fn zero_effect_update_matches_without_modifying() -> anyhow::Result<()> {
    let (_session, coll) = harness();
    seed(&coll);
    let info = coll.update_all(doc! {"_id": 1}, doc! {"$set": {"n": 10}})?;
    assert_eq!(info.matched, 1);
    assert_eq!(info.updated, 0);
    Ok(())
}

#[test]
fn upsert_suppresses_not_found_and_reports_the_id() -> anyhow::Result<()> {
    let (_session, coll) = harness();
    seed(&coll);

    // Existing document: a plain update, no upserted id.
    let info = coll.upsert(doc! {"_id": 1}, doc! {"$set": {"n": 100}})?;
    assert_eq!(info.updated, 1);
    assert!(info.upserted_id.is_none());

    // Missing document: inserted, id echoed back.
    let info = coll.upsert(doc! {"k": 999}, doc! {"k": 999, "n": 1})?;
    assert_eq!(info.updated, 0);
    assert!(info.upserted_id.is_some());
    assert_eq!(coll.count_by(doc! {"k": 999})?, 1);
    Ok(())
}

#[test]
fn remove_semantics() -> anyhow::Result<()> {
    let (_session, coll) = harness();
    seed(&coll);

    coll.remove(doc! {"tag": "a"})?;
    assert_eq!(coll.count()?, 3);

    // Removing a missing document is a no-op, not an error.
    coll.remove(doc! {"tag": "z"})?;

    let info = coll.remove_all(doc! {"tag": "a"})?;
    assert_eq!(info.removed, 1);
    assert_eq!(coll.count()?, 2);
    Ok(())
}

#[test]
fn apply_update_returns_the_requested_image() -> anyhow::Result<()> {
    let (_session, coll) = harness();
    seed(&coll);

    let (info, before) = coll.find(doc! {"_id": 1}).apply::<Document>(Change {
        update: Some(doc! {"$inc": {"n": 1}}),
        ..Change::default()
    })?;
    assert_eq!(info.updated, 1);
    assert_eq!(before.unwrap().get_i32("n")?, 10);

    let (info, after) = coll.find(doc! {"_id": 1}).apply::<Document>(Change {
        update: Some(doc! {"$inc": {"n": 1}}),
        return_new: true,
        ..Change::default()
    })?;
    assert_eq!(info.updated, 1);
    assert_eq!(after.unwrap().get_i64("n")?, 12);
    Ok(())
}

#[test]
fn apply_remove_returns_the_removed_document() -> anyhow::Result<()> {
    let (_session, coll) = harness();
    seed(&coll);

    let (info, removed) = coll.find(doc! {"_id": 4}).apply::<Document>(Change {
        remove: true,
        ..Change::default()
    })?;
    assert_eq!(info.removed, 1);
    assert_eq!(removed.unwrap().get_i32("_id")?, 4);
    assert_eq!(coll.count()?, 3);

    let missing = coll.find(doc! {"_id": 4}).apply::<Document>(Change {
        remove: true,
        ..Change::default()
    });
    assert!(matches!(missing, Err(Error::NotFound)));
    Ok(())
}

#[test]
fn apply_upsert_and_not_found() {
    let (_session, coll) = harness();
    seed(&coll);

    let missing = coll.find(doc! {"_id": 99}).apply::<Document>(Change {
        update: Some(doc! {"$set": {"n": 0}}),
        ..Change::default()
    });
    assert!(matches!(missing, Err(Error::NotFound)));

    let (info, new_doc) = coll
        .find(doc! {"_id": 99})
        .apply::<Document>(Change {
            update: Some(doc! {"$set": {"n": 5}}),
            upsert: true,
            return_new: true,
            ..Change::default()
        })
        .unwrap();
    assert_eq!(info.updated, 1);
    assert_eq!(new_doc.unwrap().get_i64("n").unwrap(), 5);
}

#[test]
#[should_panic(expected = "Apply: Change.update not set")]
fn apply_without_update_panics() {
    let (_session, coll) = harness();
    let _ = coll
        .find(doc! {"_id": 1})
        .apply::<Document>(Change::default());
}

#[test]
fn explain_runs_against_the_store() -> anyhow::Result<()> {
    let (_session, coll) = harness();
    seed(&coll);
    let plan = coll.find(doc! {"n": {"$gt": 15}}).explain()?;
    assert!(plan.get_document("queryPlanner").is_ok());
    Ok(())
}

#[test]
fn allow_disk_use_requires_a_known_compatible_version() -> anyhow::Result<()> {
    // 4.2 sits inside the supported window, so the option reaches the
    // store; the call must succeed either way.
    let session = Session::connect(Arc::new(MemStore::new()), SessionConfig::default())?;
    let coll = session.c("items");
    coll.insert(&[doc! {"_id": 1}])?;
    let docs: Vec<Document> = coll.find(None).allow_disk_use().all()?;
    assert_eq!(docs.len(), 1);

    // 5.0 is outside the window; the option degrades to a no-op.
    let session = Session::connect(
        Arc::new(MemStore::with_version("5.0.9")),
        SessionConfig::default(),
    )?;
    let coll = session.c("items");
    coll.insert(&[doc! {"_id": 1}])?;
    let docs: Vec<Document> = coll.find(None).allow_disk_use().all()?;
    assert_eq!(docs.len(), 1);
    Ok(())
}

#[test]
fn pipe_aggregates_and_decodes() -> anyhow::Result<()> {
    let (_session, coll) = harness();
    seed(&coll);

    let out: Vec<Document> = coll
        .pipe(vec![
            doc! {"$match": {"n": {"$gte": 20}}},
            doc! {"$sort": {"n": -1}},
            doc! {"$limit": 2},
        ])
        .all()?;
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].get_i32("_id")?, 4);

    let totals: Vec<Document> = coll
        .pipe(vec![
            doc! {"$group": {"_id": Bson::Null, "total": {"$sum": "$n"}}},
        ])
        .all()?;
    assert_eq!(totals[0].get_f64("total")?, 100.0);
    Ok(())
}

#[test]
fn session_surface() -> anyhow::Result<()> {
    let (session, coll) = harness();
    seed(&coll);

    session.ping()?;
    let info = session.build_info()?;
    assert_eq!(info.version, "4.2.14");
    assert_eq!(info.version_array, vec![4, 2, 14, 0]);

    let names = session.database_names()?;
    assert!(names.contains(&"test".to_string()));

    let colls = session.db("test").collection_names()?;
    assert_eq!(colls, vec!["items".to_string()]);
    Ok(())
}
