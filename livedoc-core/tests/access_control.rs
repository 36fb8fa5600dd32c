//! Allow/deny enforcement through the method boundary

use livedoc_core::config::Config;
use livedoc_core::core_access::ValidatorRules;
use livedoc_core::core_collection::{
    CollectionError, CollectionOptions, LiveDb, MethodInvocation, MutationOptions, ALLOW_DENY_HOOK_TAG,
};
use livedoc_core::core_doc::{IdGeneration, Selector};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn db() -> LiveDb {
    let mut config = Config::default();
    config.pubsub.enabled = false;
    LiveDb::new(config)
}

async fn call(db: &LiveDb, method: &str, actor: &str, args: Value) -> Result<Value, CollectionError> {
    db.call(method, MethodInvocation::as_actor(actor), args).await
}

#[tokio::test]
async fn test_deny_wins_over_allow() {
    let db = db();
    let items = db.collection("items").unwrap();
    items.allow(ValidatorRules::new().insert(|_, _| true)).unwrap();
    items
        .deny(ValidatorRules::new().insert(|_, doc| doc.get("banned") == Some(&json!(true))))
        .unwrap();

    call(&db, "/items/insertOne", "u1", json!([{"_id": "ok"}])).await.unwrap();
    let err = call(&db, "/items/insertOne", "u1", json!([{"_id": "no", "banned": true}]))
        .await
        .unwrap_err();
    assert!(err.is_access_denied());
    assert!(items.find_one(&Selector::new(json!("no")), None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_restricted_without_allow_rules_denies() {
    let db = db();
    let items = db.collection("items").unwrap();
    items.deny(ValidatorRules::new().update(|_, _, _, _| false)).unwrap();
    items
        .insert_one(json!({"_id": "a", "n": 1}).as_object().cloned().unwrap(), MutationOptions::new())
        .await
        .unwrap();

    let err = call(&db, "/items/updateOne", "u1", json!(["a", {"$set": {"n": 2}}]))
        .await
        .unwrap_err();
    assert!(err.is_access_denied());
    let err = call(&db, "/items/deleteOne", "u1", json!(["a"])).await.unwrap_err();
    assert!(err.is_access_denied());
}

#[tokio::test]
async fn test_replacement_and_rename_rejected_before_validators() {
    let db = db();
    let items = db.collection("items").unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    items
        .allow(ValidatorRules::new().update(move |_, _, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        }))
        .unwrap();
    items
        .insert_one(json!({"_id": "a", "name": "old"}).as_object().cloned().unwrap(), MutationOptions::new())
        .await
        .unwrap();

    let err = call(&db, "/items/updateOne", "u1", json!(["a", {"name": "x"}]))
        .await
        .unwrap_err();
    assert!(err.is_access_denied());
    let err = call(&db, "/items/updateOne", "u1", json!(["a", {"$rename": {"name": "title"}}]))
        .await
        .unwrap_err();
    assert!(err.is_access_denied());
    let err = call(&db, "/items/updateOne", "u1", json!(["a", {"$set": {"n": 1}}, {"upsert": true}]))
        .await
        .unwrap_err();
    assert!(err.is_access_denied());
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    call(&db, "/items/updateOne", "u1", json!(["a", {"$set": {"name": "new"}}]))
        .await
        .unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_client_cannot_claim_trust() {
    let db = db();
    let items = db.collection("items").unwrap();
    items.allow(ValidatorRules::new().remove(|_, _| false)).unwrap();
    items
        .insert_one(json!({"_id": "a"}).as_object().cloned().unwrap(), MutationOptions::new())
        .await
        .unwrap();

    let err = call(&db, "/items/deleteOne", "u1", json!(["a", {"isInsecure": false}]))
        .await
        .unwrap_err();
    assert!(err.is_access_denied());

    // The same operation from trusted code is not checked
    let result = items
        .delete_one(&Selector::new(json!("a")), MutationOptions::new())
        .await
        .unwrap();
    assert_eq!(result.deleted, 1);
}

#[tokio::test]
async fn test_validators_see_actor_and_fetched_fields() {
    let db = db();
    let items = db.collection("items").unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    items
        .allow(
            ValidatorRules::new()
                .remove(move |actor, doc| {
                    log.lock().unwrap().push(doc.clone());
                    actor == doc.get("owner").and_then(Value::as_str)
                })
                .fetch(["owner"]),
        )
        .unwrap();
    items
        .insert_one(
            json!({"_id": "a", "owner": "u1", "body": "long text"}).as_object().cloned().unwrap(),
            MutationOptions::new(),
        )
        .await
        .unwrap();

    let err = call(&db, "/items/deleteOne", "u2", json!(["a"])).await.unwrap_err();
    assert!(err.is_access_denied());
    call(&db, "/items/deleteOne", "u1", json!(["a"])).await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|d| !d.contains_key("body")));
}

#[tokio::test]
async fn test_denied_insert_does_not_leak_generated_id() {
    let db = db();
    let minted = Arc::new(AtomicUsize::new(0));
    let counter = minted.clone();
    let items = db
        .collection_with(
            "items",
            CollectionOptions::new().id_generation(IdGeneration::Custom(Arc::new(move || {
                format!("id{}", counter.fetch_add(1, Ordering::SeqCst))
            }))),
        )
        .unwrap();
    let seen_ids = Arc::new(Mutex::new(Vec::new()));
    let log = seen_ids.clone();
    items
        .allow(ValidatorRules::new().insert(move |_, doc| {
            log.lock().unwrap().push(doc.get("_id").cloned());
            doc.get("ok") == Some(&json!(true))
        }))
        .unwrap();

    let err = call(&db, "/items/insertOne", "u1", json!([{"ok": false}])).await.unwrap_err();
    assert!(err.is_access_denied());
    let out = call(&db, "/items/insertOne", "u1", json!([{"ok": true}])).await.unwrap();

    // Validators saw an id both times; only the approved one was stored
    let seen_ids = seen_ids.lock().unwrap();
    assert!(seen_ids.iter().all(Option::is_some));
    assert_eq!(out["id"], json!("id1"));
    assert!(items.find_one(&Selector::new(json!("id0")), None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_disabling_the_tag_skips_checks() {
    let db = db();
    let items = db.collection("items").unwrap();
    items.allow(ValidatorRules::new().insert(|_, _| false)).unwrap();
    assert!(call(&db, "/items/insertOne", "u1", json!([{"_id": "a"}])).await.is_err());

    items.hooks().disable_tag(ALLOW_DENY_HOOK_TAG);
    call(&db, "/items/insertOne", "u1", json!([{"_id": "a"}])).await.unwrap();
}

#[test]
fn test_rules_on_collection_without_methods() {
    let db = db();
    let items = db
        .collection_with("local", CollectionOptions::new().define_mutation_methods(false))
        .unwrap();
    let err = items.allow(ValidatorRules::new()).unwrap_err();
    assert!(err.is_configuration());
    assert!(!db.methods().contains("/local/insertOne"));
}
