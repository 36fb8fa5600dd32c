/*
    memory.rs - In-memory document store

    Keeps every collection in a BTreeMap keyed by id and records each write
    in a ChangeLog while the write lock is held, so log order equals apply
    order. Used by tests, the CLI and embedders that want a process-local
    store.
*/

use crate::core_doc::{
    apply_mutator, mutator::set_path, DocId, Document, IdGeneration, Projection, QueryDescription, Selector,
    ID_FIELD,
};
use crate::core_store::change_log::{ChangeLog, LogOp};
use crate::core_store::errors::{StoreError, StoreResult};
use crate::core_store::traits::{DeleteResult, DocumentStore, InsertResult, Snapshot, UpdateResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use tracing::trace;

/// Helper to convert poison errors into StoreError
fn handle_poison<T>(_err: PoisonError<T>) -> StoreError {
    StoreError::Storage("Lock poisoned: a thread panicked while holding the lock".to_string())
}

type CollectionData = BTreeMap<DocId, Document>;

/// Process-local store with an ordered change log
pub struct MemoryStore {
    collections: RwLock<HashMap<String, CollectionData>>,
    change_log: ChangeLog,
    id_generation: IdGeneration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_log_capacity(1024)
    }

    pub fn with_log_capacity(capacity: usize) -> Self {
        MemoryStore {
            collections: RwLock::new(HashMap::new()),
            change_log: ChangeLog::new(capacity),
            id_generation: IdGeneration::String,
        }
    }

    /// Id strategy for documents created by upserts
    pub fn with_id_generation(mut self, id_generation: IdGeneration) -> Self {
        self.id_generation = id_generation;
        self
    }

    /// Number of documents in a collection
    pub fn count(&self, collection: &str) -> StoreResult<usize> {
        let collections = self.collections.read().map_err(handle_poison)?;
        Ok(collections.get(collection).map(BTreeMap::len).unwrap_or(0))
    }

    fn first_match<'a>(data: &'a CollectionData, selector: &Selector) -> Option<&'a DocId> {
        if let Some(id) = selector.single_id() {
            return data.get_key_value(&id).map(|(k, _)| k);
        }
        data.iter().find(|(_, doc)| selector.matches(doc)).map(|(id, _)| id)
    }

    fn upsert_seed(&self, selector: &Selector) -> StoreResult<Document> {
        let mut seed = Document::new();
        if let Some(fields) = selector.as_value().as_object() {
            for (path, cond) in fields {
                if path.starts_with('$') || path == ID_FIELD {
                    continue;
                }
                let is_operator = cond
                    .as_object()
                    .map(|m| m.keys().any(|k| k.starts_with('$')))
                    .unwrap_or(false);
                if !is_operator {
                    set_path(&mut seed, path, cond.clone())?;
                }
            }
        }
        let id = selector.single_id().unwrap_or_else(|| self.id_generation.generate());
        seed.insert(ID_FIELD.to_string(), id.to_value());
        Ok(seed)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert(&self, collection: &str, doc: Document) -> StoreResult<InsertResult> {
        let id = DocId::of(&doc).ok_or_else(|| {
            StoreError::InvalidOperation(format!("document inserted into {} has no {}", collection, ID_FIELD))
        })?;

        let mut collections = self.collections.write().map_err(handle_poison)?;
        let data = collections.entry(collection.to_string()).or_default();
        if data.contains_key(&id) {
            return Err(StoreError::DuplicateId {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        data.insert(id.clone(), doc.clone());
        let seq = self.change_log.append(collection, LogOp::Insert { doc });
        trace!(collection, id = %id, seq, "inserted");

        Ok(InsertResult { id })
    }

    async fn update_one(
        &self,
        collection: &str,
        selector: &Selector,
        mutator: &Value,
        upsert: bool,
    ) -> StoreResult<UpdateResult> {
        let mut collections = self.collections.write().map_err(handle_poison)?;
        let data = collections.entry(collection.to_string()).or_default();

        let Some(id) = Self::first_match(data, selector).cloned() else {
            if !upsert {
                return Ok(UpdateResult::default());
            }
            let mut doc = self.upsert_seed(selector)?;
            apply_mutator(&mut doc, mutator, true)?;
            let id = DocId::of(&doc)
                .ok_or_else(|| StoreError::InvalidOperation("upserted document lost its id".to_string()))?;
            data.insert(id.clone(), doc.clone());
            let seq = self.change_log.append(collection, LogOp::Insert { doc });
            trace!(collection, id = %id, seq, "upserted");
            return Ok(UpdateResult {
                matched: 0,
                modified: 0,
                upserted: Some(id.clone()),
                id: Some(id),
            });
        };

        let current = data
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut next = current.clone();
        apply_mutator(&mut next, mutator, false)?;

        if &next == current {
            return Ok(UpdateResult {
                matched: 1,
                modified: 0,
                upserted: None,
                id: Some(id),
            });
        }

        data.insert(id.clone(), next.clone());
        let seq = self.change_log.append(
            collection,
            LogOp::Update {
                id: id.clone(),
                doc: next,
            },
        );
        trace!(collection, id = %id, seq, "updated");

        Ok(UpdateResult {
            matched: 1,
            modified: 1,
            upserted: None,
            id: Some(id),
        })
    }

    async fn remove_one(&self, collection: &str, selector: &Selector) -> StoreResult<DeleteResult> {
        let mut collections = self.collections.write().map_err(handle_poison)?;
        let Some(data) = collections.get_mut(collection) else {
            return Ok(DeleteResult::default());
        };
        let Some(id) = Self::first_match(data, selector).cloned() else {
            return Ok(DeleteResult::default());
        };
        data.remove(&id);
        let seq = self.change_log.append(collection, LogOp::Remove { id: id.clone() });
        trace!(collection, id = %id, seq, "removed");

        Ok(DeleteResult {
            deleted: 1,
            id: Some(id),
        })
    }

    async fn find(&self, query: &QueryDescription) -> StoreResult<Vec<Document>> {
        let collections = self.collections.read().map_err(handle_poison)?;
        Ok(match collections.get(&query.collection) {
            Some(data) => query.execute(data.values()),
            None => Vec::new(),
        })
    }

    async fn find_one(
        &self,
        collection: &str,
        selector: &Selector,
        projection: Option<&Projection>,
    ) -> StoreResult<Option<Document>> {
        let collections = self.collections.read().map_err(handle_poison)?;
        let Some(data) = collections.get(collection) else {
            return Ok(None);
        };
        let found = Self::first_match(data, selector)
            .and_then(|id| data.get(id))
            .filter(|doc| selector.matches(doc));
        Ok(found.map(|doc| match projection {
            Some(p) => p.apply(doc),
            None => doc.clone(),
        }))
    }

    async fn snapshot(&self, query: &QueryDescription) -> StoreResult<Snapshot> {
        let collections = self.collections.read().map_err(handle_poison)?;
        // Writers append under the write lock, so this read is consistent with last_seq
        let seq = self.change_log.last_seq();
        let docs = match collections.get(&query.collection) {
            Some(data) => query.execute(data.values()),
            None => Vec::new(),
        };
        Ok(Snapshot { docs, seq: Some(seq) })
    }

    fn change_log(&self) -> Option<ChangeLog> {
        Some(self.change_log.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let store = MemoryStore::new();
        store.insert("items", doc(json!({"_id": "a", "x": 1}))).await.unwrap();
        store.insert("items", doc(json!({"_id": "b", "x": 2}))).await.unwrap();

        let q = QueryDescription::new("items", Selector::new(json!({"x": {"$gt": 1}})));
        assert_eq!(store.find(&q).await.unwrap(), vec![doc(json!({"_id": "b", "x": 2}))]);
        assert_eq!(store.count("items").unwrap(), 2);
        assert_eq!(store.count("missing").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_and_missing_id() {
        let store = MemoryStore::new();
        store.insert("items", doc(json!({"_id": "a"}))).await.unwrap();
        assert!(matches!(
            store.insert("items", doc(json!({"_id": "a"}))).await,
            Err(StoreError::DuplicateId { .. })
        ));
        assert!(matches!(
            store.insert("items", doc(json!({"x": 1}))).await,
            Err(StoreError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_update_reports_id_and_logs_post_image() {
        let store = MemoryStore::new();
        let log = store.change_log().unwrap();
        store.insert("items", doc(json!({"_id": "a", "x": 1}))).await.unwrap();
        let mut rx = log.subscribe();

        let res = store
            .update_one("items", &Selector::new(json!({"x": 1})), &json!({"$set": {"x": 5}}), false)
            .await
            .unwrap();
        assert_eq!(res.id, Some(DocId::from("a")));
        assert_eq!(res.modified, 1);

        let entry = rx.recv().await.unwrap();
        assert_eq!(
            entry.op,
            LogOp::Update {
                id: DocId::from("a"),
                doc: doc(json!({"_id": "a", "x": 5}))
            }
        );
    }

    #[tokio::test]
    async fn test_noop_update_is_not_logged() {
        let store = MemoryStore::new();
        store.insert("items", doc(json!({"_id": "a", "x": 1}))).await.unwrap();
        let before = store.change_log().unwrap().last_seq();
        let res = store
            .update_one("items", &Selector::new(json!("a")), &json!({"$set": {"x": 1}}), false)
            .await
            .unwrap();
        assert_eq!((res.matched, res.modified), (1, 0));
        assert_eq!(store.change_log().unwrap().last_seq(), before);
    }

    #[tokio::test]
    async fn test_bulk_writes_touch_every_match() {
        let store = MemoryStore::new();
        let inserted = store
            .insert_many(
                "items",
                vec![
                    doc(json!({"_id": "a", "x": 1})),
                    doc(json!({"_id": "b", "x": 1})),
                    doc(json!({"_id": "c", "x": 2})),
                ],
            )
            .await
            .unwrap();
        assert_eq!(inserted.ids.len(), 3);

        let updated = store
            .update_many("items", &Selector::new(json!({"x": 1})), &json!({"$inc": {"x": 10}}), false)
            .await
            .unwrap();
        assert_eq!((updated.matched, updated.modified), (2, 2));
        assert_eq!(updated.ids, vec![DocId::from("a"), DocId::from("b")]);

        let removed = store.remove_many("items", &Selector::new(json!({"x": 11}))).await.unwrap();
        assert_eq!(removed.deleted, 2);
        assert_eq!(store.count("items").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_insert_many_reports_partial_progress() {
        let store = MemoryStore::new();
        store.insert("items", doc(json!({"_id": "b"}))).await.unwrap();
        let err = store
            .insert_many("items", vec![doc(json!({"_id": "a"})), doc(json!({"_id": "b"})), doc(json!({"_id": "c"}))])
            .await
            .unwrap_err();
        assert_eq!(err.applied(), &[DocId::from("a")]);
        assert!(matches!(err, StoreError::Partial { .. }));
        assert_eq!(store.count("items").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_update_many_upserts_when_nothing_matches() {
        let store = MemoryStore::new();
        let res = store
            .update_many("items", &Selector::new(json!({"_id": "z", "k": 1})), &json!({"$set": {"n": 1}}), true)
            .await
            .unwrap();
        assert_eq!(res.upserted, Some(DocId::from("z")));
        assert_eq!(res.ids, vec![DocId::from("z")]);
    }

    #[tokio::test]
    async fn test_upsert_seeds_from_selector() {
        let store = MemoryStore::new();
        let res = store
            .update_one(
                "items",
                &Selector::new(json!({"_id": "new", "kind": "k"})),
                &json!({"$set": {"n": 1}, "$setOnInsert": {"fresh": true}}),
                true,
            )
            .await
            .unwrap();
        assert_eq!(res.upserted, Some(DocId::from("new")));
        let found = store.find_one("items", &Selector::new(json!("new")), None).await.unwrap();
        assert_eq!(found, Some(doc(json!({"_id": "new", "kind": "k", "n": 1, "fresh": true}))));
    }

    #[tokio::test]
    async fn test_remove_and_projection() {
        let store = MemoryStore::new();
        store.insert("items", doc(json!({"_id": "a", "x": 1, "y": 2}))).await.unwrap();

        let projected = store
            .find_one("items", &Selector::new(json!("a")), Some(&Projection::include(["y"])))
            .await
            .unwrap();
        assert_eq!(projected, Some(doc(json!({"_id": "a", "y": 2}))));

        let res = store.remove_one("items", &Selector::new(json!("a"))).await.unwrap();
        assert_eq!(res.id, Some(DocId::from("a")));
        let res = store.remove_one("items", &Selector::new(json!("a"))).await.unwrap();
        assert_eq!(res.deleted, 0);
    }

    #[tokio::test]
    async fn test_snapshot_reports_log_position() {
        let store = MemoryStore::new();
        store.insert("items", doc(json!({"_id": "a"}))).await.unwrap();
        store.insert("items", doc(json!({"_id": "b"}))).await.unwrap();
        let snap = store.snapshot(&QueryDescription::new("items", Selector::all())).await.unwrap();
        assert_eq!(snap.seq, Some(2));
        assert_eq!(snap.docs.len(), 2);
    }
}
