//! Document Store Trait
//!
//! The interface the observation layer and the mutation gateway consume.
//! Any backend that can run selectors and apply mutators can sit behind it.

use crate::core_doc::{DocId, Document, Projection, QueryDescription, Selector};
use crate::core_store::change_log::ChangeLog;
use crate::core_store::errors::{StoreError, StoreResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Outcome of an insert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertResult {
    pub id: DocId,
}

/// Outcome of an update
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateResult {
    /// Documents matched by the selector (0 or 1)
    pub matched: usize,
    /// Documents whose contents changed
    pub modified: usize,
    /// Id of the document created by an upsert
    pub upserted: Option<DocId>,
    /// Id of the affected document, if any
    pub id: Option<DocId>,
}

/// Outcome of a removal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteResult {
    pub deleted: usize,
    pub id: Option<DocId>,
}

/// Outcome of a bulk insert
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InsertManyResult {
    /// Ids in insertion order
    pub ids: Vec<DocId>,
}

/// Outcome of a bulk update
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateManyResult {
    pub matched: usize,
    pub modified: usize,
    pub upserted: Option<DocId>,
    /// Every document the update touched, including an upserted one
    pub ids: Vec<DocId>,
}

/// Outcome of a bulk removal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteManyResult {
    pub deleted: usize,
    pub ids: Vec<DocId>,
}

/// Narrow `selector` to one id, so a bulk write skips documents that stopped
/// matching since they were collected
fn pinned(id: &DocId, selector: &Selector) -> Selector {
    Selector::new(json!({"$and": [{"_id": id.to_value()}, selector.as_value()]}))
}

/// A query result together with the change-log position it reflects
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub docs: Vec<Document>,
    /// Last change-log sequence included in `docs`, when the store has a log
    pub seq: Option<u64>,
}

/// Document store collaborator
///
/// Implementations must ensure:
/// - Writes to one collection are applied atomically, one at a time
/// - Reads see every write that returned before the read started
/// - When a change log is exposed, every write is appended to it in apply order
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a document that already carries its `_id`
    async fn insert(&self, collection: &str, doc: Document) -> StoreResult<InsertResult>;

    /// Apply `mutator` to the first document matching `selector`
    async fn update_one(
        &self,
        collection: &str,
        selector: &Selector,
        mutator: &Value,
        upsert: bool,
    ) -> StoreResult<UpdateResult>;

    /// Remove the first document matching `selector`
    async fn remove_one(&self, collection: &str, selector: &Selector) -> StoreResult<DeleteResult>;

    /// Insert documents in order, stopping at the first failure. A failure
    /// after some documents were written is reported as
    /// [`StoreError::Partial`].
    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> StoreResult<InsertManyResult> {
        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            match self.insert(collection, doc).await {
                Ok(result) => ids.push(result.id),
                Err(e) => return Err(StoreError::partial(ids, e)),
            }
        }
        Ok(InsertManyResult { ids })
    }

    /// Apply `mutator` to every document matching `selector`
    async fn update_many(
        &self,
        collection: &str,
        selector: &Selector,
        mutator: &Value,
        upsert: bool,
    ) -> StoreResult<UpdateManyResult> {
        let query = QueryDescription::new(collection, selector.clone());
        let targets: Vec<DocId> = self.find(&query).await?.iter().filter_map(DocId::of).collect();
        if targets.is_empty() {
            if !upsert {
                return Ok(UpdateManyResult::default());
            }
            let result = self.update_one(collection, selector, mutator, true).await?;
            return Ok(UpdateManyResult {
                matched: result.matched,
                modified: result.modified,
                upserted: result.upserted,
                ids: result.id.into_iter().collect(),
            });
        }

        let mut out = UpdateManyResult::default();
        for id in targets {
            match self.update_one(collection, &pinned(&id, selector), mutator, false).await {
                Ok(result) => {
                    if let Some(id) = result.id {
                        out.matched += result.matched;
                        out.modified += result.modified;
                        out.ids.push(id);
                    }
                }
                Err(e) => return Err(StoreError::partial(out.ids, e)),
            }
        }
        Ok(out)
    }

    /// Remove every document matching `selector`
    async fn remove_many(&self, collection: &str, selector: &Selector) -> StoreResult<DeleteManyResult> {
        let query = QueryDescription::new(collection, selector.clone());
        let targets: Vec<DocId> = self.find(&query).await?.iter().filter_map(DocId::of).collect();

        let mut out = DeleteManyResult::default();
        for id in targets {
            match self.remove_one(collection, &pinned(&id, selector)).await {
                Ok(result) => {
                    if let Some(id) = result.id {
                        out.deleted += result.deleted;
                        out.ids.push(id);
                    }
                }
                Err(e) => return Err(StoreError::partial(out.ids, e)),
            }
        }
        Ok(out)
    }

    /// Run a query
    async fn find(&self, query: &QueryDescription) -> StoreResult<Vec<Document>>;

    /// Fetch one document, optionally projected
    async fn find_one(
        &self,
        collection: &str,
        selector: &Selector,
        projection: Option<&Projection>,
    ) -> StoreResult<Option<Document>>;

    /// Run a query and report the log position it reflects
    async fn snapshot(&self, query: &QueryDescription) -> StoreResult<Snapshot> {
        Ok(Snapshot {
            docs: self.find(query).await?,
            seq: None,
        })
    }

    /// Ordered change log, if this store keeps one
    fn change_log(&self) -> Option<ChangeLog> {
        None
    }
}
