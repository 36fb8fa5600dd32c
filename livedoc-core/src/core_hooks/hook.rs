//! Mutation hook trait and the contexts hooks receive
//!
//! A hook declares which mutation kinds it cares about, may carry tags so
//! the pipeline can switch it off, and gets a `before` call that can veto or
//! rewrite the mutation and an `after` call that sees the outcome.

use crate::core_collection::MutationOptions;
use crate::core_doc::{Document, Projection, Selector};
use crate::core_hooks::errors::HookResult;
use crate::core_store::{
    DeleteManyResult, DeleteResult, DocumentStore, InsertManyResult, InsertResult, StoreError, UpdateManyResult,
    UpdateResult,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Kind of mutation passing through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
    InsertMany,
    UpdateMany,
    DeleteMany,
}

impl MutationKind {
    /// Whether the mutation may touch more than one document
    pub fn is_bulk(self) -> bool {
        matches!(self, MutationKind::InsertMany | MutationKind::UpdateMany | MutationKind::DeleteMany)
    }
}

/// Arguments of the mutation; `before` hooks may rewrite them
#[derive(Debug, Clone, PartialEq)]
pub enum MutationArgs {
    Insert { doc: Document },
    Update { selector: Selector, mutator: Value },
    Delete { selector: Selector },
    InsertMany { docs: Vec<Document> },
    UpdateMany { selector: Selector, mutator: Value },
    DeleteMany { selector: Selector },
}

impl MutationArgs {
    pub fn kind(&self) -> MutationKind {
        match self {
            MutationArgs::Insert { .. } => MutationKind::Insert,
            MutationArgs::Update { .. } => MutationKind::Update,
            MutationArgs::Delete { .. } => MutationKind::Delete,
            MutationArgs::InsertMany { .. } => MutationKind::InsertMany,
            MutationArgs::UpdateMany { .. } => MutationKind::UpdateMany,
            MutationArgs::DeleteMany { .. } => MutationKind::DeleteMany,
        }
    }

    pub fn selector(&self) -> Option<&Selector> {
        match self {
            MutationArgs::Insert { .. } | MutationArgs::InsertMany { .. } => None,
            MutationArgs::Update { selector, .. }
            | MutationArgs::Delete { selector }
            | MutationArgs::UpdateMany { selector, .. }
            | MutationArgs::DeleteMany { selector } => Some(selector),
        }
    }
}

/// What the store reported for a successful write
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    Inserted(InsertResult),
    Updated(UpdateResult),
    Deleted(DeleteResult),
    InsertedMany(InsertManyResult),
    UpdatedMany(UpdateManyResult),
    DeletedMany(DeleteManyResult),
}

/// State handed to `before` hooks
pub struct BeforeContext {
    pub collection: String,
    pub args: MutationArgs,
    pub options: MutationOptions,
    store: Arc<dyn DocumentStore>,
    projection: Option<Projection>,
    pre_images: HashMap<String, Option<Document>>,
}

impl BeforeContext {
    pub fn new(
        collection: impl Into<String>,
        args: MutationArgs,
        options: MutationOptions,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        BeforeContext {
            collection: collection.into(),
            args,
            options,
            store,
            projection: None,
            pre_images: HashMap::new(),
        }
    }

    pub fn kind(&self) -> MutationKind {
        self.args.kind()
    }

    pub(crate) fn set_projection(&mut self, projection: Option<Projection>) {
        self.projection = projection;
    }

    /// Load the document this mutation targets, using the current hook's
    /// projection. Loaded once per projection and cached for later hooks.
    /// Bulk mutations have no single target and always load `None`.
    pub async fn get_document(&mut self) -> HookResult<Option<Document>> {
        if self.kind().is_bulk() {
            return Ok(None);
        }
        let Some(selector) = self.args.selector().cloned() else {
            return Ok(None);
        };
        let key = self
            .projection
            .as_ref()
            .map(|p| p.to_value().to_string())
            .unwrap_or_default();
        if let Some(cached) = self.pre_images.get(&key) {
            return Ok(cached.clone());
        }
        let doc = self
            .store
            .find_one(&self.collection, &selector, self.projection.as_ref())
            .await?;
        self.pre_images.insert(key, doc.clone());
        Ok(doc)
    }
}

/// State handed to `after` hooks
pub struct AfterContext<'a> {
    pub collection: &'a str,
    pub args: &'a MutationArgs,
    pub options: &'a MutationOptions,
    pub result: Result<&'a MutationOutcome, &'a StoreError>,
}

impl AfterContext<'_> {
    pub fn kind(&self) -> MutationKind {
        self.args.kind()
    }
}

/// A before/after callback pair wrapped around mutations
#[async_trait]
pub trait MutationHook: Send + Sync {
    /// Name used in logs and veto errors
    fn name(&self) -> &str;

    /// Tags the pipeline can enable or disable as a group
    fn tags(&self) -> &[&'static str] {
        &[]
    }

    /// Mutation kinds this hook wants to see
    fn handles(&self, kind: MutationKind) -> bool;

    /// Decide from the original arguments whether to run at all
    fn should_run(&self, _args: &MutationArgs, _options: &MutationOptions) -> bool {
        true
    }

    /// Fields `get_document` should load; `None` loads the whole document
    fn projection(&self) -> Option<Projection> {
        None
    }

    async fn before(&self, _ctx: &mut BeforeContext) -> HookResult<()> {
        Ok(())
    }

    async fn after(&self, _ctx: &AfterContext<'_>) -> HookResult<()> {
        Ok(())
    }
}
