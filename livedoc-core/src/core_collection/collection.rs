/*
    collection.rs - Hooked document collection

    Every mutation, trusted or not, takes the same path:

      fence token -> before hooks -> id generation -> store write
        -> poll-driver wake-up -> after hooks -> token commit

    Allow/deny checks are one of the before hooks and only run when the
    method boundary flagged the call insecure. After hooks always run, with
    either the outcome or the store error, so publishers can skip failed
    writes. Bulk writes share the path; one that stops part way still wakes
    poll drivers for what it wrote.
*/

use crate::core_access::{AccessError, DocTransform, Polarity, ValidationContext, ValidatorRules};
use crate::core_collection::allow_deny::AllowDenyHook;
use crate::core_collection::errors::{CollectionError, CollectionResult};
use crate::core_collection::methods::{CollectionMethod, MethodRegistry};
use crate::core_collection::options::{FindOptions, MutationOptions};
use crate::core_doc::{DocId, Document, IdGeneration, Projection, QueryDescription, Selector, ID_FIELD};
use crate::core_hooks::{AfterContext, BeforeContext, HookPipeline, MutationArgs, MutationOutcome};
use crate::core_observe::{Cursor, ObserveRegistry};
use crate::core_store::{
    DeleteManyResult, DeleteResult, DocumentStore, InsertManyResult, InsertResult, StoreResult,
    UpdateManyResult, UpdateResult,
};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

pub struct Collection {
    name: String,
    store: Arc<dyn DocumentStore>,
    registry: ObserveRegistry,
    hooks: HookPipeline,
    transform: Option<DocTransform>,
    id_generation: IdGeneration,
    validation: OnceLock<Arc<ValidationContext>>,
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("hooks", &self.hooks.len())
            .field("id_generation", &self.id_generation)
            .field("has_methods", &self.validation.get().is_some())
            .finish()
    }
}

impl Collection {
    pub fn new(
        name: impl Into<String>,
        registry: ObserveRegistry,
        transform: Option<DocTransform>,
        id_generation: IdGeneration,
    ) -> Self {
        Self {
            name: name.into(),
            store: registry.store().clone(),
            registry,
            hooks: HookPipeline::new(),
            transform,
            id_generation,
            validation: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hooks(&self) -> &HookPipeline {
        &self.hooks
    }

    pub fn transform(&self) -> Option<&DocTransform> {
        self.transform.as_ref()
    }

    /// Mint an id the way inserts without `_id` get one
    pub fn new_id(&self) -> DocId {
        self.id_generation.generate()
    }

    /// Validation state, present once mutation methods are defined
    pub fn validation(&self) -> Option<&Arc<ValidationContext>> {
        self.validation.get()
    }

    /// Expose `/<name>/insertOne`, `updateOne` and `deleteOne` on `methods`
    /// and install the allow/deny hook. Allowed once per collection.
    pub fn define_mutation_methods(self: &Arc<Self>, methods: &MethodRegistry) -> CollectionResult<()> {
        let context = Arc::new(ValidationContext::new(self.name.clone(), self.transform.clone()));
        if self.validation.set(context.clone()).is_err() {
            return Err(CollectionError::Configuration(format!(
                "Can't redefine mutation methods for collection '{}'",
                self.name
            )));
        }
        methods.define_all(CollectionMethod::all_for(self))?;
        self.hooks
            .add(Arc::new(AllowDenyHook::new(context, self.id_generation.clone())));
        info!(collection = %self.name, "mutation methods defined");
        Ok(())
    }

    fn context(&self) -> CollectionResult<&Arc<ValidationContext>> {
        self.validation.get().ok_or_else(|| {
            CollectionError::Access(AccessError::Configuration(format!(
                "Can't specify allow/deny rules on collection '{}' with no methods",
                self.name
            )))
        })
    }

    /// Register allow rules for untrusted mutations
    pub fn allow(&self, rules: ValidatorRules) -> CollectionResult<()> {
        Ok(self.context()?.register(Polarity::Allow, rules)?)
    }

    /// Register deny rules for untrusted mutations
    pub fn deny(&self, rules: ValidatorRules) -> CollectionResult<()> {
        Ok(self.context()?.register(Polarity::Deny, rules)?)
    }

    /// Override whether an unrestricted collection accepts untrusted writes
    pub fn set_insecure(&self, insecure: Option<bool>) -> CollectionResult<()> {
        Ok(self.context()?.set_insecure(insecure)?)
    }

    pub async fn insert_one(&self, mut doc: Document, options: MutationOptions) -> CollectionResult<InsertResult> {
        // Untrusted inserts get their id from the allow/deny hook, after approval
        if !options.is_insecure && !doc.contains_key(ID_FIELD) {
            doc.insert(ID_FIELD.to_string(), self.new_id().to_value());
        }
        match self.mutate(MutationArgs::Insert { doc }, options).await? {
            MutationOutcome::Inserted(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    pub async fn update_one(
        &self,
        selector: &Selector,
        mutator: &Value,
        options: MutationOptions,
    ) -> CollectionResult<UpdateResult> {
        let args = MutationArgs::Update {
            selector: selector.clone(),
            mutator: mutator.clone(),
        };
        match self.mutate(args, options).await? {
            MutationOutcome::Updated(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_one(&self, selector: &Selector, options: MutationOptions) -> CollectionResult<DeleteResult> {
        let args = MutationArgs::Delete {
            selector: selector.clone(),
        };
        match self.mutate(args, options).await? {
            MutationOutcome::Deleted(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    /// Insert documents in order. Stops at the first store failure; the
    /// documents written before it are still announced to observers.
    pub async fn insert_many(
        &self,
        mut docs: Vec<Document>,
        options: MutationOptions,
    ) -> CollectionResult<InsertManyResult> {
        for doc in docs.iter_mut().filter(|doc| !doc.contains_key(ID_FIELD)) {
            doc.insert(ID_FIELD.to_string(), self.new_id().to_value());
        }
        match self.mutate(MutationArgs::InsertMany { docs }, options).await? {
            MutationOutcome::InsertedMany(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    pub async fn update_many(
        &self,
        selector: &Selector,
        mutator: &Value,
        options: MutationOptions,
    ) -> CollectionResult<UpdateManyResult> {
        let args = MutationArgs::UpdateMany {
            selector: selector.clone(),
            mutator: mutator.clone(),
        };
        match self.mutate(args, options).await? {
            MutationOutcome::UpdatedMany(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_many(&self, selector: &Selector, options: MutationOptions) -> CollectionResult<DeleteManyResult> {
        let args = MutationArgs::DeleteMany {
            selector: selector.clone(),
        };
        match self.mutate(args, options).await? {
            MutationOutcome::DeletedMany(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    async fn mutate(&self, args: MutationArgs, options: MutationOptions) -> CollectionResult<MutationOutcome> {
        if options.is_insecure && self.validation.get().is_none() {
            return Err(CollectionError::Configuration(format!(
                "Collection '{}' has no mutation methods",
                self.name
            )));
        }
        let token = options.fence.as_ref().map(|fence| fence.begin_write()).transpose()?;

        let mut ctx = BeforeContext::new(self.name.clone(), args, options, self.store.clone());
        self.hooks.run_before(&mut ctx).await?;
        let pending: Vec<&mut Document> = match &mut ctx.args {
            MutationArgs::Insert { doc } => vec![doc],
            MutationArgs::InsertMany { docs } => docs.iter_mut().collect(),
            _ => Vec::new(),
        };
        for doc in pending.into_iter().filter(|doc| !doc.contains_key(ID_FIELD)) {
            doc.insert(ID_FIELD.to_string(), self.new_id().to_value());
        }

        let result = self.write(&ctx.args, ctx.options.upsert).await;
        let changed = match &result {
            Ok(_) => true,
            Err(e) => !e.applied().is_empty(),
        };
        if changed {
            self.registry.notify_write(&self.name);
        }
        if let Err(e) = &result {
            debug!(collection = %self.name, kind = ?ctx.kind(), applied = e.applied().len(), "write failed");
        }

        let after = AfterContext {
            collection: &self.name,
            args: &ctx.args,
            options: &ctx.options,
            result: result.as_ref(),
        };
        self.hooks.run_after(&after).await;

        if let Some(token) = token {
            token.commit();
        }
        Ok(result?)
    }

    async fn write(&self, args: &MutationArgs, upsert: bool) -> StoreResult<MutationOutcome> {
        match args {
            MutationArgs::Insert { doc } => self
                .store
                .insert(&self.name, doc.clone())
                .await
                .map(MutationOutcome::Inserted),
            MutationArgs::Update { selector, mutator } => self
                .store
                .update_one(&self.name, selector, mutator, upsert)
                .await
                .map(MutationOutcome::Updated),
            MutationArgs::Delete { selector } => self
                .store
                .remove_one(&self.name, selector)
                .await
                .map(MutationOutcome::Deleted),
            MutationArgs::InsertMany { docs } => self
                .store
                .insert_many(&self.name, docs.clone())
                .await
                .map(MutationOutcome::InsertedMany),
            MutationArgs::UpdateMany { selector, mutator } => self
                .store
                .update_many(&self.name, selector, mutator, upsert)
                .await
                .map(MutationOutcome::UpdatedMany),
            MutationArgs::DeleteMany { selector } => self
                .store
                .remove_many(&self.name, selector)
                .await
                .map(MutationOutcome::DeletedMany),
        }
    }

    /// Cursor over the documents matching `selector`
    pub fn find(&self, selector: Selector, options: FindOptions) -> Cursor {
        let mut query = QueryDescription::new(self.name.clone(), selector);
        if let Some(projection) = options.projection {
            query = query.with_projection(projection);
        }
        if let Some(sort) = options.sort {
            query = query.with_sort(sort);
        }
        if let Some(skip) = options.skip {
            query = query.with_skip(skip);
        }
        if let Some(limit) = options.limit {
            query = query.with_limit(limit);
        }
        Cursor::new(self.registry.clone(), query)
            .with_transform(self.transform.clone())
            .with_scope(options.scope)
    }

    /// First matching document, transformed
    pub async fn find_one(
        &self,
        selector: &Selector,
        projection: Option<&Projection>,
    ) -> CollectionResult<Option<Document>> {
        let doc = self.store.find_one(&self.name, selector, projection).await?;
        Ok(match (&self.transform, doc) {
            (Some(transform), Some(doc)) => Some(transform(doc)),
            (_, doc) => doc,
        })
    }
}

fn unexpected(outcome: MutationOutcome) -> CollectionError {
    CollectionError::InvalidArguments(format!("store reported an unexpected outcome: {:?}", outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObserveConfig;
    use crate::core_hooks::{HookError, HookResult, MutationHook, MutationKind};
    use crate::core_observe::ChangeFence;
    use crate::core_store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    fn collection(name: &str) -> Arc<Collection> {
        let registry = ObserveRegistry::new(Arc::new(MemoryStore::new()), ObserveConfig::default(), None);
        Arc::new(Collection::new(
            name,
            registry,
            None,
            IdGeneration::Custom(Arc::new(|| "generated".to_string())),
        ))
    }

    struct Outcomes(Arc<Mutex<Vec<bool>>>);

    #[async_trait]
    impl MutationHook for Outcomes {
        fn name(&self) -> &str {
            "outcomes"
        }

        fn handles(&self, _kind: MutationKind) -> bool {
            true
        }

        async fn after(&self, ctx: &AfterContext<'_>) -> HookResult<()> {
            self.0.lock().unwrap().push(ctx.result.is_ok());
            Ok(())
        }
    }

    struct Veto;

    #[async_trait]
    impl MutationHook for Veto {
        fn name(&self) -> &str {
            "veto"
        }

        fn handles(&self, kind: MutationKind) -> bool {
            kind == MutationKind::Delete
        }

        async fn before(&self, _ctx: &mut BeforeContext) -> HookResult<()> {
            Err(HookError::Vetoed {
                hook: "veto".to_string(),
                reason: "read only".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_trusted_insert_generates_id() {
        let items = collection("items");
        let result = items.insert_one(doc(json!({"x": 1})), MutationOptions::new()).await.unwrap();
        assert_eq!(result.id, DocId::from("generated"));
        let stored = items.find_one(&Selector::for_id(&result.id), None).await.unwrap().unwrap();
        assert_eq!(stored["x"], json!(1));
    }

    #[tokio::test]
    async fn test_after_hooks_see_failed_writes() {
        let items = collection("items");
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        items.hooks().add(Arc::new(Outcomes(outcomes.clone())));

        items.insert_one(doc(json!({"_id": "a"})), MutationOptions::new()).await.unwrap();
        let err = items.insert_one(doc(json!({"_id": "a"})), MutationOptions::new()).await.unwrap_err();
        assert!(matches!(err, CollectionError::Store(_)));
        assert_eq!(*outcomes.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test]
    async fn test_bulk_writes_run_through_hooks() {
        let items = collection("items");
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        items.hooks().add(Arc::new(Outcomes(outcomes.clone())));

        let inserted = items
            .insert_many(
                vec![doc(json!({"_id": "a", "n": 1})), doc(json!({"n": 2}))],
                MutationOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(inserted.ids, vec![DocId::from("a"), DocId::from("generated")]);

        let err = items
            .insert_many(vec![doc(json!({"_id": "b"})), doc(json!({"_id": "a"}))], MutationOptions::new())
            .await
            .unwrap_err();
        let CollectionError::Store(err) = err else {
            panic!("expected a store error");
        };
        assert_eq!(err.applied(), &[DocId::from("b")]);

        let updated = items
            .update_many(&Selector::all(), &json!({"$set": {"seen": true}}), MutationOptions::new())
            .await
            .unwrap();
        assert_eq!(updated.modified, 3);
        let removed = items.delete_many(&Selector::all(), MutationOptions::new()).await.unwrap();
        assert_eq!(removed.deleted, 3);
        assert_eq!(*outcomes.lock().unwrap(), vec![true, false, true, true]);
    }

    #[tokio::test]
    async fn test_before_hook_veto_skips_write() {
        let items = collection("items");
        items.insert_one(doc(json!({"_id": "a"})), MutationOptions::new()).await.unwrap();
        items.hooks().add(Arc::new(Veto));
        let err = items
            .delete_one(&Selector::new(json!("a")), MutationOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CollectionError::Vetoed { .. }));
        assert!(items.find_one(&Selector::new(json!("a")), None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rules_need_mutation_methods() {
        let items = collection("items");
        let err = items.allow(ValidatorRules::new().insert(|_, _| true)).unwrap_err();
        assert!(err.is_configuration());

        let err = items
            .insert_one(doc(json!({"x": 1})), MutationOptions::new().insecure(None))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_mutation_methods_defined_once() {
        let items = collection("items");
        let methods = MethodRegistry::new();
        items.define_mutation_methods(&methods).unwrap();
        assert_eq!(
            methods.names(),
            vec!["/items/deleteOne", "/items/insertOne", "/items/updateOne"]
        );
        let err = items.define_mutation_methods(&methods).unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_fence_token_finishes_with_the_write() {
        let items = collection("items");
        let fence = ChangeFence::new();
        items
            .insert_one(doc(json!({"_id": "a"})), MutationOptions::new().with_fence(fence.clone()))
            .await
            .unwrap();
        assert_eq!(fence.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_find_applies_collection_transform() {
        let registry = ObserveRegistry::new(Arc::new(MemoryStore::new()), ObserveConfig::default(), None);
        let transform: DocTransform = Arc::new(|mut d: Document| {
            d.insert("wrapped".to_string(), json!(true));
            d
        });
        let items = Collection::new("items", registry, Some(transform), IdGeneration::String);
        items.insert_one(doc(json!({"_id": "a"})), MutationOptions::new()).await.unwrap();

        let docs = items.find(Selector::all(), FindOptions::new()).fetch().await.unwrap();
        assert_eq!(docs[0]["wrapped"], json!(true));
        let one = items.find_one(&Selector::new(json!("a")), None).await.unwrap().unwrap();
        assert_eq!(one["wrapped"], json!(true));
    }
}
