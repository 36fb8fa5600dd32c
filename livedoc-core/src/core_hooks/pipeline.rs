/*
    pipeline.rs - Ordered list of mutation hooks

    Hooks run in registration order. A `before` error aborts the mutation
    and skips the remaining hooks. `after` errors cannot undo the write, so
    they are logged and the remaining hooks still run.
*/

use crate::core_hooks::errors::HookResult;
use crate::core_hooks::hook::{AfterContext, BeforeContext, MutationHook};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tracing::{trace, warn};

/// Hooks attached to one collection
#[derive(Default)]
pub struct HookPipeline {
    hooks: RwLock<Vec<Arc<dyn MutationHook>>>,
    disabled_tags: RwLock<HashSet<String>>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook
    pub fn add(&self, hook: Arc<dyn MutationHook>) {
        match self.hooks.write() {
            Ok(mut hooks) => hooks.push(hook),
            Err(poisoned) => poisoned.into_inner().push(hook),
        }
    }

    /// Stop running every hook carrying `tag`
    pub fn disable_tag(&self, tag: &str) {
        match self.disabled_tags.write() {
            Ok(mut tags) => tags.insert(tag.to_string()),
            Err(poisoned) => poisoned.into_inner().insert(tag.to_string()),
        };
    }

    pub fn enable_tag(&self, tag: &str) {
        match self.disabled_tags.write() {
            Ok(mut tags) => tags.remove(tag),
            Err(poisoned) => poisoned.into_inner().remove(tag),
        };
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn MutationHook>> {
        let hooks = match self.hooks.read() {
            Ok(hooks) => hooks.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let disabled = match self.disabled_tags.read() {
            Ok(tags) => tags.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        hooks
            .into_iter()
            .filter(|h| !h.tags().iter().any(|t| disabled.contains(*t)))
            .collect()
    }

    /// Run every applicable `before` hook
    pub async fn run_before(&self, ctx: &mut BeforeContext) -> HookResult<()> {
        let kind = ctx.kind();
        let original = ctx.args.clone();
        for hook in self.snapshot() {
            if !hook.handles(kind) || !hook.should_run(&original, &ctx.options) {
                continue;
            }
            trace!(hook = hook.name(), collection = %ctx.collection, ?kind, "before hook");
            ctx.set_projection(hook.projection());
            hook.before(ctx).await?;
        }
        ctx.set_projection(None);
        Ok(())
    }

    /// Run every applicable `after` hook
    pub async fn run_after(&self, ctx: &AfterContext<'_>) {
        let kind = ctx.kind();
        for hook in self.snapshot() {
            if !hook.handles(kind) || !hook.should_run(ctx.args, ctx.options) {
                continue;
            }
            trace!(hook = hook.name(), collection = ctx.collection, ?kind, "after hook");
            if let Err(e) = hook.after(ctx).await {
                warn!(hook = hook.name(), collection = ctx.collection, error = %e, "after hook failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_collection::MutationOptions;
    use crate::core_doc::{Document, Projection, Selector};
    use crate::core_hooks::errors::HookError;
    use crate::core_hooks::hook::{MutationArgs, MutationKind, MutationOutcome};
    use crate::core_store::{DocumentStore, InsertResult, MemoryStore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        tags: &'static [&'static str],
        log: Arc<Mutex<Vec<String>>>,
        veto: bool,
    }

    #[async_trait]
    impl MutationHook for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn tags(&self) -> &[&'static str] {
            self.tags
        }

        fn handles(&self, _kind: MutationKind) -> bool {
            true
        }

        async fn before(&self, _ctx: &mut BeforeContext) -> HookResult<()> {
            self.log.lock().unwrap().push(format!("before:{}", self.name));
            if self.veto {
                return Err(HookError::Vetoed {
                    hook: self.name.to_string(),
                    reason: "no".to_string(),
                });
            }
            Ok(())
        }

        async fn after(&self, _ctx: &AfterContext<'_>) -> HookResult<()> {
            self.log.lock().unwrap().push(format!("after:{}", self.name));
            Ok(())
        }
    }

    struct Loader {
        seen: Arc<Mutex<Vec<Option<Document>>>>,
        projection: Option<Projection>,
    }

    #[async_trait]
    impl MutationHook for Loader {
        fn name(&self) -> &str {
            "loader"
        }

        fn handles(&self, kind: MutationKind) -> bool {
            kind == MutationKind::Update
        }

        fn projection(&self) -> Option<Projection> {
            self.projection.clone()
        }

        async fn before(&self, ctx: &mut BeforeContext) -> HookResult<()> {
            let doc = ctx.get_document().await?;
            self.seen.lock().unwrap().push(doc);
            Ok(())
        }
    }

    fn insert_ctx(store: Arc<dyn DocumentStore>) -> BeforeContext {
        BeforeContext::new(
            "items",
            MutationArgs::Insert {
                doc: json!({"_id": "a"}).as_object().cloned().unwrap(),
            },
            MutationOptions::default(),
            store,
        )
    }

    #[tokio::test]
    async fn test_hooks_run_in_order_and_tags_disable() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = HookPipeline::new();
        pipeline.add(Arc::new(Recorder { name: "one", tags: &[], log: log.clone(), veto: false }));
        pipeline.add(Arc::new(Recorder { name: "two", tags: &["audit"], log: log.clone(), veto: false }));

        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        pipeline.run_before(&mut insert_ctx(store.clone())).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["before:one", "before:two"]);

        log.lock().unwrap().clear();
        pipeline.disable_tag("audit");
        pipeline.run_before(&mut insert_ctx(store.clone())).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["before:one"]);

        log.lock().unwrap().clear();
        pipeline.enable_tag("audit");
        let args = MutationArgs::Delete { selector: Selector::all() };
        let options = MutationOptions::default();
        let outcome = MutationOutcome::Inserted(InsertResult { id: "a".into() });
        pipeline
            .run_after(&AfterContext {
                collection: "items",
                args: &args,
                options: &options,
                result: Ok(&outcome),
            })
            .await;
        assert_eq!(*log.lock().unwrap(), vec!["after:one", "after:two"]);
    }

    #[tokio::test]
    async fn test_veto_stops_pipeline() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = HookPipeline::new();
        pipeline.add(Arc::new(Recorder { name: "gate", tags: &[], log: log.clone(), veto: true }));
        pipeline.add(Arc::new(Recorder { name: "later", tags: &[], log: log.clone(), veto: false }));

        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let err = pipeline.run_before(&mut insert_ctx(store)).await.unwrap_err();
        assert!(matches!(err, HookError::Vetoed { .. }));
        assert_eq!(*log.lock().unwrap(), vec!["before:gate"]);
    }

    #[tokio::test]
    async fn test_get_document_uses_hook_projection() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert("items", json!({"_id": "a", "owner": "u1", "secret": 1}).as_object().cloned().unwrap())
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let pipeline = HookPipeline::new();
        pipeline.add(Arc::new(Loader {
            seen: seen.clone(),
            projection: Some(Projection::include(["owner"])),
        }));
        pipeline.add(Arc::new(Loader { seen: seen.clone(), projection: None }));

        let mut ctx = BeforeContext::new(
            "items",
            MutationArgs::Update {
                selector: Selector::new(json!("a")),
                mutator: json!({"$set": {"x": 1}}),
            },
            MutationOptions::default(),
            store,
        );
        pipeline.run_before(&mut ctx).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], json!({"_id": "a", "owner": "u1"}).as_object().cloned());
        assert_eq!(seen[1], json!({"_id": "a", "owner": "u1", "secret": 1}).as_object().cloned());
    }
}
