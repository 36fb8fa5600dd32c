/*
    allow_deny.rs - Before-hook that enforces allow/deny rules

    Runs only for mutations flagged `is_insecure`, which the method boundary
    sets and trusted callers never do. Update and delete checks load the
    pre-image with the smallest projection the registered validators need.
*/

use crate::core_access::{AccessError, ValidationContext};
use crate::core_doc::{IdGeneration, Projection};
use crate::core_hooks::{BeforeContext, HookResult, MutationArgs, MutationHook, MutationKind};
use crate::core_collection::options::MutationOptions;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Hook tag; disabling it on a collection's pipeline turns the checks off
pub const ALLOW_DENY_HOOK_TAG: &str = "allow-deny";

pub struct AllowDenyHook {
    context: Arc<ValidationContext>,
    id_generation: IdGeneration,
}

impl AllowDenyHook {
    pub fn new(context: Arc<ValidationContext>, id_generation: IdGeneration) -> Self {
        Self { context, id_generation }
    }
}

#[async_trait]
impl MutationHook for AllowDenyHook {
    fn name(&self) -> &str {
        "allow-deny"
    }

    fn tags(&self) -> &[&'static str] {
        &[ALLOW_DENY_HOOK_TAG]
    }

    fn handles(&self, _kind: MutationKind) -> bool {
        true
    }

    fn should_run(&self, _args: &MutationArgs, options: &MutationOptions) -> bool {
        options.is_insecure
    }

    fn projection(&self) -> Option<Projection> {
        match self.context.fetch_projection() {
            Ok(projection) => projection,
            Err(e) => {
                warn!(collection = self.context.collection(), error = %e, "falling back to a full pre-image");
                None
            }
        }
    }

    async fn before(&self, ctx: &mut BeforeContext) -> HookResult<()> {
        let actor = ctx.options.actor_id.clone();
        match ctx.args.clone() {
            MutationArgs::Insert { doc } => {
                let doc = self
                    .context
                    .authorize_insert(doc, actor.as_deref(), &self.id_generation)?;
                ctx.args = MutationArgs::Insert { doc };
            }
            MutationArgs::Update { selector, mutator } => {
                let fetched = ctx.get_document().await?;
                self.context.authorize_update(
                    &selector,
                    &mutator,
                    ctx.options.upsert,
                    actor.as_deref(),
                    fetched.as_ref(),
                )?;
            }
            MutationArgs::Delete { selector } => {
                let fetched = ctx.get_document().await?;
                self.context
                    .authorize_remove(&selector, actor.as_deref(), fetched.as_ref())?;
            }
            MutationArgs::InsertMany { .. } | MutationArgs::UpdateMany { .. } | MutationArgs::DeleteMany { .. } => {
                return Err(AccessError::unsupported("Bulk mutations are only available to trusted code").into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_access::{Polarity, ValidatorRules};
    use crate::core_doc::{DocId, Selector};
    use crate::core_store::{DocumentStore, MemoryStore};
    use serde_json::json;
    use std::sync::Mutex;

    fn hook() -> (AllowDenyHook, Arc<ValidationContext>) {
        let context = Arc::new(ValidationContext::new("items", None));
        let hook = AllowDenyHook::new(context.clone(), IdGeneration::Custom(Arc::new(|| "gen".to_string())));
        (hook, context)
    }

    #[tokio::test]
    async fn test_insert_gets_generated_id_after_approval() {
        let (hook, context) = hook();
        context
            .register(Polarity::Allow, ValidatorRules::new().insert(|_, _| true))
            .unwrap();
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let mut ctx = BeforeContext::new(
            "items",
            MutationArgs::Insert { doc: json!({"x": 1}).as_object().cloned().unwrap() },
            MutationOptions::new().insecure(Some("u1".to_string())),
            store,
        );
        hook.before(&mut ctx).await.unwrap();
        let MutationArgs::Insert { doc } = &ctx.args else {
            panic!("args changed kind");
        };
        assert_eq!(DocId::of(doc), Some(DocId::from("gen")));
    }

    #[tokio::test]
    async fn test_update_validator_sees_projected_pre_image() {
        let (hook, context) = hook();
        let seen = Arc::new(Mutex::new(None));
        let log = seen.clone();
        context
            .register(
                Polarity::Allow,
                ValidatorRules::new()
                    .update(move |actor, doc, _, _| {
                        *log.lock().unwrap() = Some((actor.map(str::to_string), doc.clone()));
                        true
                    })
                    .fetch(["owner"]),
            )
            .unwrap();

        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        store
            .insert("items", json!({"_id": "a", "owner": "u1", "secret": 9}).as_object().cloned().unwrap())
            .await
            .unwrap();
        let mut ctx = BeforeContext::new(
            "items",
            MutationArgs::Update {
                selector: Selector::new(json!("a")),
                mutator: json!({"$set": {"x": 1}}),
            },
            MutationOptions::new().insecure(Some("u1".to_string())),
            store,
        );
        ctx.set_projection(hook.projection());
        hook.before(&mut ctx).await.unwrap();

        let (actor, doc) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(actor.as_deref(), Some("u1"));
        assert_eq!(doc["owner"], json!("u1"));
        assert!(!doc.contains_key("secret"));
    }

    #[test]
    fn test_runs_only_for_insecure_calls() {
        let (hook, _) = hook();
        let args = MutationArgs::Delete { selector: Selector::new(json!("a")) };
        assert!(!hook.should_run(&args, &MutationOptions::new()));
        assert!(hook.should_run(&args, &MutationOptions::new().insecure(None)));
    }

    #[tokio::test]
    async fn test_untrusted_bulk_mutation_is_rejected() {
        let (hook, context) = hook();
        context
            .register(Polarity::Allow, ValidatorRules::new().remove(|_, _| true))
            .unwrap();
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let mut ctx = BeforeContext::new(
            "items",
            MutationArgs::DeleteMany { selector: Selector::all() },
            MutationOptions::new().insecure(Some("u1".to_string())),
            store,
        );
        let err = hook.before(&mut ctx).await.unwrap_err();
        assert!(err.to_string().contains("trusted code"), "{}", err);
    }
}
