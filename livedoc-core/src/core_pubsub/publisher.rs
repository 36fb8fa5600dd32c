/*
    publisher.rs - After-hook turning applied writes into per-document broadcast events
*/

use crate::core_doc::{mutator_fields, DocId};
use crate::core_hooks::{AfterContext, HookResult, MutationArgs, MutationHook, MutationKind, MutationOutcome};
use crate::core_pubsub::errors::PubSubError;
use crate::core_pubsub::event::{channels_for, PubSubEvent};
use crate::core_pubsub::manager::PubSubManager;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Hook tag; disable it on a pipeline to stop publishing for that collection
pub const PUBSUB_HOOK_TAG: &str = "pubsub";

/// Publishes insert/update/remove envelopes after each successful write
pub struct PubSubPublisher {
    manager: PubSubManager,
}

impl PubSubPublisher {
    pub fn new(manager: PubSubManager) -> Self {
        Self { manager }
    }

    /// One event per document the write touched
    fn events_for(args: &MutationArgs, outcome: &MutationOutcome) -> Vec<PubSubEvent> {
        match (outcome, args) {
            (MutationOutcome::Inserted(result), _) => vec![PubSubEvent::insert(result.id.clone())],
            (MutationOutcome::Updated(result), MutationArgs::Update { mutator, .. }) => {
                let fields: Vec<String> = mutator_fields(mutator).into_iter().collect();
                result.id.iter().map(|id| PubSubEvent::update(id.clone(), fields.clone())).collect()
            }
            (MutationOutcome::Deleted(result), _) => result.id.iter().cloned().map(PubSubEvent::remove).collect(),
            (MutationOutcome::InsertedMany(result), _) => Self::events_for_ids(args, &result.ids),
            (MutationOutcome::UpdatedMany(result), _) => Self::events_for_ids(args, &result.ids),
            (MutationOutcome::DeletedMany(result), _) => Self::events_for_ids(args, &result.ids),
            _ => Vec::new(),
        }
    }

    /// Events for documents a write changed, named by id only. Also covers
    /// bulk writes that failed part way.
    fn events_for_ids(args: &MutationArgs, ids: &[DocId]) -> Vec<PubSubEvent> {
        match args {
            MutationArgs::Insert { .. } | MutationArgs::InsertMany { .. } => {
                ids.iter().cloned().map(PubSubEvent::insert).collect()
            }
            MutationArgs::Update { mutator, .. } | MutationArgs::UpdateMany { mutator, .. } => {
                let fields: Vec<String> = mutator_fields(mutator).into_iter().collect();
                ids.iter().map(|id| PubSubEvent::update(id.clone(), fields.clone())).collect()
            }
            MutationArgs::Delete { .. } | MutationArgs::DeleteMany { .. } => {
                ids.iter().cloned().map(PubSubEvent::remove).collect()
            }
        }
    }
}

#[async_trait]
impl MutationHook for PubSubPublisher {
    fn name(&self) -> &str {
        "pubsub-publisher"
    }

    fn tags(&self) -> &[&'static str] {
        &[PUBSUB_HOOK_TAG]
    }

    fn handles(&self, _kind: MutationKind) -> bool {
        true
    }

    async fn after(&self, ctx: &AfterContext<'_>) -> HookResult<()> {
        let publish = &ctx.options.pubsub;
        if !publish.push_to_broadcast {
            return Ok(());
        }
        // A failed write changed nothing unless a bulk write stopped part way
        let events = match ctx.result {
            Ok(outcome) => Self::events_for(ctx.args, outcome),
            Err(e) => Self::events_for_ids(ctx.args, e.applied()),
        };
        if events.is_empty() {
            return Ok(());
        }

        let optimistic = publish.optimistic.unwrap_or_else(|| self.manager.optimistic());
        let uid = self.manager.uid();
        let batch: Vec<_> = events
            .into_iter()
            .map(|mut event| {
                if optimistic {
                    event = event.with_writer(uid);
                }
                let channels = channels_for(ctx.collection, &publish.scope, std::slice::from_ref(event.id()));
                (channels, Arc::new(event))
            })
            .collect();
        debug!(
            collection = ctx.collection,
            kind = ?ctx.kind(),
            documents = batch.len(),
            optimistic,
            "publishing changes"
        );

        let manager = self.manager.clone();
        let work = async move {
            for (channels, event) in batch {
                if optimistic {
                    manager.process_local(&channels, event.clone()).await;
                }
                manager.emit(&channels, &event).await?;
            }
            Ok::<(), PubSubError>(())
        };

        match &ctx.options.fence {
            Some(fence) => {
                let deferred = Box::pin(async move {
                    if let Err(e) = work.await {
                        warn!(error = %e, "deferred publication failed");
                    }
                });
                if let Err(now) = fence.on_visible(deferred) {
                    now.await;
                }
                Ok(())
            }
            None => Ok(work.await?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_collection::MutationOptions;
    use crate::core_doc::Selector;
    use crate::core_observe::ChangeFence;
    use crate::core_pubsub::broadcast::{Broadcast, MemoryBroadcast};
    use crate::core_pubsub::event::PubSubEventKind;
    use crate::core_pubsub::manager::RoutedMessage;
    use crate::core_store::{InsertManyResult, InsertResult, StoreError, UpdateManyResult, UpdateResult};
    use serde_json::json;

    fn setup(optimistic: bool) -> (PubSubPublisher, PubSubManager, Arc<MemoryBroadcast>) {
        let bus = Arc::new(MemoryBroadcast::new(16));
        let manager = PubSubManager::new(bus.clone(), optimistic, 16);
        (PubSubPublisher::new(manager.clone()), manager, bus)
    }

    fn update_args() -> MutationArgs {
        MutationArgs::Update {
            selector: Selector::new(json!("a")),
            mutator: json!({"$set": {"x.y": 1}, "$inc": {"n": 1}}),
        }
    }

    #[tokio::test]
    async fn test_update_publishes_touched_fields() {
        let (publisher, _manager, bus) = setup(false);
        let mut rx = bus.listen("items::a").unwrap();

        let args = update_args();
        let options = MutationOptions::default();
        let outcome = MutationOutcome::Updated(UpdateResult {
            matched: 1,
            modified: 1,
            upserted: None,
            id: Some(DocId::from("a")),
        });
        publisher
            .after(&AfterContext {
                collection: "items",
                args: &args,
                options: &options,
                result: Ok(&outcome),
            })
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, PubSubEventKind::Update);
        assert_eq!(event.fields, Some(vec!["n".to_string(), "x".to_string()]));
        assert_eq!(event.writer_id, None);
        assert_eq!(bus.emitted(), 2);
    }

    #[tokio::test]
    async fn test_failed_write_publishes_nothing() {
        let (publisher, _manager, bus) = setup(true);
        let args = update_args();
        let options = MutationOptions::default();
        let err = StoreError::NotFound("a".to_string());
        publisher
            .after(&AfterContext {
                collection: "items",
                args: &args,
                options: &options,
                result: Err(&err),
            })
            .await
            .unwrap();
        assert_eq!(bus.emitted(), 0);
    }

    #[tokio::test]
    async fn test_push_disabled_publishes_nothing() {
        let (publisher, _manager, bus) = setup(true);
        let args = MutationArgs::Insert { doc: Default::default() };
        let mut options = MutationOptions::default();
        options.pubsub.push_to_broadcast = false;
        let outcome = MutationOutcome::Inserted(InsertResult { id: DocId::from("a") });
        publisher
            .after(&AfterContext {
                collection: "items",
                args: &args,
                options: &options,
                result: Ok(&outcome),
            })
            .await
            .unwrap();
        assert_eq!(bus.emitted(), 0);
    }

    #[tokio::test]
    async fn test_optimistic_insert_is_routed_locally_first() {
        let (publisher, manager, bus) = setup(true);
        let mut sub = manager.register(&["items".to_string()]).unwrap();

        let args = MutationArgs::Insert { doc: Default::default() };
        let options = MutationOptions::default();
        let outcome = MutationOutcome::Inserted(InsertResult { id: DocId::from("a") });
        publisher
            .after(&AfterContext {
                collection: "items",
                args: &args,
                options: &options,
                result: Ok(&outcome),
            })
            .await
            .unwrap();

        let RoutedMessage::Event(event) = sub.rx.recv().await.unwrap() else {
            panic!("expected event");
        };
        assert_eq!(event.writer_id.as_deref(), Some(manager.uid()));
        assert_eq!(bus.emitted(), 2);

        // The broadcast echo is dropped by the manager
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fence_defers_publication() {
        let (publisher, _manager, bus) = setup(false);
        let fence = ChangeFence::new();
        let token = fence.begin_write().unwrap();

        let args = MutationArgs::Delete { selector: Selector::new(json!("a")) };
        let options = MutationOptions {
            fence: Some(fence.clone()),
            ..MutationOptions::default()
        };
        let outcome = MutationOutcome::Deleted(crate::core_store::DeleteResult {
            deleted: 1,
            id: Some(DocId::from("a")),
        });
        publisher
            .after(&AfterContext {
                collection: "items",
                args: &args,
                options: &options,
                result: Ok(&outcome),
            })
            .await
            .unwrap();
        assert_eq!(bus.emitted(), 0);

        token.commit();
        fence.arm();
        fence.visible().await;
        assert_eq!(bus.emitted(), 2);
    }

    #[tokio::test]
    async fn test_bulk_update_publishes_each_document() {
        let (publisher, _manager, bus) = setup(false);
        let mut rx = bus.listen("items").unwrap();

        let args = MutationArgs::UpdateMany {
            selector: Selector::new(json!({"kind": "k"})),
            mutator: json!({"$set": {"x": 1}}),
        };
        let options = MutationOptions::default();
        let outcome = MutationOutcome::UpdatedMany(UpdateManyResult {
            matched: 3,
            modified: 3,
            upserted: None,
            ids: vec![DocId::from("a"), DocId::from("b"), DocId::from("c")],
        });
        publisher
            .after(&AfterContext {
                collection: "items",
                args: &args,
                options: &options,
                result: Ok(&outcome),
            })
            .await
            .unwrap();

        for id in ["a", "b", "c"] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.event, PubSubEventKind::Update);
            assert_eq!(event.id(), &DocId::from(id));
            assert_eq!(event.fields, Some(vec!["x".to_string()]));
        }
        assert_eq!(bus.emitted(), 6);
    }

    #[tokio::test]
    async fn test_partial_bulk_insert_publishes_written_documents() {
        let (publisher, _manager, bus) = setup(false);
        let mut rx = bus.listen("items").unwrap();

        let args = MutationArgs::InsertMany { docs: Vec::new() };
        let options = MutationOptions::default();
        let err = StoreError::partial(
            vec![DocId::from("a"), DocId::from("b")],
            StoreError::DuplicateId {
                collection: "items".to_string(),
                id: "c".to_string(),
            },
        );
        publisher
            .after(&AfterContext {
                collection: "items",
                args: &args,
                options: &options,
                result: Err(&err),
            })
            .await
            .unwrap();

        for id in ["a", "b"] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.event, PubSubEventKind::Insert);
            assert_eq!(event.id(), &DocId::from(id));
        }
        assert_eq!(bus.emitted(), 4);
    }

    #[tokio::test]
    async fn test_empty_bulk_insert_publishes_nothing() {
        let (publisher, _manager, bus) = setup(true);
        let args = MutationArgs::InsertMany { docs: Vec::new() };
        let options = MutationOptions::default();
        let outcome = MutationOutcome::InsertedMany(InsertManyResult::default());
        publisher
            .after(&AfterContext {
                collection: "items",
                args: &args,
                options: &options,
                result: Ok(&outcome),
            })
            .await
            .unwrap();
        assert_eq!(bus.emitted(), 0);
    }
}
