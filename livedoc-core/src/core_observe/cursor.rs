//! Client-facing cursor over a query
//!
//! A cursor is a description, not a subscription: cloning it copies the
//! query and transforms, and each `observe*` call on any clone creates its
//! own listener.

use crate::core_access::DocTransform;
use crate::core_doc::{Document, QueryDescription};
use crate::core_observe::callbacks::{ChangeCallbacks, ObserveCallbacks, SubscriptionSink};
use crate::core_observe::errors::{ObserveError, ObserveResult};
use crate::core_observe::event::{MappedChangePolicy, ObserveOptions};
use crate::core_observe::handle::{
    ChangesDelivery, Delivery, DocPipeline, DocumentDelivery, ListenerTask, MappedView, ObserveHandle, SinkDelivery,
};
use crate::core_observe::registry::ObserveRegistry;
use crate::core_pubsub::ChannelScope;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Clone)]
pub struct Cursor {
    registry: ObserveRegistry,
    query: QueryDescription,
    pipeline: DocPipeline,
    scope: ChannelScope,
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("query", &self.query)
            .field("maps", &self.pipeline.maps.len())
            .field("scope", &self.scope)
            .finish()
    }
}

impl Cursor {
    pub fn new(registry: ObserveRegistry, query: QueryDescription) -> Self {
        Self {
            registry,
            query,
            pipeline: DocPipeline::default(),
            scope: ChannelScope::default(),
        }
    }

    /// Document-level transform applied before any map
    pub fn with_transform(mut self, transform: Option<DocTransform>) -> Self {
        self.pipeline.transform = transform;
        self
    }

    /// Broadcast channels observers of this cursor listen on
    pub fn with_scope(mut self, scope: ChannelScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn query(&self) -> &QueryDescription {
        &self.query
    }

    /// Append a map; maps run in the order they were added
    pub fn map<F>(mut self, f: F) -> Self
    where
        F: Fn(Document) -> Document + Send + Sync + 'static,
    {
        self.pipeline.maps.push(Arc::new(f));
        self
    }

    /// Run the query once
    pub async fn fetch(&self) -> ObserveResult<Vec<Document>> {
        let docs = self.registry.store().find(&self.query).await?;
        Ok(docs.into_iter().map(|doc| self.pipeline.apply(doc)).collect())
    }

    pub async fn count(&self) -> ObserveResult<usize> {
        Ok(self.registry.store().find(&self.query).await?.len())
    }

    fn policy(&self, options: &ObserveOptions) -> MappedChangePolicy {
        options
            .mapped_change_policy
            .unwrap_or(self.registry.config().mapped_change_policy)
    }

    /// Watch id/fields level changes. Returns once the initial result set
    /// has been delivered.
    pub async fn observe_changes(
        &self,
        callbacks: ChangeCallbacks,
        options: ObserveOptions,
    ) -> ObserveResult<ObserveHandle> {
        let view = MappedView::new(self.pipeline.clone(), self.policy(&options), options.fields.clone());
        self.start_listener(ChangesDelivery { view, callbacks }, &options).await
    }

    /// Watch whole documents, with positions when callbacks ask for them
    pub async fn observe(&self, callbacks: ObserveCallbacks, options: ObserveOptions) -> ObserveResult<ObserveHandle> {
        if options.no_indices && callbacks.uses_indices() {
            return Err(ObserveError::InvalidOptions(
                "positional callbacks cannot be used with no_indices".to_string(),
            ));
        }
        let delivery = DocumentDelivery::new(
            self.pipeline.clone(),
            self.policy(&options),
            options.fields.clone(),
            self.query.sort.clone(),
            callbacks,
        );
        self.start_listener(delivery, &options).await
    }

    /// Feed a transport subscription. The observer stops when the sink does.
    pub async fn publish(&self, sink: Arc<dyn SubscriptionSink>, options: ObserveOptions) -> ObserveResult<ObserveHandle> {
        let view = MappedView::new(self.pipeline.clone(), self.policy(&options), options.fields.clone());
        let delivery = SinkDelivery {
            view,
            collection: self.query.collection.clone(),
            sink: sink.clone(),
        };
        let handle = self.start_listener(delivery, &options).await?;
        let on_stop = handle.clone();
        sink.on_stop(Box::new(move || on_stop.request_stop()));
        Ok(handle)
    }

    async fn start_listener<D: Delivery>(&self, delivery: D, options: &ObserveOptions) -> ObserveResult<ObserveHandle> {
        if self.query.projection.as_ref().is_some_and(|p| p.excludes_id()) {
            return Err(ObserveError::IdExcluded);
        }

        let registration = self.registry.attach(&self.query, &self.scope, options.driver).await?;
        let stopped = Arc::new(AtomicBool::new(false));
        let handle = ObserveHandle::new(
            self.registry.clone(),
            registration.key,
            registration.mux,
            registration.attachment.id,
            stopped.clone(),
        );

        let (ready_tx, ready_rx) = oneshot::channel();
        let task = ListenerTask::new(delivery, stopped, options.suppress_initial, ready_tx);
        let attachment = registration.attachment;
        tokio::spawn(task.run(attachment.initial, attachment.rx));

        // Dropped sender means the multiplexer went away before it was ready
        if ready_rx.await.is_err() {
            handle.stop().await;
            return Err(ObserveError::Stopped);
        }
        debug!(collection = %self.query.collection, driver = %handle.driver(), "observer ready");
        Ok(handle)
    }
}
