//! Options accepted by collection operations

use crate::core_access::DocTransform;
use crate::core_doc::{Document, IdGeneration, Projection, SortSpec};
use crate::core_observe::ChangeFence;
use crate::core_pubsub::{ChannelScope, PublishOptions};
use std::fmt;
use std::sync::Arc;

/// Per-call mutation options
#[derive(Debug, Clone, Default)]
pub struct MutationOptions {
    /// Set only by the method boundary; turns on allow/deny checks
    pub is_insecure: bool,
    /// Caller identity handed to validators
    pub actor_id: Option<String>,
    /// Insert when an update matches nothing
    pub upsert: bool,
    pub pubsub: PublishOptions,
    /// Defer publication until the fence says the write is visible
    pub fence: Option<ChangeFence>,
}

impl MutationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(mut self) -> Self {
        self.upsert = true;
        self
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_publish(mut self, pubsub: PublishOptions) -> Self {
        self.pubsub = pubsub;
        self
    }

    pub fn with_fence(mut self, fence: ChangeFence) -> Self {
        self.fence = Some(fence);
        self
    }

    pub(crate) fn insecure(mut self, actor_id: Option<String>) -> Self {
        self.is_insecure = true;
        self.actor_id = actor_id;
        self
    }
}

/// Options for `Collection::find`
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub projection: Option<Projection>,
    pub sort: Option<SortSpec>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    /// Broadcast channels observers of the cursor listen on
    pub scope: ChannelScope,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn projection(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn sort(mut self, sort: SortSpec) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn scope(mut self, scope: ChannelScope) -> Self {
        self.scope = scope;
        self
    }
}

/// Options used when a collection is created; unset fields fall back to
/// the `collections` config section
#[derive(Clone, Default)]
pub struct CollectionOptions {
    pub transform: Option<DocTransform>,
    pub id_generation: Option<IdGeneration>,
    pub define_mutation_methods: Option<bool>,
}

impl CollectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transform<F>(mut self, f: F) -> Self
    where
        F: Fn(Document) -> Document + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(f));
        self
    }

    pub fn id_generation(mut self, id_generation: IdGeneration) -> Self {
        self.id_generation = Some(id_generation);
        self
    }

    pub fn define_mutation_methods(mut self, define: bool) -> Self {
        self.define_mutation_methods = Some(define);
        self
    }
}

impl fmt::Debug for CollectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionOptions")
            .field("transform", &self.transform.is_some())
            .field("id_generation", &self.id_generation)
            .field("define_mutation_methods", &self.define_mutation_methods)
            .finish()
    }
}
