/*
    live_db.rs - Composition root

    Owns the store, the observe registry, the optional broadcast manager and
    the method registry, and hands them to every collection it creates.
    Nothing below this layer reaches for a process-wide instance.
*/

use crate::config::Config;
use crate::core_collection::collection::Collection;
use crate::core_collection::errors::{CollectionError, CollectionResult};
use crate::core_collection::methods::{MethodInvocation, MethodRegistry};
use crate::core_collection::options::CollectionOptions;
use crate::core_doc::IdGeneration;
use crate::core_observe::ObserveRegistry;
use crate::core_pubsub::{Broadcast, MemoryBroadcast, PubSubManager, PubSubPublisher};
use crate::core_store::{DocumentStore, MemoryStore};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

pub struct LiveDb {
    config: Config,
    registry: ObserveRegistry,
    pubsub: Option<PubSubManager>,
    methods: Arc<MethodRegistry>,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
}

impl LiveDb {
    /// In-memory store, plus an in-process broadcast when pub/sub is enabled
    pub fn new(config: Config) -> Self {
        let broadcast: Option<Arc<dyn Broadcast>> = config
            .pubsub
            .enabled
            .then(|| Arc::new(MemoryBroadcast::new(config.pubsub.channel_buffer)) as Arc<dyn Broadcast>);
        Self::with_store(config, Arc::new(MemoryStore::new()), broadcast)
    }

    pub fn with_store(config: Config, store: Arc<dyn DocumentStore>, broadcast: Option<Arc<dyn Broadcast>>) -> Self {
        let pubsub = broadcast
            .map(|b| PubSubManager::new(b, config.pubsub.optimistic, config.pubsub.channel_buffer));
        let registry = ObserveRegistry::new(store, config.observe.clone(), pubsub.clone());
        info!(
            pubsub = pubsub.is_some(),
            change_log = registry.store().change_log().is_some(),
            "live db ready"
        );
        Self {
            config,
            registry,
            pubsub,
            methods: Arc::new(MethodRegistry::new()),
            collections: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        self.registry.store()
    }

    pub fn registry(&self) -> &ObserveRegistry {
        &self.registry
    }

    pub fn pubsub(&self) -> Option<&PubSubManager> {
        self.pubsub.as_ref()
    }

    pub fn methods(&self) -> &Arc<MethodRegistry> {
        &self.methods
    }

    /// Create a collection with the configured defaults
    pub fn collection(&self, name: &str) -> CollectionResult<Arc<Collection>> {
        self.collection_with(name, CollectionOptions::default())
    }

    pub fn collection_with(&self, name: &str, options: CollectionOptions) -> CollectionResult<Arc<Collection>> {
        let mut collections = match self.collections.write() {
            Ok(collections) => collections,
            Err(poisoned) => poisoned.into_inner(),
        };
        if collections.contains_key(name) {
            return Err(CollectionError::Configuration(format!(
                "There is already a collection named '{}'",
                name
            )));
        }

        let id_generation = match options.id_generation {
            Some(id_generation) => id_generation,
            None => self.config.collections.id_generation.parse::<IdGeneration>()?,
        };
        let collection = Arc::new(Collection::new(
            name,
            self.registry.clone(),
            options.transform,
            id_generation,
        ));

        if options
            .define_mutation_methods
            .unwrap_or(self.config.collections.define_mutation_methods)
        {
            collection.define_mutation_methods(&self.methods)?;
        }
        if let Some(manager) = &self.pubsub {
            collection.hooks().add(Arc::new(PubSubPublisher::new(manager.clone())));
        }

        collections.insert(name.to_string(), collection.clone());
        Ok(collection)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Collection>> {
        match self.collections.read() {
            Ok(collections) => collections.get(name).cloned(),
            Err(poisoned) => poisoned.into_inner().get(name).cloned(),
        }
    }

    /// Call a method through the untrusted boundary
    pub async fn call(&self, name: &str, invocation: MethodInvocation, args: Value) -> CollectionResult<Value> {
        self.methods.call(name, invocation, args).await
    }
}
