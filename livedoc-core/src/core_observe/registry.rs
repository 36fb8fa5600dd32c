/*
    registry.rs - Query key to multiplexer map

    Each key owns a slot guarded by its own async lock. Creating the
    driver, attaching a listener and the last detach (which tears the driver
    down) all happen inside that slot's critical section, so a key never has
    two live drivers. The outer map lock is only held to look slots up.
*/

use crate::config::ObserveConfig;
use crate::core_doc::QueryDescription;
use crate::core_observe::driver::{
    select_driver, ChangeDriver, DriverCapabilities, OplogDriver, PollDriver, PubSubDriver,
};
use crate::core_observe::errors::{ObserveError, ObserveResult};
use crate::core_observe::event::DriverKind;
use crate::core_observe::multiplexer::{Attachment, ObserveMultiplexer};
use crate::core_pubsub::{listen_channels, ChannelScope, PubSubManager};
use crate::core_store::DocumentStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::{watch, Mutex};
use tracing::debug;

type Slot = Arc<Mutex<Option<Arc<ObserveMultiplexer>>>>;

struct RegistryInner {
    store: Arc<dyn DocumentStore>,
    config: ObserveConfig,
    pubsub: Option<PubSubManager>,
    slots: StdMutex<HashMap<String, Slot>>,
    write_clocks: StdMutex<HashMap<String, watch::Sender<u64>>>,
    drivers_created: AtomicUsize,
}

/// Shared registry of live multiplexers
#[derive(Clone)]
pub struct ObserveRegistry {
    inner: Arc<RegistryInner>,
}

/// A listener attached through the registry
#[derive(Debug)]
pub struct Registration {
    pub key: String,
    pub mux: Arc<ObserveMultiplexer>,
    pub attachment: Attachment,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ObserveRegistry {
    pub fn new(store: Arc<dyn DocumentStore>, config: ObserveConfig, pubsub: Option<PubSubManager>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                store,
                config,
                pubsub,
                slots: StdMutex::new(HashMap::new()),
                write_clocks: StdMutex::new(HashMap::new()),
                drivers_created: AtomicUsize::new(0),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &ObserveConfig {
        &self.inner.config
    }

    pub fn pubsub(&self) -> Option<&PubSubManager> {
        self.inner.pubsub.as_ref()
    }

    /// Drivers started over the registry's lifetime
    pub fn drivers_created(&self) -> usize {
        self.inner.drivers_created.load(Ordering::SeqCst)
    }

    /// Keys that currently have a slot
    pub fn active_keys(&self) -> usize {
        lock(&self.inner.slots).len()
    }

    pub fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            pubsub_ready: self.inner.pubsub.as_ref().is_some_and(PubSubManager::is_ready),
            change_log: self.inner.store.change_log().is_some(),
            log_tailing_disabled: self.inner.config.disable_log_tailing,
        }
    }

    /// Wake poll drivers of `collection` after a local write
    pub fn notify_write(&self, collection: &str) {
        let clocks = lock(&self.inner.write_clocks);
        if let Some(clock) = clocks.get(collection) {
            clock.send_modify(|tick| *tick = tick.wrapping_add(1));
        }
    }

    fn write_clock(&self, collection: &str) -> watch::Receiver<u64> {
        let mut clocks = lock(&self.inner.write_clocks);
        clocks
            .entry(collection.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    /// Key under which equivalent observations share a driver
    pub fn key_for(query: &QueryDescription, scope: &ChannelScope, forced: Option<DriverKind>) -> String {
        format!(
            "{}|{}|{}",
            query.normalized_key(),
            scope.key(),
            forced.map(|d| d.as_str()).unwrap_or("auto")
        )
    }

    fn build_driver(
        &self,
        kind: DriverKind,
        query: &QueryDescription,
        scope: &ChannelScope,
    ) -> ObserveResult<Arc<dyn ChangeDriver>> {
        let store = self.inner.store.clone();
        Ok(match kind {
            DriverKind::Poll => Arc::new(PollDriver::new(
                store,
                query.clone(),
                self.inner.config.poll_interval,
                self.inner.config.poll_throttle,
                self.write_clock(&query.collection),
            )),
            DriverKind::LogTailing => {
                let log = store.change_log().ok_or_else(|| ObserveError::DriverUnavailable {
                    driver: kind,
                    reason: "store has no change log".to_string(),
                })?;
                Arc::new(OplogDriver::new(store, query.clone(), log))
            }
            DriverKind::PubSub => {
                let manager = self.inner.pubsub.clone().ok_or_else(|| ObserveError::DriverUnavailable {
                    driver: kind,
                    reason: "no broadcast manager".to_string(),
                })?;
                let ids = query.selector.ids();
                let channels = listen_channels(&query.collection, scope, ids.as_deref());
                Arc::new(PubSubDriver::new(store, query.clone(), manager, channels))
            }
        })
    }

    fn slot(&self, key: &str) -> Slot {
        lock(&self.inner.slots).entry(key.to_string()).or_default().clone()
    }

    fn is_current(&self, key: &str, slot: &Slot) -> bool {
        lock(&self.inner.slots).get(key).is_some_and(|s| Arc::ptr_eq(s, slot))
    }

    fn forget(&self, key: &str, slot: &Slot) {
        let mut slots = lock(&self.inner.slots);
        if slots.get(key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(key);
        }
    }

    /// Attach a listener, starting a driver if this key has none
    pub async fn attach(
        &self,
        query: &QueryDescription,
        scope: &ChannelScope,
        forced: Option<DriverKind>,
    ) -> ObserveResult<Registration> {
        let key = Self::key_for(query, scope, forced);
        loop {
            let slot = self.slot(&key);
            let mut guard = slot.lock().await;
            if !self.is_current(&key, &slot) {
                // Torn down while we waited; start over with a fresh slot
                continue;
            }

            let mux = match guard.as_ref() {
                Some(mux) => mux.clone(),
                None => {
                    let started = match select_driver(forced, self.capabilities(), query) {
                        Ok(kind) => match self.build_driver(kind, query, scope) {
                            Ok(driver) => {
                                ObserveMultiplexer::start(
                                    key.clone(),
                                    driver,
                                    self.inner.config.driver_buffer,
                                    self.inner.config.listener_buffer,
                                )
                                .await
                            }
                            Err(e) => Err(e),
                        },
                        Err(e) => Err(e),
                    };
                    match started {
                        Ok(mux) => {
                            self.inner.drivers_created.fetch_add(1, Ordering::SeqCst);
                            *guard = Some(mux.clone());
                            mux
                        }
                        Err(e) => {
                            self.forget(&key, &slot);
                            return Err(e);
                        }
                    }
                }
            };

            let attachment = mux.attach().await;
            return Ok(Registration { key, mux, attachment });
        }
    }

    /// Detach a listener; the last one out stops the driver
    pub async fn detach(&self, key: &str, mux: &Arc<ObserveMultiplexer>, listener: u64) {
        let slot = lock(&self.inner.slots).get(key).cloned();
        let Some(slot) = slot else {
            mux.detach(listener).await;
            return;
        };

        let mut guard = slot.lock().await;
        let remaining = mux.detach(listener).await;
        let owns_slot = guard.as_ref().is_some_and(|current| Arc::ptr_eq(current, mux));
        if remaining == 0 && owns_slot {
            debug!(key, "last listener gone, stopping driver");
            *guard = None;
            mux.stop().await;
            self.forget(key, &slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_doc::Selector;
    use crate::core_store::MemoryStore;
    use serde_json::json;

    fn registry() -> ObserveRegistry {
        ObserveRegistry::new(Arc::new(MemoryStore::new()), ObserveConfig::default(), None)
    }

    #[tokio::test]
    async fn test_equivalent_queries_share_a_driver() {
        let registry = registry();
        let a = QueryDescription::new("items", Selector::new(json!({"x": 1, "y": 2})));
        let b = QueryDescription::new("items", Selector::new(json!({"y": 2, "x": 1})));

        let first = registry.attach(&a, &ChannelScope::default(), None).await.unwrap();
        let second = registry.attach(&b, &ChannelScope::default(), None).await.unwrap();
        assert!(Arc::ptr_eq(&first.mux, &second.mux));
        assert_eq!(registry.drivers_created(), 1);
        assert_eq!(first.mux.kind(), DriverKind::LogTailing);

        registry.detach(&first.key, &first.mux, first.attachment.id).await;
        assert!(!second.mux.is_stopped());
        assert_eq!(registry.active_keys(), 1);

        registry.detach(&second.key, &second.mux, second.attachment.id).await;
        assert!(second.mux.is_stopped());
        assert_eq!(registry.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_new_driver_after_teardown() {
        let registry = registry();
        let q = QueryDescription::new("items", Selector::all());
        let first = registry.attach(&q, &ChannelScope::default(), None).await.unwrap();
        registry.detach(&first.key, &first.mux, first.attachment.id).await;

        let again = registry.attach(&q, &ChannelScope::default(), None).await.unwrap();
        assert!(!Arc::ptr_eq(&first.mux, &again.mux));
        assert_eq!(registry.drivers_created(), 2);
        registry.detach(&again.key, &again.mux, again.attachment.id).await;
    }

    #[tokio::test]
    async fn test_unavailable_driver_leaves_no_slot() {
        let registry = registry();
        let q = QueryDescription::new("items", Selector::all());
        let err = registry
            .attach(&q, &ChannelScope::default(), Some(DriverKind::PubSub))
            .await
            .unwrap_err();
        assert!(matches!(err, ObserveError::DriverUnavailable { driver: DriverKind::PubSub, .. }));
        assert_eq!(registry.active_keys(), 0);
        assert_eq!(registry.drivers_created(), 0);
    }

    #[tokio::test]
    async fn test_forced_driver_is_part_of_the_key() {
        let registry = registry();
        let q = QueryDescription::new("items", Selector::all());
        let auto = registry.attach(&q, &ChannelScope::default(), None).await.unwrap();
        let poll = registry
            .attach(&q, &ChannelScope::default(), Some(DriverKind::Poll))
            .await
            .unwrap();
        assert_eq!(poll.mux.kind(), DriverKind::Poll);
        assert_eq!(registry.drivers_created(), 2);
        registry.detach(&auto.key, &auto.mux, auto.attachment.id).await;
        registry.detach(&poll.key, &poll.mux, poll.attachment.id).await;
    }
}
