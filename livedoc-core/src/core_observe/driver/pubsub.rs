//! Broadcast-fed driver
//!
//! Listens on the query's channels through the [`PubSubManager`]. Each
//! envelope names one document; the driver re-reads it and decides
//! membership with the local matcher. Queries with skip/limit cannot be
//! maintained from single documents and are re-run instead.

use crate::core_doc::{DocId, Document, QueryDescription, Selector};
use crate::core_observe::driver::{diff_results, stopped, ChangeDriver, DriverLoop};
use crate::core_observe::errors::{ObserveError, ObserveResult};
use crate::core_observe::event::{DriverEvent, DriverKind};
use crate::core_pubsub::{PubSubEvent, PubSubEventKind, PubSubManager, RoutedMessage};
use crate::core_store::{DocumentStore, StoreResult};
use crate::metrics;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

pub struct PubSubDriver {
    store: Arc<dyn DocumentStore>,
    query: QueryDescription,
    manager: PubSubManager,
    channels: Vec<String>,
    registration: Mutex<Option<u64>>,
    driver_loop: DriverLoop,
}

impl PubSubDriver {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        query: QueryDescription,
        manager: PubSubManager,
        channels: Vec<String>,
    ) -> Self {
        Self {
            store,
            query,
            manager,
            channels,
            registration: Mutex::new(None),
            driver_loop: DriverLoop::new(),
        }
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    fn take_registration(&self) -> Option<u64> {
        match self.registration.lock() {
            Ok(mut registration) => registration.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

/// Re-evaluate the one document an envelope refers to
async fn apply_event(
    store: &dyn DocumentStore,
    query: &QueryDescription,
    known: &mut HashMap<DocId, Document>,
    event: &PubSubEvent,
) -> StoreResult<Option<DriverEvent>> {
    let id = event.id().clone();
    if event.event == PubSubEventKind::Remove {
        return Ok(known.remove(&id).map(|_| DriverEvent::Removed(id)));
    }

    let current = store
        .find_one(&query.collection, &Selector::for_id(&id), None)
        .await?;
    match current {
        Some(doc) if query.selector.matches(&doc) => {
            let projected = query.project(&doc);
            Ok(match known.insert(id, projected.clone()) {
                None => Some(DriverEvent::Added(projected)),
                Some(old) if old != projected => Some(DriverEvent::Changed(projected)),
                Some(_) => None,
            })
        }
        _ => Ok(known.remove(&id).map(|_| DriverEvent::Removed(id))),
    }
}

#[async_trait]
impl ChangeDriver for PubSubDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::PubSub
    }

    async fn start(&self, sink: mpsc::Sender<DriverEvent>) -> ObserveResult<()> {
        let mut subscription = self.manager.register(&self.channels)?;
        match self.registration.lock() {
            Ok(mut registration) => *registration = Some(subscription.id),
            Err(poisoned) => *poisoned.into_inner() = Some(subscription.id),
        }

        let mut known = HashMap::new();
        let docs = match self.store.find(&self.query).await {
            Ok(docs) => docs,
            Err(e) => {
                self.manager.unregister(subscription.id);
                return Err(e.into());
            }
        };
        for event in diff_results(&mut known, docs) {
            sink.send(event).await.map_err(|_| ObserveError::Stopped)?;
        }
        sink.send(DriverEvent::Ready).await.map_err(|_| ObserveError::Stopped)?;

        let store = self.store.clone();
        let query = self.query.clone();
        let mut stop = self.driver_loop.stop_signal();

        let handle = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = stopped(&mut stop) => break,
                    message = subscription.rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };

                let requery = match &message {
                    RoutedMessage::Resync => {
                        metrics::driver_resync();
                        true
                    }
                    RoutedMessage::Event(_) => query.is_windowed(),
                };

                let events = if requery {
                    match store.find(&query).await {
                        Ok(docs) => diff_results(&mut known, docs),
                        Err(e) => {
                            warn!(collection = %query.collection, error = %e, "pubsub re-query failed");
                            continue;
                        }
                    }
                } else if let RoutedMessage::Event(event) = &message {
                    trace!(collection = %query.collection, id = %event.id(), kind = ?event.event, "pubsub event");
                    match apply_event(store.as_ref(), &query, &mut known, event).await {
                        Ok(event) => event.into_iter().collect(),
                        Err(e) => {
                            warn!(collection = %query.collection, error = %e, "pubsub lookup failed");
                            continue;
                        }
                    }
                } else {
                    Vec::new()
                };

                for event in events {
                    if sink.send(event).await.is_err() {
                        return;
                    }
                }
            }
            debug!(collection = %query.collection, "pubsub driver stopped");
        });
        self.driver_loop.attach(handle);
        Ok(())
    }

    async fn stop(&self) {
        if let Some(id) = self.take_registration() {
            self.manager.unregister(id);
        }
        self.driver_loop.shutdown().await;
    }
}
