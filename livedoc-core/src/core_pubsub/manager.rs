/*
    manager.rs - Routes broadcast channels to pub/sub change drivers

    One listener task per channel in use. Each task forwards envelopes to the
    drivers registered on that channel and drops echoes of this process's
    own optimistic writes, which were already routed by `process_local`.
    Passed explicitly to whatever needs it; there is no global instance.
*/

use crate::core_pubsub::broadcast::Broadcast;
use crate::core_pubsub::errors::PubSubResult;
use crate::core_pubsub::event::PubSubEvent;
use crate::metrics;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// What a registered driver receives
#[derive(Debug, Clone, PartialEq)]
pub enum RoutedMessage {
    Event(Arc<PubSubEvent>),
    /// Events were dropped on a lagging channel; re-query to catch up
    Resync,
}

/// A driver's registration with the manager
#[derive(Debug)]
pub struct PubSubSubscription {
    pub id: u64,
    pub rx: mpsc::Receiver<RoutedMessage>,
}

struct ChannelRoute {
    subscribers: Vec<(u64, mpsc::Sender<RoutedMessage>)>,
    task: JoinHandle<()>,
}

struct ManagerInner {
    uid: String,
    broadcast: Arc<dyn Broadcast>,
    optimistic: bool,
    buffer: usize,
    routes: Mutex<HashMap<String, ChannelRoute>>,
    next_id: AtomicU64,
}

/// Shared handle to the channel router
#[derive(Clone)]
pub struct PubSubManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for PubSubManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubManager")
            .field("uid", &self.inner.uid)
            .field("optimistic", &self.inner.optimistic)
            .field("channels", &self.channel_count())
            .finish()
    }
}

impl ManagerInner {
    fn routes(&self) -> MutexGuard<'_, HashMap<String, ChannelRoute>> {
        match self.routes.lock() {
            Ok(routes) => routes,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn senders(&self, channel: &str) -> Vec<mpsc::Sender<RoutedMessage>> {
        self.routes()
            .get(channel)
            .map(|route| route.subscribers.iter().map(|(_, tx)| tx.clone()).collect())
            .unwrap_or_default()
    }
}

impl PubSubManager {
    pub fn new(broadcast: Arc<dyn Broadcast>, optimistic: bool, buffer: usize) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                uid: Uuid::new_v4().to_string(),
                broadcast,
                optimistic,
                buffer: buffer.max(1),
                routes: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Identity stamped on this process's optimistic events
    pub fn uid(&self) -> &str {
        &self.inner.uid
    }

    /// Default for writes that do not say whether they are optimistic
    pub fn optimistic(&self) -> bool {
        self.inner.optimistic
    }

    pub fn is_ready(&self) -> bool {
        self.inner.broadcast.is_ready()
    }

    pub fn broadcast(&self) -> &Arc<dyn Broadcast> {
        &self.inner.broadcast
    }

    /// Channels with at least one registered driver
    pub fn channel_count(&self) -> usize {
        self.inner.routes().len()
    }

    /// Register a driver on `channels`
    pub fn register(&self, channels: &[String]) -> PubSubResult<PubSubSubscription> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.inner.buffer);

        let mut routes = self.inner.routes();
        let mut opened = Vec::new();
        for channel in channels {
            if let Some(route) = routes.get_mut(channel) {
                route.subscribers.push((id, tx.clone()));
                continue;
            }
            let receiver = match self.inner.broadcast.listen(channel) {
                Ok(receiver) => receiver,
                Err(e) => {
                    // Roll back the channels opened by this call
                    for channel in &opened {
                        if let Some(route) = routes.remove(channel) {
                            route.task.abort();
                        }
                    }
                    for route in routes.values_mut() {
                        route.subscribers.retain(|(sub, _)| *sub != id);
                    }
                    return Err(e);
                }
            };
            let task = tokio::spawn(route_channel(Arc::downgrade(&self.inner), channel.clone(), receiver));
            debug!(channel = %channel, "listening on broadcast channel");
            routes.insert(
                channel.clone(),
                ChannelRoute {
                    subscribers: vec![(id, tx.clone())],
                    task,
                },
            );
            opened.push(channel.clone());
        }
        Ok(PubSubSubscription { id, rx })
    }

    /// Remove a driver; channels left without drivers stop listening
    pub fn unregister(&self, id: u64) {
        let mut routes = self.inner.routes();
        routes.retain(|channel, route| {
            route.subscribers.retain(|(sub, _)| *sub != id);
            if route.subscribers.is_empty() {
                debug!(channel = %channel, "closing broadcast channel");
                route.task.abort();
                false
            } else {
                true
            }
        });
    }

    /// Route an event to local drivers without a broadcast round-trip
    pub async fn process_local(&self, channels: &[String], event: Arc<PubSubEvent>) {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        {
            let routes = self.inner.routes();
            for channel in channels {
                if let Some(route) = routes.get(channel) {
                    for (id, tx) in &route.subscribers {
                        if seen.insert(*id) {
                            targets.push(tx.clone());
                        }
                    }
                }
            }
        }
        trace!(targets = targets.len(), "optimistic local delivery");
        for tx in targets {
            let _ = tx.send(RoutedMessage::Event(event.clone())).await;
        }
    }

    /// Emit an event on every channel
    pub async fn emit(&self, channels: &[String], event: &PubSubEvent) -> PubSubResult<()> {
        for channel in channels {
            self.inner.broadcast.emit(channel, event).await?;
            metrics::event_published();
        }
        Ok(())
    }
}

async fn route_channel(
    manager: Weak<ManagerInner>,
    channel: String,
    mut receiver: broadcast::Receiver<Arc<PubSubEvent>>,
) {
    loop {
        let message = match receiver.recv().await {
            Ok(event) => {
                let Some(inner) = manager.upgrade() else { break };
                if event.writer_id.as_deref() == Some(inner.uid.as_str()) {
                    trace!(channel = %channel, id = %event.id(), "ignoring own optimistic echo");
                    metrics::echo_ignored();
                    continue;
                }
                RoutedMessage::Event(event)
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(channel = %channel, skipped, "broadcast channel lagged");
                RoutedMessage::Resync
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let Some(inner) = manager.upgrade() else { break };
        let senders = inner.senders(&channel);
        drop(inner);
        for tx in senders {
            let _ = tx.send(message.clone()).await;
        }
    }
    debug!(channel = %channel, "broadcast route finished");
}
