//! Broadcast channel collaborator
//!
//! `emit` publishes an envelope on a named channel; `listen` returns a
//! receiver for everything emitted on that channel afterwards.

use crate::core_pubsub::errors::{PubSubError, PubSubResult};
use crate::core_pubsub::event::PubSubEvent;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::trace;

/// Channel fan-out transport
#[async_trait]
pub trait Broadcast: Send + Sync {
    /// Publish `event` to every current listener of `channel`
    async fn emit(&self, channel: &str, event: &PubSubEvent) -> PubSubResult<()>;

    /// Start receiving events published on `channel`
    fn listen(&self, channel: &str) -> PubSubResult<broadcast::Receiver<Arc<PubSubEvent>>>;

    /// Whether the transport is initialised and usable
    fn is_ready(&self) -> bool {
        true
    }
}

/// In-process broadcast transport.
///
/// Envelopes go through a JSON encode/decode step so listeners receive
/// exactly what a networked transport would deliver.
pub struct MemoryBroadcast {
    channels: Mutex<HashMap<String, broadcast::Sender<Arc<PubSubEvent>>>>,
    capacity: usize,
    closed: AtomicBool,
    emitted: AtomicU64,
}

impl MemoryBroadcast {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
            emitted: AtomicU64::new(0),
        }
    }

    /// Shut the transport down; later emits and listens fail
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        match self.channels.lock() {
            Ok(mut channels) => channels.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    /// Envelopes emitted so far
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::SeqCst)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Arc<PubSubEvent>> {
        let mut channels = match self.channels.lock() {
            Ok(channels) => channels,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for MemoryBroadcast {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Broadcast for MemoryBroadcast {
    async fn emit(&self, channel: &str, event: &PubSubEvent) -> PubSubResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PubSubError::Closed);
        }
        let wire = serde_json::to_string(event).map_err(|e| PubSubError::Serialization(e.to_string()))?;
        let decoded: PubSubEvent =
            serde_json::from_str(&wire).map_err(|e| PubSubError::Serialization(e.to_string()))?;

        self.emitted.fetch_add(1, Ordering::SeqCst);
        // No receivers is not an error: nobody is listening on this channel yet
        let receivers = self.sender(channel).send(Arc::new(decoded)).unwrap_or(0);
        trace!(channel, receivers, "broadcast emit");
        Ok(())
    }

    fn listen(&self, channel: &str) -> PubSubResult<broadcast::Receiver<Arc<PubSubEvent>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PubSubError::ChannelUnavailable(channel.to_string()));
        }
        Ok(self.sender(channel).subscribe())
    }

    fn is_ready(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}
