//! Broadcast event envelope and channel naming

use crate::core_doc::DocId;
use serde::{Deserialize, Serialize};

/// Kind of write an envelope announces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PubSubEventKind {
    #[serde(rename = "i")]
    Insert,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "r")]
    Remove,
}

/// `{_id}` reference carried by an envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocRef {
    #[serde(rename = "_id")]
    pub id: DocId,
}

/// Envelope sent over broadcast channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PubSubEvent {
    #[serde(rename = "e")]
    pub event: PubSubEventKind,
    #[serde(rename = "d")]
    pub doc: DocRef,
    /// Top-level fields an update touched
    #[serde(rename = "f", default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    /// Process that already applied this event locally
    #[serde(rename = "u", default, skip_serializing_if = "Option::is_none")]
    pub writer_id: Option<String>,
}

impl PubSubEvent {
    pub fn insert(id: DocId) -> Self {
        Self {
            event: PubSubEventKind::Insert,
            doc: DocRef { id },
            fields: None,
            writer_id: None,
        }
    }

    pub fn update(id: DocId, fields: Vec<String>) -> Self {
        Self {
            event: PubSubEventKind::Update,
            doc: DocRef { id },
            fields: Some(fields),
            writer_id: None,
        }
    }

    pub fn remove(id: DocId) -> Self {
        Self {
            event: PubSubEventKind::Remove,
            doc: DocRef { id },
            fields: None,
            writer_id: None,
        }
    }

    pub fn with_writer(mut self, writer_id: impl Into<String>) -> Self {
        self.writer_id = Some(writer_id.into());
        self
    }

    pub fn id(&self) -> &DocId {
        &self.doc.id
    }
}

/// Channel scoping shared by publishers and observers
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ChannelScope {
    pub channel: Option<String>,
    pub channels: Vec<String>,
    pub namespace: Option<String>,
    pub namespaces: Vec<String>,
}

impl ChannelScope {
    pub fn channel(name: impl Into<String>) -> Self {
        Self {
            channel: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn namespace(name: impl Into<String>) -> Self {
        Self {
            namespace: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn is_default(&self) -> bool {
        self == &Self::default()
    }

    /// Stable textual form used in multiplexer keys
    pub fn key(&self) -> String {
        if self.is_default() {
            return String::new();
        }
        format!(
            "c={:?};cs={:?};n={:?};ns={:?}",
            self.channel, self.channels, self.namespace, self.namespaces
        )
    }
}

/// Per-mutation publishing options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    pub scope: ChannelScope,
    /// Apply locally before the broadcast round-trip; `None` uses the manager default
    pub optimistic: Option<bool>,
    /// `false` skips publication entirely
    pub push_to_broadcast: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            scope: ChannelScope::default(),
            optimistic: None,
            push_to_broadcast: true,
        }
    }
}

/// Channels a write (or an observer) uses.
///
/// Explicit channels and namespaced collection channels win; otherwise the
/// collection channel plus one `collection::id` channel per document.
pub fn channels_for(collection: &str, scope: &ChannelScope, doc_ids: &[DocId]) -> Vec<String> {
    let mut channels = Vec::new();
    if let Some(channel) = &scope.channel {
        channels.push(channel.clone());
    }
    channels.extend(scope.channels.iter().cloned());
    if let Some(ns) = &scope.namespace {
        channels.push(format!("{}::{}", ns, collection));
    }
    channels.extend(scope.namespaces.iter().map(|ns| format!("{}::{}", ns, collection)));

    if channels.is_empty() {
        channels.push(collection.to_string());
        channels.extend(doc_ids.iter().map(|id| format!("{}::{}", collection, id)));
    }
    channels
}

/// Channels an observer listens on: dedicated id channels when the selector
/// targets known ids, the collection channel otherwise
pub fn listen_channels(collection: &str, scope: &ChannelScope, ids: Option<&[DocId]>) -> Vec<String> {
    if !scope.is_default() {
        return channels_for(collection, scope, &[]);
    }
    match ids {
        Some(ids) if !ids.is_empty() => ids.iter().map(|id| format!("{}::{}", collection, id)).collect(),
        _ => vec![collection.to_string()],
    }
}
