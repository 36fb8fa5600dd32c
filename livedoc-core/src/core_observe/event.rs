//! Change events and observation options

use crate::core_doc::{DocId, Document, FieldChanges, Fields, Projection};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One change to a query's result set, as seen by a listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ChangeEvent {
    Added { id: DocId, fields: Fields },
    Changed { id: DocId, fields: FieldChanges },
    Removed { id: DocId },
}

impl ChangeEvent {
    pub fn id(&self) -> &DocId {
        match self {
            ChangeEvent::Added { id, .. } | ChangeEvent::Changed { id, .. } | ChangeEvent::Removed { id } => id,
        }
    }

    /// Keep only the fields a projection allows. Returns `None` when a
    /// `changed` event has nothing left to report.
    pub fn narrowed(&self, projection: &Projection) -> Option<ChangeEvent> {
        match self {
            ChangeEvent::Added { id, fields } => Some(ChangeEvent::Added {
                id: id.clone(),
                fields: fields
                    .iter()
                    .filter(|(k, _)| projection.includes(k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            }),
            ChangeEvent::Changed { id, fields } => {
                let fields: FieldChanges = fields
                    .iter()
                    .filter(|(k, _)| projection.includes(k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                if fields.is_empty() {
                    None
                } else {
                    Some(ChangeEvent::Changed { id: id.clone(), fields })
                }
            }
            ChangeEvent::Removed { id } => Some(ChangeEvent::Removed { id: id.clone() }),
        }
    }
}

/// Raw output of a change driver. Documents are full (projected) post-images
/// including `_id`; the multiplexer turns them into [`ChangeEvent`]s.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    Added(Document),
    Changed(Document),
    Removed(DocId),
    /// Initial result set fully sent
    Ready,
}

/// Change-detection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Poll,
    #[serde(alias = "log", alias = "oplog")]
    LogTailing,
    #[serde(alias = "redis")]
    PubSub,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Poll => "poll",
            DriverKind::LogTailing => "oplog",
            DriverKind::PubSub => "pubsub",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "poll" | "polling" => Ok(DriverKind::Poll),
            "log" | "oplog" | "logtailing" | "log-tailing" => Ok(DriverKind::LogTailing),
            "pubsub" | "redis" => Ok(DriverKind::PubSub),
            other => Err(format!("unknown driver: {}", other)),
        }
    }
}

/// What a listener sees when its mapped document did not change even
/// though the underlying fields did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappedChangePolicy {
    /// Drop the `changed` event
    #[default]
    SuppressUnchanged,
    /// Send a `changed` event carrying every mapped field
    AlwaysDeliver,
}

/// Per-listener observation options
#[derive(Debug, Clone, Default)]
pub struct ObserveOptions {
    /// Skip the initial `added` events for documents already in the result
    pub suppress_initial: bool,
    /// Do not track positions; `*_at` and `moved_to` callbacks are refused
    pub no_indices: bool,
    /// Narrow delivered fields for this listener only
    pub fields: Option<Projection>,
    /// Force a driver instead of letting the registry choose
    pub driver: Option<DriverKind>,
    /// Override the configured mapped-change policy
    pub mapped_change_policy: Option<MappedChangePolicy>,
}

impl ObserveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suppress_initial(mut self) -> Self {
        self.suppress_initial = true;
        self
    }

    pub fn no_indices(mut self) -> Self {
        self.no_indices = true;
        self
    }

    pub fn fields(mut self, projection: Projection) -> Self {
        self.fields = Some(projection);
        self
    }

    pub fn driver(mut self, driver: DriverKind) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn mapped_change_policy(mut self, policy: MappedChangePolicy) -> Self {
        self.mapped_change_policy = Some(policy);
        self
    }
}
