/*
    driver - Change detection strategies

    A driver turns one query into a stream of `DriverEvent`s: the initial
    result set as `Added` events, a `Ready` marker, then live changes. Three
    strategies exist:

    - poll: re-run the query periodically and diff
    - oplog: tail the store's ordered change log
    - pubsub: react to broadcast envelopes and re-check affected documents

    Which one serves a query is decided by `select_driver`, a pure function
    of the caller's choice, runtime capabilities and the query itself.
*/

pub mod oplog;
pub mod poll;
pub mod pubsub;

use crate::core_doc::{DocId, Document, QueryDescription};
use crate::core_observe::errors::{ObserveError, ObserveResult};
use crate::core_observe::event::{DriverEvent, DriverKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub use oplog::OplogDriver;
pub use poll::PollDriver;
pub use pubsub::PubSubDriver;

/// One change detection strategy bound to one query
#[async_trait]
pub trait ChangeDriver: Send + Sync {
    fn kind(&self) -> DriverKind;

    /// Send the initial result set followed by `Ready`, then keep sending
    /// changes from a background task until `stop` is called
    async fn start(&self, sink: mpsc::Sender<DriverEvent>) -> ObserveResult<()>;

    /// Stop producing events. Safe to call more than once.
    async fn stop(&self);
}

/// What the runtime can offer a new driver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverCapabilities {
    /// A broadcast manager exists and its transport is ready
    pub pubsub_ready: bool,
    /// The store exposes an ordered change log
    pub change_log: bool,
    /// Log tailing was switched off in configuration
    pub log_tailing_disabled: bool,
}

/// Pick the driver for `query`.
///
/// A forced driver is honoured or refused, never substituted. Otherwise
/// pub/sub is preferred when ready and the selector can be evaluated
/// locally, then log tailing for unwindowed queries, then polling.
pub fn select_driver(
    forced: Option<DriverKind>,
    caps: DriverCapabilities,
    query: &QueryDescription,
) -> ObserveResult<DriverKind> {
    let evaluable = query.selector.is_locally_evaluable();
    let log_usable = caps.change_log && !caps.log_tailing_disabled;

    match forced {
        Some(DriverKind::Poll) => Ok(DriverKind::Poll),
        Some(DriverKind::PubSub) => {
            if !caps.pubsub_ready {
                Err(unavailable(DriverKind::PubSub, "broadcast transport is not initialised"))
            } else if !evaluable {
                Err(unavailable(DriverKind::PubSub, "selector uses operators that cannot be evaluated locally"))
            } else {
                Ok(DriverKind::PubSub)
            }
        }
        Some(DriverKind::LogTailing) => {
            if !caps.change_log {
                Err(unavailable(DriverKind::LogTailing, "store has no change log"))
            } else if caps.log_tailing_disabled {
                Err(unavailable(DriverKind::LogTailing, "log tailing is disabled"))
            } else if !evaluable {
                Err(unavailable(DriverKind::LogTailing, "selector uses operators that cannot be evaluated locally"))
            } else if query.is_windowed() {
                Err(unavailable(DriverKind::LogTailing, "skip/limit queries need a full re-query"))
            } else {
                Ok(DriverKind::LogTailing)
            }
        }
        None if caps.pubsub_ready && evaluable => Ok(DriverKind::PubSub),
        None if log_usable && evaluable && !query.is_windowed() => Ok(DriverKind::LogTailing),
        None => Ok(DriverKind::Poll),
    }
}

fn unavailable(driver: DriverKind, reason: &str) -> ObserveError {
    ObserveError::DriverUnavailable {
        driver,
        reason: reason.to_string(),
    }
}

/// Diff a fresh result set against the known one, updating `known`.
/// Removals come first, then additions and changes in result order.
pub(crate) fn diff_results(known: &mut HashMap<DocId, Document>, fresh: Vec<Document>) -> Vec<DriverEvent> {
    let mut next: HashMap<DocId, Document> = HashMap::with_capacity(fresh.len());
    let mut ordered = Vec::with_capacity(fresh.len());
    for doc in fresh {
        if let Some(id) = DocId::of(&doc) {
            ordered.push(id.clone());
            next.insert(id, doc);
        }
    }

    let mut events = Vec::new();
    let mut gone: Vec<&DocId> = known.keys().filter(|id| !next.contains_key(*id)).collect();
    gone.sort();
    for id in gone {
        events.push(DriverEvent::Removed(id.clone()));
    }
    for id in &ordered {
        if let Some(doc) = next.get(id) {
            match known.get(id) {
                None => events.push(DriverEvent::Added(doc.clone())),
                Some(old) if old != doc => events.push(DriverEvent::Changed(doc.clone())),
                Some(_) => {}
            }
        }
    }
    *known = next;
    events
}

/// Stop signal and task handle shared by the driver implementations
pub(crate) struct DriverLoop {
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DriverLoop {
    pub(crate) fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            stop,
            task: Mutex::new(None),
        }
    }

    pub(crate) fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    pub(crate) fn attach(&self, handle: JoinHandle<()>) {
        let mut task = match self.task.lock() {
            Ok(task) => task,
            Err(poisoned) => poisoned.into_inner(),
        };
        *task = Some(handle);
    }

    /// Signal the loop and wait for it to finish
    pub(crate) async fn shutdown(&self) {
        let _ = self.stop.send(true);
        let handle = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Resolves once the stop flag is raised (or its sender is gone)
pub(crate) async fn stopped(signal: &mut watch::Receiver<bool>) {
    while !*signal.borrow() {
        if signal.changed().await.is_err() {
            return;
        }
    }
}
