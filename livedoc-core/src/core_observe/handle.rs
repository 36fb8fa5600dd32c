/*
    handle.rs - Per-listener delivery and the handle that stops it

    Every listener runs its own delivery task that drains its multiplexer
    queue. The task applies the cursor's document transform and map chain,
    the mapped-change policy and the listener's field narrowing, then calls
    the listener's callbacks. The stop flag is checked before every call so
    nothing reaches a stopped listener, even events already queued.
*/

use crate::core_access::DocTransform;
use crate::core_doc::{apply_changes, diff_fields, split_id, with_id, DocId, Document, FieldChanges, Fields, Projection, SortSpec};
use crate::core_observe::callbacks::{ChangeCallbacks, ObserveCallbacks, SubscriptionSink};
use crate::core_observe::event::{ChangeEvent, DriverKind, MappedChangePolicy};
use crate::core_observe::multiplexer::{ListenerMessage, ObserveMultiplexer};
use crate::core_observe::registry::ObserveRegistry;
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Transform plus map chain applied to every delivered document
#[derive(Clone, Default)]
pub(crate) struct DocPipeline {
    pub(crate) transform: Option<DocTransform>,
    pub(crate) maps: Vec<DocTransform>,
}

impl DocPipeline {
    pub(crate) fn is_identity(&self) -> bool {
        self.transform.is_none() && self.maps.is_empty()
    }

    pub(crate) fn apply(&self, doc: Document) -> Document {
        let doc = match &self.transform {
            Some(transform) => transform(doc),
            None => doc,
        };
        self.maps.iter().fold(doc, |doc, map| map(doc))
    }

    fn apply_fields(&self, id: &DocId, fields: &Fields) -> Fields {
        split_id(self.apply(with_id(id, fields))).1
    }
}

/// Listener-side view turning raw multiplexer events into delivered ones
pub(crate) struct MappedView {
    pipeline: DocPipeline,
    policy: MappedChangePolicy,
    fields: Option<Projection>,
    raw: HashMap<DocId, Fields>,
    mapped: HashMap<DocId, Fields>,
}

impl MappedView {
    pub(crate) fn new(pipeline: DocPipeline, policy: MappedChangePolicy, fields: Option<Projection>) -> Self {
        Self {
            pipeline,
            policy,
            fields,
            raw: HashMap::new(),
            mapped: HashMap::new(),
        }
    }

    /// The event this listener should see, if any. Unmapped events are
    /// passed through without copying.
    pub(crate) fn apply(&mut self, event: &Arc<ChangeEvent>) -> Option<Arc<ChangeEvent>> {
        let delivered = if self.pipeline.is_identity() {
            event.clone()
        } else {
            Arc::new(self.map_event(event)?)
        };
        match &self.fields {
            Some(projection) => delivered.narrowed(projection).map(Arc::new),
            None => Some(delivered),
        }
    }

    fn map_event(&mut self, event: &ChangeEvent) -> Option<ChangeEvent> {
        match event {
            ChangeEvent::Added { id, fields } => {
                let out = self.pipeline.apply_fields(id, fields);
                self.raw.insert(id.clone(), fields.clone());
                self.mapped.insert(id.clone(), out.clone());
                Some(ChangeEvent::Added { id: id.clone(), fields: out })
            }
            ChangeEvent::Changed { id, fields: changes } => {
                let raw = self.raw.entry(id.clone()).or_default();
                apply_changes(raw, changes);
                let raw = raw.clone();
                let new = self.pipeline.apply_fields(id, &raw);
                let old = self.mapped.insert(id.clone(), new.clone()).unwrap_or_default();
                let diff = diff_fields(&old, &new);

                let fields = match self.policy {
                    MappedChangePolicy::SuppressUnchanged if diff.is_empty() => return None,
                    MappedChangePolicy::SuppressUnchanged => diff,
                    MappedChangePolicy::AlwaysDeliver => {
                        // Every mapped field, plus the ones that disappeared
                        let mut full: FieldChanges = new.iter().map(|(k, v)| (k.clone(), Some(v.clone()))).collect();
                        full.extend(diff.into_iter().filter(|(_, v)| v.is_none()));
                        full
                    }
                };
                Some(ChangeEvent::Changed { id: id.clone(), fields })
            }
            ChangeEvent::Removed { id } => {
                self.raw.remove(id);
                self.mapped.remove(id);
                Some(ChangeEvent::Removed { id: id.clone() })
            }
        }
    }
}

/// Something that consumes a listener's events
pub(crate) trait Delivery: Send + 'static {
    /// `quiet` events update state without calling back
    fn deliver(&mut self, event: &Arc<ChangeEvent>, quiet: bool, stopped: &AtomicBool);
}

/// `observe_changes` delivery
pub(crate) struct ChangesDelivery {
    pub(crate) view: MappedView,
    pub(crate) callbacks: ChangeCallbacks,
}

impl Delivery for ChangesDelivery {
    fn deliver(&mut self, event: &Arc<ChangeEvent>, quiet: bool, stopped: &AtomicBool) {
        let Some(event) = self.view.apply(event) else {
            return;
        };
        if quiet || stopped.load(Ordering::SeqCst) {
            return;
        }
        match event.as_ref() {
            ChangeEvent::Added { id, fields } => self.callbacks.call_added(id, fields),
            ChangeEvent::Changed { id, fields } => self.callbacks.call_changed(id, fields),
            ChangeEvent::Removed { id } => self.callbacks.call_removed(id),
        }
    }
}

/// `publish` delivery: forwards to a transport sink
pub(crate) struct SinkDelivery {
    pub(crate) view: MappedView,
    pub(crate) collection: String,
    pub(crate) sink: Arc<dyn SubscriptionSink>,
}

impl Delivery for SinkDelivery {
    fn deliver(&mut self, event: &Arc<ChangeEvent>, quiet: bool, stopped: &AtomicBool) {
        let Some(event) = self.view.apply(event) else {
            return;
        };
        if quiet || stopped.load(Ordering::SeqCst) {
            return;
        }
        match event.as_ref() {
            ChangeEvent::Added { id, fields } => self.sink.added(&self.collection, id, fields),
            ChangeEvent::Changed { id, fields } => self.sink.changed(&self.collection, id, fields),
            ChangeEvent::Removed { id } => self.sink.removed(&self.collection, id),
        }
    }
}

/// `observe` delivery: whole documents, kept in query order
pub(crate) struct DocumentDelivery {
    pub(crate) pipeline: DocPipeline,
    pub(crate) policy: MappedChangePolicy,
    pub(crate) fields: Option<Projection>,
    pub(crate) sort: Option<SortSpec>,
    pub(crate) docs: Vec<Document>,
    pub(crate) callbacks: ObserveCallbacks,
}

impl DocumentDelivery {
    pub(crate) fn new(
        pipeline: DocPipeline,
        policy: MappedChangePolicy,
        fields: Option<Projection>,
        sort: Option<SortSpec>,
        callbacks: ObserveCallbacks,
    ) -> Self {
        Self {
            pipeline,
            policy,
            fields,
            sort,
            docs: Vec::new(),
            callbacks,
        }
    }

    fn position_of(&self, id: &DocId) -> Option<usize> {
        self.docs.iter().position(|d| DocId::of(d).as_ref() == Some(id))
    }

    fn insertion_point(&self, doc: &Document) -> usize {
        match &self.sort {
            Some(sort) => self
                .docs
                .iter()
                .position(|d| sort.compare(d, doc) == CmpOrdering::Greater)
                .unwrap_or(self.docs.len()),
            None => self.docs.len(),
        }
    }

    fn id_at(&self, index: usize) -> Option<DocId> {
        self.docs.get(index).and_then(DocId::of)
    }

    /// Transform, map, then narrow to the listener's fields
    fn output(&self, doc: Document) -> Document {
        let mapped = self.pipeline.apply(doc);
        match &self.fields {
            Some(projection) => projection.apply(&mapped),
            None => mapped,
        }
    }
}

impl Delivery for DocumentDelivery {
    fn deliver(&mut self, event: &Arc<ChangeEvent>, quiet: bool, stopped: &AtomicBool) {
        match event.as_ref() {
            ChangeEvent::Added { id, fields } => {
                let doc = with_id(id, fields);
                let index = self.insertion_point(&doc);
                self.docs.insert(index, doc.clone());
                let before = self.id_at(index + 1);
                if quiet || stopped.load(Ordering::SeqCst) {
                    return;
                }
                let mapped = self.output(doc);
                if let Some(f) = &mut self.callbacks.added_at {
                    f(mapped, index, before);
                } else if let Some(f) = &mut self.callbacks.added {
                    f(mapped);
                }
            }
            ChangeEvent::Changed { id, fields } => {
                let Some(from) = self.position_of(id) else {
                    return;
                };
                let old = self.docs[from].clone();
                let mut new = old.clone();
                apply_changes(&mut new, fields);

                let to = if self.sort.is_some() {
                    self.docs.remove(from);
                    let to = self.insertion_point(&new);
                    self.docs.insert(to, new.clone());
                    to
                } else {
                    self.docs[from] = new.clone();
                    from
                };
                if stopped.load(Ordering::SeqCst) {
                    return;
                }

                let mapped_new = self.output(new);
                let mapped_old = self.output(old);
                let deliver_change =
                    mapped_new != mapped_old || self.policy == MappedChangePolicy::AlwaysDeliver;
                if deliver_change {
                    if let Some(f) = &mut self.callbacks.changed_at {
                        f(mapped_new.clone(), mapped_old, from);
                    } else if let Some(f) = &mut self.callbacks.changed {
                        f(mapped_new.clone(), mapped_old);
                    }
                }
                if to != from && !stopped.load(Ordering::SeqCst) {
                    let before = self.id_at(to + 1);
                    if let Some(f) = &mut self.callbacks.moved_to {
                        f(mapped_new, from, to, before);
                    }
                }
            }
            ChangeEvent::Removed { id } => {
                let Some(index) = self.position_of(id) else {
                    return;
                };
                let old = self.docs.remove(index);
                if stopped.load(Ordering::SeqCst) {
                    return;
                }
                let mapped = self.output(old);
                if let Some(f) = &mut self.callbacks.removed_at {
                    f(mapped, index);
                } else if let Some(f) = &mut self.callbacks.removed {
                    f(mapped);
                }
            }
        }
    }
}

/// Drives one listener's delivery
pub(crate) struct ListenerTask<D> {
    delivery: D,
    stopped: Arc<AtomicBool>,
    suppress_initial: bool,
    initializing: bool,
    ready: Option<oneshot::Sender<()>>,
}

impl<D: Delivery> ListenerTask<D> {
    pub(crate) fn new(
        delivery: D,
        stopped: Arc<AtomicBool>,
        suppress_initial: bool,
        ready: oneshot::Sender<()>,
    ) -> Self {
        Self {
            delivery,
            stopped,
            suppress_initial,
            initializing: true,
            ready: Some(ready),
        }
    }

    fn handle(&mut self, message: ListenerMessage) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        match message {
            ListenerMessage::InitialDone => {
                self.initializing = false;
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(());
                }
            }
            ListenerMessage::Event(event) => {
                let quiet = self.initializing && self.suppress_initial;
                self.delivery.deliver(&event, quiet, &self.stopped);
            }
        }
        true
    }

    pub(crate) async fn run(mut self, initial: Vec<ListenerMessage>, mut rx: mpsc::Receiver<ListenerMessage>) {
        for message in initial {
            if !self.handle(message) {
                return;
            }
        }
        while let Some(message) = rx.recv().await {
            if !self.handle(message) {
                return;
            }
        }
        // Queue closed without a stop: the multiplexer dropped this listener
        if !self.stopped.swap(true, Ordering::SeqCst) {
            warn!("listener dropped by its multiplexer, observation ended");
        }
    }
}

struct HandleInner {
    registry: ObserveRegistry,
    key: String,
    mux: Arc<ObserveMultiplexer>,
    listener: u64,
    stopped: Arc<AtomicBool>,
    detached: AtomicBool,
}

/// Handle to a running observation
#[derive(Clone)]
pub struct ObserveHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for ObserveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserveHandle")
            .field("key", &self.inner.key)
            .field("listener", &self.inner.listener)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl ObserveHandle {
    pub(crate) fn new(
        registry: ObserveRegistry,
        key: String,
        mux: Arc<ObserveMultiplexer>,
        attachment_id: u64,
        stopped: Arc<AtomicBool>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                registry,
                key,
                mux,
                listener: attachment_id,
                stopped,
                detached: AtomicBool::new(false),
            }),
        }
    }

    /// Driver serving this observation
    pub fn driver(&self) -> DriverKind {
        self.inner.mux.kind()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stop delivery and release the listener. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        if self.inner.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(key = %self.inner.key, listener = self.inner.listener, "stopping observer");
        self.inner
            .registry
            .detach(&self.inner.key, &self.inner.mux, self.inner.listener)
            .await;
    }

    /// Stop from synchronous code; delivery ends at once, the detach runs
    /// in the background
    pub fn request_stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let handle = self.clone();
            runtime.spawn(async move { handle.stop().await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn fields(v: Value) -> Fields {
        v.as_object().cloned().unwrap()
    }

    fn product_pipeline() -> DocPipeline {
        DocPipeline {
            transform: None,
            maps: vec![Arc::new(|doc: Document| {
                let x = doc.get("x").and_then(Value::as_i64).unwrap_or(0);
                let y = doc.get("y").and_then(Value::as_i64).unwrap_or(0);
                let mut out = Document::new();
                if let Some(id) = doc.get("_id") {
                    out.insert("_id".to_string(), id.clone());
                }
                out.insert("result".to_string(), json!(x * y));
                out
            })],
        }
    }

    fn change(v: Value) -> FieldChanges {
        v.as_object()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), if v.is_null() { None } else { Some(v.clone()) }))
            .collect()
    }

    #[test]
    fn test_identity_view_shares_events() {
        let mut view = MappedView::new(DocPipeline::default(), MappedChangePolicy::default(), None);
        let event = Arc::new(ChangeEvent::Removed { id: DocId::from("a") });
        let delivered = view.apply(&event).unwrap();
        assert!(Arc::ptr_eq(&event, &delivered));
    }

    #[test]
    fn test_unchanged_mapped_value_suppressed() {
        let mut view = MappedView::new(product_pipeline(), MappedChangePolicy::SuppressUnchanged, None);
        let added = view
            .apply(&Arc::new(ChangeEvent::Added {
                id: DocId::from("doc1"),
                fields: fields(json!({"x": 2, "y": 3})),
            }))
            .unwrap();
        assert_eq!(
            *added,
            ChangeEvent::Added { id: DocId::from("doc1"), fields: fields(json!({"result": 6})) }
        );

        let changed = view.apply(&Arc::new(ChangeEvent::Changed {
            id: DocId::from("doc1"),
            fields: change(json!({"x": 3, "y": 2})),
        }));
        assert_eq!(changed, None);

        let changed = view
            .apply(&Arc::new(ChangeEvent::Changed {
                id: DocId::from("doc1"),
                fields: change(json!({"x": 4})),
            }))
            .unwrap();
        assert_eq!(
            *changed,
            ChangeEvent::Changed { id: DocId::from("doc1"), fields: change(json!({"result": 8})) }
        );
    }

    #[test]
    fn test_unchanged_mapped_value_always_delivered() {
        let mut view = MappedView::new(product_pipeline(), MappedChangePolicy::AlwaysDeliver, None);
        view.apply(&Arc::new(ChangeEvent::Added {
            id: DocId::from("doc1"),
            fields: fields(json!({"x": 2, "y": 3})),
        }));
        let changed = view
            .apply(&Arc::new(ChangeEvent::Changed {
                id: DocId::from("doc1"),
                fields: change(json!({"x": 3, "y": 2})),
            }))
            .unwrap();
        assert_eq!(
            *changed,
            ChangeEvent::Changed { id: DocId::from("doc1"), fields: change(json!({"result": 6})) }
        );
    }

    #[test]
    fn test_ordered_delivery_reports_positions_and_moves() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (added, moved, removed) = (log.clone(), log.clone(), log.clone());
        let callbacks = ObserveCallbacks::new()
            .added_at(move |doc, index, before| {
                added
                    .lock()
                    .unwrap()
                    .push(format!("added {} at {} before {:?}", doc["_id"], index, before.map(|b| b.0)));
            })
            .moved_to(move |doc, from, to, _| {
                moved.lock().unwrap().push(format!("moved {} {}->{}", doc["_id"], from, to));
            })
            .removed_at(move |doc, index| {
                removed.lock().unwrap().push(format!("removed {} at {}", doc["_id"], index));
            });
        let mut delivery = DocumentDelivery::new(
            DocPipeline::default(),
            MappedChangePolicy::default(),
            None,
            Some(SortSpec::new().asc("rank")),
            callbacks,
        );
        let stopped = AtomicBool::new(false);

        for (id, rank) in [("a", 2), ("b", 1)] {
            delivery.deliver(
                &Arc::new(ChangeEvent::Added { id: DocId::from(id), fields: fields(json!({"rank": rank})) }),
                false,
                &stopped,
            );
        }
        delivery.deliver(
            &Arc::new(ChangeEvent::Changed { id: DocId::from("b"), fields: change(json!({"rank": 3})) }),
            false,
            &stopped,
        );
        delivery.deliver(&Arc::new(ChangeEvent::Removed { id: DocId::from("a") }), false, &stopped);

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "added \"a\" at 0 before None",
                "added \"b\" at 0 before Some(\"a\")",
                "moved \"b\" 0->1",
                "removed \"a\" at 0",
            ]
        );
    }

    #[test]
    fn test_document_maps_see_fields_outside_narrowing() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (added, changed) = (log.clone(), log.clone());
        let callbacks = ObserveCallbacks::new()
            .added(move |doc| added.lock().unwrap().push(doc))
            .changed(move |new, _| changed.lock().unwrap().push(new));
        let mut delivery = DocumentDelivery::new(
            product_pipeline(),
            MappedChangePolicy::SuppressUnchanged,
            Some(Projection::include(["result"])),
            None,
            callbacks,
        );
        let stopped = AtomicBool::new(false);

        delivery.deliver(
            &Arc::new(ChangeEvent::Added { id: DocId::from("doc1"), fields: fields(json!({"x": 2, "y": 3})) }),
            false,
            &stopped,
        );
        delivery.deliver(
            &Arc::new(ChangeEvent::Changed { id: DocId::from("doc1"), fields: change(json!({"x": 4})) }),
            false,
            &stopped,
        );

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                fields(json!({"_id": "doc1", "result": 6})),
                fields(json!({"_id": "doc1", "result": 12})),
            ]
        );
    }

    #[tokio::test]
    async fn test_closed_queue_ends_observation() {
        let stopped = Arc::new(AtomicBool::new(false));
        let delivery = ChangesDelivery {
            view: MappedView::new(DocPipeline::default(), MappedChangePolicy::default(), None),
            callbacks: ChangeCallbacks::new(),
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = ListenerTask::new(delivery, stopped.clone(), false, ready_tx);
        let (tx, rx) = mpsc::channel(1);
        drop(tx);

        task.run(vec![ListenerMessage::InitialDone], rx).await;
        assert!(ready_rx.await.is_ok());
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stopped_listener_gets_nothing() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = count.clone();
        let mut delivery = ChangesDelivery {
            view: MappedView::new(DocPipeline::default(), MappedChangePolicy::default(), None),
            callbacks: ChangeCallbacks::new().removed(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        };
        let stopped = AtomicBool::new(true);
        delivery.deliver(&Arc::new(ChangeEvent::Removed { id: DocId::from("a") }), false, &stopped);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
