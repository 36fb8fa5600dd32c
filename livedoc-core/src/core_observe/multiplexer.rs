/*
    multiplexer.rs - One driver, many listeners

    The multiplexer owns the driver for one query key and keeps the full
    current field set of every document in the result. A pump task turns
    driver output into `ChangeEvent`s and fans them out without waiting:
    each listener has its own bounded queue, and a listener whose queue is
    full or closed is dropped so it never holds back the driver or the
    other listeners.

    New listeners get a synthetic `added` for every known document, taken
    under the same lock the pump uses, so no event is lost or doubled
    between the snapshot and the live stream.
*/

use crate::core_doc::{diff_fields, split_id, DocId, Fields};
use crate::core_observe::driver::ChangeDriver;
use crate::core_observe::errors::ObserveResult;
use crate::core_observe::event::{ChangeEvent, DriverEvent, DriverKind};
use crate::metrics;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// What a listener's queue carries
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerMessage {
    Event(Arc<ChangeEvent>),
    /// Every document of the initial result set has been delivered
    InitialDone,
}

/// A listener's place on a multiplexer
#[derive(Debug)]
pub struct Attachment {
    pub id: u64,
    /// Snapshot of the current result, to deliver before `rx`
    pub initial: Vec<ListenerMessage>,
    pub rx: mpsc::Receiver<ListenerMessage>,
}

struct ListenerSlot {
    tx: mpsc::Sender<ListenerMessage>,
    awaiting_initial: bool,
}

#[derive(Default)]
struct MuxState {
    known: BTreeMap<DocId, Fields>,
    listeners: HashMap<u64, ListenerSlot>,
    ready: bool,
    next_listener: u64,
}

pub struct ObserveMultiplexer {
    key: String,
    kind: DriverKind,
    driver: Arc<dyn ChangeDriver>,
    state: Mutex<MuxState>,
    pump: StdMutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    listener_buffer: usize,
}

impl fmt::Debug for ObserveMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserveMultiplexer")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

impl ObserveMultiplexer {
    /// Start `driver` and the pump feeding listeners from it
    pub async fn start(
        key: String,
        driver: Arc<dyn ChangeDriver>,
        driver_buffer: usize,
        listener_buffer: usize,
    ) -> ObserveResult<Arc<Self>> {
        let kind = driver.kind();
        let mux = Arc::new(Self {
            key,
            kind,
            driver: driver.clone(),
            state: Mutex::new(MuxState::default()),
            pump: StdMutex::new(None),
            stopped: AtomicBool::new(false),
            listener_buffer: listener_buffer.max(1),
        });

        let (sink, events) = mpsc::channel(driver_buffer.max(1));
        let pump = tokio::spawn(pump(Arc::downgrade(&mux), events));
        mux.set_pump(pump);

        if let Err(e) = driver.start(sink).await {
            mux.stopped.store(true, Ordering::SeqCst);
            driver.stop().await;
            mux.abort_pump();
            return Err(e);
        }

        info!(key = %mux.key, driver = %kind, "multiplexer started");
        metrics::multiplexer_opened();
        metrics::driver_started(kind.as_str());
        Ok(mux)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> DriverKind {
        self.kind
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub async fn listener_count(&self) -> usize {
        self.state.lock().await.listeners.len()
    }

    /// Whether the driver has delivered its initial result set
    pub async fn is_ready(&self) -> bool {
        self.state.lock().await.ready
    }

    /// Documents currently in the result set
    pub async fn known_ids(&self) -> Vec<DocId> {
        self.state.lock().await.known.keys().cloned().collect()
    }

    fn set_pump(&self, handle: JoinHandle<()>) {
        match self.pump.lock() {
            Ok(mut pump) => *pump = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
    }

    fn abort_pump(&self) {
        let handle = match self.pump.lock() {
            Ok(mut pump) => pump.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Add a listener
    pub async fn attach(&self) -> Attachment {
        let (tx, rx) = mpsc::channel(self.listener_buffer);
        let mut state = self.state.lock().await;
        let id = state.next_listener;
        state.next_listener += 1;

        let mut initial: Vec<ListenerMessage> = state
            .known
            .iter()
            .map(|(id, fields)| {
                ListenerMessage::Event(Arc::new(ChangeEvent::Added {
                    id: id.clone(),
                    fields: fields.clone(),
                }))
            })
            .collect();
        if state.ready {
            initial.push(ListenerMessage::InitialDone);
        }
        let awaiting_initial = !state.ready;
        state.listeners.insert(
            id,
            ListenerSlot {
                tx,
                awaiting_initial,
            },
        );
        metrics::listener_attached();
        debug!(key = %self.key, listener = id, snapshot = initial.len(), "listener attached");

        Attachment { id, initial, rx }
    }

    /// Remove a listener and return how many remain
    pub async fn detach(&self, listener: u64) -> usize {
        let mut state = self.state.lock().await;
        if state.listeners.remove(&listener).is_some() {
            metrics::listener_detached();
            debug!(key = %self.key, listener, "listener detached");
        }
        state.listeners.len()
    }

    /// Drop listeners the pump could not deliver to. Their queues close once
    /// drained, which ends their delivery.
    async fn drop_listeners(&self, listeners: &[u64]) {
        let mut state = self.state.lock().await;
        for listener in listeners {
            if state.listeners.remove(listener).is_some() {
                metrics::listener_detached();
            }
        }
    }

    /// Tear down the driver. Only the first call does anything.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // Pump first, so a driver blocked on a full queue sees it close
        self.abort_pump();
        self.driver.stop().await;
        {
            let mut state = self.state.lock().await;
            for _ in state.listeners.drain() {
                metrics::listener_detached();
            }
        }
        metrics::multiplexer_closed();
        metrics::driver_stopped(self.kind.as_str());
        info!(key = %self.key, driver = %self.kind, "multiplexer stopped");
    }

    /// Fold one driver event into the known set and pick recipients
    async fn apply(&self, event: DriverEvent) -> Vec<(u64, mpsc::Sender<ListenerMessage>, ListenerMessage)> {
        let mut state = self.state.lock().await;
        let message = match event {
            DriverEvent::Added(doc) | DriverEvent::Changed(doc) => {
                let (id, fields) = split_id(doc);
                let Some(id) = id else {
                    return Vec::new();
                };
                let change = match state.known.get(&id) {
                    Some(old) => {
                        let changes = diff_fields(old, &fields);
                        if changes.is_empty() {
                            None
                        } else {
                            Some(ChangeEvent::Changed {
                                id: id.clone(),
                                fields: changes,
                            })
                        }
                    }
                    None => Some(ChangeEvent::Added {
                        id: id.clone(),
                        fields: fields.clone(),
                    }),
                };
                state.known.insert(id, fields);
                match change {
                    Some(change) => ListenerMessage::Event(Arc::new(change)),
                    None => return Vec::new(),
                }
            }
            DriverEvent::Removed(id) => {
                if state.known.remove(&id).is_none() {
                    return Vec::new();
                }
                ListenerMessage::Event(Arc::new(ChangeEvent::Removed { id }))
            }
            DriverEvent::Ready => {
                state.ready = true;
                return state
                    .listeners
                    .iter_mut()
                    .filter(|(_, slot)| slot.awaiting_initial)
                    .map(|(id, slot)| {
                        slot.awaiting_initial = false;
                        (*id, slot.tx.clone(), ListenerMessage::InitialDone)
                    })
                    .collect();
            }
        };

        state
            .listeners
            .iter()
            .map(|(id, slot)| (*id, slot.tx.clone(), message.clone()))
            .collect()
    }
}

async fn pump(mux: std::sync::Weak<ObserveMultiplexer>, mut events: mpsc::Receiver<DriverEvent>) {
    while let Some(event) = events.recv().await {
        let Some(mux) = mux.upgrade() else { break };
        if mux.is_stopped() {
            break;
        }
        let mut dropped = Vec::new();
        for (listener, tx, message) in mux.apply(event).await {
            let is_event = matches!(message, ListenerMessage::Event(_));
            match tx.try_send(message) {
                Ok(()) if is_event => metrics::event_delivered(),
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(key = %mux.key, listener, "listener queue full, dropping listener");
                    metrics::listener_overflowed();
                    dropped.push(listener);
                }
                Err(TrySendError::Closed(_)) => {
                    trace!(key = %mux.key, listener, "listener queue closed");
                    dropped.push(listener);
                }
            }
        }
        if !dropped.is_empty() {
            mux.drop_listeners(&dropped).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_doc::Document;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Driver fed by hand from the test
    struct ScriptedDriver {
        initial: Vec<Document>,
        sink: StdMutex<Option<mpsc::Sender<DriverEvent>>>,
        stops: AtomicUsize,
    }

    impl ScriptedDriver {
        fn new(initial: Vec<Document>) -> Arc<Self> {
            Arc::new(Self {
                initial,
                sink: StdMutex::new(None),
                stops: AtomicUsize::new(0),
            })
        }

        async fn push(&self, event: DriverEvent) {
            let sink = self.sink.lock().unwrap().clone().unwrap();
            sink.send(event).await.unwrap();
        }
    }

    #[async_trait]
    impl ChangeDriver for ScriptedDriver {
        fn kind(&self) -> DriverKind {
            DriverKind::Poll
        }

        async fn start(&self, sink: mpsc::Sender<DriverEvent>) -> ObserveResult<()> {
            for doc in &self.initial {
                sink.send(DriverEvent::Added(doc.clone())).await.unwrap();
            }
            sink.send(DriverEvent::Ready).await.unwrap();
            *self.sink.lock().unwrap() = Some(sink);
            Ok(())
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.sink.lock().unwrap().take();
        }
    }

    fn doc(v: serde_json::Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    async fn next(rx: &mut mpsc::Receiver<ListenerMessage>) -> ListenerMessage {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out")
            .expect("closed")
    }

    async fn next_or_closed(rx: &mut mpsc::Receiver<ListenerMessage>) -> Option<ListenerMessage> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out")
    }

    fn event(message: ListenerMessage) -> ChangeEvent {
        match message {
            ListenerMessage::Event(event) => (*event).clone(),
            other => panic!("expected event, got {:?}", other),
        }
    }

    async fn settled(mux: &ObserveMultiplexer, count: usize) {
        for _ in 0..100 {
            if mux.is_ready().await && mux.known_ids().await.len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("multiplexer never reached {} documents", count);
    }

    #[tokio::test]
    async fn test_late_listener_gets_snapshot_as_added() {
        let driver = ScriptedDriver::new(vec![doc(json!({"_id": "a", "x": 1}))]);
        let mux = ObserveMultiplexer::start("k".to_string(), driver.clone(), 8, 8).await.unwrap();
        settled(&mux, 1).await;

        let attachment = mux.attach().await;
        assert_eq!(
            attachment.initial,
            vec![
                ListenerMessage::Event(Arc::new(ChangeEvent::Added {
                    id: DocId::from("a"),
                    fields: doc(json!({"x": 1})),
                })),
                ListenerMessage::InitialDone,
            ]
        );
        mux.stop().await;
    }

    #[tokio::test]
    async fn test_events_computed_from_known_set() {
        let driver = ScriptedDriver::new(vec![]);
        let mux = ObserveMultiplexer::start("k".to_string(), driver.clone(), 8, 8).await.unwrap();
        let mut first = mux.attach().await;
        let mut second = mux.attach().await;

        driver.push(DriverEvent::Changed(doc(json!({"_id": "a", "x": 1})))).await;
        driver.push(DriverEvent::Added(doc(json!({"_id": "a", "x": 1})))).await;
        driver.push(DriverEvent::Added(doc(json!({"_id": "a", "x": 2, "y": 1})))).await;
        driver.push(DriverEvent::Removed(DocId::from("nope"))).await;
        driver.push(DriverEvent::Removed(DocId::from("a"))).await;

        for attachment in [&mut first, &mut second] {
            let rx = &mut attachment.rx;
            if attachment.initial.is_empty() {
                assert_eq!(next(rx).await, ListenerMessage::InitialDone);
            }
            assert_eq!(
                event(next(rx).await),
                ChangeEvent::Added { id: DocId::from("a"), fields: doc(json!({"x": 1})) }
            );
            let mut changes = crate::core_doc::FieldChanges::new();
            changes.insert("x".to_string(), Some(json!(2)));
            changes.insert("y".to_string(), Some(json!(1)));
            assert_eq!(
                event(next(rx).await),
                ChangeEvent::Changed { id: DocId::from("a"), fields: changes }
            );
            assert_eq!(event(next(rx).await), ChangeEvent::Removed { id: DocId::from("a") });
        }
        mux.stop().await;
    }

    #[tokio::test]
    async fn test_detached_listener_stops_receiving() {
        let driver = ScriptedDriver::new(vec![]);
        let mux = ObserveMultiplexer::start("k".to_string(), driver.clone(), 8, 8).await.unwrap();
        let gone = mux.attach().await;
        let mut stays = mux.attach().await;
        assert_eq!(mux.detach(gone.id).await, 1);

        driver.push(DriverEvent::Added(doc(json!({"_id": "b"})))).await;
        let mut rx = gone.rx;
        let mut got = Vec::new();
        while let Ok(message) = rx.try_recv() {
            got.push(message);
        }
        assert!(got.iter().all(|m| !matches!(m, ListenerMessage::Event(_))));

        loop {
            if let ListenerMessage::Event(event) = next(&mut stays.rx).await {
                assert_eq!(event.id(), &DocId::from("b"));
                break;
            }
        }
        mux.stop().await;
    }

    #[tokio::test]
    async fn test_stalled_listener_does_not_hold_back_others() {
        let driver = ScriptedDriver::new(vec![]);
        let mux = ObserveMultiplexer::start("k".to_string(), driver.clone(), 8, 2).await.unwrap();
        settled(&mux, 0).await;
        // Never drained
        let stalled = mux.attach().await;
        let mut live = mux.attach().await;

        for n in 0..6 {
            let id = format!("d{}", n);
            driver.push(DriverEvent::Added(doc(json!({"_id": id, "n": n})))).await;
            assert_eq!(
                event(next(&mut live.rx).await),
                ChangeEvent::Added { id: DocId::from(id.as_str()), fields: doc(json!({"n": n})) }
            );
        }
        assert_eq!(mux.listener_count().await, 1);

        // The stalled queue keeps what fit, then closes
        let mut rx = stalled.rx;
        let mut buffered = 0;
        while let Some(message) = next_or_closed(&mut rx).await {
            assert!(matches!(message, ListenerMessage::Event(_)));
            buffered += 1;
        }
        assert_eq!(buffered, 2);
        mux.stop().await;
    }

    #[tokio::test]
    async fn test_closed_listener_is_dropped() {
        let driver = ScriptedDriver::new(vec![]);
        let mux = ObserveMultiplexer::start("k".to_string(), driver.clone(), 8, 8).await.unwrap();
        settled(&mux, 0).await;
        let gone = mux.attach().await;
        let mut stays = mux.attach().await;
        drop(gone);

        driver.push(DriverEvent::Added(doc(json!({"_id": "a"})))).await;
        driver.push(DriverEvent::Added(doc(json!({"_id": "b"})))).await;
        assert_eq!(event(next(&mut stays.rx).await).id(), &DocId::from("a"));
        assert_eq!(event(next(&mut stays.rx).await).id(), &DocId::from("b"));
        assert_eq!(mux.listener_count().await, 1);
        mux.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let driver = ScriptedDriver::new(vec![]);
        let mux = ObserveMultiplexer::start("k".to_string(), driver.clone(), 8, 8).await.unwrap();
        mux.stop().await;
        mux.stop().await;
        assert!(mux.is_stopped());
        assert_eq!(driver.stops.load(Ordering::SeqCst), 1);
    }
}
