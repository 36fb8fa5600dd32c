/*
    oplog.rs - Change-log tailing driver

    Subscribes to the store's change log before taking the initial snapshot,
    then applies every later entry for the collection in log order. Entries
    carry post-images, so matching and projection happen here without
    reading back from the store. A lagging receiver triggers a re-query.
*/

use crate::core_doc::{DocId, Document, QueryDescription};
use crate::core_observe::driver::{diff_results, stopped, ChangeDriver, DriverLoop};
use crate::core_observe::errors::{ObserveError, ObserveResult};
use crate::core_observe::event::{DriverEvent, DriverKind};
use crate::core_store::{ChangeLog, DocumentStore, LogEntry, LogOp};
use crate::metrics;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

pub struct OplogDriver {
    store: Arc<dyn DocumentStore>,
    query: QueryDescription,
    log: ChangeLog,
    driver_loop: DriverLoop,
}

impl OplogDriver {
    pub fn new(store: Arc<dyn DocumentStore>, query: QueryDescription, log: ChangeLog) -> Self {
        Self {
            store,
            query,
            log,
            driver_loop: DriverLoop::new(),
        }
    }
}

/// Fold one log entry into the known result set
fn apply_entry(query: &QueryDescription, known: &mut HashMap<DocId, Document>, op: &LogOp) -> Option<DriverEvent> {
    match op {
        LogOp::Insert { doc } | LogOp::Update { doc, .. } => {
            let id = DocId::of(doc)?;
            if query.selector.matches(doc) {
                let projected = query.project(doc);
                match known.insert(id, projected.clone()) {
                    None => Some(DriverEvent::Added(projected)),
                    Some(old) if old != projected => Some(DriverEvent::Changed(projected)),
                    Some(_) => None,
                }
            } else {
                known.remove(&id).map(|_| DriverEvent::Removed(id))
            }
        }
        LogOp::Remove { id } => known.remove(id).map(|_| DriverEvent::Removed(id.clone())),
    }
}

#[async_trait]
impl ChangeDriver for OplogDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::LogTailing
    }

    async fn start(&self, sink: mpsc::Sender<DriverEvent>) -> ObserveResult<()> {
        let mut entries = self.log.subscribe();
        let snapshot = self.store.snapshot(&self.query).await?;
        let mut applied = snapshot.seq.unwrap_or(0);

        let mut known = HashMap::new();
        for event in diff_results(&mut known, snapshot.docs) {
            sink.send(event).await.map_err(|_| ObserveError::Stopped)?;
        }
        sink.send(DriverEvent::Ready).await.map_err(|_| ObserveError::Stopped)?;

        let store = self.store.clone();
        let query = self.query.clone();
        let mut stop = self.driver_loop.stop_signal();

        let handle = tokio::spawn(async move {
            loop {
                let received: Result<Arc<LogEntry>, broadcast::error::RecvError> = tokio::select! {
                    _ = stopped(&mut stop) => break,
                    received = entries.recv() => received,
                };

                let events = match received {
                    Ok(entry) => {
                        if entry.seq <= applied || entry.collection != query.collection {
                            continue;
                        }
                        applied = entry.seq;
                        apply_entry(&query, &mut known, &entry.op).into_iter().collect()
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(collection = %query.collection, skipped, "change log lagged, re-querying");
                        metrics::driver_resync();
                        match store.snapshot(&query).await {
                            Ok(snapshot) => {
                                if let Some(seq) = snapshot.seq {
                                    applied = applied.max(seq);
                                }
                                diff_results(&mut known, snapshot.docs)
                            }
                            Err(e) => {
                                warn!(collection = %query.collection, error = %e, "resync query failed");
                                continue;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                for event in events {
                    if sink.send(event).await.is_err() {
                        return;
                    }
                }
            }
            debug!(collection = %query.collection, "oplog driver stopped");
        });
        self.driver_loop.attach(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.driver_loop.shutdown().await;
    }
}
