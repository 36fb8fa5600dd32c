//! Poll-and-diff driver
//!
//! Re-runs the query every `poll_interval`, and shortly after any write to
//! the collection made through this process. Writes arriving within
//! `poll_throttle` of each other share one re-query.

use crate::core_doc::QueryDescription;
use crate::core_observe::driver::{diff_results, stopped, ChangeDriver, DriverLoop};
use crate::core_observe::errors::{ObserveError, ObserveResult};
use crate::core_observe::event::{DriverEvent, DriverKind};
use crate::core_store::DocumentStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

pub struct PollDriver {
    store: Arc<dyn DocumentStore>,
    query: QueryDescription,
    interval: Duration,
    throttle: Duration,
    writes: watch::Receiver<u64>,
    driver_loop: DriverLoop,
}

impl PollDriver {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        query: QueryDescription,
        interval: Duration,
        throttle: Duration,
        writes: watch::Receiver<u64>,
    ) -> Self {
        Self {
            store,
            query,
            interval,
            throttle,
            writes,
            driver_loop: DriverLoop::new(),
        }
    }
}

#[async_trait]
impl ChangeDriver for PollDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Poll
    }

    async fn start(&self, sink: mpsc::Sender<DriverEvent>) -> ObserveResult<()> {
        let mut known = HashMap::new();
        let docs = self.store.find(&self.query).await?;
        for event in diff_results(&mut known, docs) {
            sink.send(event).await.map_err(|_| ObserveError::Stopped)?;
        }
        sink.send(DriverEvent::Ready).await.map_err(|_| ObserveError::Stopped)?;

        let store = self.store.clone();
        let query = self.query.clone();
        let throttle = self.throttle;
        let mut writes = self.writes.clone();
        writes.borrow_and_update();
        let mut stop = self.driver_loop.stop_signal();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let handle = tokio::spawn(async move {
            // interval() fires immediately; the initial query already ran
            ticker.tick().await;
            let mut writes_open = true;
            loop {
                tokio::select! {
                    _ = stopped(&mut stop) => break,
                    _ = ticker.tick() => {}
                    changed = writes.changed(), if writes_open => {
                        if changed.is_err() {
                            writes_open = false;
                            continue;
                        }
                        tokio::select! {
                            _ = stopped(&mut stop) => break,
                            _ = tokio::time::sleep(throttle) => {}
                        }
                        writes.borrow_and_update();
                    }
                }

                match store.find(&query).await {
                    Ok(docs) => {
                        for event in diff_results(&mut known, docs) {
                            if sink.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!(collection = %query.collection, error = %e, "poll query failed"),
                }
            }
            debug!(collection = %query.collection, "poll driver stopped");
        });
        self.driver_loop.attach(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.driver_loop.shutdown().await;
    }
}
