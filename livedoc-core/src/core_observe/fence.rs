/*
    fence.rs - Write fence gating when queued publications become visible

    Writes join the fence with `begin_write`. Work that must not be seen
    before those writes are durable is queued with `on_visible`. Once the
    fence is armed and every write has finished, `visible()` runs the queued
    work in order and releases every waiter.
*/

use crate::core_observe::errors::{ObserveError, ObserveResult};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::trace;

/// Work deferred until the fence fires
pub type VisibleWork = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Default)]
struct FenceState {
    outstanding: usize,
    armed: bool,
    firing: bool,
    completed: bool,
    queued: Vec<VisibleWork>,
}

struct FenceInner {
    state: Mutex<FenceState>,
    notify: Notify,
}

/// Barrier releasing queued publications once its writes are durable
#[derive(Clone)]
pub struct ChangeFence {
    inner: Arc<FenceInner>,
}

impl Default for ChangeFence {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChangeFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ChangeFence")
            .field("outstanding", &state.outstanding)
            .field("armed", &state.armed)
            .field("queued", &state.queued.len())
            .field("completed", &state.completed)
            .finish()
    }
}

impl PartialEq for ChangeFence {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl ChangeFence {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FenceInner {
                state: Mutex::new(FenceState::default()),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FenceState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a write in progress
    pub fn begin_write(&self) -> ObserveResult<ChangeFenceToken> {
        let mut state = self.lock();
        if state.firing || state.completed {
            return Err(ObserveError::FenceFired);
        }
        state.outstanding += 1;
        Ok(ChangeFenceToken {
            fence: self.clone(),
            finished: false,
        })
    }

    /// Queue work for when the fence fires. Hands the work back if the fence
    /// is already firing; the caller should run it right away.
    pub fn on_visible(&self, work: VisibleWork) -> Result<(), VisibleWork> {
        let mut state = self.lock();
        if state.firing || state.completed {
            return Err(work);
        }
        state.queued.push(work);
        Ok(())
    }

    /// No more writes will join; the fence may fire once outstanding writes finish
    pub fn arm(&self) {
        self.lock().armed = true;
        self.inner.notify.notify_waiters();
    }

    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    pub fn is_completed(&self) -> bool {
        self.lock().completed
    }

    /// Wait until the fence has fired and all queued work has run
    pub async fn visible(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let work = {
                let mut state = self.lock();
                if state.completed {
                    return;
                }
                if state.armed && state.outstanding == 0 && !state.firing {
                    state.firing = true;
                    Some(std::mem::take(&mut state.queued))
                } else {
                    None
                }
            };

            if let Some(work) = work {
                trace!(queued = work.len(), "change fence firing");
                for item in work {
                    item.await;
                }
                self.lock().completed = true;
                self.inner.notify.notify_waiters();
                return;
            }

            notified.await;
        }
    }

    /// Run `op` inside a fresh fence, then wait for its publications
    pub async fn with_fence<F, Fut, T>(op: F) -> T
    where
        F: FnOnce(ChangeFence) -> Fut,
        Fut: Future<Output = T>,
    {
        let fence = ChangeFence::new();
        let result = op(fence.clone()).await;
        fence.arm();
        fence.visible().await;
        result
    }

    fn finish_write(&self) {
        {
            let mut state = self.lock();
            state.outstanding = state.outstanding.saturating_sub(1);
        }
        self.inner.notify.notify_waiters();
    }
}

/// One write registered with a fence; dropping it also finishes the write
#[derive(Debug)]
pub struct ChangeFenceToken {
    fence: ChangeFence,
    finished: bool,
}

impl ChangeFenceToken {
    /// Mark the write durable
    pub fn commit(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.fence.finish_write();
        }
    }
}

impl Drop for ChangeFenceToken {
    fn drop(&mut self) {
        self.finish();
    }
}
