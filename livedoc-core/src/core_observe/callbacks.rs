//! Listener callbacks
//!
//! `ChangeCallbacks` are id/fields level. Each of `added` and `changed` is
//! registered either as a non-mutating callback, which borrows a value that
//! may be shared with other listeners, or as an `*_owned` callback, which
//! gets its own clone and may do what it likes with it.
//!
//! `ObserveCallbacks` are document level and always receive owned
//! documents, plus positions when the query is ordered.

use crate::core_doc::{DocId, Document, FieldChanges, Fields};

type SharedAdded = Box<dyn FnMut(&DocId, &Fields) + Send>;
type OwnedAdded = Box<dyn FnMut(DocId, Fields) + Send>;
type SharedChanged = Box<dyn FnMut(&DocId, &FieldChanges) + Send>;
type OwnedChanged = Box<dyn FnMut(DocId, FieldChanges) + Send>;
type Removed = Box<dyn FnMut(&DocId) + Send>;

enum AddedCallback {
    Shared(SharedAdded),
    Owned(OwnedAdded),
}

enum ChangedCallback {
    Shared(SharedChanged),
    Owned(OwnedChanged),
}

/// Callbacks for `Cursor::observe_changes`
#[derive(Default)]
pub struct ChangeCallbacks {
    added: Option<AddedCallback>,
    changed: Option<ChangedCallback>,
    removed: Option<Removed>,
}

impl ChangeCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn added(mut self, f: impl FnMut(&DocId, &Fields) + Send + 'static) -> Self {
        self.added = Some(AddedCallback::Shared(Box::new(f)));
        self
    }

    pub fn added_owned(mut self, f: impl FnMut(DocId, Fields) + Send + 'static) -> Self {
        self.added = Some(AddedCallback::Owned(Box::new(f)));
        self
    }

    pub fn changed(mut self, f: impl FnMut(&DocId, &FieldChanges) + Send + 'static) -> Self {
        self.changed = Some(ChangedCallback::Shared(Box::new(f)));
        self
    }

    pub fn changed_owned(mut self, f: impl FnMut(DocId, FieldChanges) + Send + 'static) -> Self {
        self.changed = Some(ChangedCallback::Owned(Box::new(f)));
        self
    }

    pub fn removed(mut self, f: impl FnMut(&DocId) + Send + 'static) -> Self {
        self.removed = Some(Box::new(f));
        self
    }

    pub(crate) fn call_added(&mut self, id: &DocId, fields: &Fields) {
        match &mut self.added {
            Some(AddedCallback::Shared(f)) => f(id, fields),
            Some(AddedCallback::Owned(f)) => f(id.clone(), fields.clone()),
            None => {}
        }
    }

    pub(crate) fn call_changed(&mut self, id: &DocId, fields: &FieldChanges) {
        match &mut self.changed {
            Some(ChangedCallback::Shared(f)) => f(id, fields),
            Some(ChangedCallback::Owned(f)) => f(id.clone(), fields.clone()),
            None => {}
        }
    }

    pub(crate) fn call_removed(&mut self, id: &DocId) {
        if let Some(f) = &mut self.removed {
            f(id);
        }
    }
}

type DocFn = Box<dyn FnMut(Document) + Send>;
type DocAtFn = Box<dyn FnMut(Document, usize, Option<DocId>) + Send>;
type ChangedDocFn = Box<dyn FnMut(Document, Document) + Send>;
type ChangedAtFn = Box<dyn FnMut(Document, Document, usize) + Send>;
type RemovedAtFn = Box<dyn FnMut(Document, usize) + Send>;
type MovedToFn = Box<dyn FnMut(Document, usize, usize, Option<DocId>) + Send>;

/// Callbacks for `Cursor::observe`.
///
/// When both the plain and the `*_at` form of a callback are set, only the
/// `*_at` form runs. `before` arguments name the document now following
/// the affected one, or `None` at the end.
#[derive(Default)]
pub struct ObserveCallbacks {
    pub(crate) added: Option<DocFn>,
    pub(crate) added_at: Option<DocAtFn>,
    pub(crate) changed: Option<ChangedDocFn>,
    pub(crate) changed_at: Option<ChangedAtFn>,
    pub(crate) removed: Option<DocFn>,
    pub(crate) removed_at: Option<RemovedAtFn>,
    pub(crate) moved_to: Option<MovedToFn>,
}

impl ObserveCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn added(mut self, f: impl FnMut(Document) + Send + 'static) -> Self {
        self.added = Some(Box::new(f));
        self
    }

    pub fn added_at(mut self, f: impl FnMut(Document, usize, Option<DocId>) + Send + 'static) -> Self {
        self.added_at = Some(Box::new(f));
        self
    }

    /// `f(new, old)`
    pub fn changed(mut self, f: impl FnMut(Document, Document) + Send + 'static) -> Self {
        self.changed = Some(Box::new(f));
        self
    }

    /// `f(new, old, index)`
    pub fn changed_at(mut self, f: impl FnMut(Document, Document, usize) + Send + 'static) -> Self {
        self.changed_at = Some(Box::new(f));
        self
    }

    pub fn removed(mut self, f: impl FnMut(Document) + Send + 'static) -> Self {
        self.removed = Some(Box::new(f));
        self
    }

    pub fn removed_at(mut self, f: impl FnMut(Document, usize) + Send + 'static) -> Self {
        self.removed_at = Some(Box::new(f));
        self
    }

    /// `f(doc, from, to, before)`
    pub fn moved_to(mut self, f: impl FnMut(Document, usize, usize, Option<DocId>) + Send + 'static) -> Self {
        self.moved_to = Some(Box::new(f));
        self
    }

    /// Whether any callback needs positions
    pub fn uses_indices(&self) -> bool {
        self.added_at.is_some() || self.changed_at.is_some() || self.removed_at.is_some() || self.moved_to.is_some()
    }
}

/// Transport side of a published subscription
pub trait SubscriptionSink: Send + Sync {
    fn added(&self, collection: &str, id: &DocId, fields: &Fields);
    fn changed(&self, collection: &str, id: &DocId, fields: &FieldChanges);
    fn removed(&self, collection: &str, id: &DocId);
    /// Run `callback` when the transport ends the subscription
    fn on_stop(&self, callback: Box<dyn FnOnce() + Send>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_owned_and_shared_contracts() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let fields = json!({"x": 1}).as_object().cloned().unwrap();

        let log = seen.clone();
        let mut shared = ChangeCallbacks::new().added(move |id, f| {
            log.lock().unwrap().push((id.clone(), f.clone()));
        });
        shared.call_added(&DocId::from("a"), &fields);

        let log = seen.clone();
        let mut owned = ChangeCallbacks::new().added_owned(move |id, mut f| {
            f.insert("touched".to_string(), json!(true));
            log.lock().unwrap().push((id, f));
        });
        owned.call_added(&DocId::from("b"), &fields);

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].1, fields);
        assert_eq!(seen[1].1["touched"], json!(true));
        // The caller's copy is untouched
        assert!(!fields.contains_key("touched"));
    }

    #[test]
    fn test_uses_indices() {
        assert!(!ObserveCallbacks::new().added(|_| {}).uses_indices());
        assert!(ObserveCallbacks::new().moved_to(|_, _, _, _| {}).uses_indices());
    }
}
