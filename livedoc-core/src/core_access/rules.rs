//! Allow/deny rule definitions
//!
//! `ValidatorRules` is the closed set of options a caller may pass to
//! `allow` / `deny`. Every validator is a plain predicate; the rule set's
//! transform decides what document shape it sees.

use crate::core_doc::Document;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// `(actor, doc) -> allowed?` for inserts
pub type InsertValidator = Arc<dyn Fn(Option<&str>, &Document) -> bool + Send + Sync>;

/// `(actor, doc, changed top-level fields, mutator) -> allowed?` for updates
pub type UpdateValidator = Arc<dyn Fn(Option<&str>, &Document, &[String], &Value) -> bool + Send + Sync>;

/// `(actor, doc) -> allowed?` for removals
pub type RemoveValidator = Arc<dyn Fn(Option<&str>, &Document) -> bool + Send + Sync>;

/// Document transform applied before a validator sees the document
pub type DocTransform = Arc<dyn Fn(Document) -> Document + Send + Sync>;

/// Whether a rule is an allow or a deny rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Polarity {
    Allow,
    Deny,
}

impl Polarity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Polarity::Allow => "allow",
            Polarity::Deny => "deny",
        }
    }
}

/// Mutation kinds that can be validated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Insert,
    Update,
    Remove,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Remove => "remove",
        }
    }
}

/// Transform choice for a rule set
#[derive(Clone, Default)]
pub enum TransformOption {
    /// Use the collection's own transform
    #[default]
    Inherit,
    /// Validators see raw documents
    Disabled,
    /// Validators see documents passed through this function
    Custom(DocTransform),
}

impl fmt::Debug for TransformOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformOption::Inherit => f.write_str("Inherit"),
            TransformOption::Disabled => f.write_str("Disabled"),
            TransformOption::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Options for one `allow` or `deny` call
#[derive(Clone, Default)]
pub struct ValidatorRules {
    pub insert: Option<InsertValidator>,
    pub update: Option<UpdateValidator>,
    pub remove: Option<RemoveValidator>,
    /// Fields update/remove validators read; `None` means the whole document
    pub fetch: Option<Vec<String>>,
    pub transform: TransformOption,
}

impl ValidatorRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&str>, &Document) -> bool + Send + Sync + 'static,
    {
        self.insert = Some(Arc::new(f));
        self
    }

    pub fn update<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&str>, &Document, &[String], &Value) -> bool + Send + Sync + 'static,
    {
        self.update = Some(Arc::new(f));
        self
    }

    pub fn remove<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&str>, &Document) -> bool + Send + Sync + 'static,
    {
        self.remove = Some(Arc::new(f));
        self
    }

    pub fn fetch<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fetch = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn transform<F>(mut self, f: F) -> Self
    where
        F: Fn(Document) -> Document + Send + Sync + 'static,
    {
        self.transform = TransformOption::Custom(Arc::new(f));
        self
    }

    pub fn without_transform(mut self) -> Self {
        self.transform = TransformOption::Disabled;
        self
    }

    /// True when any update/remove rule or an explicit fetch list is present
    pub(crate) fn affects_fetch(&self) -> bool {
        self.update.is_some() || self.remove.is_some() || self.fetch.is_some()
    }
}

impl fmt::Debug for ValidatorRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatorRules")
            .field("insert", &self.insert.is_some())
            .field("update", &self.update.is_some())
            .field("remove", &self.remove.is_some())
            .field("fetch", &self.fetch)
            .field("transform", &self.transform)
            .finish()
    }
}
