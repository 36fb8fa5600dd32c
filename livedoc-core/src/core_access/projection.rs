//! Accumulated fetch projection for validators
//!
//! Every registered update/remove rule declares which fields it needs. The
//! union is kept here once, so the pre-image fetched before validation
//! contains just those fields. A rule that declares nothing needs the whole
//! document, and from then on the accumulator stays in "all fields" mode.

use crate::core_doc::Projection;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
enum FetchState {
    Fields(BTreeSet<String>),
    AllFields,
}

/// Union of the fields validators asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionAccumulator {
    state: FetchState,
}

impl Default for ProjectionAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectionAccumulator {
    pub fn new() -> Self {
        ProjectionAccumulator {
            state: FetchState::Fields(BTreeSet::new()),
        }
    }

    /// Add field names; ignored once in "all fields" mode
    pub fn add_fields<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let FetchState::Fields(fields) = &mut self.state {
            fields.extend(names.into_iter().map(Into::into));
        }
    }

    /// Switch to "all fields" for good, dropping the finite set
    pub fn add_all_fields(&mut self) {
        self.state = FetchState::AllFields;
    }

    pub fn is_all_fields(&self) -> bool {
        matches!(self.state, FetchState::AllFields)
    }

    /// Inclusion projection, or `None` to fetch everything.
    ///
    /// An empty field set also means "everything": nothing narrowed it.
    pub fn current_projection(&self) -> Option<Projection> {
        match &self.state {
            FetchState::AllFields => None,
            FetchState::Fields(fields) if fields.is_empty() => None,
            FetchState::Fields(fields) => Some(Projection::include(fields.iter())),
        }
    }
}
