/*
    core_doc - Document model and in-memory query toolkit

    Everything drivers and validators need to reason about documents
    without a round-trip to the store: selectors, sorts, projections,
    update operators, field diffs and id generation.
*/

pub mod document;
pub mod errors;
pub mod idgen;
pub mod mutator;
pub mod projection;
pub mod query;
pub mod selector;
pub mod sort;

pub use document::{
    apply_changes, diff_fields, lookup_path, split_id, top_level, with_id, DocId, Document, FieldChanges,
    Fields, ID_FIELD,
};
pub use errors::{DocError, DocResult};
pub use idgen::IdGeneration;
pub use mutator::{apply_mutator, is_replacement, mutator_fields, operators};
pub use projection::Projection;
pub use query::QueryDescription;
pub use selector::Selector;
pub use sort::{compare_values, values_equal, SortDirection, SortSpec};
