//! Allow/deny access control for untrusted mutations
//!
//! Each collection owns one [`ValidationContext`]. Rules are registered with
//! [`ValidatorRules`]; the fields their validators need are folded into a
//! [`ProjectionAccumulator`] so the pre-image is fetched once with the
//! smallest projection that satisfies all of them.

pub mod context;
pub mod errors;
pub mod projection;
pub mod rules;

pub use context::ValidationContext;
pub use errors::{AccessError, AccessResult};
pub use projection::ProjectionAccumulator;
pub use rules::{
    DocTransform, InsertValidator, OperationKind, Polarity, RemoveValidator, TransformOption, UpdateValidator,
    ValidatorRules,
};
