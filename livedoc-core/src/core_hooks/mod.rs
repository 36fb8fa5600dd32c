/*
    core_hooks - Before/after hooks around collection mutations

    The allow/deny engine and the broadcast publisher both plug in here,
    each tagged so it can be switched off independently.
*/

pub mod errors;
pub mod hook;
pub mod pipeline;

pub use errors::{HookError, HookResult};
pub use hook::{AfterContext, BeforeContext, MutationArgs, MutationHook, MutationKind, MutationOutcome};
pub use pipeline::HookPipeline;
