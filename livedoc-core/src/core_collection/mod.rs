/*
    core_collection - Collections, the method boundary and the composition root

    A collection routes every mutation through its hook pipeline. Mutations
    that arrive through `MethodRegistry` are flagged insecure and checked by
    the allow/deny hook; trusted calls skip it. `LiveDb` wires collections to
    the shared store, observe registry and broadcast manager.
*/

pub mod allow_deny;
pub mod collection;
pub mod errors;
pub mod live_db;
pub mod methods;
pub mod options;

pub use allow_deny::{AllowDenyHook, ALLOW_DENY_HOOK_TAG};
pub use collection::Collection;
pub use errors::{CollectionError, CollectionResult};
pub use live_db::LiveDb;
pub use methods::{MethodHandler, MethodInvocation, MethodRegistry};
pub use options::{CollectionOptions, FindOptions, MutationOptions};
