pub mod config;
pub mod core_access;
pub mod core_collection;
pub mod core_doc;
pub mod core_hooks;
pub mod core_observe;
pub mod core_pubsub;
pub mod core_store;
pub mod logging;
pub mod metrics;

pub use config::{Config, ConfigError};
pub use core_collection::{Collection, CollectionError, LiveDb, MutationOptions};
pub use core_doc::{DocId, Document, Selector};
pub use core_observe::{ChangeCallbacks, ObserveHandle, ObserveOptions};
pub use logging::{init_logging, LogLevel};
