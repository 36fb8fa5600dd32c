/*
    Store subsystem - Document store collaborator

    The trait the rest of the crate talks to, an in-memory implementation
    and the ordered change log it exposes for tailing.
*/

pub mod change_log;
pub mod errors;
pub mod memory;
pub mod traits;

pub use change_log::{ChangeLog, LogEntry, LogOp};
pub use errors::*;
pub use memory::MemoryStore;
pub use traits::{
    DeleteManyResult, DeleteResult, DocumentStore, InsertManyResult, InsertResult, Snapshot, UpdateManyResult,
    UpdateResult,
};
