/*
    core_observe - Live queries

    A `Cursor` turns a query into change streams. Listeners of equivalent
    queries share one `ObserveMultiplexer` and its change driver; the
    `ObserveRegistry` creates a multiplexer for the first listener of a key
    and tears it down after the last one leaves.

    Cursor -> ObserveRegistry -> ObserveMultiplexer -> ChangeDriver
       |                               |
       +-- ObserveHandle <- listener task (transform, maps, narrowing)
*/

pub mod callbacks;
pub mod cursor;
pub mod driver;
pub mod errors;
pub mod event;
pub mod fence;
pub mod handle;
pub mod multiplexer;
pub mod registry;

pub use callbacks::{ChangeCallbacks, ObserveCallbacks, SubscriptionSink};
pub use cursor::Cursor;
pub use driver::{select_driver, ChangeDriver, DriverCapabilities, OplogDriver, PollDriver, PubSubDriver};
pub use errors::{ObserveError, ObserveResult};
pub use event::{ChangeEvent, DriverEvent, DriverKind, MappedChangePolicy, ObserveOptions};
pub use fence::{ChangeFence, ChangeFenceToken, VisibleWork};
pub use handle::ObserveHandle;
pub use multiplexer::{Attachment, ListenerMessage, ObserveMultiplexer};
pub use registry::{ObserveRegistry, Registration};
