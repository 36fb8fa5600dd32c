/*
    core_pubsub - Broadcast-fed change propagation

    Writes are announced as small envelopes on named channels. Observers of
    the same collection in any process pick them up through the manager and
    re-evaluate the affected documents locally.
*/

pub mod broadcast;
pub mod errors;
pub mod event;
pub mod manager;
pub mod publisher;

pub use broadcast::{Broadcast, MemoryBroadcast};
pub use errors::{PubSubError, PubSubResult};
pub use event::{channels_for, listen_channels, ChannelScope, DocRef, PubSubEvent, PubSubEventKind, PublishOptions};
pub use manager::{PubSubManager, PubSubSubscription, RoutedMessage};
pub use publisher::{PubSubPublisher, PUBSUB_HOOK_TAG};
