//! Seams between the transfer protocol and the outside world: the channel
//! engine, the message bus and per-channel locks, with in-memory
//! implementations of each.

pub mod adapters;
pub mod bus;
pub mod error;
pub mod events;
pub mod lock;
pub mod traits;
pub mod types;

pub use adapters::{CounterpartyBehaviour, DepositBehaviour, InMemoryChannelEngine};
pub use bus::{subject_matches, BusMessage, BusSubscription, InMemoryMessageBus};
pub use error::{ChannelError, LockError};
pub use events::{EngineEvent, EventHub, EventKind, Subscription};
pub use lock::{with_channel_lock, ChannelLock, ChannelLockGuard, InMemoryChannelLock, LockToken};
pub use traits::{ChannelEngine, MessageBus, RequestHandler};
pub use types::{
    AppAction, AppDefinition, AppInstance, AppStatus, InstallRoute, LinkedTransferAppState,
    ProposeInstallParams,
};
