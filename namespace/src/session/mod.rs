//! Runtime side of the namespace: where values live and how changes travel.

pub mod events;
pub mod experiments;
pub mod observers;
pub mod remote_configuration;
pub mod remote_keys;
pub mod remote_source;
pub mod state;
pub mod subscription;

pub use events::{Event, EventBus, EventHandle};
pub use observers::{ObserverEvent, ObserverRule, Observers, Publish};
pub use remote_configuration::RemoteConfiguration;
pub use remote_source::{InMemoryRemote, RemoteSource};
pub use state::{Computed, Slot, State, SHARED_SCOPE};
pub use subscription::Subscription;
