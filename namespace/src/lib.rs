// lib.rs - Typed tag namespace with reactive session state and remote configuration

pub mod app;
pub mod client;
pub mod config;
pub mod errors;
pub mod fetch_result;
pub mod ids;
pub mod session;
pub mod storage;
pub mod tag;

// Re-export common types
pub use app::App;
pub use client::{ClientObserver, ClientObservers};
pub use config::{Environment, NamespaceConfig};
pub use errors::{NamespaceError, NamespaceResult};
pub use fetch_result::{FetchError, FetchResult, Metadata, Source};
pub use session::{
    Event, EventBus, EventHandle, InMemoryRemote, ObserverRule, Observers, RemoteConfiguration,
    RemoteSource, State, Subscription,
};
pub use storage::{FilePreferences, MemoryPreferences, Preferences};
pub use tag::{Context, DescendantPolicy, Graph, Key, Language, Reference, Tag, ToReference};
