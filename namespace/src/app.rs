use std::future::{poll_fn, Future};
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;

use serde_json::Value;

use crate::client::ClientObservers;
use crate::config::NamespaceConfig;
use crate::errors::NamespaceResult;
use crate::fetch_result::{FetchError, FetchResult, Metadata, Source};
use crate::ids;
use crate::session::{
    Event, EventBus, EventHandle, Observers, Publish, RemoteConfiguration, RemoteSource, State,
    Subscription,
};
use crate::storage::{FilePreferences, Preferences};
use crate::tag::{Context, Language, Reference, Tag, ToReference};

const PREFERENCES_FILE: &str = "preferences.json";

type Wait<'a> = Pin<Box<dyn Future<Output = Option<FetchResult>> + Send + 'a>>;

/// The engine wired together: one language, its session state, remote
/// configuration, event bus and observer dispatch.
pub struct App {
    language: Language,
    config: NamespaceConfig,
    state: State,
    remote_configuration: RemoteConfiguration,
    events: EventBus,
    observers: Observers,
    router: Router,
    clients: ClientObservers,
    started: AtomicBool,
}

impl App {
    pub fn initialize<R: ToReference>(
        language: Language,
        config: NamespaceConfig,
        preferences: Arc<dyn Preferences>,
        remote: Arc<dyn RemoteSource>,
        defaults: impl IntoIterator<Item = (R, Value)>,
    ) -> NamespaceResult<Self> {
        config.validate()?;
        let capacity = config.broadcast_capacity()?;
        let state = State::new(language.clone(), preferences.clone(), capacity)?;
        let remote_configuration = RemoteConfiguration::new(
            state.clone(),
            remote,
            preferences,
            config.clone(),
            defaults,
        );
        let events = EventBus::new(capacity);
        let router = Router {
            state: state.clone(),
            remote_configuration: remote_configuration.clone(),
        };
        let observers = Observers::new(language.clone(), events.clone(), router.publish());
        log::info!(
            "Initialized namespace for {:?} environment",
            config.environment()
        );
        Ok(Self {
            language,
            config,
            state,
            remote_configuration,
            events,
            observers,
            router,
            clients: ClientObservers::new(),
            started: AtomicBool::new(false),
        })
    }

    /// Like [`App::initialize`], persisting preferences under `root_dir`.
    pub fn open<R: ToReference>(
        root_dir: impl AsRef<Path>,
        language: Language,
        config: NamespaceConfig,
        remote: Arc<dyn RemoteSource>,
        defaults: impl IntoIterator<Item = (R, Value)>,
    ) -> NamespaceResult<Self> {
        let preferences = FilePreferences::open(root_dir.as_ref().join(PREFERENCES_FILE))?;
        Self::initialize(language, config, Arc::new(preferences), remote, defaults)
    }

    /// Starts remote fetching and, when enabled, observer dispatch.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> NamespaceResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.remote_configuration.start()?;
        if self.config.observers_enabled()? {
            self.observers.subscribe()?;
        }
        Ok(())
    }

    pub fn language(&self) -> &Language {
        &self.language
    }

    pub fn config(&self) -> &NamespaceConfig {
        &self.config
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn remote_configuration(&self) -> &RemoteConfiguration {
        &self.remote_configuration
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn observers(&self) -> &Observers {
        &self.observers
    }

    pub fn clients(&self) -> &ClientObservers {
        &self.clients
    }

    /// Resolves a dotted id, with optional `[index]` segments, in this app's language.
    pub fn reference(&self, id: &str) -> NamespaceResult<Reference> {
        Reference::parse(id, &self.language)
    }

    pub fn post(&self, event: impl ToReference, context: Context) {
        self.events.post(event, context);
    }

    /// Stores `value` in state and posts the event with the value in its context.
    pub fn post_value(&self, event: impl ToReference, value: impl Into<Value>) {
        let reference = event.to_reference();
        let value = value.into();
        self.state.set(&reference, value.clone());
        let context = Context::new().with(reference.tag().id(), value);
        self.events.post(&reference, context);
    }

    pub fn on<I>(&self, patterns: I, handler: impl Fn(Event) + Send + Sync + 'static) -> EventHandle
    where
        I: IntoIterator,
        I::Item: ToReference,
    {
        self.events.on(patterns, handler)
    }

    /// Routes to state or remote configuration. Collection indices the
    /// reference leaves open are bound to the current state value of each
    /// collection's id, and the subscription follows that id as it changes.
    pub fn publisher(&self, event: impl ToReference) -> Subscription {
        self.router.publisher(&event.to_reference())
    }

    pub fn result(&self, event: impl ToReference) -> FetchResult {
        self.router.result(&event.to_reference())
    }

    /// Writes to state, or overrides remote configuration for configuration tags.
    pub fn set(&self, event: impl ToReference, value: impl Into<Value>) {
        let reference = event.to_reference();
        if is_remote(reference.tag()) {
            self.remote_configuration.override_value(&reference, value);
        } else {
            self.state.set(&reference, value);
        }
    }

    pub fn sign_in(&self, user: &str) -> NamespaceResult<()> {
        let user_id = self.language.resolve(ids::USER_ID)?;
        self.post(self.language.resolve(ids::SESSION_EVENT_WILL_SIGN_IN)?, Context::new());
        self.state.transaction(|state| {
            state.set(&user_id, user);
            Ok(())
        });
        self.post(
            self.language.resolve(ids::SESSION_EVENT_DID_SIGN_IN)?,
            Context::new().with(ids::USER_ID, user),
        );
        log::info!("Signed in");
        self.reset_observers()
    }

    pub fn sign_out(&self) -> NamespaceResult<()> {
        let user_id = self.language.resolve(ids::USER_ID)?;
        self.post(self.language.resolve(ids::SESSION_EVENT_WILL_SIGN_OUT)?, Context::new());
        self.state.clear(&user_id);
        self.post(self.language.resolve(ids::SESSION_EVENT_DID_SIGN_OUT)?, Context::new());
        log::info!("Signed out");
        self.reset_observers()
    }

    fn reset_observers(&self) -> NamespaceResult<()> {
        if self.started.load(Ordering::SeqCst) && self.config.observers_enabled()? {
            self.observers.reset()?;
        }
        Ok(())
    }
}

#[derive(Clone)]
struct Router {
    state: State,
    remote_configuration: RemoteConfiguration,
}

impl Router {
    fn publish(&self) -> Publish {
        let router = self.clone();
        Arc::new(move |reference: &Reference| router.publisher(reference))
    }

    fn route(&self, reference: &Reference) -> Subscription {
        if is_remote(reference.tag()) {
            self.remote_configuration.publisher(reference)
        } else {
            self.state.publisher(reference)
        }
    }

    fn result(&self, reference: &Reference) -> FetchResult {
        if !has_open_indices(reference) {
            return self.route_result(reference);
        }
        match bind_indices(&self.state, reference).1 {
            Ok(bound) => self.route_result(&bound),
            Err(error) => {
                FetchResult::from_result(Err(error), Metadata::new(reference.clone(), Source::App))
            }
        }
    }

    fn route_result(&self, reference: &Reference) -> FetchResult {
        if is_remote(reference.tag()) {
            self.remote_configuration.result(reference)
        } else {
            self.state.result(reference)
        }
    }

    fn publisher(&self, reference: &Reference) -> Subscription {
        if !has_open_indices(reference) {
            return self.route(reference);
        }
        let (revision, changes) = tokio::sync::watch::channel(0u64);
        let router = self.clone();
        let key = reference.clone();
        let subscription = Subscription::revisions(changes, move || router.result(&key));
        if tokio::runtime::Handle::try_current().is_err() {
            log::warn!("No runtime to follow the collection indices of {}", reference);
            return subscription;
        }

        let router = self.clone();
        let reference = reference.clone();
        let mut seen = router.result(&reference);
        let task = tokio::spawn(async move {
            loop {
                let (keys, bound) = bind_indices(&router.state, &reference);
                let mut feeds: Vec<Subscription> =
                    keys.iter().map(|key| router.state.publisher(key)).collect();
                if let Ok(bound) = &bound {
                    feeds.push(router.route(bound));
                }
                for feed in feeds.iter_mut() {
                    feed.try_next();
                }
                // Changes made before the feeds above existed.
                let current = router.result(&reference);
                if current != seen {
                    seen = current;
                    revision.send_modify(|revision| *revision += 1);
                    continue;
                }
                if !any_change(&mut feeds).await {
                    break;
                }
                seen = router.result(&reference);
                revision.send_modify(|revision| *revision += 1);
            }
        });
        subscription.with_task(task)
    }
}

fn has_open_indices(reference: &Reference) -> bool {
    let tag = reference.tag();
    tag.indices()
        .iter()
        .any(|id| id.as_str() != tag.id() && reference.index(id).is_none())
}

/// Binds each collection index `reference` leaves open to the state value of
/// that collection's id. Also returns the id keys read on the way.
fn bind_indices(
    state: &State,
    reference: &Reference,
) -> (Vec<Reference>, Result<Reference, FetchError>) {
    let tag = reference.tag();
    let mut keys = Vec::new();
    let mut context = reference.context().clone();
    for id in tag.indices() {
        if id.as_str() == tag.id() || reference.index(id).is_some() {
            continue;
        }
        let collection_id = match state.language().resolve(id) {
            Ok(collection_id) => collection_id,
            Err(error) => return (keys, Err(FetchError::Other(error.to_string()))),
        };
        let key = Reference::new(collection_id, context.clone());
        let value = state.get(&key);
        keys.push(key.clone());
        match value {
            Ok(Value::String(index)) => context.insert(id.clone(), index),
            Ok(other) => {
                return (
                    keys,
                    Err(FetchError::Decoding(format!(
                        "{} is not a collection index: {}",
                        key, other
                    ))),
                )
            }
            Err(error) => return (keys, Err(error)),
        }
    }
    (keys, Ok(Reference::new(tag.clone(), context)))
}

/// Waits until any feed yields; false once one of them has closed.
async fn any_change(feeds: &mut [Subscription]) -> bool {
    let mut waits: Vec<Wait<'_>> = feeds
        .iter_mut()
        .map(|feed| Box::pin(feed.next()) as Wait<'_>)
        .collect();
    poll_fn(|cx| {
        for wait in waits.iter_mut() {
            if let Poll::Ready(result) = wait.as_mut().poll(cx) {
                return Poll::Ready(result.is_some());
            }
        }
        Poll::Pending
    })
    .await
}

/// Whether values under `tag` come from remote configuration rather than state.
/// The nearest tag in the lineage that is a state or configuration value decides.
fn is_remote(tag: &Tag) -> bool {
    for tag in tag.lineage() {
        if tag.is_id(ids::SESSION_STATE_VALUE) || tag.is_id(ids::DB_COLLECTION_ID) {
            return false;
        }
        if tag.is_id(ids::SESSION_CONFIGURATION_VALUE) || tag.is_id(ids::APP_CONFIGURATION) {
            return true;
        }
    }
    false
}
