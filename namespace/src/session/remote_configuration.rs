use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::remote_keys::{self, IMPORTANT};
use super::{experiments, RemoteSource, State, Subscription};
use crate::config::NamespaceConfig;
use crate::errors::NamespaceResult;
use crate::fetch_result::{self, FetchError, FetchResult, Metadata, Source};
use crate::ids;
use crate::storage::Preferences;
use crate::tag::{Reference, ToReference};

type Retry = Pin<Box<dyn Future<Output = NamespaceResult<()>> + Send>>;

#[derive(Default)]
struct Layers {
    fetched: HashMap<String, Value>,
    overrides: HashMap<String, Value>,
}

struct Inner {
    state: State,
    remote: Arc<dyn RemoteSource>,
    preferences: Arc<dyn Preferences>,
    config: NamespaceConfig,
    defaults: BTreeMap<String, Value>,
    layers: RwLock<Layers>,
    revision: watch::Sender<u64>,
    synchronized: watch::Sender<bool>,
    fetching: tokio::sync::Mutex<()>,
    attempts: AtomicU32,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Flat configuration view merging, by ascending priority, defaults, values
/// fetched from a [`RemoteSource`] and local overrides.
///
/// Nothing is readable until the first fetch succeeds: every read before that
/// fails with [`FetchError::NotSynchronized`].
#[derive(Clone)]
pub struct RemoteConfiguration {
    inner: Arc<Inner>,
}

impl RemoteConfiguration {
    /// `defaults` are keyed by reference and looked up under the plain dotted id.
    pub fn new<R: ToReference>(
        state: State,
        remote: Arc<dyn RemoteSource>,
        preferences: Arc<dyn Preferences>,
        config: NamespaceConfig,
        defaults: impl IntoIterator<Item = (R, Value)>,
    ) -> Self {
        let defaults = defaults
            .into_iter()
            .map(|(event, value)| (remote_keys::default(&event.to_reference()), value))
            .collect();
        let configuration = Self {
            inner: Arc::new(Inner {
                state,
                remote,
                preferences,
                config,
                defaults,
                layers: RwLock::new(Layers::default()),
                revision: watch::channel(0).0,
                synchronized: watch::channel(false).0,
                fetching: tokio::sync::Mutex::new(()),
                attempts: AtomicU32::new(0),
                tasks: Mutex::new(Vec::new()),
            }),
        };
        configuration.reload_overrides();
        configuration
    }

    /// Fetches once now and again whenever
    /// `blockchain.app.configuration.remote.is.stale` becomes `true`.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> NamespaceResult<()> {
        let stale = self
            .inner
            .state
            .language()
            .resolve(ids::APP_CONFIGURATION_REMOTE_IS_STALE)?;
        let mut changes = self.inner.state.publisher(&stale);
        let configuration = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut first = true;
            while let Some(result) = changes.next().await {
                let is_stale = result.is_yes();
                if !(is_stale || first) {
                    continue;
                }
                first = false;
                let Some(inner) = configuration.upgrade() else {
                    break;
                };
                let _ = RemoteConfiguration { inner }.fetch(is_stale).await;
            }
        });
        self.inner.tasks.lock().push(task);
        Ok(())
    }

    pub fn is_synchronized(&self) -> bool {
        *self.inner.synchronized.borrow()
    }

    /// Resolves once the first fetch has succeeded.
    pub async fn synchronized(&self) {
        let mut synchronized = self.inner.synchronized.subscribe();
        let _ = synchronized.wait_for(|synchronized| *synchronized).await;
    }

    /// Fetches and activates remote values, asking the source for fresh data
    /// when `is_stale`. Failures leave the current values in place; outside
    /// fail-fast mode they are also retried with exponential backoff.
    pub async fn fetch(&self, is_stale: bool) -> NamespaceResult<()> {
        let _fetching = self.inner.fetching.lock().await;
        self.reload_overrides();

        let expiration = if is_stale {
            Duration::ZERO
        } else {
            self.inner.config.fetch_expiration()?
        };

        let outcome = async {
            self.inner.remote.fetch(expiration).await?;
            self.inner.remote.activate().await
        }
        .await;

        if let Err(error) = outcome {
            if self.inner.config.fail_fast_on_fetch_error()? {
                log::error!("Remote configuration fetch failed, retrying: {}", error);
            } else {
                log::warn!("Remote configuration fetch failed, retrying: {}", error);
            }
            self.retry(is_stale)?;
            return Err(error);
        }

        let fetched: HashMap<String, Value> = self
            .inner
            .remote
            .all_keys()
            .into_iter()
            .filter_map(|key| {
                let bytes = self.inner.remote.value(&key)?;
                let value = serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                    Value::String(String::from_utf8_lossy(&bytes).into_owned())
                });
                Some((key, value))
            })
            .collect();
        log::debug!("Fetched {} remote configuration values", fetched.len());

        self.inner.layers.write().fetched = fetched;
        self.inner.attempts.store(0, Ordering::SeqCst);

        let stale = self
            .inner
            .state
            .language()
            .resolve(ids::APP_CONFIGURATION_REMOTE_IS_STALE)?;
        self.inner.state.set(&stale, false);
        self.inner.synchronized.send_replace(true);
        self.notify();
        Ok(())
    }

    fn fetch_boxed(self, is_stale: bool) -> Retry {
        Box::pin(async move { self.fetch(is_stale).await })
    }

    fn retry(&self, is_stale: bool) -> NamespaceResult<()> {
        let attempt = self.inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = backoff(
            attempt,
            self.inner.config.fetch_backoff_base()?,
            self.inner.config.fetch_backoff_cap()?,
        );
        let configuration: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = configuration.upgrade() {
                let _ = RemoteConfiguration { inner }.fetch_boxed(is_stale).await;
            }
        });
        Ok(())
    }

    pub fn contains(&self, event: impl ToReference) -> bool {
        self.lookup(&event.to_reference()).is_some()
    }

    pub fn get(&self, event: impl ToReference) -> Result<Value, FetchError> {
        let reference = event.to_reference();
        if !self.is_synchronized() {
            return Err(FetchError::NotSynchronized);
        }
        let value = self
            .lookup(&reference)
            .ok_or(FetchError::KeyDoesNotExist(reference))?;
        Ok(experiments::resolve(value, &self.inner.state))
    }

    pub fn get_as<T: DeserializeOwned>(&self, event: impl ToReference) -> Result<T, FetchError> {
        let reference = event.to_reference();
        fetch_result::decode(self.get(&reference)?, &reference)
    }

    pub fn result(&self, event: impl ToReference) -> FetchResult {
        let reference = event.to_reference();
        let result = self.get(&reference);
        FetchResult::from_result(result, Metadata::new(reference, Source::RemoteConfiguration))
    }

    /// The current result followed by a fresh one after every fetch or override change.
    pub fn publisher(&self, event: impl ToReference) -> Subscription {
        let reference = event.to_reference();
        let configuration = self.clone();
        Subscription::revisions(self.inner.revision.subscribe(), move || {
            configuration.result(&reference)
        })
    }

    pub fn yes<I, U>(&self, ifs: I, unless: U) -> bool
    where
        I: IntoIterator,
        I::Item: ToReference,
        U: IntoIterator,
        U::Item: ToReference,
    {
        ifs.into_iter().all(|event| self.result(event).is_yes())
            && !unless.into_iter().any(|event| self.result(event).is_yes())
    }

    pub fn no<I, U>(&self, ifs: I, unless: U) -> bool
    where
        I: IntoIterator,
        I::Item: ToReference,
        U: IntoIterator,
        U::Item: ToReference,
    {
        !self.yes(ifs, unless)
    }

    /// Shadows every other layer for `event` until cleared. Persisted.
    pub fn override_value(&self, event: impl ToReference, value: impl Into<Value>) {
        let key = remote_keys::important(&event.to_reference());
        self.inner.layers.write().overrides.insert(key, value.into());
        self.persist_overrides();
        self.notify();
    }

    /// Removes the override for `event`, leaving the remote and default values untouched.
    pub fn clear(&self, event: impl ToReference) {
        let key = remote_keys::important(&event.to_reference());
        self.inner.layers.write().overrides.remove(&key);
        self.persist_overrides();
        self.notify();
    }

    pub fn clear_overrides(&self) {
        self.inner.layers.write().overrides.clear();
        self.persist_overrides();
        self.notify();
    }

    /// Reads a raw key of the merged view, bypassing key derivation.
    pub fn get_key(&self, key: &str) -> Result<Option<Value>, FetchError> {
        if !self.is_synchronized() {
            return Err(FetchError::NotSynchronized);
        }
        let layers = self.inner.layers.read();
        Ok(layers
            .overrides
            .get(key)
            .or_else(|| layers.fetched.get(key))
            .or_else(|| self.inner.defaults.get(key))
            .cloned())
    }

    /// Overrides a raw key. Only `!`-prefixed keys are persisted.
    pub fn override_key(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner
            .layers
            .write()
            .overrides
            .insert(key.into(), value.into());
        self.persist_overrides();
        self.notify();
    }

    /// Every key of the merged view.
    pub fn all_keys(&self) -> Vec<String> {
        let layers = self.inner.layers.read();
        let mut keys: Vec<String> = layers
            .overrides
            .keys()
            .chain(layers.fetched.keys())
            .chain(self.inner.defaults.keys())
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    fn lookup(&self, reference: &Reference) -> Option<Value> {
        let layers = self.inner.layers.read();
        remote_keys::candidates(reference).iter().find_map(|key| {
            layers
                .overrides
                .get(key)
                .or_else(|| layers.fetched.get(key))
                .or_else(|| self.inner.defaults.get(key))
                .cloned()
        })
    }

    fn notify(&self) {
        self.inner.revision.send_modify(|revision| *revision += 1);
    }

    fn reload_overrides(&self) {
        let persisted = match self.inner.preferences.object(ids::SESSION_CONFIGURATION) {
            Some(Value::Object(persisted)) => persisted,
            _ => return,
        };
        let mut layers = self.inner.layers.write();
        layers.overrides.retain(|key, _| !key.starts_with(IMPORTANT));
        for (key, value) in persisted {
            layers.overrides.insert(format!("{}{}", IMPORTANT, key), value);
        }
    }

    fn persist_overrides(&self) {
        let overrides: Map<String, Value> = self
            .inner
            .layers
            .read()
            .overrides
            .iter()
            .filter_map(|(key, value)| {
                let key = key.strip_prefix(IMPORTANT)?;
                Some((key.to_string(), value.clone()))
            })
            .collect();
        let object = (!overrides.is_empty()).then_some(Value::Object(overrides));
        self.inner
            .preferences
            .set(ids::SESSION_CONFIGURATION, object);
    }
}

/// Random delay in `[base, base * 2^(attempt - 1)]`, capped.
fn backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let base = base.as_millis() as u64;
    let factor = 1u64 << attempt.saturating_sub(1).min(32);
    let upper = base.saturating_mul(factor).min(cap.as_millis() as u64);
    let lower = base.min(upper);
    Duration::from_millis(rand::thread_rng().gen_range(lower..=upper))
}
