use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::Subscription;
use crate::errors::NamespaceResult;
use crate::fetch_result::{self, FetchError, FetchResult, Metadata, Source};
use crate::ids;
use crate::storage::Preferences;
use crate::tag::{Language, Reference, ToReference};

/// Persisted scope holding preferences shared by every user of the device.
pub const SHARED_SCOPE: &str = "ø";

type Compute = dyn Fn() -> Result<Value, FetchError> + Send + Sync;

/// A closure stored in place of a value, evaluated afresh on every read.
#[derive(Clone)]
pub struct Computed {
    id: Uuid,
    compute: Arc<Compute>,
}

impl Computed {
    pub fn new(compute: impl Fn() -> Result<Value, FetchError> + Send + Sync + 'static) -> Self {
        Self {
            id: Uuid::new_v4(),
            compute: Arc::new(compute),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn call(&self) -> Result<Value, FetchError> {
        (self.compute)()
    }
}

impl PartialEq for Computed {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for Computed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Computed({})", self.id)
    }
}

/// What the store holds for a key.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Literal(Value),
    Computed(Computed),
}

impl Slot {
    fn evaluate(&self) -> Result<Value, FetchError> {
        match self {
            Slot::Literal(value) => Ok(value.clone()),
            Slot::Computed(computed) => computed.call(),
        }
    }
}

#[derive(Debug, Clone)]
enum Pending {
    Set(Slot),
    Tombstone,
}

#[derive(Default)]
struct Inner {
    store: HashMap<Reference, Slot>,
    subjects: HashMap<Reference, broadcast::Sender<FetchResult>>,
    dirty: HashMap<Reference, Pending>,
    level: u32,
    poisoned: bool,
}

struct Data {
    language: Language,
    preferences: Arc<dyn Preferences>,
    capacity: usize,
    user: Reference,
    lock: ReentrantMutex<RefCell<Inner>>,
}

/// Transactional, observable key-value store keyed by [`Reference`].
///
/// Every mutation goes through one reentrant lock, so nested transactions and
/// callbacks that write back into the store from a commit never deadlock.
#[derive(Clone)]
pub struct State {
    data: Arc<Data>,
}

impl State {
    pub fn new(
        language: Language,
        preferences: Arc<dyn Preferences>,
        capacity: usize,
    ) -> NamespaceResult<Self> {
        let user = language.resolve(ids::USER_ID)?.reference();
        Ok(Self {
            data: Arc::new(Data {
                language,
                preferences,
                capacity: capacity.max(1),
                user,
                lock: ReentrantMutex::new(RefCell::new(Inner::default())),
            }),
        })
    }

    pub fn language(&self) -> &Language {
        &self.data.language
    }

    /// Runs `work` with exclusive access to the inner maps. `work` must not call
    /// back into the store.
    fn sync<T>(&self, work: impl FnOnce(&mut Inner) -> T) -> T {
        let guard = self.data.lock.lock();
        let mut inner = guard.borrow_mut();
        work(&mut inner)
    }

    /// The signed-in user, if any.
    pub fn user(&self) -> Option<String> {
        self.sync(|inner| match inner.store.get(&self.data.user) {
            Some(Slot::Literal(Value::String(user))) => Some(user.clone()),
            _ => None,
        })
    }

    pub fn is_in_transaction(&self) -> bool {
        self.sync(|inner| inner.level > 0)
    }

    /// Runs `work` atomically: its writes become visible together when it
    /// succeeds and are discarded when it fails. Errors stop here.
    pub fn transaction<T>(&self, work: impl FnOnce(&State) -> NamespaceResult<T>) -> Option<T> {
        let _guard = self.data.lock.lock();
        self.begin_transaction();
        match work(self) {
            Ok(value) => self.finish_transaction().then_some(value),
            Err(error) => {
                log::warn!("Rolling back session state transaction: {}", error);
                self.rollback_transaction();
                None
            }
        }
    }

    pub fn begin_transaction(&self) {
        self.sync(|inner| inner.level += 1);
    }

    /// Closes one transaction level; the outermost one commits and broadcasts.
    pub fn end_transaction(&self) {
        self.finish_transaction();
    }

    /// Returns false when the outermost level discards its writes because a
    /// nested transaction was rolled back.
    fn finish_transaction(&self) -> bool {
        let _guard = self.data.lock.lock();
        let batch = self.sync(|inner| match inner.level {
            0 => {
                log::warn!(
                    "Misaligned begin -> end transaction calls. You must be in a transaction to end a transaction."
                );
                Some(None)
            }
            1 if inner.poisoned => {
                log::warn!("Discarding session state transaction after a nested rollback");
                inner.level = 0;
                inner.poisoned = false;
                inner.dirty.clear();
                None
            }
            1 => {
                inner.level = 0;
                Some(Some(inner.dirty.drain().collect::<Vec<_>>()))
            }
            _ => {
                inner.level -= 1;
                Some(None)
            }
        });
        match batch {
            Some(Some(batch)) => {
                self.update(batch);
                true
            }
            Some(None) => true,
            None => false,
        }
    }

    /// Discards every buffered write, whatever the nesting depth. A nested
    /// rollback leaves the enclosing levels open but failed: their later
    /// writes stay buffered and are dropped when the outermost level closes.
    pub fn rollback_transaction(&self) {
        self.sync(|inner| match inner.level {
            0 => log::warn!("Rolling back outside of a transaction"),
            1 => {
                inner.level = 0;
                inner.poisoned = false;
                inner.dirty.clear();
            }
            _ => {
                inner.level -= 1;
                inner.poisoned = true;
                inner.dirty.clear();
            }
        });
    }

    pub fn contains(&self, event: impl ToReference) -> bool {
        let key = event.to_reference();
        self.sync(|inner| inner.store.contains_key(&key))
    }

    pub fn does_not_contain(&self, event: impl ToReference) -> bool {
        !self.contains(event)
    }

    pub fn set(&self, event: impl ToReference, value: impl Into<Value>) {
        self.write(event.to_reference(), Pending::Set(Slot::Literal(value.into())));
    }

    /// Stores a closure that is evaluated on every read instead of a value.
    pub fn set_computed(
        &self,
        event: impl ToReference,
        compute: impl Fn() -> Result<Value, FetchError> + Send + Sync + 'static,
    ) {
        self.write(
            event.to_reference(),
            Pending::Set(Slot::Computed(Computed::new(compute))),
        );
    }

    /// Removes a key. Clearing `blockchain.user.id` signs out: every key except
    /// preferences and the user id itself is cleared with it.
    pub fn clear(&self, event: impl ToReference) {
        let key = event.to_reference();
        if key.tag().is_id(ids::USER_ID) {
            let _guard = self.data.lock.lock();
            let keys: Vec<Reference> = self.sync(|inner| inner.store.keys().cloned().collect());
            self.transaction(|state| {
                for reference in keys {
                    let tag = reference.tag();
                    if tag.is_id(ids::SESSION_STATE_SHARED_VALUE)
                        || tag.is_id(ids::SESSION_STATE_PREFERENCE_VALUE)
                        || reference == key
                    {
                        continue;
                    }
                    state.write(reference, Pending::Tombstone);
                }
                Ok(())
            });
        }
        self.write(key, Pending::Tombstone);
    }

    pub fn get(&self, event: impl ToReference) -> Result<Value, FetchError> {
        let key = event.to_reference();
        let slot = self.sync(|inner| inner.store.get(&key).cloned());
        if let Some(slot) = slot {
            return slot.evaluate();
        }

        let tag = key.tag();
        if tag.is_id(ids::SESSION_STATE_PREFERENCE_VALUE) {
            let scope = if tag.is_id(ids::SESSION_STATE_SHARED_VALUE) {
                Some(SHARED_SCOPE.to_string())
            } else {
                self.user()
            };
            let value = scope.and_then(|scope| self.preference(&key, &scope));
            if let Some(value) = value {
                self.write(key, Pending::Set(Slot::Literal(value.clone())));
                return Ok(value);
            }
        }
        Err(FetchError::KeyDoesNotExist(key))
    }

    pub fn get_as<T: DeserializeOwned>(&self, event: impl ToReference) -> Result<T, FetchError> {
        let key = event.to_reference();
        fetch_result::decode(self.get(&key)?, &key)
    }

    pub fn result(&self, event: impl ToReference) -> FetchResult {
        let key = event.to_reference();
        let result = self.get(&key);
        FetchResult::from_result(result, Metadata::new(key, Source::State))
    }

    /// The current result for the key followed by one result per committed change.
    pub fn publisher(&self, event: impl ToReference) -> Subscription {
        let key = event.to_reference();
        let _guard = self.data.lock.lock();
        let initial = self.result(&key);
        let capacity = self.data.capacity;
        let receiver = self.sync(|inner| {
            inner
                .subjects
                .entry(key)
                .or_insert_with(|| broadcast::channel(capacity).0)
                .subscribe()
        });
        Subscription::broadcast(initial, receiver)
    }

    /// True when every `ifs` key holds `true` and no `unless` key does.
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

    fn write(&self, key: Reference, pending: Pending) {
        let _guard = self.data.lock.lock();
        let signed_in = match &pending {
            Pending::Set(Slot::Literal(Value::String(user))) if key == self.data.user => {
                Some(user.clone())
            }
            _ => None,
        };
        let previous = signed_in.as_ref().and_then(|_| self.user());

        let immediate = self.sync(|inner| {
            if inner.level > 0 {
                inner.dirty.insert(key.clone(), pending);
                None
            } else {
                Some(pending)
            }
        });
        if let Some(pending) = immediate {
            self.update(vec![(key, pending)]);
        }

        if let Some(user) = signed_in {
            if previous.as_deref() != Some(user.as_str()) {
                self.sign_in(&user);
            }
        }
    }

    /// Swaps the in-memory per-user preferences for `user`'s persisted ones,
    /// atomically for subscribers.
    fn sign_in(&self, user: &str) {
        let _guard = self.data.lock.lock();
        self.begin_transaction();
        let (resident, subscribed) = self.sync(|inner| {
            let resident: Vec<Reference> = inner
                .store
                .keys()
                .filter(|key| is_user_preference(key))
                .cloned()
                .collect();
            let subscribed: Vec<Reference> = inner
                .subjects
                .keys()
                .filter(|key| is_user_preference(key) && !inner.store.contains_key(*key))
                .cloned()
                .collect();
            (resident, subscribed)
        });
        for key in &resident {
            self.write(key.clone(), Pending::Tombstone);
        }
        for key in resident.into_iter().chain(subscribed) {
            if let Some(value) = self.preference(&key, user) {
                self.write(key, Pending::Set(Slot::Literal(value)));
            }
        }
        self.end_transaction();
        log::debug!("Rehydrated session preferences for {}", user);
    }

    fn preference(&self, key: &Reference, scope: &str) -> Option<Value> {
        self.data
            .preferences
            .object(ids::SESSION_STATE)?
            .get(scope)?
            .get(key.string())
            .cloned()
    }

    fn update(&self, batch: Vec<(Reference, Pending)>) {
        let _guard = self.data.lock.lock();
        self.sync(|inner| {
            for (key, pending) in &batch {
                match pending {
                    Pending::Set(slot) => {
                        inner.store.insert(key.clone(), slot.clone());
                    }
                    Pending::Tombstone => {
                        inner.store.remove(key);
                    }
                }
            }
        });

        self.persist(&batch);

        for (key, pending) in batch {
            let Some(subject) = self.sync(|inner| inner.subjects.get(&key).cloned()) else {
                continue;
            };
            let result = match pending {
                Pending::Set(slot) => slot.evaluate(),
                Pending::Tombstone => Err(FetchError::KeyDoesNotExist(key.clone())),
            };
            let _ = subject.send(FetchResult::from_result(
                result,
                Metadata::new(key, Source::State),
            ));
        }
    }

    fn persist(&self, batch: &[(Reference, Pending)]) {
        let preferences: Vec<&(Reference, Pending)> = batch
            .iter()
            .filter(|(key, pending)| {
                key.tag().is_id(ids::SESSION_STATE_PREFERENCE_VALUE)
                    && !matches!(pending, Pending::Set(Slot::Computed(_)))
            })
            .collect();
        if preferences.is_empty() {
            return;
        }

        let (shared, personal): (Vec<_>, Vec<_>) = preferences
            .into_iter()
            .partition(|(key, _)| key.tag().is_id(ids::SESSION_STATE_SHARED_VALUE));
        let user = self.user();
        if user.is_none() && !personal.is_empty() {
            log::warn!(
                "Attempted to write user preferences without being signed in, \
                 observe {} before writing them: {:?}",
                ids::SESSION_EVENT_DID_SIGN_IN,
                personal.iter().map(|(key, _)| key.string()).collect::<Vec<_>>()
            );
        }
        if shared.is_empty() && (user.is_none() || personal.is_empty()) {
            return;
        }

        self.data
            .preferences
            .transaction(ids::SESSION_STATE, &mut |object| {
                let mut scopes = match object.take() {
                    Some(Value::Object(scopes)) => scopes,
                    _ => Map::new(),
                };
                apply(&mut scopes, SHARED_SCOPE, &shared);
                if let Some(user) = &user {
                    apply(&mut scopes, user, &personal);
                }
                *object = Some(Value::Object(scopes));
            });
    }
}

fn is_user_preference(key: &Reference) -> bool {
    key.tag().is_id(ids::SESSION_STATE_PREFERENCE_VALUE)
        && !key.tag().is_id(ids::SESSION_STATE_SHARED_VALUE)
}

fn apply(scopes: &mut Map<String, Value>, scope: &str, entries: &[&(Reference, Pending)]) {
    if entries.is_empty() {
        return;
    }
    let mut values = match scopes.remove(scope) {
        Some(Value::Object(values)) => values,
        _ => Map::new(),
    };
    for (key, pending) in entries {
        match pending {
            Pending::Set(Slot::Literal(value)) => {
                values.insert(key.string().to_string(), value.clone());
            }
            Pending::Set(Slot::Computed(_)) => {}
            Pending::Tombstone => {
                values.remove(key.string());
            }
        }
    }
    scopes.insert(scope.to_string(), Value::Object(values));
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (keys, level) = self.sync(|inner| (inner.store.len(), inner.level));
        f.debug_struct("State")
            .field("keys", &keys)
            .field("level", &level)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::NamespaceError;
    use crate::storage::MemoryPreferences;
    use crate::tag::{Graph, Tag};
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    const LEXICON: &str = r#"{
        "app": {
            "x": { "@type": "blockchain.session.state.value" },
            "y": { "@type": "blockchain.session.state.value" },
            "flag": { "@type": ["blockchain.session.state.value", "blockchain.db.type.boolean"] },
            "preference": { "@type": "blockchain.session.state.preference.value" },
            "shared": { "@type": "blockchain.session.state.shared.value" }
        }
    }"#;

    fn fixture(preferences: MemoryPreferences) -> (State, Arc<MemoryPreferences>) {
        let language = Language::new(Graph::from_json(LEXICON).unwrap()).unwrap();
        let preferences = Arc::new(preferences);
        let state = State::new(language, preferences.clone(), 16).unwrap();
        (state, preferences)
    }

    fn tag(state: &State, id: &str) -> Tag {
        state.language().resolve(id).unwrap()
    }

    #[test]
    fn set_get_clear() {
        let (state, _) = fixture(MemoryPreferences::new());
        let x = tag(&state, "app.x");

        assert!(matches!(state.get(&x), Err(FetchError::KeyDoesNotExist(_))));
        state.set(&x, 1);
        assert_eq!(state.get(&x).unwrap(), json!(1));
        assert!(state.contains(&x));
        state.clear(&x);
        assert!(state.does_not_contain(&x));
    }

    #[test]
    fn failed_transaction_rolls_back_everything() {
        let (state, _) = fixture(MemoryPreferences::new());
        let x = tag(&state, "app.x");
        let y = tag(&state, "app.y");
        state.set(&x, "before");

        let outcome = state.transaction(|state| {
            state.set(&x, "during");
            state.clear(&x);
            state.transaction(|state| {
                state.set(&y, "nested");
                Ok(())
            });
            Err::<(), _>(NamespaceError::Storage("boom".to_string()))
        });

        assert!(outcome.is_none());
        assert_eq!(state.get(&x).unwrap(), json!("before"));
        assert!(state.does_not_contain(&y));
        assert!(!state.is_in_transaction());
    }

    #[test]
    fn writes_after_a_failed_nested_transaction_stay_buffered() {
        let (state, _) = fixture(MemoryPreferences::new());
        let x = tag(&state, "app.x");
        let y = tag(&state, "app.y");

        let outcome = state.transaction(|state| {
            state.set(&x, "outer");
            let nested = state.transaction(|_| {
                Err::<(), _>(NamespaceError::Storage("nested".to_string()))
            });
            assert!(nested.is_none());
            assert!(state.is_in_transaction());
            state.set(&y, "after");
            assert!(state.does_not_contain(&y));
            Err::<(), _>(NamespaceError::Storage("outer".to_string()))
        });

        assert!(outcome.is_none());
        assert!(state.does_not_contain(&x));
        assert!(state.does_not_contain(&y));
        assert!(!state.is_in_transaction());
    }

    #[test]
    fn a_failed_nested_transaction_fails_the_outer_one() {
        let (state, _) = fixture(MemoryPreferences::new());
        let x = tag(&state, "app.x");

        let outcome = state.transaction(|state| {
            state.transaction(|_| Err::<(), _>(NamespaceError::Storage("nested".to_string())));
            state.set(&x, "after");
            Ok(())
        });

        assert!(outcome.is_none());
        assert!(state.does_not_contain(&x));

        state.set(&x, "later");
        assert_eq!(state.get(&x).unwrap(), json!("later"));
    }

    #[test]
    fn nested_transactions_commit_once() {
        let (state, _) = fixture(MemoryPreferences::new());
        let x = tag(&state, "app.x");
        let mut subscription = state.publisher(&x);
        assert!(subscription.try_next().unwrap().error().is_some());

        state.begin_transaction();
        state.begin_transaction();
        state.set(&x, 1);
        state.set(&x, 2);
        state.end_transaction();
        assert!(state.does_not_contain(&x));
        assert!(subscription.try_next().is_none());
        state.end_transaction();

        let results = subscription.drain();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].value(), Some(&json!(2)));
        assert_eq!(state.get(&x).unwrap(), json!(2));
    }

    #[test]
    fn computed_values_are_evaluated_on_every_read() {
        let (state, _) = fixture(MemoryPreferences::new());
        let x = tag(&state, "app.x");
        let counter = Arc::new(AtomicU64::new(0));
        let calls = counter.clone();
        state.set_computed(&x, move || Ok(json!(calls.fetch_add(1, Ordering::SeqCst))));

        assert_eq!(state.get(&x).unwrap(), json!(0));
        assert_eq!(state.get(&x).unwrap(), json!(1));
        assert_eq!(state.get(&x).unwrap(), json!(2));
    }

    #[test]
    fn computed_values_may_read_the_store() {
        let (state, _) = fixture(MemoryPreferences::new());
        let x = tag(&state, "app.x");
        let y = tag(&state, "app.y");
        state.set(&x, 20);

        let reader = state.clone();
        let source = x.clone();
        state.set_computed(&y, move || {
            let x: i64 = reader.get_as(&source)?;
            Ok(json!(x + 1))
        });
        assert_eq!(state.get_as::<i64>(&y).unwrap(), 21);
    }

    #[test]
    fn yes_and_no() {
        let (state, _) = fixture(MemoryPreferences::new());
        let flag = tag(&state, "app.flag");
        let x = tag(&state, "app.x");
        let none: [&Tag; 0] = [];

        state.set(&flag, true);
        state.set(&x, false);
        assert!(state.yes([&flag], [&x]));
        state.set(&x, true);
        assert!(!state.yes([&flag], [&x]));
        assert!(state.no([&flag], [&x]));
        assert!(state.yes(none, none));
        state.set(&x, "true");
        assert!(state.yes([&flag], [&x]));
    }

    #[test]
    fn sign_out_keeps_preferences() {
        let (state, _) = fixture(MemoryPreferences::new());
        let user = tag(&state, ids::USER_ID);
        let shared = tag(&state, "app.shared");
        let preference = tag(&state, "app.preference");
        let x = tag(&state, "app.x");

        state.set(&user, "u");
        state.set(&shared, "s");
        state.set(&preference, "p");
        state.set(&x, "x");

        state.clear(&user);

        assert_eq!(state.get(&shared).unwrap(), json!("s"));
        assert_eq!(state.get(&preference).unwrap(), json!("p"));
        assert!(state.does_not_contain(&x));
        assert!(state.does_not_contain(&user));
    }

    #[test]
    fn preferences_are_scoped_per_user() {
        let persisted = MemoryPreferences::new().with(
            ids::SESSION_STATE,
            json!({
                "alice": { "app.preference": "v1" },
                SHARED_SCOPE: { "app.preference": "v0", "app.shared": "s0" }
            }),
        );
        let (state, _) = fixture(persisted);
        let user = tag(&state, ids::USER_ID);
        let preference = tag(&state, "app.preference");
        let shared = tag(&state, "app.shared");

        assert!(state.get(&preference).is_err());
        assert_eq!(state.get(&shared).unwrap(), json!("s0"));

        state.set(&user, "alice");
        assert_eq!(state.get(&preference).unwrap(), json!("v1"));

        state.set(&user, "bob");
        assert!(matches!(
            state.get(&preference),
            Err(FetchError::KeyDoesNotExist(_))
        ));
        assert_eq!(state.get(&shared).unwrap(), json!("s0"));
    }

    #[test]
    fn sign_in_rehydrates_subscribers_in_one_commit() {
        let persisted = MemoryPreferences::new().with(
            ids::SESSION_STATE,
            json!({ "alice": { "app.preference": "v1" } }),
        );
        let (state, _) = fixture(persisted);
        let user = tag(&state, ids::USER_ID);
        let preference = tag(&state, "app.preference");

        let mut subscription = state.publisher(&preference);
        assert!(subscription.try_next().unwrap().error().is_some());

        state.set(&user, "alice");
        let results = subscription.drain();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].value(), Some(&json!("v1")));
    }

    #[test]
    fn preference_writes_are_persisted_under_the_scope() {
        let (state, preferences) = fixture(MemoryPreferences::new());
        let user = tag(&state, ids::USER_ID);
        let preference = tag(&state, "app.preference");
        let shared = tag(&state, "app.shared");

        state.set(&preference, "dropped");
        assert_eq!(preferences.object(ids::SESSION_STATE), None);

        state.set(&user, "carol");
        state.set(&preference, "kept");
        state.set(&shared, "everyone");
        assert_eq!(
            preferences.object(ids::SESSION_STATE),
            Some(json!({
                "carol": { "app.preference": "kept" },
                SHARED_SCOPE: { "app.shared": "everyone" }
            }))
        );

        state.clear(&preference);
        assert_eq!(
            preferences.object(ids::SESSION_STATE).unwrap()["carol"],
            json!({})
        );
    }

    #[test]
    fn misaligned_end_is_ignored() {
        let (state, _) = fixture(MemoryPreferences::new());
        state.end_transaction();
        state.rollback_transaction();
        assert!(!state.is_in_transaction());
    }

    #[test]
    fn concurrent_writers_are_serialized() {
        let (state, _) = fixture(MemoryPreferences::new());
        let x = tag(&state, "app.x");
        state.set(&x, 0);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = state.clone();
                let x = x.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        state.transaction(|state| {
                            let value: i64 = state.get_as(&x)?;
                            state.set(&x, value + 1);
                            Ok(())
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(state.get(&x).unwrap(), json!(400));
    }
}
