use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use super::{EventBus, EventHandle, Subscription};
use crate::errors::NamespaceResult;
use crate::fetch_result::FetchError;
use crate::ids;
use crate::tag::{Context, Language, Reference};

/// Opens a change feed for a reference, wherever its value lives.
pub type Publish = Arc<dyn Fn(&Reference) -> Subscription + Send + Sync>;

/// A forwarding rule as declared in `blockchain.session.state.observers`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObserverRule {
    pub event: ObserverEvent,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObserverEvent {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<BTreeMap<String, String>>,
}

impl ObserverEvent {
    pub fn is_binding(&self) -> bool {
        self.binding.unwrap_or(false)
    }

    pub fn is_notification(&self) -> bool {
        self.notification.unwrap_or(false)
    }
}

/// A rule whose ids have been resolved against the language.
#[derive(Debug, Clone)]
struct Observer {
    rule: ObserverRule,
    event: Reference,
    action: Reference,
    context: Context,
}

impl Observer {
    fn parse(value: &Value, language: &Language) -> NamespaceResult<Self> {
        let rule: ObserverRule = serde_json::from_value(value.clone())?;
        // Context keys that are not tags of this language are ignored.
        let context: Context = rule
            .event
            .context
            .iter()
            .flatten()
            .filter_map(|(id, value)| {
                let tag = language.tag(id)?;
                Some((tag.id().to_string(), Value::String(value.clone())))
            })
            .collect();
        let event = Reference::parse(&rule.event.tag, language)?.with_context(&context);
        let action = Reference::parse(&rule.action, language)?.with_context(&context);
        Ok(Self {
            rule,
            event,
            action,
            context,
        })
    }
}

/// Forwards a value's changes to the rule's action.
struct Binding {
    current: Arc<Mutex<Option<Value>>>,
    task: JoinHandle<()>,
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Default)]
struct Installed {
    subscription: Option<JoinHandle<()>>,
    notifications: HashMap<ObserverRule, EventHandle>,
    bindings: HashMap<ObserverRule, Binding>,
}

struct Inner {
    language: Language,
    events: EventBus,
    publish: Publish,
    installed: Mutex<Installed>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(subscription) = self.installed.get_mut().subscription.take() {
            subscription.abort();
        }
    }
}

/// Keeps event forwarding in line with the rule set stored under
/// `blockchain.session.state.observers`.
///
/// Notification rules are diffed against what is installed, so pushing the same
/// rule twice never doubles its deliveries. Bindings are rebuilt on every change,
/// carrying over the last value they forwarded.
#[derive(Clone)]
pub struct Observers {
    inner: Arc<Inner>,
}

impl Observers {
    pub fn new(language: Language, events: EventBus, publish: Publish) -> Self {
        Self {
            inner: Arc::new(Inner {
                language,
                events,
                publish,
                installed: Mutex::new(Installed::default()),
            }),
        }
    }

    /// Follows the stored rule set. Must be called from within a tokio runtime.
    pub fn subscribe(&self) -> NamespaceResult<()> {
        let rules = self
            .inner
            .language
            .resolve(ids::SESSION_STATE_OBSERVERS)?
            .reference();
        let mut changes = (self.inner.publish)(&rules);
        let observers: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(result) = changes.next().await {
                let Some(inner) = observers.upgrade() else {
                    break;
                };
                let rules = match result.value() {
                    Some(Value::Array(rules)) => rules.clone(),
                    _ => Vec::new(),
                };
                Observers { inner }.apply(&rules);
            }
        });
        if let Some(previous) = self.inner.installed.lock().subscription.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// Stops following the rule set and uninstalls every rule.
    pub fn clear(&self) {
        if let Some(subscription) = self.inner.installed.lock().subscription.take() {
            subscription.abort();
        }
        self.apply(&[]);
    }

    pub fn reset(&self) -> NamespaceResult<()> {
        self.clear();
        self.subscribe()
    }

    /// Reconciles the installed rules with `rules`. Malformed rules are skipped.
    pub fn apply(&self, rules: &[Value]) {
        let observers: Vec<Observer> = rules
            .iter()
            .filter_map(|rule| match Observer::parse(rule, &self.inner.language) {
                Ok(observer) => Some(observer),
                Err(error) => {
                    log::warn!("Ignoring malformed observer {}: {}", rule, error);
                    None
                }
            })
            .collect();

        let mut installed = self.inner.installed.lock();

        let mut previous = std::mem::take(&mut installed.bindings);
        for observer in observers.iter().filter(|o| o.rule.event.is_binding()) {
            let current = previous.remove(&observer.rule).and_then(|binding| {
                let current = binding.current.lock().take();
                current
            });
            let binding = self.bind(observer, current);
            installed.bindings.insert(observer.rule.clone(), binding);
        }
        drop(previous);

        let wanted: HashSet<&ObserverRule> = observers
            .iter()
            .filter(|o| o.rule.event.is_notification())
            .map(|o| &o.rule)
            .collect();
        installed
            .notifications
            .retain(|rule, _| wanted.contains(rule));
        for observer in observers.iter().filter(|o| o.rule.event.is_notification()) {
            if installed.notifications.contains_key(&observer.rule) {
                continue;
            }
            let handle = self.notify(observer);
            installed
                .notifications
                .insert(observer.rule.clone(), handle);
        }
    }

    /// Number of installed notification and binding rules.
    pub fn installed(&self) -> (usize, usize) {
        let installed = self.inner.installed.lock();
        (installed.notifications.len(), installed.bindings.len())
    }

    fn notify(&self, observer: &Observer) -> EventHandle {
        let events = self.inner.events.clone();
        let action = observer.action.clone();
        let context = observer.context.clone();
        self.inner.events.on([&observer.event], move |event| {
            events.post(&action, event.context.merged(&context));
        })
    }

    fn bind(&self, observer: &Observer, current: Option<Value>) -> Binding {
        let current = Arc::new(Mutex::new(current));
        let mut changes = (self.inner.publish)(&observer.event);
        let events = self.inner.events.clone();
        let action = observer.action.clone();
        let key = observer.event.tag().id().to_string();
        let last = current.clone();
        let task = tokio::spawn(async move {
            while let Some(result) = changes.next().await {
                if let Some(FetchError::KeyDoesNotExist(_)) = result.error() {
                    continue;
                }
                let value = result.value().cloned();
                {
                    let mut last = last.lock();
                    if *last == value {
                        continue;
                    }
                    *last = value.clone();
                }
                let context = Context::new().with(key.clone(), value.unwrap_or(Value::Null));
                events.post(&action, context);
            }
        });
        Binding { current, task }
    }
}
