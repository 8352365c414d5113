use std::any::type_name;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// A long-lived client-side component started and stopped by [`ClientObservers`].
pub trait ClientObserver: Send + Sync {
    fn start(&self);
    fn stop(&self);

    fn description(&self) -> String {
        type_name::<Self>().to_string()
    }
}

/// Registry of client observers keyed by identity: inserting the same observer
/// twice starts it once.
#[derive(Default)]
pub struct ClientObservers {
    observers: Mutex<HashMap<usize, Arc<dyn ClientObserver>>>,
}

fn identity<O: ClientObserver + ?Sized>(observer: &Arc<O>) -> usize {
    Arc::as_ptr(observer) as *const () as usize
}

impl ClientObservers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<O: ClientObserver + 'static>(&self, observer: Arc<O>) {
        let inserted = {
            let mut observers = self.observers.lock();
            match observers.entry(identity(&observer)) {
                Entry::Occupied(_) => false,
                Entry::Vacant(entry) => {
                    entry.insert(observer.clone());
                    true
                }
            }
        };
        if inserted {
            log::debug!("Starting {}", observer.description());
            observer.start();
        }
    }

    pub fn remove<O: ClientObserver + 'static>(&self, observer: &Arc<O>) {
        let removed = self.observers.lock().remove(&identity(observer));
        if let Some(removed) = removed {
            log::debug!("Stopping {}", removed.description());
            removed.stop();
        }
    }

    pub fn len(&self) -> usize {
        self.observers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
