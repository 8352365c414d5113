use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::tag::{Context, Reference, Tag, ToReference};

/// Something that happened, addressed by a reference.
#[derive(Debug, Clone)]
pub struct Event {
    pub reference: Reference,
    pub context: Context,
    pub posted_at: DateTime<Utc>,
}

impl Event {
    pub fn tag(&self) -> &Tag {
        self.reference.tag()
    }

    /// True when this event is a `pattern` and carries every index it pins.
    pub fn matches(&self, pattern: &Reference) -> bool {
        self.reference.matches(pattern)
    }
}

/// In-process fan-out of [`Event`]s.
///
/// Slow listeners that fall more than the channel capacity behind skip the
/// oldest events rather than blocking posters.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Posts `event`; `context` is merged over the reference's own context.
    pub fn post(&self, event: impl ToReference, context: Context) {
        let reference = event.to_reference();
        let context = reference.context().merged(&context);
        log::debug!("Posting {}", reference);
        let _ = self.sender.send(Event {
            reference,
            context,
            posted_at: Utc::now(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Calls `handler` for every event matching any of `patterns` until the
    /// returned handle is dropped. Must be called from within a tokio runtime.
    pub fn on<I>(&self, patterns: I, handler: impl Fn(Event) + Send + Sync + 'static) -> EventHandle
    where
        I: IntoIterator,
        I::Item: ToReference,
    {
        let patterns: Arc<[Reference]> = patterns
            .into_iter()
            .map(|pattern| pattern.to_reference())
            .collect();
        let mut receiver = self.sender.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if patterns.iter().any(|pattern| event.matches(pattern)) {
                            handler(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Event listener lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        EventHandle { task }
    }
}

/// Keeps an [`EventBus::on`] listener alive; dropping it stops the listener.
#[derive(Debug)]
pub struct EventHandle {
    task: JoinHandle<()>,
}

impl EventHandle {
    /// Stops the listener now. Events already handed to it may still run.
    pub fn cancel(self) {
        self.task.abort();
    }
}

impl Drop for EventHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::{Graph, Language};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn language() -> Language {
        let graph = Graph::from_json(
            r#"{
                "app": {
                    "tap": {},
                    "asset": {
                        "@type": "blockchain.db.collection",
                        "buy": {}
                    }
                }
            }"#,
        )
        .unwrap();
        Language::new(graph).unwrap()
    }

    #[tokio::test]
    async fn posted_events_carry_merged_context() {
        let language = language();
        let bus = EventBus::new(8);
        let mut receiver = bus.subscribe();
        let tap = language.resolve("app.tap").unwrap();

        bus.post(&tap, Context::new().with("source", "test"));
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.tag(), &tap);
        assert_eq!(event.context.get("source"), Some(&json!("test")));
    }

    #[tokio::test]
    async fn listeners_only_see_matching_events() {
        let language = language();
        let bus = EventBus::new(8);
        let btc = Reference::parse("app.asset[BTC].buy", &language).unwrap();
        let eth = Reference::parse("app.asset[ETH].buy", &language).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handle = bus.on([&btc], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.post(&eth, Context::new());
        bus.post(&btc, Context::new());
        tokio::time::timeout(Duration::from_secs(5), async {
            while seen.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        drop(handle);
        tokio::task::yield_now().await;
        bus.post(&btc, Context::new());
        tokio::task::yield_now().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_listeners_stop() {
        let language = language();
        let bus = EventBus::new(8);
        let tap = language.resolve("app.tap").unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handle = bus.on([&tap], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handle.cancel();
        tokio::task::yield_now().await;
        bus.post(&tap, Context::new());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
