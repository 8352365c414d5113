use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::fetch_result::FetchResult;

type Resolve = Arc<dyn Fn() -> FetchResult + Send + Sync>;

enum Feed {
    /// Per-key change notifications pushed by the store.
    Broadcast(broadcast::Receiver<FetchResult>),
    /// A revision counter; every bump re-resolves the key.
    Revisions {
        changes: watch::Receiver<u64>,
        resolve: Resolve,
    },
}

/// Stream of [`FetchResult`]s for one reference: the current result first, then
/// one result per change.
pub struct Subscription {
    pending: VecDeque<FetchResult>,
    feed: Feed,
    task: Option<JoinHandle<()>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Subscription {
    pub(crate) fn broadcast(
        initial: FetchResult,
        receiver: broadcast::Receiver<FetchResult>,
    ) -> Self {
        Self {
            pending: VecDeque::from([initial]),
            feed: Feed::Broadcast(receiver),
            task: None,
        }
    }

    pub(crate) fn revisions(
        mut changes: watch::Receiver<u64>,
        resolve: impl Fn() -> FetchResult + Send + Sync + 'static,
    ) -> Self {
        changes.borrow_and_update();
        let resolve: Resolve = Arc::new(resolve);
        Self {
            pending: VecDeque::from([resolve()]),
            feed: Feed::Revisions { changes, resolve },
            task: None,
        }
    }

    /// Ties the task producing this subscription's revisions to its lifetime.
    pub(crate) fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    /// Waits for the next result; `None` once the producing side is gone.
    pub async fn next(&mut self) -> Option<FetchResult> {
        if let Some(result) = self.pending.pop_front() {
            return Some(result);
        }
        match &mut self.feed {
            Feed::Broadcast(receiver) => loop {
                match receiver.recv().await {
                    Ok(result) => return Some(result),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Subscription lagged, skipped {} results", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            Feed::Revisions { changes, resolve } => {
                changes.changed().await.ok()?;
                changes.borrow_and_update();
                Some(resolve())
            }
        }
    }

    /// Returns a result that is already available without waiting.
    pub fn try_next(&mut self) -> Option<FetchResult> {
        if let Some(result) = self.pending.pop_front() {
            return Some(result);
        }
        match &mut self.feed {
            Feed::Broadcast(receiver) => loop {
                match receiver.try_recv() {
                    Ok(result) => return Some(result),
                    Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                        log::warn!("Subscription lagged, skipped {} results", skipped);
                    }
                    Err(_) => return None,
                }
            },
            Feed::Revisions { changes, resolve } => {
                if !changes.has_changed().unwrap_or(false) {
                    return None;
                }
                changes.borrow_and_update();
                Some(resolve())
            }
        }
    }

    /// Every result currently available, in order.
    pub fn drain(&mut self) -> Vec<FetchResult> {
        std::iter::from_fn(|| self.try_next()).collect()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let feed = match self.feed {
            Feed::Broadcast(_) => "broadcast",
            Feed::Revisions { .. } => "revisions",
        };
        f.debug_struct("Subscription")
            .field("pending", &self.pending.len())
            .field("feed", &feed)
            .finish()
    }
}
