use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shepherd_store::{DocumentStore, Gvk, ObjectRef, WatchEvent};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, warn};

use crate::dispatch::{ClientFactory, Dispatcher};
use crate::handler::StateHandler;
use crate::ratelimit::{RateLimiter, BASE_DELAY};
use crate::EXTERNAL_ANNOTATION_PREFIX;

/// Owns one worker per registered kind and the process-wide rate limiter.
///
/// Each worker serializes reconciliations for its kind, so there is never
/// more than one in flight per (kind, namespace, name).
pub struct Manager {
    store: Arc<dyn DocumentStore>,
    rate_limiter: Arc<RateLimiter<ObjectRef>>,
    dispatchers: Vec<Arc<Dispatcher>>,
}

impl Manager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Manager {
            store,
            rate_limiter: Arc::new(RateLimiter::new()),
            dispatchers: Vec::new(),
        }
    }

    pub fn register(&mut self, gvk: Gvk, handler: Arc<dyn StateHandler>, clients: ClientFactory) {
        self.dispatchers.push(Arc::new(Dispatcher::new(
            gvk,
            self.store.clone(),
            handler,
            clients,
            self.rate_limiter.clone(),
        )));
    }

    pub fn rate_limiter(&self) -> Arc<RateLimiter<ObjectRef>> {
        self.rate_limiter.clone()
    }

    /// Run every kind worker until `shutdown` flips to true.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let mut workers = Vec::new();
        for dispatcher in &self.dispatchers {
            info!(kind = %dispatcher.gvk.kind, "starting kind worker");
            workers.push(tokio::spawn(kind_worker(
                dispatcher.clone(),
                self.store.clone(),
                self.rate_limiter.clone(),
                shutdown.clone(),
            )));
        }
        for worker in workers {
            let _ = worker.await;
        }
    }
}

/// Admit create events, and update events only when the generation moved or
/// the document carries an external adoption annotation. Bare delete events
/// are ignored: the finalizer keeps the document alive and the engine finds
/// the deletion timestamp on the next fetch.
fn admit(event: &WatchEvent) -> bool {
    match event {
        WatchEvent::Created { .. } => true,
        WatchEvent::Updated { old, new, .. } => {
            new.generation() != old.generation()
                || new
                    .annotations()
                    .keys()
                    .any(|key| key.starts_with(EXTERNAL_ANNOTATION_PREFIX))
        }
        WatchEvent::Deleted { .. } => false,
    }
}

type PendingSet = Arc<Mutex<HashSet<ObjectRef>>>;

fn enqueue(queue: &mpsc::UnboundedSender<ObjectRef>, pending: &PendingSet, key: ObjectRef) {
    let mut pending = pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if pending.insert(key.clone()) {
        let _ = queue.send(key);
    }
}

async fn kind_worker(
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn DocumentStore>,
    rate_limiter: Arc<RateLimiter<ObjectRef>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut events = store.subscribe();
    let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<ObjectRef>();
    let pending: PendingSet = Arc::new(Mutex::new(HashSet::new()));

    // The watch only delivers changes from now on; pick up what already
    // exists in the store.
    match store.list(&dispatcher.gvk).await {
        Ok(docs) => {
            for doc in docs {
                enqueue(&queue_tx, &pending, ObjectRef::from_document(&doc));
            }
        }
        Err(err) => warn!(kind = %dispatcher.gvk.kind, error = %err, "initial list failed"),
    }

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(kind = %dispatcher.gvk.kind, "kind worker stopping");
                    return;
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if event.key().gvk == dispatcher.gvk && admit(&event) {
                        enqueue(&queue_tx, &pending, event.key().clone());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(kind = %dispatcher.gvk.kind, missed, "watch stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            Some(request) = queue_rx.recv() => {
                pending
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove(&request);

                let status = dispatcher.reconcile(&request).await;
                let delay = if let Some(error) = &status.error {
                    warn!(key = %request, error = %error, "reconcile failed");
                    // Every engine error path goes through
                    // ReconcileStatus::retry, which attaches the
                    // limiter-computed delay; the fallback covers only a
                    // status constructed by hand and matches the limiter's
                    // first-failure delay, so it never retries faster than
                    // backoff allows.
                    Some(status.requeue_after.unwrap_or(BASE_DELAY))
                } else {
                    rate_limiter.forget(&request);
                    if status.requeue {
                        Some(Duration::ZERO)
                    } else {
                        status.requeue_after
                    }
                };

                if let Some(delay) = delay {
                    let queue_tx = queue_tx.clone();
                    let pending = pending.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        enqueue(&queue_tx, &pending, request);
                    });
                }
            }
        }
    }
}
