use std::sync::Arc;

use shepherd_cloud::{ClientSet, CloudError};
use shepherd_store::{DocumentStore, Gvk, ObjectRef};
use tracing::{debug, warn};

use crate::context::Context;
use crate::engine::{ReconcileStatus, StateEngine};
use crate::error::EngineError;
use crate::handler::StateHandler;
use crate::ratelimit::RateLimiter;

/// Builds the external-API client set for one reconcile attempt.
/// Construction is cheap; no pooling across attempts.
pub type ClientFactory = Arc<dyn Fn() -> Result<ClientSet, CloudError> + Send + Sync>;

/// The production factory: credentials from the environment.
pub fn env_client_factory() -> ClientFactory {
    Arc::new(ClientSet::from_env)
}

/// Per-kind entry point: loads the document named by a work item and hands it
/// to the state engine wrapped in a request-scoped context.
pub struct Dispatcher {
    pub gvk: Gvk,
    store: Arc<dyn DocumentStore>,
    clients: ClientFactory,
    engine: StateEngine,
    rate_limiter: Arc<RateLimiter<ObjectRef>>,
}

impl Dispatcher {
    pub fn new(
        gvk: Gvk,
        store: Arc<dyn DocumentStore>,
        handler: Arc<dyn StateHandler>,
        clients: ClientFactory,
        rate_limiter: Arc<RateLimiter<ObjectRef>>,
    ) -> Self {
        Dispatcher {
            gvk,
            store: store.clone(),
            clients,
            engine: StateEngine::new(store, handler, rate_limiter.clone()),
            rate_limiter,
        }
    }

    pub async fn reconcile(&self, request: &ObjectRef) -> ReconcileStatus {
        let mut doc = match self.store.get(request).await {
            Ok(doc) => doc,
            Err(err) if err.is_not_found() => {
                // Deletion completed elsewhere or the event raced; done.
                debug!(key = %request, "document is gone, nothing to do");
                return ReconcileStatus::default();
            }
            Err(err) => return self.retry(request, err.into()),
        };

        let clients = match (self.clients)() {
            Ok(clients) => clients,
            Err(err) => return self.retry(request, err.into()),
        };

        let ctx = Context::new(request.clone(), clients);
        self.engine.reconcile(&ctx, &mut doc).await
    }

    fn retry(&self, request: &ObjectRef, error: EngineError) -> ReconcileStatus {
        let delay = self.rate_limiter.when(request);
        warn!(key = %request, error = %error, "failed to prepare reconcile");
        ReconcileStatus::retry(error, delay)
    }
}
