use std::sync::Arc;
use std::time::Duration;

use shepherd_document::{
    find_condition, set_condition, Condition, ConditionStatus, Document, READY_CONDITION,
    STATE_CONDITION,
};
use shepherd_store::{DocumentStore, ObjectRef, StoreError};
use tracing::{info, warn};

use crate::context::Context;
use crate::error::EngineError;
use crate::finalizer::{ensure_finalizers, unset_finalizers};
use crate::handler::StateHandler;
use crate::ratelimit::RateLimiter;
use crate::result::Transition;
use crate::state::{state_of, ResourceState};
use crate::{EXTERNAL_ANNOTATION_PREFIX, FINALIZER};

pub const READY_REASON_ERROR: &str = "Error";
pub const READY_REASON_PENDING: &str = "Pending";
pub const READY_REASON_SETTLED: &str = "Settled";

/// Outcome of one reconciliation, handed back to the dispatcher. `error` is
/// never silently dropped: the caller logs it and schedules the retry at
/// `requeue_after`, which the engine has already charged against the
/// rate limiter.
#[derive(Debug, Default)]
pub struct ReconcileStatus {
    pub requeue: bool,
    pub requeue_after: Option<Duration>,
    pub error: Option<EngineError>,
}

impl ReconcileStatus {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    pub(crate) fn retry(error: EngineError, delay: Duration) -> Self {
        ReconcileStatus {
            requeue: false,
            requeue_after: Some(delay),
            error: Some(error),
        }
    }
}

/// Drives one document through the lifecycle state machine.
///
/// The engine owns `status.conditions` and `metadata.finalizers`; it never
/// inspects `spec.<version>` or `status.<version>`. Everything it needs is in
/// `metadata`, the `State` condition, and the handler's returned transition.
pub struct StateEngine {
    store: Arc<dyn DocumentStore>,
    handler: Arc<dyn StateHandler>,
    rate_limiter: Arc<RateLimiter<ObjectRef>>,
}

impl StateEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        handler: Arc<dyn StateHandler>,
        rate_limiter: Arc<RateLimiter<ObjectRef>>,
    ) -> Self {
        StateEngine {
            store,
            handler,
            rate_limiter,
        }
    }

    pub async fn reconcile(&self, ctx: &Context, doc: &mut Document) -> ReconcileStatus {
        let prev_conditions = match doc.conditions() {
            Ok(conditions) => conditions,
            Err(err) => return self.fail(ctx, err.into(), None),
        };
        let prev_state = dispatch_state(doc, state_of(&prev_conditions));
        info!(key = %ctx.request, state = %prev_state, "reconcile started");

        if let Err(err) = ensure_finalizers(self.store.as_ref(), doc, &[FINALIZER]).await {
            return self.fail(ctx, err.into(), None);
        }

        let (transition, handler_error) = self.dispatch(ctx, doc, prev_state).await;
        let next_state = transition.next_state.unwrap_or(ResourceState::Initial);
        let observed_generation = observed_generation(doc, &prev_conditions, next_state);

        // One rate-limiter charge per failed attempt; the same delay feeds
        // both the Ready message and the dispatcher's requeue.
        let retry_delay = handler_error
            .as_ref()
            .map(|_| self.rate_limiter.when(&ctx.request));

        let mut conditions = match doc.conditions() {
            Ok(conditions) => conditions,
            Err(err) => return self.fail(ctx, err.into(), retry_delay),
        };
        let mut state_condition = Condition::new(
            STATE_CONDITION,
            if handler_error.is_none() {
                ConditionStatus::True
            } else {
                ConditionStatus::False
            },
            next_state.as_str(),
            &transition.message,
        );
        state_condition.observed_generation = observed_generation;
        set_condition(&mut conditions, state_condition);

        info!(key = %ctx.request, next_state = %next_state, "reconcile finished");

        if next_state == ResourceState::Deleted {
            if let Err(err) = unset_finalizers(self.store.as_ref(), doc, &[FINALIZER]).await {
                return self.fail(ctx, err.into(), retry_delay);
            }
            if let Err(err) = doc.set_conditions(&conditions) {
                return self.fail(ctx, err.into(), retry_delay);
            }
            match self.patch_status(doc).await {
                Ok(()) => {}
                // The store removes the document once its last finalizer
                // drains; a vanished document is the expected end here.
                Err(err) if err.is_not_found() => {}
                Err(err) => return self.fail(ctx, err.into(), retry_delay),
            }
            return self.finish(transition, handler_error, retry_delay);
        }

        let mut ready = ready_condition(next_state);
        ready.observed_generation = observed_generation;
        match (&handler_error, retry_delay) {
            (Some(err), Some(delay)) => {
                ready.status = ConditionStatus::False;
                ready.reason = READY_REASON_ERROR.to_string();
                ready.message = format!(
                    "{} Next reconcile after {}.",
                    ensure_period(err.to_string()),
                    format_duration(delay)
                );
            }
            _ => {
                if transition.requeue || transition.requeue_after.is_some() {
                    let after = transition.requeue_after.unwrap_or(Duration::ZERO);
                    ready.message = format!(
                        "{} Next reconcile after {}.",
                        ready.message,
                        format_duration(after)
                    );
                }
            }
        }
        set_condition(&mut conditions, ready);

        if let Err(err) = doc.set_conditions(&conditions) {
            return self.fail(ctx, err.into(), retry_delay);
        }
        if let Err(err) = self.patch_status(doc).await {
            return self.fail(ctx, err.into(), retry_delay);
        }

        self.finish(transition, handler_error, retry_delay)
    }

    async fn dispatch(
        &self,
        ctx: &Context,
        doc: &mut Document,
        state: ResourceState,
    ) -> (Transition, Option<EngineError>) {
        let result = match state {
            ResourceState::Initial => self.handler.handle_initial(ctx, doc).await,
            ResourceState::ImportRequested => self.handler.handle_import_requested(ctx, doc).await,
            ResourceState::Imported => self.handler.handle_imported(ctx, doc).await,
            ResourceState::Creating => self.handler.handle_creating(ctx, doc).await,
            ResourceState::Created => self.handler.handle_created(ctx, doc).await,
            ResourceState::Updating => self.handler.handle_updating(ctx, doc).await,
            ResourceState::Updated => self.handler.handle_updated(ctx, doc).await,
            ResourceState::DeletionRequested => {
                self.handler.handle_deletion_requested(ctx, doc).await
            }
            ResourceState::Deleting => self.handler.handle_deleting(ctx, doc).await,
            // Terminal; never dispatched. An empty transition restarts the
            // machine if a stale condition ever routes here.
            ResourceState::Deleted => Ok(Transition::default()),
        };
        match result {
            Ok(transition) => (transition, None),
            Err(err) => (
                Transition {
                    next_state: Some(err.state),
                    ..Transition::default()
                },
                Some(err.source),
            ),
        }
    }

    fn finish(
        &self,
        transition: Transition,
        handler_error: Option<EngineError>,
        retry_delay: Option<Duration>,
    ) -> ReconcileStatus {
        match handler_error {
            Some(error) => {
                // retry_delay is always Some when handler_error is; the
                // fallback matches the limiter's first-failure delay.
                let delay = retry_delay.unwrap_or(crate::ratelimit::BASE_DELAY);
                ReconcileStatus::retry(error, delay)
            }
            None => ReconcileStatus {
                requeue: transition.requeue,
                requeue_after: transition.requeue_after,
                error: None,
            },
        }
    }

    /// `charged` carries a delay already taken from the rate limiter in this
    /// attempt; reusing it keeps the limiter at one charge per failed
    /// reconciliation even when persistence fails after a handler error.
    fn fail(
        &self,
        ctx: &Context,
        error: EngineError,
        charged: Option<Duration>,
    ) -> ReconcileStatus {
        let delay = charged.unwrap_or_else(|| self.rate_limiter.when(&ctx.request));
        warn!(key = %ctx.request, error = %error, "reconcile attempt failed");
        ReconcileStatus::retry(error, delay)
    }

    async fn patch_status(&self, doc: &Document) -> Result<(), StoreError> {
        let key = ObjectRef::from_document(doc);
        self.store.patch_status(&key, doc.as_value().clone()).await?;
        Ok(())
    }
}

/// The state to dispatch: the recorded `State` reason with two overrides.
/// An `Initial` document carrying an external adoption annotation is promoted
/// to `ImportRequested`; a deletion-stamped document is promoted to
/// `DeletionRequested` unless deletion is already progressing.
fn dispatch_state(doc: &Document, recorded: ResourceState) -> ResourceState {
    let mut state = recorded;
    if state == ResourceState::Initial
        && doc
            .annotations()
            .keys()
            .any(|key| key.starts_with(EXTERNAL_ANNOTATION_PREFIX))
    {
        state = ResourceState::ImportRequested;
    }
    if doc.deletion_timestamp().is_some() && state != ResourceState::Deleting {
        state = ResourceState::DeletionRequested;
    }
    state
}

/// While work toward the currently-observed generation is in flight the
/// observed generation stays pinned; a new generation is only accepted when
/// the machine is known to be starting on it.
fn observed_generation(
    doc: &Document,
    prev_conditions: &[Condition],
    next_state: ResourceState,
) -> i64 {
    let generation = doc.generation();
    let prev_condition = match find_condition(prev_conditions, STATE_CONDITION) {
        Some(condition) => condition,
        None => return generation,
    };

    use ResourceState::*;
    match (state_of(prev_conditions), next_state) {
        (Updating, Updating) | (Updating, Updated) => prev_condition.observed_generation,
        (Creating, Creating) | (Creating, Created) => prev_condition.observed_generation,
        (DeletionRequested, Deleting) => prev_condition.observed_generation,
        (Deleting, Deleting) | (Deleting, Deleted) => prev_condition.observed_generation,
        _ => generation,
    }
}

fn ready_condition(next_state: ResourceState) -> Condition {
    use ResourceState::*;
    let (status, reason, message) = match next_state {
        Initial => (
            ConditionStatus::False,
            READY_REASON_PENDING,
            "Resource is in initial state.".to_string(),
        ),
        ImportRequested => (
            ConditionStatus::False,
            READY_REASON_PENDING,
            "Resource is being imported.".to_string(),
        ),
        Creating | Updating | Deleting | DeletionRequested => (
            ConditionStatus::False,
            READY_REASON_PENDING,
            "Resource is pending.".to_string(),
        ),
        Created | Updated => (
            ConditionStatus::True,
            READY_REASON_SETTLED,
            "Resource is settled.".to_string(),
        ),
        Imported => (
            ConditionStatus::True,
            READY_REASON_SETTLED,
            "Resource is imported.".to_string(),
        ),
        // Deleted short-circuits before Ready synthesis; anything landing
        // here is a programming error in the handler table.
        Deleted => (
            ConditionStatus::False,
            READY_REASON_ERROR,
            format!("unknown state: {next_state}"),
        ),
    };
    Condition::new(READY_CONDITION, status, reason, &message)
}

fn ensure_period(mut message: String) -> String {
    if !message.ends_with('.') {
        message.push('.');
    }
    message
}

fn format_duration(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{duration:?}")
    }
}
