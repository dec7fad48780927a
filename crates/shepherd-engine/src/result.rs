use std::time::Duration;

use thiserror::Error;

use crate::error::EngineError;
use crate::state::ResourceState;

/// How long in-flight states wait before polling the external system again.
pub const POLL_INTERVAL: Duration = Duration::from_secs(15);

/// What a state handler decided: where the machine goes next, the message
/// recorded in the `State` condition, and whether the dispatcher should wake
/// this document up again without waiting for a store event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transition {
    /// `None` is coerced to `Initial` by the engine, restarting the machine
    /// on malformed handler output.
    pub next_state: Option<ResourceState>,
    pub message: String,
    pub requeue: bool,
    pub requeue_after: Option<Duration>,
}

/// A handler failure pinned to the lifecycle state the engine should record.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct StateError {
    pub state: ResourceState,
    #[source]
    pub source: EngineError,
}

pub type HandlerResult = Result<Transition, StateError>;

/// Successful transition into `state`. In-flight states are stamped with the
/// shared poll interval so the dispatcher keeps watching the external system.
pub fn next_state(state: ResourceState, msg: &str) -> HandlerResult {
    let mut message = msg.to_string();
    if !message.ends_with('.') {
        message.push('.');
    }

    let requeue_after = match state {
        ResourceState::Creating
        | ResourceState::Updating
        | ResourceState::Deleting
        | ResourceState::DeletionRequested => Some(POLL_INTERVAL),
        _ => None,
    };

    Ok(Transition {
        next_state: Some(state),
        message,
        requeue: false,
        requeue_after,
    })
}

/// Failed attempt: the machine stays in `state` and the error surfaces in the
/// `Ready` condition.
pub fn error(state: ResourceState, err: impl Into<EngineError>) -> HandlerResult {
    Err(StateError {
        state,
        source: err.into(),
    })
}

/// Pins errors from fallible helpers to the state the machine should record,
/// so handlers can use `?` throughout.
pub trait InState<T> {
    fn in_state(self, state: ResourceState) -> Result<T, StateError>;
}

impl<T, E: Into<EngineError>> InState<T> for Result<T, E> {
    fn in_state(self, state: ResourceState) -> Result<T, StateError> {
        self.map_err(|err| StateError {
            state,
            source: err.into(),
        })
    }
}
