pub mod context;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod finalizer;
pub mod handler;
pub mod manager;
pub mod ratelimit;
pub mod result;
pub mod state;

pub use context::Context;
pub use dispatch::{env_client_factory, ClientFactory, Dispatcher};
pub use engine::{
    ReconcileStatus, StateEngine, READY_REASON_ERROR, READY_REASON_PENDING, READY_REASON_SETTLED,
};
pub use error::EngineError;
pub use handler::StateHandler;
pub use manager::Manager;
pub use ratelimit::RateLimiter;
pub use result::{error, next_state, HandlerResult, InState, StateError, Transition, POLL_INTERVAL};
pub use state::ResourceState;

/// The one finalizer this controller owns on every managed document.
pub const FINALIZER: &str = "shepherd.io/finalizer";

/// Any annotation under this prefix marks a document as adopting an
/// out-of-band resource; its presence promotes `Initial` to `ImportRequested`.
pub const EXTERNAL_ANNOTATION_PREFIX: &str = "shepherd.io/external-";

pub const ANNOTATION_EXTERNAL_NAME: &str = "shepherd.io/external-name";
pub const ANNOTATION_EXTERNAL_GROUP_ID: &str = "shepherd.io/external-group-id";
pub const ANNOTATION_EXTERNAL_ID: &str = "shepherd.io/external-id";
