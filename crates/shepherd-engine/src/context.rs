use shepherd_cloud::ClientSet;
use shepherd_store::ObjectRef;

/// Request-scoped state threaded through every handler call.
///
/// Handlers pull the external-API client set from here instead of being
/// injected at construction, which keeps handler signatures uniform across
/// kinds.
#[derive(Clone)]
pub struct Context {
    pub request: ObjectRef,
    pub clients: ClientSet,
}

impl Context {
    pub fn new(request: ObjectRef, clients: ClientSet) -> Self {
        Context { request, clients }
    }
}
