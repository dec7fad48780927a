use shepherd_document::{find_condition, Condition, STATE_CONDITION};

/// Lifecycle states a document moves through.
///
/// `Deleted` is terminal: the engine unsets its finalizer and never
/// dispatches a handler for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Initial,
    ImportRequested,
    Imported,
    Creating,
    Created,
    Updating,
    Updated,
    DeletionRequested,
    Deleting,
    Deleted,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Initial => "Initial",
            ResourceState::ImportRequested => "ImportRequested",
            ResourceState::Imported => "Imported",
            ResourceState::Creating => "Creating",
            ResourceState::Created => "Created",
            ResourceState::Updating => "Updating",
            ResourceState::Updated => "Updated",
            ResourceState::DeletionRequested => "DeletionRequested",
            ResourceState::Deleting => "Deleting",
            ResourceState::Deleted => "Deleted",
        }
    }

    pub fn parse(raw: &str) -> Option<ResourceState> {
        match raw {
            "Initial" => Some(ResourceState::Initial),
            "ImportRequested" => Some(ResourceState::ImportRequested),
            "Imported" => Some(ResourceState::Imported),
            "Creating" => Some(ResourceState::Creating),
            "Created" => Some(ResourceState::Created),
            "Updating" => Some(ResourceState::Updating),
            "Updated" => Some(ResourceState::Updated),
            "DeletionRequested" => Some(ResourceState::DeletionRequested),
            "Deleting" => Some(ResourceState::Deleting),
            "Deleted" => Some(ResourceState::Deleted),
            _ => None,
        }
    }

    /// Converged with no in-flight work.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ResourceState::Imported | ResourceState::Created | ResourceState::Updated
        )
    }
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The state recorded in the `State` condition's reason, defaulting to
/// `Initial` when the condition is absent or carries an unknown reason.
pub fn state_of(conditions: &[Condition]) -> ResourceState {
    find_condition(conditions, STATE_CONDITION)
        .and_then(|c| ResourceState::parse(&c.reason))
        .unwrap_or(ResourceState::Initial)
}
