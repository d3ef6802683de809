/// Lifecycle of one orchestration call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchState {
    #[default]
    Idle,
    Validating,
    Dispatching,
    Parsing,
    Publishing,
    Completed,
    /// Systemic failure: validation rejected or engine unreachable.
    Failed,
}

impl BatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchState::Completed | BatchState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEvent {
    Started,
    Validated,
    Rejected,
    EngineUnreachable,
    Dispatched,
    /// Output parsed; `publish` says whether a publish step follows.
    Parsed { publish: bool },
    Published,
}

/// Pure transition function. Events that do not apply to the current state
/// leave it unchanged; terminal states absorb everything.
pub fn advance(state: BatchState, event: BatchEvent) -> BatchState {
    match (state, event) {
        (BatchState::Idle, BatchEvent::Started) => BatchState::Validating,
        (BatchState::Validating, BatchEvent::Validated) => BatchState::Dispatching,
        (BatchState::Validating, BatchEvent::Rejected) => BatchState::Failed,
        (BatchState::Dispatching, BatchEvent::Dispatched) => BatchState::Parsing,
        (BatchState::Dispatching, BatchEvent::EngineUnreachable) => BatchState::Failed,
        (BatchState::Parsing, BatchEvent::Parsed { publish: true }) => BatchState::Publishing,
        (BatchState::Parsing, BatchEvent::Parsed { publish: false }) => BatchState::Completed,
        (BatchState::Publishing, BatchEvent::Published) => BatchState::Completed,
        (state, _) => state,
    }
}
