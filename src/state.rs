use std::fmt;
use tracing::debug;
use uuid::Uuid;

/// Lifecycle of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Built,
    Validating,
    Spawning,
    Running,
    Collecting,
    Completed,
    Failed,
    TimedOut,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::TimedOut
        )
    }

    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Built, Validating)
                | (Validating, Spawning)
                | (Validating, Failed)
                | (Spawning, Running)
                | (Spawning, Failed)
                | (Running, Collecting)
                | (Running, TimedOut)
                | (Collecting, Completed)
                | (Collecting, Failed)
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: ExecutionState,
    pub to: ExecutionState,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal transition {} -> {}", self.from, self.to)
    }
}

/// Tracks one request through [`ExecutionState`], refusing illegal moves.
#[derive(Debug)]
pub struct ExecutionTracker {
    request_id: Uuid,
    state: ExecutionState,
}

impl ExecutionTracker {
    pub fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            state: ExecutionState::Built,
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn advance(&mut self, next: ExecutionState) -> Result<(), IllegalTransition> {
        if !self.state.can_transition_to(next) {
            return Err(IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(
            "[SANDBOX] {} state {} -> {}",
            self.request_id, self.state, next
        );
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionState::*;

    #[test]
    fn test_happy_path() {
        let mut tracker = ExecutionTracker::new(Uuid::nil());
        for next in [Validating, Spawning, Running, Collecting, Completed] {
            tracker.advance(next).unwrap();
        }
        assert!(tracker.state().is_terminal());
    }

    #[test]
    fn test_illegal_transitions_refused() {
        let mut tracker = ExecutionTracker::new(Uuid::nil());
        assert_eq!(
            tracker.advance(Running),
            Err(IllegalTransition {
                from: Built,
                to: Running
            })
        );
        assert_eq!(tracker.state(), Built);

        tracker.advance(Validating).unwrap();
        tracker.advance(Failed).unwrap();
        assert!(tracker.advance(Spawning).is_err());
        assert!(!Collecting.can_transition_to(TimedOut));
        assert!(!Completed.can_transition_to(Failed));
    }
}
