//! Stage state management

/// Stage worker state machine
///
/// `Idle → Running → Draining → Idle`. A stage that fails fatally goes
/// straight from `Running` back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageState {
    /// Not scheduled; the stage may be started
    #[default]
    Idle,

    /// The work loop is scheduled and pulling from its queue
    Running,

    /// `stop()` was requested; queued items are still being consumed
    Draining,
}

impl StageState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &StageState) -> bool {
        use StageState::*;

        match (self, target) {
            (Idle, Running) => true,
            (Running, Draining) => true,
            // fatal error, or a stop on a non-draining stage
            (Running, Idle) => true,
            (Draining, Idle) => true,

            (a, b) if a == b => true,

            _ => false,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            StageState::Idle => "Idle",
            StageState::Running => "Running",
            StageState::Draining => "Draining",
        }
    }

    /// Scheduled, whether running or draining
    pub fn is_active(&self) -> bool {
        !matches!(self, StageState::Idle)
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Externally visible state of a publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublisherState {
    #[default]
    Idle,
    Publishing,
    Draining,
    /// Trailer written; no further packets are accepted
    Stopped,
}

impl PublisherState {
    pub fn can_transition_to(&self, target: &PublisherState) -> bool {
        use PublisherState::*;

        match (self, target) {
            (Idle, Publishing) => true,
            // stop before start still finalizes the sink
            (Idle, Stopped) => true,
            (Publishing, Draining) => true,
            // write failure
            (Publishing, Stopped) => true,
            (Draining, Stopped) => true,
            (Stopped, _) => false,
            (a, b) if a == b => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for PublisherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PublisherState::Idle => "Idle",
            PublisherState::Publishing => "Publishing",
            PublisherState::Draining => "Draining",
            PublisherState::Stopped => "Stopped",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        let idle = StageState::Idle;
        let running = StageState::Running;
        let draining = StageState::Draining;

        assert!(idle.can_transition_to(&running));
        assert!(running.can_transition_to(&draining));
        assert!(draining.can_transition_to(&idle));
        assert!(running.can_transition_to(&idle));

        assert!(idle.can_transition_to(&idle));
        assert!(running.can_transition_to(&running));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!StageState::Idle.can_transition_to(&StageState::Draining));
        assert!(!StageState::Draining.can_transition_to(&StageState::Running));
    }

    #[test]
    fn test_publisher_transitions() {
        use PublisherState::*;
        assert!(Idle.can_transition_to(&Publishing));
        assert!(Publishing.can_transition_to(&Draining));
        assert!(Draining.can_transition_to(&Stopped));
        assert!(Idle.can_transition_to(&Stopped));
        assert!(!Stopped.can_transition_to(&Publishing));
        assert!(!Stopped.can_transition_to(&Stopped));
        assert!(!Draining.can_transition_to(&Publishing));
    }

    #[test]
    fn test_state_checks() {
        assert!(!StageState::Idle.is_active());
        assert!(StageState::Running.is_active());
        assert!(StageState::Draining.is_active());
        assert_eq!(StageState::Draining.to_string(), "Draining");
    }
}
