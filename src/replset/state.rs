use serde::{Deserialize, Serialize};

/// Replica-set member states (spec.md §4.5). Transitions are validated by
/// [`MemberState::can_transition_to`] rather than left to callers to get
/// right by convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    Startup,
    Startup2,
    Secondary,
    Primary,
    Recovering,
    Rollback,
    Arbiter,
    Down,
    Shunned,
    Fatal,
}

impl MemberState {
    pub fn can_transition_to(self, to: MemberState) -> bool {
        use MemberState::*;
        match (self, to) {
            (_, Fatal) => true,
            (Startup, Startup2) => true,
            (Startup2, Secondary) | (Startup2, Arbiter) | (Startup2, Recovering) => true,
            (Secondary, Primary)
            | (Secondary, Recovering)
            | (Secondary, Rollback)
            | (Secondary, Down)
            | (Secondary, Shunned) => true,
            (Primary, Secondary) | (Primary, Recovering) => true,
            (Recovering, Secondary) | (Recovering, Rollback) | (Recovering, Down) => true,
            (Rollback, Recovering) => true,
            (Down, Recovering) | (Down, Shunned) => true,
            (Arbiter, Down) => true,
            _ => false,
        }
    }

    /// Whether this node may be elected while in this state — only a
    /// fully-caught-up secondary is a candidate (spec.md §4.6).
    pub fn is_election_eligible(self) -> bool {
        matches!(self, MemberState::Secondary)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MemberState::Fatal | MemberState::Shunned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_sequence_is_linear() {
        assert!(MemberState::Startup.can_transition_to(MemberState::Startup2));
        assert!(MemberState::Startup2.can_transition_to(MemberState::Secondary));
        assert!(!MemberState::Startup.can_transition_to(MemberState::Primary));
    }

    #[test]
    fn any_state_can_go_fatal() {
        assert!(MemberState::Primary.can_transition_to(MemberState::Fatal));
        assert!(MemberState::Rollback.can_transition_to(MemberState::Fatal));
    }

    #[test]
    fn terminal_states_reject_further_work() {
        assert!(MemberState::Shunned.is_terminal());
        assert!(!MemberState::Secondary.is_terminal());
    }
}
