use serde::{Deserialize, Serialize};

use super::error::{SessionError, SessionResult};

/// Lifecycle of a VM session.
///
/// ```text
/// Created -> Booting -> Ready <-> Executing
///                         |
///                         v
///                   ShuttingDown -> Stopped
/// ```
/// Every non-terminal state may also move to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Booting,
    Ready,
    Executing,
    ShuttingDown,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Stopped | Failed, _) => false,
            (_, Failed) => true,
            (Created, Booting)
            | (Booting, Ready)
            | (Ready, Executing)
            | (Executing, Ready)
            | (Ready, ShuttingDown)
            | (ShuttingDown, Stopped) => true,
            _ => false,
        }
    }

    /// Move to `next`, rejecting transitions outside the table.
    pub fn advance(&mut self, next: SessionState) -> SessionResult<()> {
        if !self.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Booting => "booting",
            SessionState::Ready => "ready",
            SessionState::Executing => "executing",
            SessionState::ShuttingDown => "shutting_down",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState::*;
    use super::*;

    #[test]
    fn happy_path() {
        let mut s = Created;
        for next in [Booting, Ready, Executing, Ready, ShuttingDown, Stopped] {
            s.advance(next).unwrap();
        }
        assert!(s.is_terminal());
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [Stopped, Failed] {
            for next in [Created, Booting, Ready, Executing, ShuttingDown, Stopped, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn cannot_skip_boot() {
        let mut s = Created;
        assert!(matches!(
            s.advance(Ready),
            Err(SessionError::InvalidTransition { from: Created, to: Ready })
        ));
        assert_eq!(s, Created);
    }

    #[test]
    fn any_live_state_can_fail() {
        for live in [Created, Booting, Ready, Executing, ShuttingDown] {
            assert!(live.can_transition_to(Failed));
        }
    }
}
