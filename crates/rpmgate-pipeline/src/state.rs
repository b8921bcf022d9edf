use serde::{Deserialize, Serialize};

/// Where one (request, architecture) branch stands.
///
/// ```text
/// Queued -> Building -> Validating -> Publishing -> Archived
///                                          |
///                                          v
///                                      RolledBack
/// ```
/// Every non-terminal state may also move to `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchState {
    Queued,
    Building,
    Validating,
    Publishing,
    Archived,
    Aborted,
    RolledBack,
}

impl BranchState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BranchState::Archived | BranchState::Aborted | BranchState::RolledBack
        )
    }

    pub fn can_transition_to(self, next: BranchState) -> bool {
        use BranchState::*;
        match (self, next) {
            (Archived | Aborted | RolledBack, _) => false,
            (_, Aborted) => true,
            (Queued, Building)
            | (Building, Validating)
            | (Validating, Publishing)
            | (Publishing, Archived)
            | (Publishing, RolledBack) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BranchState::Queued => "queued",
            BranchState::Building => "building",
            BranchState::Validating => "validating",
            BranchState::Publishing => "publishing",
            BranchState::Archived => "archived",
            BranchState::Aborted => "aborted",
            BranchState::RolledBack => "rolled_back",
        }
    }
}

impl std::fmt::Display for BranchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
