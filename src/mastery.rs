use serde::{Deserialize, Serialize};

/// Mastery proposal lifecycle. Explicit tagged status; archival is a
/// separate nullable timestamp and never encodes workflow state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Draft,
    Submitted,
    Approved,
    ChangesRequested,
}

impl ProposalStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "submitted" => Some(Self::Submitted),
            "approved" => Some(Self::Approved),
            "changes_requested" => Some(Self::ChangesRequested),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::Approved => "approved",
            Self::ChangesRequested => "changes_requested",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Submit,
    Approve,
    RequestChanges,
}

/// Returns the next status, or None when the transition is illegal from
/// the current status. Approved is terminal.
pub fn apply_transition(current: ProposalStatus, t: Transition) -> Option<ProposalStatus> {
    match (current, t) {
        (ProposalStatus::Draft, Transition::Submit) => Some(ProposalStatus::Submitted),
        (ProposalStatus::ChangesRequested, Transition::Submit) => Some(ProposalStatus::Submitted),
        (ProposalStatus::Submitted, Transition::Approve) => Some(ProposalStatus::Approved),
        (ProposalStatus::Submitted, Transition::RequestChanges) => {
            Some(ProposalStatus::ChangesRequested)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_draft_to_approved() {
        let s = apply_transition(ProposalStatus::Draft, Transition::Submit).unwrap();
        assert_eq!(s, ProposalStatus::Submitted);
        let s = apply_transition(s, Transition::Approve).unwrap();
        assert_eq!(s, ProposalStatus::Approved);
    }

    #[test]
    fn changes_requested_can_be_resubmitted() {
        let s = apply_transition(ProposalStatus::Submitted, Transition::RequestChanges).unwrap();
        assert_eq!(s, ProposalStatus::ChangesRequested);
        let s = apply_transition(s, Transition::Submit).unwrap();
        assert_eq!(s, ProposalStatus::Submitted);
    }

    #[test]
    fn approved_is_terminal() {
        assert!(apply_transition(ProposalStatus::Approved, Transition::Submit).is_none());
        assert!(apply_transition(ProposalStatus::Approved, Transition::Approve).is_none());
        assert!(apply_transition(ProposalStatus::Approved, Transition::RequestChanges).is_none());
    }

    #[test]
    fn draft_cannot_skip_to_approval() {
        assert!(apply_transition(ProposalStatus::Draft, Transition::Approve).is_none());
        assert!(apply_transition(ProposalStatus::Draft, Transition::RequestChanges).is_none());
    }
}
