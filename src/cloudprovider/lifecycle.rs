use std::fmt;

use thiserror::Error;

use crate::apis::node_claim::{
    CONDITION_LAUNCHED, CONDITION_READY, NodeClaim, STATUS_FALSE, STATUS_TRUE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Ready,
    Failed,
}

/// Where a NodeClaim is in its provisioning lifecycle.
///
/// ```text
/// Unresolved ─▶ Resolving ─┬─▶ Feasible ──▶ Delegated ──▶ Observed(Ready | Failed)
///                          └─▶ Infeasible ─▶ (retry) Resolving
/// any ─▶ Deleted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    Unresolved,
    Resolving,
    Feasible,
    Infeasible,
    Delegated,
    Observed(Observation),
    Deleted,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid NodeClaim transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: ClaimState,
    pub to: ClaimState,
}

impl ClaimState {
    pub fn can_transition_to(&self, next: ClaimState) -> bool {
        use ClaimState::*;
        matches!(
            (self, next),
            (Unresolved, Resolving)
                | (Resolving, Feasible)
                | (Resolving, Infeasible)
                | (Infeasible, Resolving)
                | (Feasible, Delegated)
                // The delegate may still report the offering as gone.
                | (Feasible, Infeasible)
                | (Delegated, Observed(_))
                | (Observed(_), Observed(_))
        ) || (*self != Deleted && next == Deleted)
    }

    pub fn transition(self, next: ClaimState) -> Result<ClaimState, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Derive the durable state recorded on a NodeClaim's status.
    /// `Resolving` and `Feasible` only exist inside a single create call.
    pub fn of(node_claim: &NodeClaim) -> ClaimState {
        let Some(status) = node_claim.status.as_ref() else {
            return ClaimState::Unresolved;
        };
        match status.condition(CONDITION_LAUNCHED).map(|c| c.status.as_str()) {
            Some(STATUS_TRUE) => {}
            Some(STATUS_FALSE) => return ClaimState::Infeasible,
            _ => return ClaimState::Unresolved,
        }
        match status.condition(CONDITION_READY).map(|c| c.status.as_str()) {
            Some(STATUS_TRUE) => ClaimState::Observed(Observation::Ready),
            Some(STATUS_FALSE) => ClaimState::Observed(Observation::Failed),
            _ => ClaimState::Delegated,
        }
    }
}

impl fmt::Display for ClaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unresolved => write!(f, "Unresolved"),
            Self::Resolving => write!(f, "Resolving"),
            Self::Feasible => write!(f, "Feasible"),
            Self::Infeasible => write!(f, "Infeasible"),
            Self::Delegated => write!(f, "Delegated"),
            Self::Observed(Observation::Ready) => write!(f, "Observed(Ready)"),
            Self::Observed(Observation::Failed) => write!(f, "Observed(Failed)"),
            Self::Deleted => write!(f, "Deleted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::apis::node_claim::{NodeClaimSpec, NodeClaimStatus, STATUS_UNKNOWN};

    fn claim_with(conditions: &[(&str, &str)]) -> NodeClaim {
        let mut claim = NodeClaim::new("nc", NodeClaimSpec::default());
        let mut status = NodeClaimStatus::default();
        for (type_, value) in conditions {
            status.set_condition(type_, value, None, None);
        }
        claim.status = Some(status);
        claim
    }

    #[test]
    fn happy_path_is_valid() {
        let state = ClaimState::Unresolved
            .transition(ClaimState::Resolving)
            .and_then(|s| s.transition(ClaimState::Feasible))
            .and_then(|s| s.transition(ClaimState::Delegated))
            .and_then(|s| s.transition(ClaimState::Observed(Observation::Ready)))
            .and_then(|s| s.transition(ClaimState::Deleted))
            .unwrap();
        assert_eq!(state, ClaimState::Deleted);
    }

    #[test]
    fn infeasible_can_retry() {
        let state = ClaimState::Resolving
            .transition(ClaimState::Infeasible)
            .and_then(|s| s.transition(ClaimState::Resolving))
            .unwrap();
        assert_eq!(state, ClaimState::Resolving);
    }

    #[test]
    fn skipping_resolution_is_rejected() {
        let err = ClaimState::Unresolved
            .transition(ClaimState::Delegated)
            .unwrap_err();
        assert_eq!(err.from, ClaimState::Unresolved);
        assert_eq!(err.to, ClaimState::Delegated);
        assert!(!ClaimState::Infeasible.can_transition_to(ClaimState::Delegated));
        assert!(!ClaimState::Delegated.can_transition_to(ClaimState::Resolving));
    }

    #[test]
    fn deleted_is_terminal() {
        assert!(!ClaimState::Deleted.can_transition_to(ClaimState::Deleted));
        assert!(!ClaimState::Deleted.can_transition_to(ClaimState::Resolving));
        assert!(ClaimState::Infeasible.can_transition_to(ClaimState::Deleted));
    }

    #[test]
    fn state_is_derived_from_conditions() {
        assert_eq!(
            ClaimState::of(&NodeClaim::new("nc", NodeClaimSpec::default())),
            ClaimState::Unresolved
        );
        assert_eq!(
            ClaimState::of(&claim_with(&[(CONDITION_LAUNCHED, STATUS_FALSE)])),
            ClaimState::Infeasible
        );
        assert_eq!(
            ClaimState::of(&claim_with(&[
                (CONDITION_LAUNCHED, STATUS_TRUE),
                (CONDITION_READY, STATUS_UNKNOWN)
            ])),
            ClaimState::Delegated
        );
        assert_eq!(
            ClaimState::of(&claim_with(&[
                (CONDITION_LAUNCHED, STATUS_TRUE),
                (CONDITION_READY, STATUS_TRUE)
            ])),
            ClaimState::Observed(Observation::Ready)
        );
        assert_eq!(
            ClaimState::of(&claim_with(&[
                (CONDITION_LAUNCHED, STATUS_TRUE),
                (CONDITION_READY, STATUS_FALSE)
            ])),
            ClaimState::Observed(Observation::Failed)
        );
    }

    #[test]
    fn display_names_states() {
        assert_eq!(
            ClaimState::Observed(Observation::Failed).to_string(),
            "Observed(Failed)"
        );
    }
}
