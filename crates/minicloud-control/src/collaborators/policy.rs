//! Admission policy gate.
//!
//! Consulted once before a provision request is accepted. How decisions are
//! reached (IAM statements, quotas held elsewhere) is up to the gate.

use minicloud_store::InstanceSpec;

/// Action name evaluated for provision requests.
pub const CREATE_INSTANCE_ACTION: &str = "compute:CreateInstance";

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// The request may proceed.
    Allow,
    /// The request is refused, with the reason shown to the caller.
    Deny(String),
}

impl PolicyDecision {
    /// Whether the decision allows the request.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Decides whether `action` on `spec` is permitted.
pub trait PolicyGate: Send + Sync {
    /// Evaluate the request.
    fn evaluate(&self, action: &str, spec: &InstanceSpec) -> PolicyDecision;
}

/// Gate that allows everything.
#[derive(Debug, Clone, Default)]
pub struct AllowAllPolicy;

impl PolicyGate for AllowAllPolicy {
    fn evaluate(&self, _action: &str, _spec: &InstanceSpec) -> PolicyDecision {
        PolicyDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_all() {
        let decision = AllowAllPolicy.evaluate(CREATE_INSTANCE_ACTION, &InstanceSpec::default());
        assert!(decision.is_allowed());
        assert!(!PolicyDecision::Deny("no".into()).is_allowed());
    }
}
