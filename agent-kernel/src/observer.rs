//! Observability hooks attached to the pipeline.

use std::sync::Arc;

use agent_policy::{DecisionKind, PolicyDecision, PolicyInput};
use tracing::{debug, info, warn};

use crate::state_machine::{KernelState, StateListener, TransitionResult};

/// Observer invoked whenever a policy decision is produced.
pub trait PolicyObserver: Send + Sync {
    /// Records the decision emitted for the supplied input.
    fn on_decision(&self, input: &PolicyInput, decision: &PolicyDecision);
}

/// Observer that emits decisions to the tracing system.
#[derive(Debug, Default)]
pub struct TracingPolicyObserver;

impl PolicyObserver for TracingPolicyObserver {
    fn on_decision(&self, input: &PolicyInput, decision: &PolicyDecision) {
        let call = input.call();
        let reason = decision.reason().unwrap_or_default();
        let policy_id = decision.policy_id().unwrap_or_default();
        match decision.kind() {
            DecisionKind::Allow => {
                debug!(call_id = %call.id(), tool = call.tool(), policy_id, "policy allow");
            }
            DecisionKind::Deny => {
                warn!(
                    call_id = %call.id(),
                    tool = call.tool(),
                    policy_id,
                    reason,
                    "policy deny"
                );
            }
            DecisionKind::RequireApproval => {
                info!(
                    call_id = %call.id(),
                    tool = call.tool(),
                    policy_id,
                    reason,
                    approvers = ?decision.required_approvals(),
                    "policy requires approval"
                );
            }
        }
    }
}

/// Composite observer that forwards decisions to a collection of observers.
#[derive(Default)]
pub struct CompositePolicyObserver {
    observers: Vec<Arc<dyn PolicyObserver>>,
}

impl CompositePolicyObserver {
    /// Creates a new composite observer from the supplied list.
    #[must_use]
    pub fn new<I>(observers: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn PolicyObserver>>,
    {
        Self {
            observers: observers.into_iter().collect(),
        }
    }

    /// Adds an observer to the composite set.
    pub fn push(&mut self, observer: Arc<dyn PolicyObserver>) {
        self.observers.push(observer);
    }
}

impl PolicyObserver for CompositePolicyObserver {
    fn on_decision(&self, input: &PolicyInput, decision: &PolicyDecision) {
        for observer in &self.observers {
            observer.on_decision(input, decision);
        }
    }
}

/// State listener that logs every accepted transition.
#[derive(Debug, Default)]
pub struct TracingStateListener;

impl StateListener for TracingStateListener {
    fn on_transition(&self, transition: &TransitionResult) {
        if transition.to == KernelState::SafeMode {
            warn!(
                trigger = %transition.trigger,
                from = %transition.from,
                "kernel entered safe mode"
            );
        } else {
            debug!(
                trigger = %transition.trigger,
                from = %transition.from,
                to = %transition.to,
                "kernel transition"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use agent_primitives::ProposedToolCall;

    #[derive(Default)]
    struct Recording(Mutex<Vec<DecisionKind>>);

    impl PolicyObserver for Recording {
        fn on_decision(&self, _input: &PolicyInput, decision: &PolicyDecision) {
            self.0.lock().unwrap().push(decision.kind());
        }
    }

    #[test]
    fn composite_forwards_to_every_observer() {
        let first = Arc::new(Recording::default());
        let second = Arc::new(Recording::default());
        let mut composite = CompositePolicyObserver::new([
            Arc::clone(&first) as Arc<dyn PolicyObserver>,
            Arc::new(TracingPolicyObserver),
        ]);
        composite.push(Arc::clone(&second) as Arc<dyn PolicyObserver>);

        let call = ProposedToolCall::builder("fs.write").build().unwrap();
        let input = PolicyInput::from_call(&call);
        composite.on_decision(&input, &PolicyDecision::deny("nope"));

        assert_eq!(*first.0.lock().unwrap(), [DecisionKind::Deny]);
        assert_eq!(*second.0.lock().unwrap(), [DecisionKind::Deny]);
    }
}
