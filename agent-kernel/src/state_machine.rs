//! Deterministic state machine governing one call's lifecycle.
//!
//! Legality lives in [`TRANSITIONS`] only. A lookup tries the exact
//! `(trigger, state)` row first and falls back to the wildcard row for the
//! trigger. Instances are single-call scoped and must not be shared between
//! concurrently executing calls.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::pipeline::panic_message;

/// Lifecycle states of a single governed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelState {
    /// No call in flight.
    Idle,
    /// Call validated; policy is being evaluated.
    Validating,
    /// Parked in the approval gate.
    AwaitingApproval,
    /// Action handler is running.
    Executing,
    /// Postconditions are being checked.
    Verifying,
    /// Kernel-wide halt; only `recover` leaves it.
    SafeMode,
    /// Failed call; only `recover` leaves it.
    Error,
}

impl KernelState {
    /// Every state, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Idle,
        Self::Validating,
        Self::AwaitingApproval,
        Self::Executing,
        Self::Verifying,
        Self::SafeMode,
        Self::Error,
    ];

    /// Returns the stable snake_case label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Executing => "executing",
            Self::Verifying => "verifying",
            Self::SafeMode => "safe_mode",
            Self::Error => "error",
        }
    }

    /// Returns `true` for states that require an explicit `recover`.
    #[must_use]
    pub const fn is_halted(self) -> bool {
        matches!(self, Self::SafeMode | Self::Error)
    }
}

impl fmt::Display for KernelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Call passed validation.
    ToolValidated,
    /// Policy allowed the call without approval.
    PolicyAllowed,
    /// Policy denied the call.
    PolicyDenied,
    /// Policy requires a human decision.
    ApprovalRequired,
    /// Approver granted the call.
    ApprovalGranted,
    /// Approver denied the call.
    ApprovalDenied,
    /// Approval deadline passed.
    ApprovalExpired,
    /// Action handler returned.
    ExecutionComplete,
    /// Postconditions held.
    VerificationPassed,
    /// A critical postcondition failed.
    VerificationFailed,
    /// Unexpected failure anywhere in the pipeline.
    FatalError,
    /// Force the kernel into safe mode.
    EscalateSafeMode,
    /// Leave `Error` or `SafeMode`.
    Recover,
    /// Synthetic trigger reported by [`KernelStateMachine::reset`]; it has no table row.
    Reset,
}

impl Trigger {
    /// Every trigger, in declaration order.
    pub const ALL: [Self; 14] = [
        Self::ToolValidated,
        Self::PolicyAllowed,
        Self::PolicyDenied,
        Self::ApprovalRequired,
        Self::ApprovalGranted,
        Self::ApprovalDenied,
        Self::ApprovalExpired,
        Self::ExecutionComplete,
        Self::VerificationPassed,
        Self::VerificationFailed,
        Self::FatalError,
        Self::EscalateSafeMode,
        Self::Recover,
        Self::Reset,
    ];

    /// Returns the stable snake_case label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ToolValidated => "tool_validated",
            Self::PolicyAllowed => "policy_allowed",
            Self::PolicyDenied => "policy_denied",
            Self::ApprovalRequired => "approval_required",
            Self::ApprovalGranted => "approval_granted",
            Self::ApprovalDenied => "approval_denied",
            Self::ApprovalExpired => "approval_expired",
            Self::ExecutionComplete => "execution_complete",
            Self::VerificationPassed => "verification_passed",
            Self::VerificationFailed => "verification_failed",
            Self::FatalError => "fatal_error",
            Self::EscalateSafeMode => "escalate_safe_mode",
            Self::Recover => "recover",
            Self::Reset => "reset",
        }
    }

    const fn counts_as_error(self) -> bool {
        matches!(self, Self::FatalError | Self::VerificationFailed)
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source side of a transition row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateMatch {
    /// Matches every state.
    Any,
    /// Matches one state.
    Exact(KernelState),
}

/// One row of the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    /// Trigger the row reacts to.
    pub trigger: Trigger,
    /// State the row applies in.
    pub from: StateMatch,
    /// Resulting state.
    pub to: KernelState,
}

const fn row(trigger: Trigger, from: KernelState, to: KernelState) -> StateTransition {
    StateTransition {
        trigger,
        from: StateMatch::Exact(from),
        to,
    }
}

const fn any(trigger: Trigger, to: KernelState) -> StateTransition {
    StateTransition {
        trigger,
        from: StateMatch::Any,
        to,
    }
}

/// The transition table.
pub static TRANSITIONS: &[StateTransition] = &[
    row(Trigger::ToolValidated, KernelState::Idle, KernelState::Validating),
    row(Trigger::ToolValidated, KernelState::Validating, KernelState::Validating),
    row(Trigger::PolicyAllowed, KernelState::Validating, KernelState::Executing),
    row(Trigger::PolicyDenied, KernelState::Validating, KernelState::Idle),
    row(Trigger::ApprovalRequired, KernelState::Validating, KernelState::AwaitingApproval),
    row(Trigger::ApprovalGranted, KernelState::AwaitingApproval, KernelState::Executing),
    row(Trigger::ApprovalDenied, KernelState::AwaitingApproval, KernelState::Idle),
    row(Trigger::ApprovalExpired, KernelState::AwaitingApproval, KernelState::Idle),
    row(Trigger::ExecutionComplete, KernelState::Executing, KernelState::Verifying),
    row(Trigger::VerificationPassed, KernelState::Verifying, KernelState::Idle),
    row(Trigger::VerificationFailed, KernelState::Verifying, KernelState::Error),
    any(Trigger::FatalError, KernelState::Error),
    any(Trigger::EscalateSafeMode, KernelState::SafeMode),
    row(Trigger::Recover, KernelState::Error, KernelState::Idle),
    row(Trigger::Recover, KernelState::SafeMode, KernelState::Idle),
];

/// Looks up the destination for `trigger` fired in `from`.
#[must_use]
pub fn lookup(trigger: Trigger, from: KernelState) -> Option<KernelState> {
    let exact = TRANSITIONS
        .iter()
        .find(|t| t.trigger == trigger && t.from == StateMatch::Exact(from));
    exact
        .or_else(|| {
            TRANSITIONS
                .iter()
                .find(|t| t.trigger == trigger && t.from == StateMatch::Any)
        })
        .map(|t| t.to)
}

/// Outcome of a transition attempt. Rejections leave the state unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionResult {
    /// Whether a table row matched.
    pub accepted: bool,
    /// State before the attempt.
    pub from: KernelState,
    /// State after the attempt; equals `from` when rejected.
    pub to: KernelState,
    /// Trigger that was fired.
    pub trigger: Trigger,
    /// Rejection reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TransitionResult {
    /// Returns `true` when the transition was accepted and moved the machine.
    #[must_use]
    pub fn changed_state(&self) -> bool {
        self.accepted && self.from != self.to
    }
}

/// Observer of accepted state changes.
pub trait StateListener: Send + Sync {
    /// Called synchronously after the state changed.
    fn on_transition(&self, transition: &TransitionResult);
}

impl<F> StateListener for F
where
    F: Fn(&TransitionResult) + Send + Sync,
{
    fn on_transition(&self, transition: &TransitionResult) {
        (self)(transition);
    }
}

/// Handle returned by [`KernelStateMachine::on_state_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Per-call state machine.
pub struct KernelStateMachine {
    state: KernelState,
    consecutive_errors: u32,
    listeners: Vec<(ListenerId, Arc<dyn StateListener>)>,
    next_listener: u64,
}

impl fmt::Debug for KernelStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelStateMachine")
            .field("state", &self.state)
            .field("consecutive_errors", &self.consecutive_errors)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Default for KernelStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelStateMachine {
    /// Creates a machine in [`KernelState::Idle`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: KernelState::Idle,
            consecutive_errors: 0,
            listeners: Vec::new(),
            next_listener: 0,
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> KernelState {
        self.state
    }

    /// Returns the number of accepted `fatal_error`/`verification_failed`
    /// triggers since the last `recover` or `reset`.
    #[must_use]
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Returns `true` when `trigger` would be accepted in the current state.
    #[must_use]
    pub fn can_fire(&self, trigger: Trigger) -> bool {
        lookup(trigger, self.state).is_some()
    }

    /// Registers a listener. Listeners run in registration order.
    pub fn on_state_change<L>(&mut self, listener: L) -> ListenerId
    where
        L: StateListener + 'static,
    {
        self.add_listener(Arc::new(listener))
    }

    /// Registers a shared listener.
    pub fn add_listener(&mut self, listener: Arc<dyn StateListener>) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, listener));
        id
    }

    /// Unsubscribes a listener. Returns `false` when it was not registered.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        self.listeners.len() != before
    }

    /// Fires a trigger. Never fails; rejections are reported in the result.
    pub fn transition(&mut self, trigger: Trigger) -> TransitionResult {
        let from = self.state;
        let Some(to) = lookup(trigger, from) else {
            debug!(%trigger, %from, "transition rejected");
            return TransitionResult {
                accepted: false,
                from,
                to: from,
                trigger,
                reason: Some(format!("no row matches trigger `{trigger}` from state `{from}`")),
            };
        };

        if trigger.counts_as_error() {
            self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        } else if trigger == Trigger::Recover {
            self.consecutive_errors = 0;
        }
        self.state = to;

        let result = TransitionResult {
            accepted: true,
            from,
            to,
            trigger,
            reason: None,
        };
        if result.changed_state() {
            debug!(%trigger, %from, %to, "state transition");
            self.notify(&result);
        }
        result
    }

    /// Returns to [`KernelState::Idle`] and zeroes the error counter.
    ///
    /// Listeners see a synthetic [`Trigger::Reset`] transition unless the
    /// machine was already idle.
    pub fn reset(&mut self) -> TransitionResult {
        let from = self.state;
        self.state = KernelState::Idle;
        self.consecutive_errors = 0;
        let result = TransitionResult {
            accepted: true,
            from,
            to: KernelState::Idle,
            trigger: Trigger::Reset,
            reason: None,
        };
        if result.changed_state() {
            self.notify(&result);
        }
        result
    }

    fn notify(&self, result: &TransitionResult) {
        for (id, listener) in &self.listeners {
            if let Err(panic) =
                panic::catch_unwind(AssertUnwindSafe(|| listener.on_transition(result)))
            {
                error!(
                    listener = ?id,
                    trigger = %result.trigger,
                    from = %result.from,
                    to = %result.to,
                    panic = %panic_message(panic.as_ref()),
                    "state listener panicked"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn machine_in(state: KernelState) -> KernelStateMachine {
        let mut machine = KernelStateMachine::new();
        let path: &[Trigger] = match state {
            KernelState::Idle => &[],
            KernelState::Validating => &[Trigger::ToolValidated],
            KernelState::AwaitingApproval => &[Trigger::ToolValidated, Trigger::ApprovalRequired],
            KernelState::Executing => &[Trigger::ToolValidated, Trigger::PolicyAllowed],
            KernelState::Verifying => &[
                Trigger::ToolValidated,
                Trigger::PolicyAllowed,
                Trigger::ExecutionComplete,
            ],
            KernelState::SafeMode => &[Trigger::EscalateSafeMode],
            KernelState::Error => &[Trigger::FatalError],
        };
        for trigger in path {
            assert!(machine.transition(*trigger).accepted);
        }
        assert_eq!(machine.state(), state);
        machine
    }

    #[test]
    fn pairs_outside_the_table_are_rejected() {
        for state in KernelState::ALL {
            for trigger in Trigger::ALL {
                let listed = TRANSITIONS.iter().any(|t| {
                    t.trigger == trigger
                        && (t.from == StateMatch::Any || t.from == StateMatch::Exact(state))
                });
                if listed {
                    continue;
                }
                let mut machine = machine_in(state);
                let errors = machine.consecutive_errors();
                let result = machine.transition(trigger);
                assert!(!result.accepted, "{trigger} from {state} should be rejected");
                assert!(result.reason.is_some());
                assert_eq!(result.to, state);
                assert_eq!(machine.state(), state);
                assert_eq!(machine.consecutive_errors(), errors);
            }
        }
    }

    #[test]
    fn wildcard_rows_fire_from_every_state() {
        for state in KernelState::ALL {
            let mut machine = machine_in(state);
            assert!(machine.transition(Trigger::FatalError).accepted);
            assert_eq!(machine.state(), KernelState::Error);

            let mut machine = machine_in(state);
            assert!(machine.transition(Trigger::EscalateSafeMode).accepted);
            assert_eq!(machine.state(), KernelState::SafeMode);
        }
    }

    #[test]
    fn recover_zeroes_errors_and_returns_to_idle() {
        let mut machine = KernelStateMachine::new();
        for _ in 0..4 {
            machine.transition(Trigger::FatalError);
        }
        assert_eq!(machine.consecutive_errors(), 4);

        let result = machine.transition(Trigger::Recover);
        assert!(result.accepted);
        assert_eq!(machine.state(), KernelState::Idle);
        assert_eq!(machine.consecutive_errors(), 0);

        let mut machine = machine_in(KernelState::SafeMode);
        machine.transition(Trigger::Recover);
        assert_eq!(machine.state(), KernelState::Idle);
    }

    #[test]
    fn verification_failure_counts_as_error() {
        let mut machine = machine_in(KernelState::Verifying);
        machine.transition(Trigger::VerificationFailed);
        assert_eq!(machine.state(), KernelState::Error);
        assert_eq!(machine.consecutive_errors(), 1);
    }

    #[test]
    fn listeners_fire_in_order_on_state_changes_only() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut machine = KernelStateMachine::new();

        let first = Arc::clone(&seen);
        machine.on_state_change(move |t: &TransitionResult| {
            first.lock().unwrap().push(format!("a:{}", t.to));
        });
        let second = Arc::clone(&seen);
        let id = machine.on_state_change(move |t: &TransitionResult| {
            second.lock().unwrap().push(format!("b:{}", t.to));
        });

        machine.transition(Trigger::ToolValidated);
        machine.transition(Trigger::ToolValidated);
        machine.transition(Trigger::ExecutionComplete);
        assert_eq!(*seen.lock().unwrap(), ["a:validating", "b:validating"]);

        assert!(machine.remove_listener(id));
        assert!(!machine.remove_listener(id));
        machine.transition(Trigger::FatalError);
        assert_eq!(seen.lock().unwrap().last().unwrap(), "a:error");
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn panicking_listener_does_not_block_the_rest() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut machine = KernelStateMachine::new();
        machine.on_state_change(|t: &TransitionResult| {
            assert_ne!(t.to, KernelState::Validating, "metrics sink down");
        });
        let sink = Arc::clone(&seen);
        machine.on_state_change(move |t: &TransitionResult| {
            sink.lock().unwrap().push(t.to);
        });

        let result = machine.transition(Trigger::ToolValidated);

        assert!(result.accepted);
        assert_eq!(machine.state(), KernelState::Validating);
        assert_eq!(*seen.lock().unwrap(), [KernelState::Validating]);
    }

    #[test]
    fn reset_notifies_unless_idle() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut machine = KernelStateMachine::new();
        let sink = Arc::clone(&seen);
        machine.on_state_change(move |t: &TransitionResult| {
            sink.lock().unwrap().push((t.trigger, t.from, t.to));
        });

        machine.reset();
        assert!(seen.lock().unwrap().is_empty());

        machine.transition(Trigger::FatalError);
        machine.transition(Trigger::FatalError);
        machine.reset();
        assert_eq!(machine.consecutive_errors(), 0);
        assert_eq!(
            seen.lock().unwrap().last().copied(),
            Some((Trigger::Reset, KernelState::Error, KernelState::Idle))
        );
    }
}
