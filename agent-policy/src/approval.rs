//! Human approval gate with risk-tiered expiry.
//!
//! The gate is the one component shared across concurrently pending calls.
//! Pending requests live in a sharded map; whoever removes an entry from the
//! map owns its settlement, which makes resolution atomic per request without a
//! gate-wide lock. Every request settles exactly once: by [`ApprovalGate::resolve`],
//! by its deadline timer, by lazy expiry on observation, or by
//! [`ApprovalGate::dispose`].

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use agent_primitives::{ApprovalId, ProposedToolCall, RiskClass};
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

/// Deadline used when a TTL would overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Maps each [`RiskClass`] to how long an approval may stay pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalTtlPolicy {
    low: Duration,
    medium: Duration,
    high: Duration,
    critical: Duration,
}

impl ApprovalTtlPolicy {
    /// Creates a policy with an explicit TTL per tier.
    #[must_use]
    pub const fn new(low: Duration, medium: Duration, high: Duration, critical: Duration) -> Self {
        Self {
            low,
            medium,
            high,
            critical,
        }
    }

    /// Creates a policy using the same TTL for every tier.
    #[must_use]
    pub const fn uniform(ttl: Duration) -> Self {
        Self::new(ttl, ttl, ttl, ttl)
    }

    /// Overrides the TTL of a single tier.
    #[must_use]
    pub const fn with_ttl(mut self, risk: RiskClass, ttl: Duration) -> Self {
        match risk {
            RiskClass::Low => self.low = ttl,
            RiskClass::Medium => self.medium = ttl,
            RiskClass::High => self.high = ttl,
            RiskClass::Critical => self.critical = ttl,
        }
        self
    }

    /// Returns the TTL applied to requests of the supplied tier.
    #[must_use]
    pub const fn ttl(&self, risk: RiskClass) -> Duration {
        match risk {
            RiskClass::Low => self.low,
            RiskClass::Medium => self.medium,
            RiskClass::High => self.high,
            RiskClass::Critical => self.critical,
        }
    }
}

impl Default for ApprovalTtlPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(300),
            Duration::from_secs(120),
            Duration::from_secs(60),
            Duration::from_secs(30),
        )
    }
}

/// Configuration for an [`ApprovalGate`].
#[derive(Debug, Clone, Copy)]
pub struct ApprovalGateConfig {
    ttl: ApprovalTtlPolicy,
    background_timers: bool,
    notify_capacity: usize,
}

impl ApprovalGateConfig {
    /// Creates a configuration with the supplied TTL policy.
    #[must_use]
    pub const fn new(ttl: ApprovalTtlPolicy) -> Self {
        Self {
            ttl,
            background_timers: true,
            notify_capacity: 64,
        }
    }

    /// Enables or disables per-request deadline timers.
    ///
    /// Without timers, expiry is enforced lazily whenever a request is observed
    /// or awaited.
    #[must_use]
    pub const fn with_background_timers(mut self, enabled: bool) -> Self {
        self.background_timers = enabled;
        self
    }

    /// Sets the buffer size of the new-request notification channel.
    #[must_use]
    pub const fn with_notify_capacity(mut self, capacity: usize) -> Self {
        self.notify_capacity = capacity;
        self
    }

    /// Returns the TTL policy.
    #[must_use]
    pub const fn ttl(&self) -> &ApprovalTtlPolicy {
        &self.ttl
    }

    /// Returns whether deadline timers are scheduled.
    #[must_use]
    pub const fn background_timers(&self) -> bool {
        self.background_timers
    }
}

impl Default for ApprovalGateConfig {
    fn default() -> Self {
        Self::new(ApprovalTtlPolicy::default())
    }
}

/// Terminal decision for an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// A human approved the call.
    Approved,
    /// A human denied the call.
    Denied,
    /// Nobody decided before the deadline, or the gate was disposed.
    Expired,
}

impl ApprovalDecision {
    /// Returns the stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A call parked in the gate waiting for a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    id: ApprovalId,
    call: ProposedToolCall,
    risk_class: RiskClass,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl ApprovalRequest {
    /// Returns the request identifier.
    #[must_use]
    pub fn id(&self) -> ApprovalId {
        self.id
    }

    /// Returns the call awaiting approval.
    #[must_use]
    pub fn call(&self) -> &ProposedToolCall {
        &self.call
    }

    /// Returns the risk class used to pick the TTL.
    #[must_use]
    pub fn risk_class(&self) -> RiskClass {
        self.risk_class
    }

    /// Returns when the request was created.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns when the request expires.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Terminal, immutable outcome of an approval request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalResult {
    id: ApprovalId,
    decision: ApprovalDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    decided_by: Option<String>,
    decided_at: DateTime<Utc>,
}

impl ApprovalResult {
    fn new(id: ApprovalId, decision: ApprovalDecision, decided_by: Option<String>) -> Self {
        Self {
            id,
            decision,
            decided_by,
            decided_at: Utc::now(),
        }
    }

    /// Returns the request identifier.
    #[must_use]
    pub fn id(&self) -> ApprovalId {
        self.id
    }

    /// Returns the decision.
    #[must_use]
    pub fn decision(&self) -> ApprovalDecision {
        self.decision
    }

    /// Returns who decided, when a human did.
    #[must_use]
    pub fn decided_by(&self) -> Option<&str> {
        self.decided_by.as_deref()
    }

    /// Returns when the decision was produced.
    #[must_use]
    pub fn decided_at(&self) -> DateTime<Utc> {
        self.decided_at
    }

    /// Returns true when the call may proceed.
    #[must_use]
    pub fn is_approved(&self) -> bool {
        self.decision == ApprovalDecision::Approved
    }
}

/// Read-only view of a request returned by [`ApprovalGate::get_pending_by_id`].
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalStatus {
    /// Request is still waiting for a decision.
    Pending(ApprovalRequest),
    /// Request passed its deadline and was expired on observation.
    Expired(ApprovalResult),
}

/// Surface consumed by approval UIs and operator tooling.
pub trait ApprovalResolver: Send + Sync {
    /// Resolves a pending request. Returns `false` when it is unknown or already settled.
    fn resolve(&self, id: ApprovalId, decision: ApprovalDecision, decided_by: Option<&str>)
    -> bool;

    /// Lists requests still waiting for a decision.
    fn pending(&self) -> Vec<ApprovalRequest>;

    /// Looks up a single request.
    fn pending_by_id(&self, id: ApprovalId) -> Option<ApprovalStatus>;
}

struct PendingEntry {
    request: ApprovalRequest,
    deadline: Instant,
    settle: oneshot::Sender<ApprovalResult>,
    timer: Option<JoinHandle<()>>,
}

struct GateShared {
    config: ApprovalGateConfig,
    pending: DashMap<ApprovalId, PendingEntry>,
    notifier: broadcast::Sender<ApprovalRequest>,
}

impl GateShared {
    fn settle(
        &self,
        id: ApprovalId,
        decision: ApprovalDecision,
        decided_by: Option<String>,
    ) -> Option<ApprovalResult> {
        let (_, entry) = self.pending.remove(&id)?;
        Some(Self::finish(entry, decision, decided_by))
    }

    /// Settles with `decision` unless the deadline has passed, in which case
    /// the request settles as expired. The deadline is checked after the entry
    /// is owned, so no expiry can slip in between. Returns `true` when the
    /// caller's decision was applied.
    fn resolve(
        &self,
        id: ApprovalId,
        decision: ApprovalDecision,
        decided_by: Option<String>,
    ) -> bool {
        let Some((_, entry)) = self.pending.remove(&id) else {
            return false;
        };
        if entry.deadline <= Instant::now() {
            debug!(approval_id = %id, "decision arrived after the deadline");
            Self::finish(entry, ApprovalDecision::Expired, None);
            return false;
        }
        Self::finish(entry, decision, decided_by);
        true
    }

    fn expire_if_due(&self, id: ApprovalId) -> Option<ApprovalResult> {
        let now = Instant::now();
        let (_, entry) = self
            .pending
            .remove_if(&id, |_, entry| entry.deadline <= now)?;
        debug!(approval_id = %id, "approval expired on observation");
        Some(Self::finish(entry, ApprovalDecision::Expired, None))
    }

    fn sweep(&self) {
        let now = Instant::now();
        let due: Vec<ApprovalId> = self
            .pending
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect();
        for id in due {
            self.expire_if_due(id);
        }
    }

    fn finish(
        entry: PendingEntry,
        decision: ApprovalDecision,
        decided_by: Option<String>,
    ) -> ApprovalResult {
        let PendingEntry {
            request,
            settle,
            timer,
            ..
        } = entry;
        if let Some(timer) = timer {
            timer.abort();
        }

        let result = ApprovalResult::new(request.id(), decision, decided_by);
        match decision {
            ApprovalDecision::Approved => info!(
                approval_id = %request.id(),
                tool = request.call().tool(),
                decided_by = result.decided_by(),
                "approval granted"
            ),
            ApprovalDecision::Denied => warn!(
                approval_id = %request.id(),
                tool = request.call().tool(),
                decided_by = result.decided_by(),
                "approval denied"
            ),
            ApprovalDecision::Expired => warn!(
                approval_id = %request.id(),
                tool = request.call().tool(),
                "approval expired"
            ),
        }

        // The waiting side may already be gone; the result is still authoritative.
        let _ = settle.send(result.clone());
        result
    }
}

/// Tracks pending approval requests and times them out.
///
/// Cloning is cheap and yields a handle to the same pending set.
#[derive(Clone)]
pub struct ApprovalGate {
    shared: Arc<GateShared>,
}

impl fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApprovalGate")
            .field("pending", &self.shared.pending.len())
            .field("ttl", self.shared.config.ttl())
            .field("background_timers", &self.shared.config.background_timers())
            .finish()
    }
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::with_config(ApprovalGateConfig::default())
    }
}

impl ApprovalGate {
    /// Creates a gate with the supplied TTL policy and background timers enabled.
    #[must_use]
    pub fn new(ttl: ApprovalTtlPolicy) -> Self {
        Self::with_config(ApprovalGateConfig::new(ttl))
    }

    /// Creates a gate from a full configuration.
    #[must_use]
    pub fn with_config(config: ApprovalGateConfig) -> Self {
        let (notifier, _) = broadcast::channel(config.notify_capacity.max(1));
        Self {
            shared: Arc::new(GateShared {
                config,
                pending: DashMap::new(),
                notifier,
            }),
        }
    }

    /// Returns the gate configuration.
    #[must_use]
    pub fn config(&self) -> &ApprovalGateConfig {
        &self.shared.config
    }

    /// Parks the call as a pending request and returns a handle that settles
    /// once the request is resolved or its deadline passes.
    ///
    /// A deadline timer is spawned on the ambient tokio runtime when one is
    /// available and timers are enabled; otherwise expiry is enforced lazily.
    #[must_use]
    pub fn request_approval(&self, call: &ProposedToolCall, risk_class: RiskClass) -> ApprovalHandle {
        let ttl = self.shared.config.ttl().ttl(risk_class);
        let id = ApprovalId::random();
        let created_at = Utc::now();
        let expires_at = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|delta| created_at.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let now = Instant::now();
        let deadline = now
            .checked_add(ttl)
            .unwrap_or_else(|| now + FAR_FUTURE);

        let request = ApprovalRequest {
            id,
            call: call.clone(),
            risk_class,
            created_at,
            expires_at,
        };

        let (settle, receiver) = oneshot::channel();
        self.shared.pending.insert(
            id,
            PendingEntry {
                request: request.clone(),
                deadline,
                settle,
                timer: None,
            },
        );

        if self.shared.config.background_timers()
            && let Ok(runtime) = Handle::try_current()
        {
            let weak = Arc::downgrade(&self.shared);
            let timer = runtime.spawn(async move {
                sleep_until(deadline).await;
                if let Some(shared) = weak.upgrade() {
                    shared.settle(id, ApprovalDecision::Expired, None);
                }
            });
            if let Some(mut entry) = self.shared.pending.get_mut(&id) {
                entry.timer = Some(timer);
            }
        }

        info!(
            approval_id = %id,
            call_id = %call.id(),
            tool = call.tool(),
            risk = %risk_class,
            ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            "approval requested"
        );
        // No subscribers is fine; the request stays listed in `get_pending`.
        let _ = self.shared.notifier.send(request.clone());

        ApprovalHandle {
            request,
            deadline,
            receiver,
            gate: Arc::downgrade(&self.shared),
        }
    }

    /// Resolves a pending request.
    ///
    /// Returns `false` when the id is unknown, already settled, or past its
    /// deadline; in the last case the request is settled as expired instead.
    #[must_use]
    pub fn resolve(
        &self,
        id: ApprovalId,
        decision: ApprovalDecision,
        decided_by: Option<&str>,
    ) -> bool {
        self.shared
            .resolve(id, decision, decided_by.map(str::to_owned))
    }

    /// Returns a snapshot of requests still pending, oldest first.
    #[must_use]
    pub fn get_pending(&self) -> Vec<ApprovalRequest> {
        self.shared.sweep();
        let mut pending: Vec<ApprovalRequest> = self
            .shared
            .pending
            .iter()
            .map(|entry| entry.request.clone())
            .collect();
        pending.sort_by_key(ApprovalRequest::created_at);
        pending
    }

    /// Looks up a single request, expiring it first if its deadline has passed.
    #[must_use]
    pub fn get_pending_by_id(&self, id: ApprovalId) -> Option<ApprovalStatus> {
        if let Some(result) = self.shared.expire_if_due(id) {
            return Some(ApprovalStatus::Expired(result));
        }
        self.shared
            .pending
            .get(&id)
            .map(|entry| ApprovalStatus::Pending(entry.request.clone()))
    }

    /// Returns the number of requests currently pending.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Subscribes to newly created requests.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalRequest> {
        self.shared.notifier.subscribe()
    }

    /// Settles every pending request as expired and cancels their timers.
    ///
    /// Returns the number of requests settled by this call.
    pub fn dispose(&self) -> usize {
        let ids: Vec<ApprovalId> = self.shared.pending.iter().map(|entry| *entry.key()).collect();
        let settled = ids
            .into_iter()
            .filter(|id| {
                self.shared
                    .settle(*id, ApprovalDecision::Expired, None)
                    .is_some()
            })
            .count();
        if settled > 0 {
            info!(settled, "approval gate disposed");
        }
        settled
    }
}

impl ApprovalResolver for ApprovalGate {
    fn resolve(
        &self,
        id: ApprovalId,
        decision: ApprovalDecision,
        decided_by: Option<&str>,
    ) -> bool {
        ApprovalGate::resolve(self, id, decision, decided_by)
    }

    fn pending(&self) -> Vec<ApprovalRequest> {
        self.get_pending()
    }

    fn pending_by_id(&self, id: ApprovalId) -> Option<ApprovalStatus> {
        self.get_pending_by_id(id)
    }
}

/// Suspended computation returned by [`ApprovalGate::request_approval`].
#[derive(Debug)]
pub struct ApprovalHandle {
    request: ApprovalRequest,
    deadline: Instant,
    receiver: oneshot::Receiver<ApprovalResult>,
    gate: Weak<GateShared>,
}

impl ApprovalHandle {
    /// Returns the request identifier.
    #[must_use]
    pub fn id(&self) -> ApprovalId {
        self.request.id()
    }

    /// Returns the parked request.
    #[must_use]
    pub fn request(&self) -> &ApprovalRequest {
        &self.request
    }

    /// Waits until the request settles.
    ///
    /// The handle races its own deadline, so it resolves to
    /// [`ApprovalDecision::Expired`] on time even when no timer fired.
    pub async fn wait(self) -> ApprovalResult {
        let Self {
            request,
            deadline,
            mut receiver,
            gate,
        } = self;
        let id = request.id();

        tokio::select! {
            settled = &mut receiver => {
                settled.unwrap_or_else(|_| ApprovalResult::new(id, ApprovalDecision::Expired, None))
            }
            () = sleep_until(deadline) => {
                if let Some(shared) = gate.upgrade() {
                    shared.settle(id, ApprovalDecision::Expired, None);
                }
                // Either our expiry or a racing resolve filled the channel.
                receiver
                    .await
                    .unwrap_or_else(|_| ApprovalResult::new(id, ApprovalDecision::Expired, None))
            }
        }
    }
}

impl fmt::Debug for GateShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateShared")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn call(tool: &str, risk: RiskClass) -> ProposedToolCall {
        ProposedToolCall::builder(tool)
            .risk_class(risk)
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_settles_waiter_once() {
        let gate = ApprovalGate::new(ApprovalTtlPolicy::uniform(Duration::from_secs(60)));
        let handle = gate.request_approval(&call("fs.write", RiskClass::High), RiskClass::High);
        let id = handle.id();
        assert_eq!(gate.pending_count(), 1);

        assert!(gate.resolve(id, ApprovalDecision::Approved, Some("alice")));
        assert!(!gate.resolve(id, ApprovalDecision::Denied, Some("bob")));

        let result = handle.wait().await;
        assert_eq!(result.decision(), ApprovalDecision::Approved);
        assert_eq!(result.decided_by(), Some("alice"));
        assert!(gate.get_pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn request_expires_after_risk_tiered_ttl() {
        let ttl = ApprovalTtlPolicy::default().with_ttl(RiskClass::High, Duration::from_millis(5000));
        let gate = ApprovalGate::new(ttl);
        let handle = gate.request_approval(&call("fs.delete", RiskClass::High), RiskClass::High);
        let id = handle.id();

        tokio::time::sleep(Duration::from_millis(5001)).await;

        let result = handle.wait().await;
        assert_eq!(result.decision(), ApprovalDecision::Expired);
        assert!(result.decided_by().is_none());
        assert!(gate.get_pending_by_id(id).is_none());
        assert!(!gate.resolve(id, ApprovalDecision::Approved, None));
    }

    #[tokio::test(start_paused = true)]
    async fn lazy_expiry_without_timers() {
        let config = ApprovalGateConfig::new(ApprovalTtlPolicy::uniform(Duration::from_secs(1)))
            .with_background_timers(false);
        let gate = ApprovalGate::with_config(config);
        let handle = gate.request_approval(&call("fs.write", RiskClass::Low), RiskClass::Low);
        let id = handle.id();

        assert!(matches!(
            gate.get_pending_by_id(id),
            Some(ApprovalStatus::Pending(_))
        ));

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(gate.pending_count(), 1, "no timer should have fired");

        match gate.get_pending_by_id(id) {
            Some(ApprovalStatus::Expired(result)) => {
                assert_eq!(result.decision(), ApprovalDecision::Expired);
            }
            other => panic!("expected expired view, got {other:?}"),
        }
        assert!(!gate.resolve(id, ApprovalDecision::Approved, Some("late")));
        assert_eq!(handle.wait().await.decision(), ApprovalDecision::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn late_waiter_observes_expiry_without_timer() {
        let config = ApprovalGateConfig::new(ApprovalTtlPolicy::uniform(Duration::from_secs(2)))
            .with_background_timers(false);
        let gate = ApprovalGate::with_config(config);
        let handle = gate.request_approval(&call("fs.write", RiskClass::Low), RiskClass::Low);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(handle.wait().await.decision(), ApprovalDecision::Expired);
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_past_deadline_reports_not_found() {
        let config = ApprovalGateConfig::new(ApprovalTtlPolicy::uniform(Duration::from_secs(1)))
            .with_background_timers(false);
        let gate = ApprovalGate::with_config(config);
        let handle = gate.request_approval(&call("fs.write", RiskClass::Low), RiskClass::Low);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!gate.resolve(handle.id(), ApprovalDecision::Approved, Some("alice")));
        assert_eq!(handle.wait().await.decision(), ApprovalDecision::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn decision_at_the_deadline_settles_as_expired() {
        let gate = ApprovalGate::with_config(
            ApprovalGateConfig::new(ApprovalTtlPolicy::uniform(Duration::from_secs(1)))
                .with_background_timers(false),
        );
        let handle = gate.request_approval(&call("fs.write", RiskClass::Low), RiskClass::Low);
        let id = handle.id();

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!gate.resolve(id, ApprovalDecision::Approved, Some("alice")));
        assert!(gate.get_pending_by_id(id).is_none());

        let result = handle.wait().await;
        assert_eq!(result.decision(), ApprovalDecision::Expired);
        assert!(result.decided_by().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_id_leaves_other_requests_untouched() {
        let gate = ApprovalGate::default();
        let handle = gate.request_approval(&call("fs.write", RiskClass::Medium), RiskClass::Medium);

        assert!(!gate.resolve(ApprovalId::random(), ApprovalDecision::Denied, None));
        assert_eq!(gate.pending_count(), 1);
        assert!(matches!(
            gate.get_pending_by_id(handle.id()),
            Some(ApprovalStatus::Pending(request)) if request.call().tool() == "fs.write"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_expires_everything_exactly_once() {
        let gate = ApprovalGate::default();
        let handles: Vec<_> = (0..3)
            .map(|i| gate.request_approval(&call(&format!("tool.{i}"), RiskClass::Low), RiskClass::Low))
            .collect();
        let ids: Vec<_> = handles.iter().map(ApprovalHandle::id).collect();

        assert_eq!(gate.dispose(), 3);
        assert_eq!(gate.dispose(), 0);

        for id in ids {
            assert!(!gate.resolve(id, ApprovalDecision::Approved, None));
        }
        for handle in handles {
            assert_eq!(handle.wait().await.decision(), ApprovalDecision::Expired);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolution_has_single_winner() {
        let gate = ApprovalGate::default();
        let handle = gate.request_approval(&call("payments.send", RiskClass::Critical), RiskClass::Critical);
        let id = handle.id();
        let winners = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let gate = gate.clone();
                let winners = Arc::clone(&winners);
                tokio::spawn(async move {
                    let decision = if i % 2 == 0 {
                        ApprovalDecision::Approved
                    } else {
                        ApprovalDecision::Denied
                    };
                    if gate.resolve(id, decision, Some("racer")) {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        futures::future::join_all(tasks).await;

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        let result = handle.wait().await;
        assert_ne!(result.decision(), ApprovalDecision::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_see_new_requests() {
        let gate = ApprovalGate::default();
        let mut events = gate.subscribe();
        let handle = gate.request_approval(&call("fs.write", RiskClass::High), RiskClass::High);

        let announced = events.recv().await.unwrap();
        assert_eq!(announced.id(), handle.id());
        assert_eq!(announced.risk_class(), RiskClass::High);
        assert!(announced.expires_at() > announced.created_at());
    }

    #[test]
    fn requests_without_runtime_fall_back_to_lazy_expiry() {
        let gate = ApprovalGate::new(ApprovalTtlPolicy::uniform(Duration::ZERO));
        let handle = gate.request_approval(&call("fs.write", RiskClass::Low), RiskClass::Low);

        assert!(matches!(
            gate.get_pending_by_id(handle.id()),
            Some(ApprovalStatus::Expired(_))
        ));
        assert!(gate.get_pending().is_empty());
    }
}
