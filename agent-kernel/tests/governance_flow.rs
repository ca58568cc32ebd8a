use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_config::KernelConfig;
use agent_kernel::{
    GovernanceFailure, KernelOrchestrator, KernelRequest, KernelState, PipelineOutcome,
    SafeModeStatus, TransitionResult,
};
use agent_policy::{
    ApprovalDecision, PolicyDecision, PolicyEvaluator, PolicyRule, RuleBasedEvaluator, RuleMatcher,
};
use agent_primitives::{ProposedToolCall, RiskClass};
use agent_tools::{
    ActionHandler, CompensationContext, CompensationOutcome, CompensationRegistry,
    CompensationStrategy, PostCondition, PostConditionRegistry, ToolError, ToolResult,
};
use serde_json::{Value, json};

fn call(tool: &str, risk: RiskClass) -> ProposedToolCall {
    ProposedToolCall::builder(tool)
        .input(json!({"target": "quarterly-report"}))
        .risk_class(risk)
        .build()
        .unwrap()
}

fn counting_handler(
    counter: &Arc<AtomicUsize>,
    result: ToolResult<Value>,
) -> impl ActionHandler + use<> {
    let counter = Arc::clone(counter);
    move |_call: ProposedToolCall| {
        let counter = Arc::clone(&counter);
        let result = result.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            result
        }
    }
}

fn policy() -> Arc<dyn PolicyEvaluator> {
    Arc::new(
        RuleBasedEvaluator::new(PolicyDecision::allow())
            .with_rule(
                PolicyRule::new(
                    "no-deletes",
                    RuleMatcher::for_tool("fs.delete"),
                    PolicyDecision::deny("deletes are disabled").with_policy_id("no-deletes"),
                )
                .unwrap(),
            )
            .with_rule(
                PolicyRule::new(
                    "high-risk-approval",
                    RuleMatcher::any().at_least(RiskClass::High),
                    PolicyDecision::require_approval("high risk", vec!["ops".into()])
                        .with_policy_id("high-risk-approval"),
                )
                .unwrap(),
            ),
    )
}

fn always_failing_postconditions(tool: &str) -> Arc<PostConditionRegistry> {
    let registry = PostConditionRegistry::new();
    registry
        .register(
            tool,
            PostCondition::critical("asset-ready", "generated asset is ready", |_| false).unwrap(),
        )
        .unwrap();
    Arc::new(registry)
}

#[tokio::test]
async fn denied_call_never_reaches_the_handler() {
    let kernel = KernelOrchestrator::builder(policy()).build();
    let invocations = Arc::new(AtomicUsize::new(0));

    let result = kernel
        .handle(KernelRequest::new().with_handler(
            call("fs.delete", RiskClass::Low),
            counting_handler(&invocations, Ok(json!(null))),
        ))
        .await;

    assert_eq!(invocations.load(Ordering::SeqCst), 0);
    let step = result.last().unwrap();
    assert_eq!(step.outcome, PipelineOutcome::Denied);
    assert_eq!(
        step.primary_failure(),
        Some(&GovernanceFailure::PolicyDenied {
            policy_id: Some("no-deletes".into()),
            reason: "deletes are disabled".into(),
        })
    );
    assert!(!result.steps[0].memory.as_ref().unwrap().written);
}

#[tokio::test]
async fn approver_denial_is_reported_as_denied() {
    let kernel = Arc::new(KernelOrchestrator::builder(policy()).build());
    let mut pending = kernel.approvals().subscribe();
    let invocations = Arc::new(AtomicUsize::new(0));

    let run = kernel
        .spawn(KernelRequest::new().with_handler(
            call("db.migrate", RiskClass::High),
            counting_handler(&invocations, Ok(json!(null))),
        ))
        .unwrap();

    let request = pending.recv().await.unwrap();
    assert_eq!(request.risk_class(), RiskClass::High);
    assert_eq!(kernel.approvals().get_pending().len(), 1);
    assert!(kernel
        .approvals()
        .resolve(request.id(), ApprovalDecision::Denied, Some("bob")));
    assert!(!kernel
        .approvals()
        .resolve(request.id(), ApprovalDecision::Approved, Some("mallory")));

    let result = run.await.unwrap().unwrap();
    let step = result.last().unwrap();
    assert_eq!(step.outcome, PipelineOutcome::Denied);
    assert_eq!(step.final_state, KernelState::Idle);
    assert_eq!(
        step.primary_failure(),
        Some(&GovernanceFailure::ApprovalDenied {
            approval_id: request.id(),
            decided_by: Some("bob".into()),
        })
    );
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_approval_expires_after_tiered_ttl() {
    let mut config = KernelConfig::default();
    config.approval.high_ttl_ms = 5000;
    let kernel = KernelOrchestrator::builder(policy())
        .config(&config)
        .unwrap()
        .build();
    let invocations = Arc::new(AtomicUsize::new(0));

    let started = tokio::time::Instant::now();
    let result = kernel
        .handle(KernelRequest::new().with_handler(
            call("db.migrate", RiskClass::High),
            counting_handler(&invocations, Ok(json!(null))),
        ))
        .await;

    assert!(started.elapsed() >= Duration::from_millis(5000));
    let step = result.last().unwrap();
    assert_eq!(step.outcome, PipelineOutcome::Expired);
    assert_eq!(
        step.approval.as_ref().unwrap().decision(),
        ApprovalDecision::Expired
    );
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
    assert!(kernel.approvals().get_pending().is_empty());
}

#[tokio::test]
async fn allowed_call_skips_awaiting_approval() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let kernel = KernelOrchestrator::builder(policy())
        .state_listener(Arc::new(move |t: &TransitionResult| {
            sink.lock().unwrap().push(t.to);
        }))
        .build();
    let invocations = Arc::new(AtomicUsize::new(0));

    let result = kernel
        .handle(KernelRequest::new().with_handler(
            call("fs.read", RiskClass::Low),
            counting_handler(&invocations, Ok(json!({"bytes": 42}))),
        ))
        .await;

    assert!(result.is_success());
    assert_eq!(
        *seen.lock().unwrap(),
        [
            KernelState::Validating,
            KernelState::Executing,
            KernelState::Verifying,
            KernelState::Idle,
        ]
    );
    let memory = kernel.memory().unwrap();
    assert_eq!(memory.traces_for(result.last().unwrap().call_id).await.len(), 1);
}

#[tokio::test]
async fn tool_without_eligibility_is_flagged_for_manual_remediation() {
    let compensation = Arc::new(CompensationRegistry::new());
    let compensations = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&compensations);
    compensation.register_fn("email.send", move |_ctx: CompensationContext| {
        let seen = Arc::clone(&seen);
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            CompensationOutcome::succeeded("recalled")
        }
    });
    let kernel = KernelOrchestrator::builder(policy())
        .postconditions(always_failing_postconditions("email.send"))
        .compensation(compensation)
        .build();
    let invocations = Arc::new(AtomicUsize::new(0));

    let result = kernel
        .handle(KernelRequest::new().with_handler(
            call("email.send", RiskClass::Medium),
            counting_handler(&invocations, Ok(json!({"message_id": "m-1"}))),
        ))
        .await;

    let step = result.last().unwrap();
    assert_eq!(step.outcome, PipelineOutcome::RemediationRequired);
    let report = step.compensation.as_ref().unwrap();
    assert_eq!(report.strategy, CompensationStrategy::Manual);
    assert!(!report.attempted);
    assert_eq!(compensations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn automated_compensation_runs_exactly_once() {
    let compensation = Arc::new(CompensationRegistry::new());
    let compensations = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&compensations);
    compensation.register_automated(
        "media.generate",
        "generated media can be deleted",
        move |ctx: CompensationContext| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                let id = ctx.output.as_ref().and_then(|o| o["asset"].as_str()).unwrap_or("?");
                CompensationOutcome::succeeded(format!("deleted {id}"))
            }
        },
    );
    let kernel = KernelOrchestrator::builder(policy())
        .postconditions(always_failing_postconditions("media.generate"))
        .compensation(compensation)
        .build();
    let invocations = Arc::new(AtomicUsize::new(0));

    let result = kernel
        .handle(KernelRequest::new().with_handler(
            call("media.generate", RiskClass::Low),
            counting_handler(&invocations, Ok(json!({"asset": "img-9"}))),
        ))
        .await;

    let step = result.last().unwrap();
    assert_eq!(step.outcome, PipelineOutcome::Compensated);
    assert_eq!(compensations.load(Ordering::SeqCst), 1);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    let report = step.compensation.as_ref().unwrap();
    assert!(report.attempted);
    assert_eq!(report.outcome.as_ref().unwrap().detail, "deleted img-9");
    assert_eq!(step.final_state, KernelState::Error);
}

#[tokio::test]
async fn safe_mode_trips_and_needs_an_explicit_exit() {
    let mut config = KernelConfig::default();
    config.safe_mode.error_threshold = 2;
    let kernel = KernelOrchestrator::builder(policy())
        .config(&config)
        .unwrap()
        .build();
    let invocations = Arc::new(AtomicUsize::new(0));
    let failing = || counting_handler(&invocations, Err(ToolError::execution("upstream 500")));

    for _ in 0..2 {
        let result = kernel
            .handle(KernelRequest::new().with_handler(call("crm.update", RiskClass::Low), failing()))
            .await;
        assert_eq!(result.last().unwrap().outcome, PipelineOutcome::RemediationRequired);
    }
    assert_eq!(kernel.safe_mode().status(), SafeModeStatus::Active);

    let rejected = kernel
        .handle(KernelRequest::new().with_handler(call("crm.update", RiskClass::Low), failing()))
        .await;
    let step = rejected.last().unwrap();
    assert_eq!(step.outcome, PipelineOutcome::Rejected);
    assert_eq!(step.final_state, KernelState::SafeMode);
    assert_eq!(
        step.primary_failure(),
        Some(&GovernanceFailure::SafeModeEngaged {
            consecutive_errors: 2
        })
    );
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(rejected.safe_mode, SafeModeStatus::Active);

    assert!(kernel.exit_safe_mode("", "retry").is_err());
    let event = kernel.exit_safe_mode("alice", "upstream fixed").unwrap();
    assert_eq!(event.actor.as_deref(), Some("alice"));

    let recovered = kernel
        .handle(KernelRequest::new().with_handler(
            call("crm.update", RiskClass::Low),
            counting_handler(&invocations, Ok(json!("ok"))),
        ))
        .await;
    assert!(recovered.is_success());
    assert_eq!(kernel.safe_mode().history().len(), 2);
}

#[tokio::test]
async fn batch_stops_at_first_failure_without_rolling_back() {
    let kernel = KernelOrchestrator::builder(policy()).build();
    let invocations = Arc::new(AtomicUsize::new(0));

    let result = kernel
        .handle(
            KernelRequest::new()
                .with_handler(
                    call("fs.read", RiskClass::Low),
                    counting_handler(&invocations, Ok(json!(1))),
                )
                .with_handler(
                    call("fs.delete", RiskClass::Low),
                    counting_handler(&invocations, Ok(json!(2))),
                )
                .with_handler(
                    call("fs.read", RiskClass::Low),
                    counting_handler(&invocations, Ok(json!(3))),
                ),
        )
        .await;

    assert_eq!(result.halted_at, Some(1));
    let outcomes: Vec<_> = result.results().map(|r| r.outcome).collect();
    assert_eq!(outcomes, [PipelineOutcome::Completed, PipelineOutcome::Denied]);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_expires_parked_calls() {
    let kernel = Arc::new(KernelOrchestrator::builder(policy()).build());
    let mut pending = kernel.approvals().subscribe();
    let invocations = Arc::new(AtomicUsize::new(0));

    let first = kernel
        .spawn(KernelRequest::new().with_handler(
            call("db.migrate", RiskClass::Critical),
            counting_handler(&invocations, Ok(json!(null))),
        ))
        .unwrap();
    let second = kernel
        .spawn(KernelRequest::new().with_handler(
            call("db.vacuum", RiskClass::High),
            counting_handler(&invocations, Ok(json!(null))),
        ))
        .unwrap();
    pending.recv().await.unwrap();
    pending.recv().await.unwrap();

    assert_eq!(kernel.shutdown(), 2);
    for run in [first, second] {
        let result = run.await.unwrap().unwrap();
        assert_eq!(result.last().unwrap().outcome, PipelineOutcome::Expired);
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
    assert!(kernel.spawn(KernelRequest::new()).is_err());
}
