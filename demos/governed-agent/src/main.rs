//! Scripted agent that pushes a handful of tool calls through the governance
//! kernel and prints what happened to each one.

use std::path::PathBuf;
use std::sync::Arc;

use agent_governance::kernel::{
    GatedMemoryWriter, KernelOrchestrator, OrchestratedResult, TracingPolicyObserver,
    TracingStateListener,
};
use agent_governance::prelude::*;
use agent_governance::telemetry::init_tracing;
use agent_governance::tools::{CompensationContext, CompensationEligibility, ToolError};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "governed-agent")]
#[command(about = "Run scripted tool calls through the governance kernel", long_about = None)]
#[command(version)]
struct Cli {
    /// Kernel configuration file (falls back to AGENT_KERNEL_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How the simulated operator answers approval requests
    #[arg(long, value_enum, default_value_t = ApproverMode::Approve)]
    approver: ApproverMode,

    /// Submit every call as one request; the plan halts at the first failure
    #[arg(long)]
    batch: bool,

    /// Print full results as JSON instead of a summary line per call
    #[arg(long)]
    json: bool,

    /// Override the configured log filter
    #[arg(long)]
    log_filter: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ApproverMode {
    /// Approve every request.
    Approve,
    /// Deny every request.
    Deny,
    /// Never answer; requests run into their TTL.
    Ignore,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config =
        KernelConfig::load(cli.config.as_deref()).context("failed to load kernel config")?;
    if let Some(filter) = cli.log_filter {
        config.telemetry.filter = filter;
    }
    init_tracing(&config.telemetry).context("failed to install tracing subscriber")?;

    let writer = GatedMemoryWriter::from_section(&config.memory)
        .await
        .context("failed to open trace store")?;

    let kernel = KernelOrchestrator::builder(policy()?)
        .config(&config)?
        .tools(Arc::new(tools()?))
        .postconditions(Arc::new(postconditions()?))
        .compensation(Arc::new(compensation()))
        .memory(writer.bus().clone())
        .observer(Arc::new(TracingPolicyObserver))
        .state_listener(Arc::new(TracingStateListener))
        .build();

    let operator = spawn_operator(kernel.approvals().clone(), cli.approver);

    let calls = scripted_calls()?;
    let results = if cli.batch {
        let request = KernelRequest::batch(calls).with_intent("scripted batch");
        vec![kernel.handle(request).await]
    } else {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(kernel.handle(KernelRequest::single(call)).await);
        }
        results
    };

    for result in &results {
        report(result, cli.json)?;
    }

    if let Some(bus) = kernel.memory() {
        let stats = bus.stats().await;
        info!(?stats, "verified traces stored");
    }

    let expired = kernel.shutdown();
    operator.abort();
    info!(expired, safe_mode = ?kernel.safe_mode().status(), "demo finished");
    Ok(())
}

fn policy() -> Result<Arc<dyn PolicyEvaluator>> {
    let evaluator = RuleBasedEvaluator::new(PolicyDecision::allow())
        .with_rule(PolicyRule::new(
            "no-filesystem-deletes",
            RuleMatcher::for_tool("fs.delete"),
            PolicyDecision::deny("agents may not delete files"),
        )?)
        .with_rule(PolicyRule::new(
            "high-risk-needs-operator",
            RuleMatcher::any().at_least(RiskClass::High),
            PolicyDecision::require_approval(
                "high risk calls need an operator",
                vec!["operator".to_owned()],
            ),
        )?);
    Ok(Arc::new(evaluator))
}

fn tools() -> Result<ToolRegistry> {
    let registry = ToolRegistry::new();

    registry.register_tool(
        ToolMetadata::new("fs.read", "1.0.0")?
            .with_description("Reads a file from the workspace")
            .with_risk_class(RiskClass::Low),
        |call: ProposedToolCall| async move {
            let path = call.input()["path"].as_str().unwrap_or("README.md").to_owned();
            Ok::<_, ToolError>(json!({ "path": path, "bytes": 1024 }))
        },
    )?;

    registry.register_tool(
        ToolMetadata::new("fs.delete", "1.0.0")?.with_risk_class(RiskClass::High),
        |_call: ProposedToolCall| async move { Ok::<_, ToolError>(json!({ "deleted": true })) },
    )?;

    registry.register_tool(
        ToolMetadata::new("db.migrate", "1.0.0")?
            .with_description("Applies a schema migration")
            .with_risk_class(RiskClass::High),
        |call: ProposedToolCall| async move {
            Ok::<_, ToolError>(json!({ "applied": call.input()["version"].clone() }))
        },
    )?;

    // Publishes without a URL so the postcondition fails and the upload is undone.
    registry.register_tool(
        ToolMetadata::new("media.publish", "1.0.0")?.with_risk_class(RiskClass::Medium),
        |_call: ProposedToolCall| async move {
            Ok::<_, ToolError>(json!({ "asset_id": "asset-7", "url": Value::Null }))
        },
    )?;

    registry.register_tool(
        ToolMetadata::new("email.send", "1.0.0")?.with_risk_class(RiskClass::Medium),
        |_call: ProposedToolCall| async move {
            Err::<Value, _>(ToolError::execution("smtp relay refused the connection"))
        },
    )?;

    Ok(registry)
}

fn postconditions() -> Result<PostConditionRegistry> {
    let registry = PostConditionRegistry::new()
        .with(
            "media.publish",
            PostCondition::critical("asset-has-url", "published asset has a public URL", |ctx| {
                ctx.output()
                    .and_then(|output| output["url"].as_str())
                    .is_some_and(|url| !url.is_empty())
            })?,
        )?
        .with(
            "email.send",
            PostCondition::critical("message-accepted", "relay accepted the message", |ctx| {
                ctx.execution_error().is_none()
            })?,
        )?;
    Ok(registry)
}

fn compensation() -> CompensationRegistry {
    let registry = CompensationRegistry::new();
    registry.register_automated(
        "media.publish",
        "uploaded assets can be deleted",
        |ctx: CompensationContext| async move {
            let asset = ctx
                .output
                .as_ref()
                .and_then(|output| output["asset_id"].as_str())
                .map(str::to_owned);
            match asset {
                Some(asset) => CompensationOutcome::succeeded(format!("deleted {asset}")),
                None => CompensationOutcome::failed("no asset id to delete"),
            }
        },
    );
    registry.set_eligibility(CompensationEligibility::manual(
        "email.send",
        "sent mail cannot be recalled",
    ));
    registry
}

fn scripted_calls() -> Result<Vec<ProposedToolCall>> {
    let calls = vec![
        ProposedToolCall::builder("fs.read")
            .risk_class(RiskClass::Low)
            .input(json!({ "path": "notes/plan.md" }))
            .build()?,
        ProposedToolCall::builder("fs.delete")
            .risk_class(RiskClass::High)
            .input(json!({ "path": "notes/plan.md" }))
            .build()?,
        ProposedToolCall::builder("db.migrate")
            .risk_class(RiskClass::High)
            .input(json!({ "version": 42 }))
            .build()?,
        ProposedToolCall::builder("media.publish")
            .risk_class(RiskClass::Medium)
            .input(json!({ "file": "banner.png" }))
            .build()?,
        ProposedToolCall::builder("email.send")
            .risk_class(RiskClass::Medium)
            .input(json!({ "to": "ops@example.com" }))
            .build()?,
    ];
    Ok(calls)
}

fn spawn_operator(gate: ApprovalGate, mode: ApproverMode) -> JoinHandle<()> {
    let mut requests = gate.subscribe();
    tokio::spawn(async move {
        loop {
            let request = match requests.recv().await {
                Ok(request) => request,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "operator fell behind on approval requests");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let decision = match mode {
                ApproverMode::Approve => ApprovalDecision::Approved,
                ApproverMode::Deny => ApprovalDecision::Denied,
                ApproverMode::Ignore => {
                    info!(approval_id = %request.id(), tool = request.call().tool(), "leaving request unanswered");
                    continue;
                }
            };
            let resolved = gate.resolve(request.id(), decision, Some("demo-operator"));
            info!(
                approval_id = %request.id(),
                tool = request.call().tool(),
                %decision,
                resolved,
                "operator answered"
            );
        }
    })
}

fn report(result: &OrchestratedResult, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    if let Some(error) = &result.planning_error {
        println!("request {}: not planned ({error})", result.request_id);
        return Ok(());
    }
    for step in &result.steps {
        let trace = &step.result;
        println!(
            "{:<14} {:<22} {}",
            trace.tool,
            trace.outcome.as_str(),
            trace.reason_chain()
        );
    }
    if let Some(index) = result.halted_at {
        println!("request {} halted at step {index}", result.request_id);
    }
    Ok(())
}
