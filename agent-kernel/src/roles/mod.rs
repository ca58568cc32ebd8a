//! Named seams the orchestrator composes around the pipeline.

pub mod auditor;
pub mod executor;
pub mod memory_writer;
pub mod planner;
pub mod safe_mode;
pub mod verifier;

pub use auditor::{AuditConfig, AuditReport, AuditorRole, DriftAuditor, DriftFinding, DriftKind};
pub use executor::ExecutorRole;
pub use memory_writer::{GatedMemoryWriter, MemoryWriteReport, MemoryWriteRequest, MemoryWriterRole};
pub use planner::{
    DirectPlanner, ExecutionPlan, KernelRequest, PlanError, PlanStep, PlannerRole, RequestedCall,
};
pub use safe_mode::{
    SafeModeController, SafeModeError, SafeModeEvent, SafeModeEventKind, SafeModeStatus,
};
pub use verifier::{PostConditionVerifier, VerifierRole};
