//! # Rollout
//!
//! Phased deployment orchestration against an eventually-consistent remote
//! system.
//!
//! A deployment is described by a [`DeploymentPlan`]: an ordered list of
//! [`Phase`]s targeting one [`Environment`]. Running a plan walks a bounded
//! lifecycle:
//!
//! 1. **Prerequisites** - fast, side-effect-free gate (access, capabilities,
//!    namespace ownership). A failing fatal check aborts before any mutation.
//! 2. **Phases** - each phase renders its desired resources, upserts them,
//!    registers them with the [`ResourceTracker`] and polls readiness with
//!    bounded backoff.
//! 3. **Validation** - independent checks run on a bounded worker pool and are
//!    aggregated by severity.
//! 4. **Recovery** - a failed run is reconciled by re-driving the earliest
//!    unsatisfied phase and everything after it.
//! 5. **Teardown** - tracked resources are deleted and the zero-leak
//!    invariant is asserted.
//!
//! ## Provider Traits
//!
//! The engine never talks to a cluster or reads manifests itself:
//!
//! - [`RemoteState`]: apply / get / delete / readiness against the remote system
//! - [`ConfigRenderer`]: desired resources for an environment and phase
//! - [`ProgressCallback`]: receives progress updates
//! - [`Clock`]: time source, replaceable in tests
//!
//! ## Example
//!
//! ```ignore
//! use rollout::{
//!     DeploymentPlan, DeploymentRun, Environment, NoProgress, Orchestrator, Phase,
//!     memory::{MemoryCluster, StaticRenderer},
//! };
//!
//! let plan = DeploymentPlan::new(
//!     "platform",
//!     Environment::new("development"),
//!     vec![Phase::new("namespaces", 1, 60), Phase::new("operators", 2, 300)],
//! )?;
//! let cluster = MemoryCluster::new();
//! let renderer = StaticRenderer::new();
//! let orchestrator = Orchestrator::new(&cluster, &renderer);
//!
//! let mut run = DeploymentRun::new(plan);
//! let outcome = orchestrator.deploy(&mut run, &[], &mut NoProgress)?;
//! ```

pub mod backoff;
pub mod context;
pub mod error;
pub mod executor;
pub mod memory;
pub mod plan;
pub mod prereq;
pub mod recovery;
pub mod report;
pub mod resource;
pub mod run;
pub mod tracker;
pub mod types;
pub mod validation;

// Re-export main types at crate root
pub use backoff::{Backoff, PollOutcome, Retried};
pub use context::{
    CancelToken, Clock, ConfigRenderer, ManualClock, NoProgress, ProgressCallback, RemoteState,
    SystemClock,
};
pub use error::{Error, Result};
pub use executor::{Entry, ExecutorOptions, PhaseExecutor, PhaseResult};
pub use plan::{DeploymentPlan, Environment, Phase, Readiness};
pub use prereq::{
    PrerequisiteCheck, PrerequisiteReport, PrerequisiteResult, PrerequisiteSettings, Verdict,
    run_prerequisites,
};
pub use recovery::{RecoveryController, RecoveryOptions, RecoveryResult};
pub use report::{JsonFileSink, Report, ReportSink};
pub use resource::{ResourceRecord, ResourceSpec};
pub use run::{
    DeployOutcome, DeploymentRun, FailureCause, Orchestrator, OrchestratorOptions, PhaseRecord,
    RunState, TeardownReport,
};
pub use tracker::{DeleteOutcome, ResourceTracker};
pub use types::{
    ApplyOutcome, ApplySummary, CheckOutcome, PhaseStatus, ResourceKey, ResourceStatus, RunStatus,
    Severity,
};
pub use validation::{
    CheckContext, CheckResult, Finding, OutcomeCounts, ResourceCheck, ValidationCheck,
    ValidationOptions, ValidationReport, run_checks,
};
