//! Recovery controller - converges a failed run without destroying anything
//!
//! A phase is satisfied when it completed, every resource it renders is
//! tracked live and the remote system shows each one in the state its
//! readiness predicate asks for. Unsatisfied phases are re-driven in order
//! through the phase executor; satisfied phases are skipped.

use crate::backoff::Backoff;
use crate::context::ProgressCallback;
use crate::error::{Error, Result};
use crate::executor::{Entry, PhaseExecutor, satisfies};
use crate::run::{DeploymentRun, RunState};
use crate::types::{PhaseStatus, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options for recovery
#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    /// Maximum reconciliation passes
    pub max_attempts: u32,
    /// Delay between passes
    pub backoff: Backoff,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::new(Duration::from_secs(5), 2.0, Duration::from_secs(60)),
        }
    }
}

/// What a reconciliation did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryResult {
    /// Earliest phase that had to be re-driven
    pub resumed_from_phase: Option<String>,
    /// Resources that did not exist and were created again
    pub resources_recreated: usize,
    /// Phases re-driven, in execution order
    pub phases_rerun: Vec<String>,
    /// Passes that re-drove at least one phase
    pub attempts: u32,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RecoveryResult {
    /// Whether the run was already converged
    pub fn was_noop(&self) -> bool {
        self.phases_rerun.is_empty()
    }
}

/// Re-drives unsatisfied phases of a run
pub struct RecoveryController<'e, 'a> {
    executor: &'e PhaseExecutor<'a>,
    options: RecoveryOptions,
}

impl<'e, 'a> RecoveryController<'e, 'a> {
    pub fn new(executor: &'e PhaseExecutor<'a>, options: RecoveryOptions) -> Self {
        Self { executor, options }
    }

    /// Whether the phase at `index` needs no further work
    pub fn is_satisfied(&self, run: &DeploymentRun, index: usize) -> Result<bool> {
        let Some(phase) = run.plan().phases().get(index) else {
            return Err(Error::InvalidPlan(format!("no phase at position {index}")));
        };
        if run.phases().get(index).map(|r| r.status) != Some(PhaseStatus::Completed) {
            return Ok(false);
        }

        let timeout = self.executor.options().request_timeout;
        for spec in self.executor.render(run, phase)? {
            let tracked = run
                .tracker()
                .get(&spec.key)
                .is_some_and(|r| r.is_live() && satisfies(phase.readiness, Some(r.status)));
            if !tracked {
                log::debug!("{} is not tracked in a satisfying state", spec.key);
                return Ok(false);
            }

            match self.executor.remote().get(&spec.key, timeout) {
                Ok(Some(status)) if satisfies(phase.readiness, Some(status)) => {}
                Ok(observed) => {
                    log::debug!("{} observed as {observed:?}", spec.key);
                    return Ok(false);
                }
                Err(e) => {
                    log::debug!("cannot observe {}: {e}", spec.key);
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Positions of every unsatisfied phase, in plan order
    pub fn unsatisfied_phases(&self, run: &DeploymentRun) -> Result<Vec<usize>> {
        let mut pending = Vec::new();
        for index in 0..run.plan().phases().len() {
            if !self.is_satisfied(run, index)? {
                pending.push(index);
            }
        }
        Ok(pending)
    }

    /// Converge `run` toward its desired state
    ///
    /// Render failures propagate. The run is left in `Reconciling` or in the
    /// last phase it re-drove; finishing it is up to the caller.
    pub fn reconcile(
        &self,
        run: &mut DeploymentRun,
        progress: &mut dyn ProgressCallback,
    ) -> Result<RecoveryResult> {
        let started_at = Utc::now();
        let mut result = RecoveryResult {
            resumed_from_phase: None,
            resources_recreated: 0,
            phases_rerun: Vec::new(),
            attempts: 0,
            status: RunStatus::Failed,
            started_at,
            finished_at: started_at,
        };

        let clock = self.executor.clock();
        let max_attempts = self.options.max_attempts.max(1);
        let mut converged = false;
        let mut progressed = false;

        while result.attempts < max_attempts {
            if run.state() != RunState::Reconciling {
                run.transition(RunState::Reconciling)?;
            }

            let pending = self.unsatisfied_phases(run)?;
            if pending.is_empty() {
                converged = true;
                break;
            }
            if result.attempts > 0 {
                let delay = self.options.backoff.delay_for_attempt(result.attempts - 1);
                log::info!("recovery pass {} in {delay:?}", result.attempts + 1);
                clock.sleep(delay);
            }
            result.attempts += 1;

            if result.resumed_from_phase.is_none() {
                let first = &run.plan().phases()[pending[0]];
                log::info!("resuming from phase {} ({})", first.id, first.ordinal);
                result.resumed_from_phase = Some(first.id.clone());
            }

            let mut failed = false;
            for index in pending {
                let phase_result = self
                    .executor
                    .execute_phase(run, index, Entry::Recovery, progress)?;
                let phase_id = run.plan().phases()[index].id.clone();
                result.resources_recreated += phase_result.summary().created;
                result.phases_rerun.push(phase_id);

                if phase_result.is_completed() {
                    progressed = true;
                } else {
                    failed = true;
                    break;
                }
            }

            if !failed {
                converged = true;
                break;
            }
            if self.executor.is_cancelled() {
                break;
            }
        }

        result.status = if converged {
            RunStatus::Succeeded
        } else if progressed {
            RunStatus::PartiallyRecovered
        } else {
            RunStatus::Failed
        };
        result.finished_at = Utc::now();

        log::info!(
            "recovery {}: {} phase run(s), {} resource(s) recreated",
            result.status,
            result.phases_rerun.len(),
            result.resources_recreated
        );
        Ok(result)
    }
}
