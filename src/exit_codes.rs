//! Stable exit codes for bosun commands.

use rollout::{FailureCause, RunStatus};

/// Command succeeded.
pub const OK: i32 = 0;
/// A prerequisite failed, or the command failed for another reason (bad plan
/// file, I/O, no persisted run).
pub const PREREQUISITE: i32 = 1;
/// A phase could not be rendered, applied or made ready.
pub const PHASE: i32 = 2;
/// A critical validation check failed, or the success rate was below the
/// requested minimum.
pub const VALIDATION: i32 = 3;
/// Teardown left tracked resources behind.
pub const TEARDOWN_LEAK: i32 = 4;

/// Exit code for a finished run
pub fn for_outcome(status: RunStatus, cause: Option<&FailureCause>) -> i32 {
    if status.is_success() {
        return OK;
    }
    match cause {
        Some(FailureCause::Prerequisite { .. }) => PREREQUISITE,
        Some(FailureCause::Validation { .. }) => VALIDATION,
        Some(FailureCause::Phase { .. }) => PHASE,
        None => PREREQUISITE,
    }
}

/// Exit code for an error that escaped a command
pub fn for_error(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<rollout::Error>() {
        Some(rollout::Error::PrerequisiteFailure { .. }) => PREREQUISITE,
        Some(
            rollout::Error::ConfigRender { .. }
            | rollout::Error::Apply { .. }
            | rollout::Error::ReadinessTimeout { .. }
            | rollout::Error::Cancelled { .. },
        ) => PHASE,
        Some(rollout::Error::ValidationFailure { .. }) => VALIDATION,
        Some(rollout::Error::TeardownLeak { .. }) => TEARDOWN_LEAK,
        _ => PREREQUISITE,
    }
}
