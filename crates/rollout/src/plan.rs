//! Deployment plan - ordered phases targeting one environment

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

/// Target environment and its resource budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    /// Multiplier applied to every phase timeout
    #[serde(default = "default_timeout_scale")]
    pub timeout_scale: f64,
    /// Upper bound on resources a run may own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_resources: Option<usize>,
}

fn default_timeout_scale() -> f64 {
    1.0
}

impl Environment {
    /// Create an environment with default budgets
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout_scale: default_timeout_scale(),
            max_resources: None,
        }
    }
}

/// When a phase counts as complete
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Readiness {
    /// Every resource of the phase is observed ready
    #[default]
    AllReady,
    /// Every resource of the phase exists remotely
    Exists,
    /// No readiness polling
    Skip,
}

/// One ordered step of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub ordinal: u32,
    /// Resource kinds this phase may produce; empty means any
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub expected_kinds: BTreeSet<String>,
    #[serde(default)]
    pub readiness: Readiness,
    pub timeout_secs: u64,
}

impl Phase {
    /// Create a phase that waits for all its resources to become ready
    pub fn new(id: impl Into<String>, ordinal: u32, timeout_secs: u64) -> Self {
        Self {
            id: id.into(),
            ordinal,
            expected_kinds: BTreeSet::new(),
            readiness: Readiness::default(),
            timeout_secs,
        }
    }

    /// Builder: set the readiness predicate
    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    /// Builder: restrict the kinds this phase may produce
    pub fn expecting<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Configured timeout before environment scaling
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Whether a rendered kind is allowed in this phase
    pub fn allows_kind(&self, kind: &str) -> bool {
        self.expected_kinds.is_empty() || self.expected_kinds.contains(kind)
    }
}

/// Ordered phases plus the target environment
///
/// Immutable once a run starts: a [`crate::DeploymentRun`] owns its plan and
/// only hands out shared references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    name: String,
    environment: Environment,
    phases: Vec<Phase>,
}

impl DeploymentPlan {
    /// Build a plan, rejecting duplicate ids, non-increasing ordinals and
    /// zero timeouts
    pub fn new(name: impl Into<String>, environment: Environment, phases: Vec<Phase>) -> Result<Self> {
        let plan = Self {
            name: name.into(),
            environment,
            phases,
        };
        plan.validate()?;
        Ok(plan)
    }

    fn validate(&self) -> Result<()> {
        if self.phases.is_empty() {
            return Err(Error::InvalidPlan(format!("plan '{}' has no phases", self.name)));
        }
        let scale = self.environment.timeout_scale;
        if !scale.is_finite() || scale <= 0.0 {
            return Err(Error::InvalidPlan(format!(
                "environment '{}' has timeout scale {scale}; expected a finite positive number",
                self.environment.name
            )));
        }

        let mut seen = HashSet::new();
        let mut last_ordinal: Option<u32> = None;
        for phase in &self.phases {
            if !seen.insert(phase.id.as_str()) {
                return Err(Error::InvalidPlan(format!("duplicate phase '{}'", phase.id)));
            }
            if let Some(last) = last_ordinal
                && phase.ordinal <= last
            {
                return Err(Error::InvalidPlan(format!(
                    "phase '{}' has ordinal {} after ordinal {}",
                    phase.id, phase.ordinal, last
                )));
            }
            if phase.timeout_secs == 0 {
                return Err(Error::InvalidPlan(format!("phase '{}' has a zero timeout", phase.id)));
            }
            if scaled_timeout(phase.timeout_secs, scale).is_none() {
                return Err(Error::InvalidPlan(format!(
                    "phase '{}' timeout of {}s scaled by {scale} is out of range",
                    phase.id, phase.timeout_secs
                )));
            }
            last_ordinal = Some(phase.ordinal);
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Find a phase by id
    pub fn phase(&self, id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == id)
    }

    /// Position of a phase in execution order
    pub fn phase_index(&self, id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.id == id)
    }

    /// Phase timeout after applying the environment's scale
    ///
    /// Saturates at [`Duration::MAX`]; plans restored from a run file skip
    /// validation.
    pub fn effective_timeout(&self, phase: &Phase) -> Duration {
        scaled_timeout(phase.timeout_secs, self.environment.timeout_scale)
            .unwrap_or(Duration::MAX)
    }
}

#[allow(clippy::cast_precision_loss)]
fn scaled_timeout(secs: u64, scale: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs as f64 * scale).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phases() -> Vec<Phase> {
        vec![
            Phase::new("namespaces", 1, 60),
            Phase::new("operators", 2, 300),
            Phase::new("workloads", 3, 600),
        ]
    }

    #[test]
    fn test_valid_plan() {
        let plan = DeploymentPlan::new("platform", Environment::new("development"), phases()).unwrap();
        assert_eq!(plan.phases().len(), 3);
        assert_eq!(plan.phase_index("operators"), Some(1));
        assert!(plan.phase("missing").is_none());
    }

    #[test]
    fn test_rejects_duplicate_phase() {
        let mut p = phases();
        p.push(Phase::new("namespaces", 4, 60));
        let err = DeploymentPlan::new("platform", Environment::new("dev"), p).unwrap_err();
        assert!(err.to_string().contains("duplicate phase"));
    }

    #[test]
    fn test_rejects_non_monotonic_ordinals() {
        let p = vec![Phase::new("a", 2, 60), Phase::new("b", 2, 60)];
        assert!(DeploymentPlan::new("platform", Environment::new("dev"), p).is_err());
    }

    #[test]
    fn test_rejects_empty_plan() {
        assert!(DeploymentPlan::new("platform", Environment::new("dev"), vec![]).is_err());
    }

    #[test]
    fn test_effective_timeout_scaled() {
        let mut env = Environment::new("production");
        env.timeout_scale = 2.0;
        let plan = DeploymentPlan::new("platform", env, phases()).unwrap();
        let operators = plan.phase("operators").unwrap();
        assert_eq!(plan.effective_timeout(operators), Duration::from_secs(600));
    }

    #[test]
    fn test_rejects_unusable_timeout_scale() {
        for scale in [f64::NAN, f64::INFINITY, -1.0, 0.0, 1e300] {
            let mut env = Environment::new("production");
            env.timeout_scale = scale;
            let err = DeploymentPlan::new("platform", env, phases()).unwrap_err();
            assert!(matches!(err, Error::InvalidPlan(_)), "scale {scale}: {err}");
        }
    }

    #[test]
    fn test_effective_timeout_saturates_for_restored_plan() {
        let mut plan = DeploymentPlan::new("platform", Environment::new("dev"), phases()).unwrap();
        plan.environment.timeout_scale = f64::NAN;
        assert_eq!(plan.effective_timeout(&plan.phases[0]), Duration::MAX);
        plan.environment.timeout_scale = 1e300;
        assert_eq!(plan.effective_timeout(&plan.phases[2]), Duration::MAX);
    }

    #[test]
    fn test_allows_kind() {
        let phase = Phase::new("storage", 1, 60).expecting(["PersistentVolumeClaim"]);
        assert!(phase.allows_kind("PersistentVolumeClaim"));
        assert!(!phase.allows_kind("Deployment"));
        assert!(Phase::new("any", 2, 60).allows_kind("Deployment"));
    }
}
