//! Prerequisite checker - gates a run before any mutation
//!
//! Checks run in a fixed order. The first fatal failure stops the pass; the
//! caller must not execute any phase afterwards. Non-fatal failures are kept
//! as warnings.

use crate::context::RemoteState;
use crate::plan::Environment;
use crate::types::ResourceKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Pass/fail plus a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    pub message: String,
}

impl Verdict {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
        }
    }
}

/// One environment-readiness check
///
/// Implementations must be side-effect free.
pub trait PrerequisiteCheck: Send + Sync {
    fn name(&self) -> String;

    /// A failing fatal check aborts the run
    fn fatal(&self) -> bool {
        true
    }

    fn check(&self, environment: &Environment) -> anyhow::Result<Verdict>;
}

/// Recorded result of one check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrerequisiteResult {
    pub name: String,
    pub fatal: bool,
    pub passed: bool,
    pub message: String,
}

/// Outcome of a prerequisite pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrerequisiteReport {
    pub passed: Vec<PrerequisiteResult>,
    pub failed: Vec<PrerequisiteResult>,
}

impl PrerequisiteReport {
    /// The fatal failure that stopped the pass, if any
    pub fn fatal_failure(&self) -> Option<&PrerequisiteResult> {
        self.failed.iter().find(|r| r.fatal)
    }

    /// Whether phase execution may proceed
    pub fn can_proceed(&self) -> bool {
        self.fatal_failure().is_none()
    }

    /// Non-fatal failures
    pub fn warnings(&self) -> impl Iterator<Item = &PrerequisiteResult> {
        self.failed.iter().filter(|r| !r.fatal)
    }
}

/// Which capabilities and namespaces the built-in checks verify
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrerequisiteSettings {
    /// Capabilities whose absence aborts the run
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Capabilities whose absence is only a warning
    #[serde(default)]
    pub optional_capabilities: Vec<String>,
    /// Namespaces the plan deploys into
    #[serde(default)]
    pub namespaces: Vec<String>,
}

/// Run `checks` in order, stopping at the first fatal failure
pub fn run_prerequisites(
    environment: &Environment,
    checks: &[Box<dyn PrerequisiteCheck + '_>],
) -> PrerequisiteReport {
    let mut report = PrerequisiteReport::default();

    for check in checks {
        let name = check.name();
        let fatal = check.fatal();
        let verdict = check
            .check(environment)
            .unwrap_or_else(|e| Verdict::fail(format!("{e:#}")));

        let result = PrerequisiteResult {
            name,
            fatal,
            passed: verdict.passed,
            message: verdict.message,
        };

        if result.passed {
            log::debug!("prerequisite {} passed: {}", result.name, result.message);
            report.passed.push(result);
        } else if fatal {
            log::error!("prerequisite {} failed: {}", result.name, result.message);
            report.failed.push(result);
            break;
        } else {
            log::warn!("prerequisite {} failed (non-fatal): {}", result.name, result.message);
            report.failed.push(result);
        }
    }

    report
}

/// Built-in checks, in their fixed order: access, capabilities, namespaces
pub fn standard_checks<'a>(
    remote: &'a dyn RemoteState,
    settings: &PrerequisiteSettings,
    owned: &BTreeSet<ResourceKey>,
    timeout: Duration,
) -> Vec<Box<dyn PrerequisiteCheck + 'a>> {
    let mut checks: Vec<Box<dyn PrerequisiteCheck + 'a>> =
        vec![Box::new(ClusterAccess { remote, timeout })];

    for name in &settings.capabilities {
        checks.push(Box::new(Capability {
            remote,
            name: name.clone(),
            fatal: true,
            timeout,
        }));
    }
    for name in &settings.optional_capabilities {
        checks.push(Box::new(Capability {
            remote,
            name: name.clone(),
            fatal: false,
            timeout,
        }));
    }
    for namespace in &settings.namespaces {
        let key = ResourceKey::cluster_scoped("Namespace", namespace);
        checks.push(Box::new(NamespaceOwnership {
            remote,
            owned: owned.contains(&key),
            key,
            timeout,
        }));
    }

    checks
}

/// Remote login / token validity
struct ClusterAccess<'a> {
    remote: &'a dyn RemoteState,
    timeout: Duration,
}

impl PrerequisiteCheck for ClusterAccess<'_> {
    fn name(&self) -> String {
        "cluster-access".to_string()
    }

    fn check(&self, _environment: &Environment) -> anyhow::Result<Verdict> {
        Ok(match self.remote.check_access(self.timeout) {
            Ok(identity) => Verdict::pass(format!("authenticated as {identity}")),
            Err(e) => Verdict::fail(format!("cannot authenticate: {e}")),
        })
    }
}

/// Required API group / operator presence
struct Capability<'a> {
    remote: &'a dyn RemoteState,
    name: String,
    fatal: bool,
    timeout: Duration,
}

impl PrerequisiteCheck for Capability<'_> {
    fn name(&self) -> String {
        format!("capability:{}", self.name)
    }

    fn fatal(&self) -> bool {
        self.fatal
    }

    fn check(&self, _environment: &Environment) -> anyhow::Result<Verdict> {
        if self.remote.has_capability(&self.name, self.timeout)? {
            Ok(Verdict::pass(format!("{} is installed", self.name)))
        } else {
            Ok(Verdict::fail(format!("{} is not installed", self.name)))
        }
    }
}

/// A namespace must be absent or already owned by this environment
struct NamespaceOwnership<'a> {
    remote: &'a dyn RemoteState,
    key: ResourceKey,
    owned: bool,
    timeout: Duration,
}

impl PrerequisiteCheck for NamespaceOwnership<'_> {
    fn name(&self) -> String {
        format!("namespace:{}", self.key.name)
    }

    fn check(&self, environment: &Environment) -> anyhow::Result<Verdict> {
        match self.remote.get(&self.key, self.timeout)? {
            None => Ok(Verdict::pass("namespace is free")),
            Some(_) if self.owned => Ok(Verdict::pass(format!(
                "namespace is owned by environment '{}'",
                environment.name
            ))),
            Some(_) => Ok(Verdict::fail(format!(
                "namespace exists and is not managed by environment '{}'",
                environment.name
            ))),
        }
    }
}
