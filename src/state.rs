use anyhow::{Context, Result};
use rollout::DeploymentRun;
use std::fs;
use std::path::{Path, PathBuf};

use crate::paths;

// ============================================================================
// Run Store
// ============================================================================

/// Persisted runs, one per environment
///
/// ```text
/// <state_dir>/
///   <environment>/
///     run.json            latest run, ledger included
///     reports/<run-id>.json
/// ```
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    /// Store under the resolved state directory
    pub fn open() -> Result<Self> {
        Ok(Self::at(paths::state_dir()?))
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn environment_dir(&self, environment: &str) -> PathBuf {
        self.root.join(environment)
    }

    pub fn run_file(&self, environment: &str) -> PathBuf {
        self.environment_dir(environment).join("run.json")
    }

    pub fn reports_dir(&self, environment: &str) -> PathBuf {
        self.environment_dir(environment).join("reports")
    }

    /// Load the latest run for `environment`, if any
    pub fn load(&self, environment: &str) -> Result<Option<DeploymentRun>> {
        let path = self.run_file(environment);

        if !path.exists() {
            log::debug!("No persisted run at {}", path.display());
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read run file: {}", path.display()))?;
        let run: DeploymentRun = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse run file: {}", path.display()))?;

        log::debug!("Loaded run {} from {}", run.id(), path.display());
        Ok(Some(run))
    }

    /// Load the latest run, failing with a hint when there is none
    pub fn require(&self, environment: &str) -> Result<DeploymentRun> {
        self.load(environment)?.with_context(|| {
            format!("No deployment recorded for '{environment}'. Run `bosun deploy -e {environment}` first.")
        })
    }

    /// Save a run, replacing the previous one atomically
    pub fn save(&self, run: &DeploymentRun) -> Result<()> {
        let environment = &run.plan().environment().name;
        let dir = self.environment_dir(environment);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;

        let path = self.run_file(environment);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(run).context("Failed to serialize run")?;
        fs::write(&tmp, content)
            .with_context(|| format!("Failed to write run file: {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace run file: {}", path.display()))?;

        log::debug!("Saved run {} to {}", run.id(), path.display());
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rollout::{DeploymentPlan, Environment, Phase, ResourceSpec, ResourceTracker};

    fn run(environment: &str) -> DeploymentRun {
        let phase = Phase::new("namespaces", 1, 60);
        let mut tracker = ResourceTracker::new();
        tracker.track(&ResourceSpec::cluster_scoped("Namespace", "platform"), &phase);
        let plan =
            DeploymentPlan::new("platform", Environment::new(environment), vec![phase]).unwrap();
        DeploymentRun::new(plan).with_tracker(tracker)
    }

    #[test]
    fn test_load_missing_is_none() {
        let temp = tempfile::tempdir().unwrap();
        let store = RunStore::at(temp.path());
        assert!(store.load("staging").unwrap().is_none());
        assert!(store.require("staging").is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let store = RunStore::at(temp.path());
        let original = run("staging");

        store.save(&original).unwrap();
        let loaded = store.require("staging").unwrap();

        assert_eq!(loaded.id(), original.id());
        assert_eq!(loaded.tracker().len(), 1);
        assert!(store.run_file("staging").exists());
        assert!(!store.run_file("staging").with_extension("json.tmp").exists());
    }

    #[test]
    fn test_environments_are_isolated() {
        let temp = tempfile::tempdir().unwrap();
        let store = RunStore::at(temp.path());
        store.save(&run("staging")).unwrap();

        assert!(store.load("production").unwrap().is_none());
        assert_eq!(
            store.reports_dir("staging"),
            temp.path().join("staging").join("reports")
        );
    }

    #[test]
    fn test_corrupt_run_file_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let store = RunStore::at(temp.path());
        fs::create_dir_all(store.environment_dir("staging")).unwrap();
        fs::write(store.run_file("staging"), "{ not json").unwrap();

        let err = store.load("staging").unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse run file"));
    }
}
