use anyhow::{Context, Result};
use rollout::{DeploymentPlan, Environment, Phase, PrerequisiteSettings, ResourceKey};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::schema::{CheckDef, PlanFile, ResourceDef};

/// Default plan file name, looked up in the working directory
pub const DEFAULT_PLAN_FILE: &str = "bosun.toml";

#[derive(Debug, Error)]
pub enum PlanFileError {
    #[error("unknown environment '{name}' (defined: {})", .known.join(", "))]
    UnknownEnvironment { name: String, known: Vec<String> },

    #[error("environment '{environment}' adds resources to unknown phase '{phase}'")]
    UnknownOverlayPhase { environment: String, phase: String },

    #[error("phase '{phase}' declares {kind} '{name}' twice")]
    DuplicateResource {
        phase: String,
        kind: String,
        name: String,
    },

    #[error("check '{check}': {message}")]
    InvalidCheck { check: String, message: String },

    #[error("invalid resource reference '{0}' (expected Kind/namespace/name or Kind/name)")]
    InvalidResourceRef(String),

    #[error("plan file has no phases")]
    NoPhases,
}

/// A parsed plan file plus the directory relative paths resolve against
#[derive(Debug, Clone)]
pub struct LoadedPlan {
    pub file: PlanFile,
    pub path: PathBuf,
    pub base_dir: PathBuf,
}

impl LoadedPlan {
    /// Load a plan file; `.json` is parsed as JSON, anything else as TOML
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read plan file {}", path.display()))?;

        let file: PlanFile = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid JSON in {}", path.display()))?
        } else {
            toml::from_str(&content).with_context(|| format!("Invalid TOML in {}", path.display()))?
        };
        file.validate()
            .with_context(|| format!("Invalid plan file {}", path.display()))?;

        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        log::debug!(
            "Loaded plan '{}' ({} phases) from {}",
            file.plan.name,
            file.phases.len(),
            path.display()
        );

        Ok(Self {
            file,
            path: path.to_path_buf(),
            base_dir,
        })
    }
}

impl PlanFile {
    /// Structural checks the engine cannot do itself
    pub fn validate(&self) -> Result<(), PlanFileError> {
        if self.phases.is_empty() {
            return Err(PlanFileError::NoPhases);
        }

        for phase in &self.phases {
            let mut seen = HashSet::new();
            for resource in &phase.resources {
                if !seen.insert((resource.kind.as_str(), resource.name.as_str())) {
                    return Err(PlanFileError::DuplicateResource {
                        phase: phase.id.clone(),
                        kind: resource.kind.clone(),
                        name: resource.name.clone(),
                    });
                }
            }
        }

        for (name, env) in &self.environments {
            for overlay in &env.resources {
                if !self.phases.iter().any(|p| p.id == overlay.phase) {
                    return Err(PlanFileError::UnknownOverlayPhase {
                        environment: name.clone(),
                        phase: overlay.phase.clone(),
                    });
                }
            }
        }

        for check in &self.checks {
            match check {
                CheckDef::Http(def) => {
                    if !def.url.starts_with("http://") && !def.url.starts_with("https://") {
                        return Err(PlanFileError::InvalidCheck {
                            check: def.name.clone(),
                            message: format!("'{}' is not an http(s) URL", def.url),
                        });
                    }
                    if def.timeout_secs == 0 {
                        return Err(PlanFileError::InvalidCheck {
                            check: def.name.clone(),
                            message: "timeout_secs must be positive".to_string(),
                        });
                    }
                }
                CheckDef::Resource(def) => {
                    parse_resource_ref(&def.resource)?;
                }
            }
        }

        Ok(())
    }

    pub fn environment_names(&self) -> Vec<String> {
        self.environments.keys().cloned().collect()
    }

    /// Namespace resources of `environment` default to
    pub fn namespace_for(&self, environment: &str) -> &str {
        self.environments
            .get(environment)
            .and_then(|env| env.namespace.as_deref())
            .unwrap_or(&self.plan.namespace)
    }

    /// Build the engine's plan for one declared environment
    pub fn plan_for(&self, environment: &str) -> Result<DeploymentPlan> {
        let Some(def) = self.environments.get(environment) else {
            return Err(PlanFileError::UnknownEnvironment {
                name: environment.to_string(),
                known: self.environment_names(),
            }
            .into());
        };

        let mut env = Environment::new(environment);
        if let Some(scale) = def.timeout_scale {
            env.timeout_scale = scale;
        }
        env.max_resources = def.max_resources;

        let phases = self
            .phases
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let ordinal = p.ordinal.unwrap_or(i as u32 + 1);
                Phase::new(&p.id, ordinal, p.timeout_secs)
                    .with_readiness(p.readiness)
                    .expecting(p.expected_kinds.iter().cloned())
            })
            .collect();

        Ok(DeploymentPlan::new(&self.plan.name, env, phases)?)
    }

    /// Settings for the built-in prerequisite checks
    pub fn prerequisite_settings(&self, namespaces: Vec<String>) -> PrerequisiteSettings {
        PrerequisiteSettings {
            capabilities: self.prerequisites.capabilities.clone(),
            optional_capabilities: self.prerequisites.optional_capabilities.clone(),
            namespaces,
        }
    }
}

/// Parse `Kind/namespace/name` or `Kind/name`
pub fn parse_resource_ref(reference: &str) -> Result<ResourceKey, PlanFileError> {
    let parts: Vec<&str> = reference.split('/').collect();
    if parts.iter().any(|p| p.trim().is_empty()) {
        return Err(PlanFileError::InvalidResourceRef(reference.to_string()));
    }
    match parts.as_slice() {
        [kind, name] => Ok(ResourceKey::cluster_scoped(*kind, *name)),
        [kind, namespace, name] => Ok(ResourceKey::new(*kind, *namespace, *name)),
        _ => Err(PlanFileError::InvalidResourceRef(reference.to_string())),
    }
}

impl ResourceDef {
    /// Resource key after namespace and name substitution
    pub fn key(&self, namespace: &str, vars: &[(&str, &str)]) -> ResourceKey {
        let name = crate::paths::expand_name(&self.name, vars);
        if self.is_cluster_scoped() {
            ResourceKey::cluster_scoped(&self.kind, name)
        } else {
            let namespace = self
                .namespace
                .as_deref()
                .map_or_else(|| namespace.to_string(), |ns| crate::paths::expand_name(ns, vars));
            ResourceKey::new(&self.kind, namespace, name)
        }
    }
}
