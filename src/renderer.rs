//! Plan-file renderer: base phase resources plus environment overlays

use anyhow::{Result, bail};
use rollout::{ConfigRenderer, DeploymentPlan, Environment, Phase, ResourceSpec};
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::paths;
use crate::schema::{PlanFile, ResourceDef};

pub struct OverlayRenderer<'a> {
    file: &'a PlanFile,
    base_dir: PathBuf,
    /// Fail rendering when a manifest path does not exist
    check_manifests: bool,
}

impl<'a> OverlayRenderer<'a> {
    pub fn new(file: &'a PlanFile, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            file,
            base_dir: base_dir.into(),
            check_manifests: true,
        }
    }

    /// Skip manifest existence checks (dry listing)
    pub fn without_manifest_checks(mut self) -> Self {
        self.check_manifests = false;
        self
    }

    fn spec_for(
        &self,
        def: &ResourceDef,
        namespace: &str,
        vars: &[(&str, &str)],
    ) -> Result<ResourceSpec> {
        let key = def.key(namespace, vars);
        let mut spec = ResourceSpec::new(key.kind, key.namespace, key.name);
        spec.labels = def.labels.clone();
        spec.labels
            .insert("app.kubernetes.io/managed-by".to_string(), "bosun".to_string());

        if let Some(manifest) = &def.manifest {
            let path = paths::expand_manifest(manifest, &self.base_dir, vars);
            if self.check_manifests && !path.exists() {
                bail!("manifest {} for {} does not exist", path.display(), spec.key);
            }
            spec.manifest = Some(path);
        }
        Ok(spec)
    }

    /// Names of the Namespace resources `plan` would create
    pub fn namespaces(&self, plan: &DeploymentPlan) -> Result<Vec<String>> {
        let mut names = BTreeSet::new();
        for phase in plan.phases() {
            for spec in self.render(plan.environment(), phase)? {
                if spec.key.kind == "Namespace" {
                    names.insert(spec.key.name);
                }
            }
        }
        Ok(names.into_iter().collect())
    }
}

impl ConfigRenderer for OverlayRenderer<'_> {
    fn render(&self, environment: &Environment, phase: &Phase) -> Result<Vec<ResourceSpec>> {
        let Some(def) = self.file.phases.iter().find(|p| p.id == phase.id) else {
            bail!("phase '{}' is not declared in the plan file", phase.id);
        };
        let overlay = self.file.environments.get(&environment.name);

        let namespace = self.file.namespace_for(&environment.name);
        let vars = [
            ("environment", environment.name.as_str()),
            ("namespace", namespace),
        ];

        let extra = overlay
            .into_iter()
            .flat_map(|env| env.resources.iter())
            .filter(|r| r.phase == phase.id)
            .map(|r| &r.resource);

        let mut specs: Vec<ResourceSpec> = Vec::new();
        for resource in def.resources.iter().chain(extra) {
            if overlay.is_some_and(|env| env.exclude.contains(&resource.name)) {
                log::debug!(
                    "{} '{}' excluded from {}",
                    resource.kind,
                    resource.name,
                    environment.name
                );
                continue;
            }
            let spec = self.spec_for(resource, namespace, &vars)?;
            // Overlay entries replace a base resource with the same key
            specs.retain(|s| s.key != spec.key);
            specs.push(spec);
        }

        log::debug!(
            "rendered {} resource(s) for phase {} in {}",
            specs.len(),
            phase.id,
            environment.name
        );
        Ok(specs)
    }
}
