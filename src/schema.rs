//! Plan file schema (`bosun.toml` / `bosun.json`)
//!
//! ```toml
//! [plan]
//! name = "platform"
//! namespace = "platform"
//!
//! [remote]
//! context = "staging-admin"
//!
//! [prerequisites]
//! capabilities = ["certificates.cert-manager.io"]
//!
//! [[phases]]
//! id = "namespaces"
//! timeout_secs = 60
//! readiness = "exists"
//!
//! [[phases.resources]]
//! kind = "Namespace"
//! name = "${namespace}"
//! manifest = "manifests/namespace.yaml"
//!
//! [environments.production]
//! timeout_scale = 2.0
//! namespace = "platform-prod"
//! ```

use rollout::{Readiness, Severity};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Kinds that never live in a namespace
pub const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "PersistentVolume",
    "StorageClass",
    "PriorityClass",
    "IngressClass",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFile {
    pub plan: PlanSection,

    #[serde(default)]
    pub remote: RemoteSection,

    #[serde(default)]
    pub prerequisites: PrerequisitesSection,

    #[serde(default)]
    pub phases: Vec<PhaseDef>,

    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentDef>,

    #[serde(default)]
    pub checks: Vec<CheckDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSection {
    pub name: String,
    /// Default namespace for namespaced resources
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSection {
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
    /// kubeconfig context; current context when unset
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            kubectl: default_kubectl(),
            context: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrerequisitesSection {
    /// Missing capability aborts the run
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Missing capability is only a warning
    #[serde(default)]
    pub optional_capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDef {
    pub id: String,
    /// Defaults to the phase's position, starting at 1
    #[serde(default)]
    pub ordinal: Option<u32>,
    pub timeout_secs: u64,
    #[serde(default)]
    pub readiness: Readiness,
    #[serde(default)]
    pub expected_kinds: BTreeSet<String>,
    #[serde(default)]
    pub resources: Vec<ResourceDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDef {
    pub kind: String,
    pub name: String,
    /// Overrides the plan / environment namespace
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub manifest: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ResourceDef {
    pub fn is_cluster_scoped(&self) -> bool {
        CLUSTER_SCOPED_KINDS.contains(&self.kind.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentDef {
    #[serde(default)]
    pub timeout_scale: Option<f64>,
    #[serde(default)]
    pub max_resources: Option<usize>,
    /// Replaces `plan.namespace`
    #[serde(default)]
    pub namespace: Option<String>,
    /// Resource names left out of this environment
    #[serde(default)]
    pub exclude: BTreeSet<String>,
    /// Extra resources, each attached to a phase
    #[serde(default)]
    pub resources: Vec<OverlayResourceDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayResourceDef {
    pub phase: String,
    #[serde(flatten)]
    pub resource: ResourceDef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CheckDef {
    Http(HttpCheckDef),
    Resource(ResourceCheckDef),
}

impl CheckDef {
    pub fn label(&self) -> &str {
        match self {
            Self::Http(def) => &def.name,
            Self::Resource(def) => &def.resource,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpCheckDef {
    pub name: String,
    pub url: String,
    #[serde(default = "default_expect_status")]
    pub expect_status: u16,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(default = "default_http_category")]
    pub category: String,
    #[serde(default = "default_check_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// Slower responses pass with a warning
    #[serde(default)]
    pub max_response_ms: Option<u64>,
    #[serde(default)]
    pub remediation: Option<String>,
}

fn default_expect_status() -> u16 {
    200
}

fn default_severity() -> Severity {
    Severity::Critical
}

fn default_http_category() -> String {
    "Endpoints".to_string()
}

fn default_check_timeout() -> u64 {
    10
}

fn default_retry_delay() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceCheckDef {
    /// `Kind/namespace/name`, or `Kind/name` when cluster-scoped
    pub resource: String,
    /// Require readiness rather than mere existence
    #[serde(default = "default_true")]
    pub ready: bool,
    #[serde(default = "default_severity")]
    pub severity: Severity,
}

fn default_true() -> bool {
    true
}
