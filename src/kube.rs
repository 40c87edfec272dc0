//! `kubectl`-backed remote state
//!
//! Every call passes `--request-timeout` and is additionally bounded as a
//! child process, so a hung API server cannot stall a phase past its budget.

use rollout::{ApplyOutcome, RemoteState, ResourceKey, ResourceSpec, ResourceStatus};
use serde_json::Value;
use std::process::Command;
use std::time::Duration;

use crate::runner::{self, CommandOutput};
use crate::schema::RemoteSection;

/// Extra time granted to the child process beyond the API request timeout
const PROCESS_GRACE: Duration = Duration::from_secs(5);

/// stderr fragments that indicate a retryable API or network condition
const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "i/o timeout",
    "tls handshake timeout",
    "the server is currently unable",
    "etcdserver: request timed out",
    "too many requests",
    "context deadline exceeded",
    "unexpected eof",
    "the object has been modified",
    "service unavailable",
];

pub struct KubectlClient {
    binary: String,
    context: Option<String>,
}

impl KubectlClient {
    pub fn new(binary: impl Into<String>, context: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            context,
        }
    }

    pub fn from_config(remote: &RemoteSection) -> Self {
        Self::new(&remote.kubectl, remote.context.clone())
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn command(&self, args: &[String], timeout: Duration) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(base_args(self.context.as_deref(), timeout));
        cmd.args(args);
        cmd
    }

    fn run(&self, args: Vec<String>, timeout: Duration) -> rollout::Result<CommandOutput> {
        let cmd = self.command(&args, timeout);
        let output = runner::run_with_timeout(cmd, timeout + PROCESS_GRACE)
            .map_err(|e| rollout::Error::permanent(format!("{e:#}")))?;
        if output.timed_out {
            return Err(rollout::Error::transient(format!(
                "{} {} timed out after {}s",
                self.binary,
                args.join(" "),
                timeout.as_secs()
            )));
        }
        Ok(output)
    }

    /// Run and turn a non-zero exit into a classified error
    fn run_ok(&self, args: Vec<String>, timeout: Duration) -> rollout::Result<String> {
        let output = self.run(args, timeout)?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(classify_failure(&output.stderr))
        }
    }
}

impl RemoteState for KubectlClient {
    fn apply(&self, spec: &ResourceSpec, timeout: Duration) -> rollout::Result<ApplyOutcome> {
        let Some(manifest) = &spec.manifest else {
            return Err(rollout::Error::permanent(format!(
                "{} has no manifest to apply",
                spec.key
            )));
        };

        let mut args = vec![
            "apply".to_string(),
            "-f".to_string(),
            manifest.display().to_string(),
        ];
        if spec.key.is_namespaced() {
            args.extend(["-n".to_string(), spec.key.namespace.clone()]);
        }
        let stdout = self.run_ok(args, timeout)?;
        let outcome = parse_apply_outcome(&stdout, &spec.key).ok_or_else(|| {
            rollout::Error::permanent(format!(
                "{} did not apply {}: {}",
                manifest.display(),
                spec.key,
                stdout.trim()
            ))
        })?;

        if !spec.labels.is_empty() {
            let mut args = vec![
                "label".to_string(),
                "--overwrite".to_string(),
                object_ref(&spec.key),
            ];
            args.extend(namespace_args(&spec.key));
            args.extend(spec.labels.iter().map(|(k, v)| format!("{k}={v}")));
            self.run_ok(args, timeout)?;
        }

        log::debug!("kubectl apply {}: {outcome:?}", spec.key);
        Ok(outcome)
    }

    fn get(&self, key: &ResourceKey, timeout: Duration) -> rollout::Result<Option<ResourceStatus>> {
        let mut args = vec![
            "get".to_string(),
            object_ref(key),
            "--ignore-not-found".to_string(),
            "-o".to_string(),
            "json".to_string(),
        ];
        args.extend(namespace_args(key));
        let stdout = self.run_ok(args, timeout)?;
        if stdout.trim().is_empty() {
            return Ok(None);
        }
        let object: Value = serde_json::from_str(&stdout)?;
        Ok(Some(status_from_object(&object)))
    }

    fn delete(&self, key: &ResourceKey, timeout: Duration) -> rollout::Result<bool> {
        let mut args = vec![
            "delete".to_string(),
            object_ref(key),
            "--ignore-not-found".to_string(),
            "--wait=false".to_string(),
            "-o".to_string(),
            "name".to_string(),
        ];
        args.extend(namespace_args(key));
        let stdout = self.run_ok(args, timeout)?;
        Ok(!stdout.trim().is_empty())
    }

    fn check_access(&self, timeout: Duration) -> rollout::Result<String> {
        let args = vec![
            "auth".to_string(),
            "whoami".to_string(),
            "-o".to_string(),
            "jsonpath={.status.userInfo.username}".to_string(),
        ];
        let user = self.run_ok(args, timeout)?;
        let user = user.trim();
        Ok(if user.is_empty() {
            "anonymous".to_string()
        } else {
            user.to_string()
        })
    }

    /// A capability is either an installed CRD (`certificates.cert-manager.io`)
    /// or a served API group (`monitoring.coreos.com`)
    fn has_capability(&self, name: &str, timeout: Duration) -> rollout::Result<bool> {
        let crd = vec![
            "get".to_string(),
            "customresourcedefinition".to_string(),
            name.to_string(),
            "--ignore-not-found".to_string(),
            "-o".to_string(),
            "name".to_string(),
        ];
        if !self.run_ok(crd, timeout)?.trim().is_empty() {
            return Ok(true);
        }

        let group = vec![
            "api-resources".to_string(),
            format!("--api-group={name}"),
            "-o".to_string(),
            "name".to_string(),
        ];
        Ok(!self.run_ok(group, timeout)?.trim().is_empty())
    }
}

fn base_args(context: Option<&str>, timeout: Duration) -> Vec<String> {
    let mut args = vec![format!("--request-timeout={}s", timeout.as_secs().max(1))];
    if let Some(context) = context {
        args.push(format!("--context={context}"));
    }
    args
}

fn object_ref(key: &ResourceKey) -> String {
    format!("{}/{}", key.kind.to_lowercase(), key.name)
}

fn namespace_args(key: &ResourceKey) -> Vec<String> {
    if key.is_namespaced() {
        vec!["-n".to_string(), key.namespace.clone()]
    } else {
        Vec::new()
    }
}

/// Map `kubectl` stderr to a transient or permanent remote error
fn classify_failure(stderr: &str) -> rollout::Error {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker)) {
        rollout::Error::transient(message)
    } else {
        rollout::Error::permanent(message)
    }
}

/// Find the line of `kubectl apply` output for `key`
///
/// Lines look like `deployment.apps/api configured`. A single-line output is
/// accepted as-is, since a one-object manifest may use a different kind alias.
fn parse_apply_outcome(stdout: &str, key: &ResourceKey) -> Option<ApplyOutcome> {
    let lines: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();
    let kind = key.kind.to_lowercase();

    let matching = lines.iter().find(|line| {
        let Some(object) = line.split_whitespace().next() else {
            return false;
        };
        let Some((resource, name)) = object.split_once('/') else {
            return false;
        };
        let resource_kind = resource.split('.').next().unwrap_or(resource);
        name == key.name && resource_kind == kind
    });

    let line = match (matching, lines.as_slice()) {
        (Some(line), _) => line,
        (None, [only]) => only,
        _ => return None,
    };
    outcome_from_verb(line.split_whitespace().last()?)
}

fn outcome_from_verb(verb: &str) -> Option<ApplyOutcome> {
    match verb {
        "created" => Some(ApplyOutcome::Created),
        "configured" | "serverside-applied" => Some(ApplyOutcome::Updated),
        "unchanged" => Some(ApplyOutcome::Unchanged),
        _ => None,
    }
}

/// Derive a status from a `kubectl get -o json` object
///
/// Conditions win over `status.phase`; objects without either (ConfigMap,
/// Service) are ready as soon as they exist.
fn status_from_object(object: &Value) -> ResourceStatus {
    if object
        .pointer("/metadata/deletionTimestamp")
        .is_some_and(|v| !v.is_null())
    {
        return ResourceStatus::Pending;
    }

    if let Some(conditions) = object.pointer("/status/conditions").and_then(Value::as_array) {
        let is_true = |kind: &str| {
            conditions.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some(kind)
                    && c.get("status").and_then(Value::as_str) == Some("True")
            })
        };
        if is_true("Failed") || is_true("ReplicaFailure") || is_true("Stalled") {
            return ResourceStatus::Failed;
        }
        if ["Ready", "Available", "Established", "Complete"]
            .iter()
            .any(|kind| is_true(kind))
        {
            return ResourceStatus::Ready;
        }
        if !conditions.is_empty() {
            return ResourceStatus::Pending;
        }
    }

    match object.pointer("/status/phase").and_then(Value::as_str) {
        Some("Running" | "Active" | "Bound" | "Succeeded" | "Available") => ResourceStatus::Ready,
        Some("Failed" | "Lost") => ResourceStatus::Failed,
        Some(_) => ResourceStatus::Pending,
        None => ResourceStatus::Ready,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_apply_outcome_picks_matching_line() {
        let stdout = "namespace/platform unchanged\n\
                      deployment.apps/api configured\n\
                      service/api created\n";
        let deployment = ResourceKey::new("Deployment", "platform", "api");
        let service = ResourceKey::new("Service", "platform", "api");
        let ns = ResourceKey::cluster_scoped("Namespace", "platform");

        assert_eq!(parse_apply_outcome(stdout, &deployment), Some(ApplyOutcome::Updated));
        assert_eq!(parse_apply_outcome(stdout, &service), Some(ApplyOutcome::Created));
        assert_eq!(parse_apply_outcome(stdout, &ns), Some(ApplyOutcome::Unchanged));
    }

    #[test]
    fn test_parse_apply_outcome_single_line_fallback() {
        let key = ResourceKey::new("HorizontalPodAutoscaler", "platform", "api");
        assert_eq!(
            parse_apply_outcome("horizontalpodautoscaler.autoscaling/api created\n", &key),
            Some(ApplyOutcome::Created)
        );
        assert_eq!(
            parse_apply_outcome("hpa/api-v2 created\n", &key),
            Some(ApplyOutcome::Created)
        );
    }

    #[test]
    fn test_parse_apply_outcome_missing_object() {
        let key = ResourceKey::new("Deployment", "platform", "worker");
        let stdout = "deployment.apps/api configured\nservice/api created\n";
        assert_eq!(parse_apply_outcome(stdout, &key), None);
        assert_eq!(parse_apply_outcome("", &key), None);
    }

    #[test]
    fn test_status_from_conditions() {
        let ready = json!({"status": {"conditions": [
            {"type": "Progressing", "status": "True"},
            {"type": "Available", "status": "True"}
        ]}});
        assert_eq!(status_from_object(&ready), ResourceStatus::Ready);

        let rolling = json!({"status": {"conditions": [
            {"type": "Available", "status": "False"}
        ]}});
        assert_eq!(status_from_object(&rolling), ResourceStatus::Pending);

        let failed = json!({"status": {"conditions": [
            {"type": "ReplicaFailure", "status": "True"}
        ]}});
        assert_eq!(status_from_object(&failed), ResourceStatus::Failed);
    }

    #[test]
    fn test_status_from_phase() {
        assert_eq!(
            status_from_object(&json!({"status": {"phase": "Bound"}})),
            ResourceStatus::Ready
        );
        assert_eq!(
            status_from_object(&json!({"status": {"phase": "Pending"}})),
            ResourceStatus::Pending
        );
        assert_eq!(
            status_from_object(&json!({"status": {"phase": "Failed"}})),
            ResourceStatus::Failed
        );
    }

    #[test]
    fn test_status_without_status_is_ready() {
        let config_map = json!({"kind": "ConfigMap", "data": {"mode": "prod"}});
        assert_eq!(status_from_object(&config_map), ResourceStatus::Ready);
    }

    #[test]
    fn test_terminating_object_is_pending() {
        let terminating = json!({
            "metadata": {"deletionTimestamp": "2026-01-01T00:00:00Z"},
            "status": {"phase": "Active"}
        });
        assert_eq!(status_from_object(&terminating), ResourceStatus::Pending);
    }

    #[test]
    fn test_classify_failure() {
        let err = classify_failure("Unable to connect to the server: dial tcp: i/o timeout");
        assert!(err.is_retryable());

        let err = classify_failure("Error from server (Forbidden): deployments.apps is forbidden");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_base_args() {
        let args = base_args(Some("staging-admin"), Duration::from_secs(20));
        assert_eq!(args, vec!["--request-timeout=20s", "--context=staging-admin"]);

        let args = base_args(None, Duration::from_millis(200));
        assert_eq!(args, vec!["--request-timeout=1s"]);
    }

    #[test]
    fn test_object_ref_and_namespace() {
        let key = ResourceKey::new("Deployment", "platform", "api");
        assert_eq!(object_ref(&key), "deployment/api");
        assert_eq!(namespace_args(&key), vec!["-n", "platform"]);

        let ns = ResourceKey::cluster_scoped("Namespace", "platform");
        assert!(namespace_args(&ns).is_empty());
    }

    #[test]
    fn test_missing_binary_is_permanent_error() {
        let client = KubectlClient::new("definitely-not-kubectl-xyz", None);
        let err = client
            .get(
                &ResourceKey::cluster_scoped("Namespace", "platform"),
                Duration::from_secs(1),
            )
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
