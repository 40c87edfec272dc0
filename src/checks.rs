//! Validation checks declared in the plan file

use anyhow::Result;
use rollout::{
    CheckContext, Finding, RemoteState, ResourceCheck, Severity, ValidationCheck,
};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::parse_resource_ref;
use crate::paths;
use crate::schema::{CheckDef, HttpCheckDef, PlanFile};

/// HTTP endpoint answers with the expected status code
pub struct HttpCheck {
    def: HttpCheckDef,
    url: String,
    agent: ureq::Agent,
}

impl HttpCheck {
    pub fn new(def: HttpCheckDef, url: String) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(def.timeout_secs)))
            .http_status_as_error(false)
            .build();
        Self {
            def,
            url,
            agent: ureq::Agent::new_with_config(config),
        }
    }

    fn attempt(&self) -> Result<(u16, Duration)> {
        let start = Instant::now();
        let response = self
            .agent
            .get(&self.url)
            .header("User-Agent", "bosun-validate")
            .call()?;
        Ok((response.status().as_u16(), start.elapsed()))
    }

    fn remediation(&self, fallback: String) -> String {
        self.def.remediation.clone().unwrap_or(fallback)
    }
}

impl ValidationCheck for HttpCheck {
    fn name(&self) -> String {
        self.def.name.clone()
    }

    fn category(&self) -> String {
        self.def.category.clone()
    }

    fn severity(&self) -> Severity {
        self.def.severity
    }

    /// Every attempt plus the pauses between them
    fn timeout(&self) -> Duration {
        let attempts = self.def.retries + 1;
        Duration::from_secs(self.def.timeout_secs) * attempts
            + Duration::from_millis(self.def.retry_delay_ms) * self.def.retries
    }

    fn run(&self, _ctx: &CheckContext<'_>) -> Result<Finding> {
        let attempts = self.def.retries + 1;
        let mut last = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                thread::sleep(Duration::from_millis(self.def.retry_delay_ms));
            }
            match self.attempt() {
                Ok((status, elapsed)) if status == self.def.expect_status => {
                    let ms = elapsed.as_millis();
                    let evidence = if attempt > 1 {
                        format!("HTTP {status} in {ms}ms (attempt {attempt}/{attempts})")
                    } else {
                        format!("HTTP {status} in {ms}ms")
                    };
                    if let Some(max) = self.def.max_response_ms
                        && ms > u128::from(max)
                    {
                        return Ok(Finding::warn(format!("{evidence}, over the {max}ms target"))
                            .with_remediation(self.remediation(format!(
                                "investigate latency of {}",
                                self.url
                            ))));
                    }
                    return Ok(Finding::pass(evidence));
                }
                Ok((status, _)) => {
                    last = format!("expected HTTP {}, got {status}", self.def.expect_status);
                }
                Err(e) => last = format!("request failed: {e:#}"),
            }
            log::debug!("{} attempt {attempt}/{attempts}: {last}", self.def.name);
        }

        Ok(Finding::fail(format!("{last} after {attempts} attempt(s)"))
            .with_remediation(self.remediation(format!("check that {} is reachable", self.url))))
    }
}

/// Instantiate the plan file's `[[checks]]` for one environment
pub fn declared_checks<'a>(
    file: &PlanFile,
    environment: &str,
    remote: &'a dyn RemoteState,
) -> Result<Vec<Box<dyn ValidationCheck + 'a>>> {
    let namespace = file.namespace_for(environment);
    let vars = [("environment", environment), ("namespace", namespace)];

    let mut checks: Vec<Box<dyn ValidationCheck + 'a>> = Vec::new();
    for def in &file.checks {
        match def {
            CheckDef::Http(http) => {
                let url = paths::expand_name(&http.url, &vars);
                checks.push(Box::new(HttpCheck::new(http.clone(), url)));
            }
            CheckDef::Resource(resource) => {
                let key = parse_resource_ref(&paths::expand_name(&resource.resource, &vars))?;
                let check = if resource.ready {
                    ResourceCheck::ready(remote, key, resource.severity)
                } else {
                    ResourceCheck::exists(remote, key, resource.severity)
                };
                checks.push(Box::new(check));
            }
        }
    }
    Ok(checks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollout::memory::MemoryCluster;
    use rollout::{CheckOutcome, DeploymentPlan, DeploymentRun, Environment, Phase};
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Serve one canned response per entry, then stop
    fn serve(responses: Vec<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for body in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                stream.write_all(body.as_bytes()).unwrap();
            }
        });
        format!("http://{addr}/healthz")
    }

    const OK: &str = "HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok";
    const UNAVAILABLE: &str =
        "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";

    fn def(retries: u32) -> HttpCheckDef {
        HttpCheckDef {
            name: "gateway-health".to_string(),
            url: String::new(),
            expect_status: 200,
            severity: Severity::Critical,
            category: "Endpoints".to_string(),
            timeout_secs: 5,
            retries,
            retry_delay_ms: 10,
            max_response_ms: None,
            remediation: None,
        }
    }

    fn run() -> DeploymentRun {
        let plan = DeploymentPlan::new(
            "platform",
            Environment::new("staging"),
            vec![Phase::new("services", 1, 60)],
        )
        .unwrap();
        DeploymentRun::new(plan)
    }

    fn check(def: HttpCheckDef, url: String) -> Finding {
        let run = run();
        let check = HttpCheck::new(def, url);
        let ctx = CheckContext {
            run: &run,
            timeout: check.timeout(),
        };
        check.run(&ctx).unwrap()
    }

    #[test]
    fn test_http_check_passes() {
        let url = serve(vec![OK]);
        let finding = check(def(0), url);
        assert_eq!(finding.outcome, CheckOutcome::Pass);
        assert!(finding.evidence.starts_with("HTTP 200"));
    }

    #[test]
    fn test_http_check_retries_until_healthy() {
        let url = serve(vec![UNAVAILABLE, OK]);
        let finding = check(def(2), url);
        assert_eq!(finding.outcome, CheckOutcome::Pass);
        assert!(finding.evidence.contains("attempt 2/3"));
    }

    #[test]
    fn test_http_check_fails_on_wrong_status() {
        let url = serve(vec![UNAVAILABLE]);
        let finding = check(def(0), url.clone());
        assert_eq!(finding.outcome, CheckOutcome::Fail);
        assert!(finding.evidence.contains("expected HTTP 200, got 503"));
        assert!(finding.remediation.unwrap().contains(&url));
    }

    #[test]
    fn test_http_check_slow_response_warns() {
        let url = serve(vec![OK]);
        let mut slow = def(0);
        slow.max_response_ms = Some(0);
        slow.remediation = Some("scale the gateway".to_string());
        let finding = check(slow, url);
        // Loopback can answer within the same millisecond
        if finding.outcome == CheckOutcome::Warn {
            assert_eq!(finding.remediation.as_deref(), Some("scale the gateway"));
        } else {
            assert_eq!(finding.outcome, CheckOutcome::Pass);
        }
    }

    #[test]
    fn test_http_timeout_budget_covers_retries() {
        let check = HttpCheck::new(def(2), "http://127.0.0.1:9/".to_string());
        assert_eq!(check.timeout(), Duration::from_millis(15_020));
    }

    #[test]
    fn test_declared_checks_expand_variables() {
        let file: PlanFile = toml::from_str(
            r#"
[plan]
name = "platform"
namespace = "platform"

[[phases]]
id = "services"
timeout_secs = 60

[environments.production]
namespace = "platform-prod"

[[checks]]
type = "http"
name = "gateway-health"
url = "https://gateway.${environment}.example.com/healthz"

[[checks]]
type = "resource"
resource = "Deployment/${namespace}/api"
ready = false
severity = "warning"
"#,
        )
        .unwrap();
        let cluster = MemoryCluster::new();

        let checks = declared_checks(&file, "production", &cluster).unwrap();
        assert_eq!(checks.len(), 2);
        assert_eq!(checks[0].name(), "gateway-health");
        assert_eq!(checks[1].name(), "resource-exists:Deployment/platform-prod/api");
        assert_eq!(checks[1].severity(), Severity::Warning);
    }
}
