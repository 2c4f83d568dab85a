//! Step validation runner.
//!
//! Executes a step's checks inside a sandbox and produces a structured
//! pass/fail report. The runner is a pure computation over its inputs plus
//! side effects against the sandbox: it never mutates session state — the
//! session manager applies the resulting transition, keeping a single
//! source of truth for lifecycle.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::compiler::PlanCheck;
use crate::provider::{ContainerProvider, ExecOptions};
use crate::sanitizer::sanitize_output;

/// Outcome of one check.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub check_name: String,
    pub passed: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Outcome of validating one step.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub step_index: usize,
    /// Logical AND of all check results.
    pub passed: bool,
    pub results: Vec<CheckResult>,
    /// Next step index when the pass advances the session; `None` on a
    /// failed attempt or a terminal (last-step) pass.
    pub advanced_to_step: Option<usize>,
}

/// Run every check of a step, in order, inside the given sandbox.
///
/// A check passes iff its command exits 0 and the sanitized stdout contains
/// the expected substring. A check whose execution errors (as opposed to
/// merely exiting non-zero) is reported as failed with a generic message so
/// one broken check does not abort the rest.
pub async fn run_validation(
    provider: &dyn ContainerProvider,
    sandbox_id: &str,
    step_index: usize,
    checks: &[PlanCheck],
    total_steps: usize,
) -> ValidationResult {
    info!(sandbox_id, step_index, check_count = checks.len(), "running validation");

    let mut results = Vec::with_capacity(checks.len());
    let mut all_passed = true;

    for check in checks {
        let command = vec!["sh".to_string(), "-c".to_string(), check.command.clone()];
        let exec = provider
            .exec(
                sandbox_id,
                &command,
                ExecOptions {
                    timeout_ms: check.timeout_ms(),
                    ..Default::default()
                },
            )
            .await;

        let result = match exec {
            Ok(exec) => {
                let sanitized = sanitize_output(&exec.stdout);
                let passed = exec.exit_code == 0 && sanitized.contains(&check.expected);
                debug!(check = %check.name, passed, exit_code = exec.exit_code, "check completed");
                CheckResult {
                    check_name: check.name.clone(),
                    passed,
                    message: if passed {
                        format!("Check \"{}\" passed", check.name)
                    } else {
                        format!(
                            "Check \"{}\" failed: expected output containing \"{}\"",
                            check.name, check.expected
                        )
                    },
                    hint: if passed { None } else { check.hint.clone() },
                }
            }
            Err(error) => {
                warn!(check = %check.name, %error, "check execution failed");
                CheckResult {
                    check_name: check.name.clone(),
                    passed: false,
                    message: format!("Check \"{}\" failed: execution error", check.name),
                    hint: check.hint.clone(),
                }
            }
        };

        if !result.passed {
            all_passed = false;
        }
        results.push(result);
    }

    let is_last_step = step_index >= total_steps.saturating_sub(1);
    let advanced_to_step = if all_passed && !is_last_step {
        Some(step_index + 1)
    } else {
        None
    };

    info!(all_passed, ?advanced_to_step, is_last_step, "validation complete");

    ValidationResult {
        step_index,
        passed: all_passed,
        results,
        advanced_to_step,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;

    fn check(name: &str, command: &str, expected: &str) -> PlanCheck {
        PlanCheck {
            name: name.into(),
            command: command.into(),
            expected: expected.into(),
            hint: Some(format!("hint for {name}")),
            timeout: None,
        }
    }

    #[tokio::test]
    async fn passing_checks_advance_to_next_step() {
        let provider = MockProvider::new().with_exec_response("cat /tmp/hello", 0, "hello world");
        let checks = vec![check("file", "cat /tmp/hello", "hello")];

        let result = run_validation(&provider, "sbx", 0, &checks, 3).await;
        assert!(result.passed);
        assert_eq!(result.advanced_to_step, Some(1));
        assert_eq!(result.results[0].message, "Check \"file\" passed");
        assert!(result.results[0].hint.is_none());
    }

    #[tokio::test]
    async fn last_step_pass_does_not_advance() {
        let provider = MockProvider::new().with_exec_response("cat /tmp/hello", 0, "hello");
        let checks = vec![check("file", "cat /tmp/hello", "hello")];

        let result = run_validation(&provider, "sbx", 2, &checks, 3).await;
        assert!(result.passed);
        assert_eq!(result.advanced_to_step, None);
    }

    #[tokio::test]
    async fn wrong_output_fails_with_hint() {
        let provider = MockProvider::new().with_exec_response("cat /tmp/hello", 0, "goodbye");
        let checks = vec![check("file", "cat /tmp/hello", "hello")];

        let result = run_validation(&provider, "sbx", 0, &checks, 3).await;
        assert!(!result.passed);
        assert_eq!(result.advanced_to_step, None);
        assert_eq!(result.results[0].hint.as_deref(), Some("hint for file"));
        assert!(result.results[0].message.contains("expected output containing"));
    }

    #[tokio::test]
    async fn nonzero_exit_fails_even_with_matching_output() {
        let provider = MockProvider::new().with_exec_response("grep x f", 1, "hello");
        let checks = vec![check("grep", "grep x f", "hello")];

        let result = run_validation(&provider, "sbx", 0, &checks, 2).await;
        assert!(!result.passed);
    }

    #[tokio::test]
    async fn one_failing_check_fails_the_step_but_runs_the_rest() {
        let provider = MockProvider::new()
            .with_exec_response("good", 0, "ok")
            .with_exec_response("bad", 0, "nope");
        let checks = vec![check("a", "good", "ok"), check("b", "bad", "ok"), check("c", "good2", "")];
        // third check: empty expected always contained, exit 0 default
        let result = run_validation(&provider, "sbx", 0, &checks, 2).await;
        assert!(!result.passed);
        assert_eq!(result.results.len(), 3);
        assert!(result.results[0].passed);
        assert!(!result.results[1].passed);
        assert_eq!(result.advanced_to_step, None);
    }

    #[tokio::test]
    async fn execution_error_is_folded_into_a_failed_check() {
        let provider = MockProvider::new().failing_exec();
        let checks = vec![check("a", "whatever", "ok")];

        let result = run_validation(&provider, "sbx", 0, &checks, 2).await;
        assert!(!result.passed);
        assert_eq!(
            result.results[0].message,
            "Check \"a\" failed: execution error"
        );
    }

    #[tokio::test]
    async fn checks_run_through_a_shell() {
        let provider = MockProvider::new().with_exec_response("echo hi", 0, "hi");
        let checks = vec![check("echo", "echo hi", "hi")];
        let _ = run_validation(&provider, "sbx", 0, &checks, 1).await;

        let log = provider.exec_log();
        assert_eq!(log[0][0], "sh");
        assert_eq!(log[0][1], "-c");
        assert_eq!(log[0][2], "echo hi");
    }
}
