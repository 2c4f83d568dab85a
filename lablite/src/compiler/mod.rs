//! Lab definition compiler.
//!
//! Turns a declarative YAML source into a validated, immutable
//! [`LabDefinition`] execution plan. Compilation is pure and deterministic:
//! the same source always yields the same plan. Step indices are assigned
//! positionally; an `index` field in the source is never trusted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Default memory limit applied when the environment omits one.
pub const DEFAULT_MEMORY_LIMIT: &str = "512m";
/// Default CPU limit (decimal cores) applied when the environment omits one.
pub const DEFAULT_CPU_LIMIT: &str = "1.0";
/// Default network mode for sandboxes.
pub const DEFAULT_NETWORK_MODE: &str = "none";
/// Default per-check timeout in milliseconds.
pub const DEFAULT_CHECK_TIMEOUT_MS: u64 = 10_000;

/// Upper bound on the sum of all check timeouts in a plan. A plan whose
/// worst-case validation time exceeds this is rejected at compile time so a
/// single validate call can never hold a sandbox busy for longer.
pub const MAX_TOTAL_CHECK_TIMEOUT_MS: u64 = 10 * 60 * 1000;

// ============================================================================
// COMPILED PLAN
// ============================================================================

/// Compiled execution plan — the runtime form of a lab definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabDefinition {
    pub metadata: PlanMetadata,
    pub environment: EnvironmentSpec,
    pub steps: Vec<PlanStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanMetadata {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_minutes: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSpec {
    /// Container image reference.
    pub image: String,
    /// Memory limit in string form, e.g. "512m".
    pub memory_limit: String,
    /// CPU limit as a decimal core count, e.g. "1.0".
    pub cpu_limit: String,
    /// "none", "internal", or a runtime-specific mode.
    pub network_mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// One ordered unit of instructions plus checks.
///
/// `index` always matches the step's position in `LabDefinition::steps`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub index: usize,
    pub title: String,
    pub instructions: String,
    pub checks: Vec<PlanCheck>,
}

/// A single command + expected-output assertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanCheck {
    pub name: String,
    pub command: String,
    /// Must-contain token matched against sanitized stdout.
    pub expected: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Per-check timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl PlanCheck {
    pub fn timeout_ms(&self) -> u64 {
        self.timeout.unwrap_or(DEFAULT_CHECK_TIMEOUT_MS)
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// A single schema violation: field path plus human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldIssue {
    pub path: String,
    pub message: String,
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

#[derive(Debug, Error)]
pub enum CompileError {
    /// Source text is not parseable YAML (or not a mapping at the top level).
    #[error("invalid lab definition source: {0}")]
    InvalidSource(String),
    /// Source parsed but violates the plan schema.
    #[error("lab definition validation failed:\n{}", format_issues(.0))]
    ValidationFailed(Vec<FieldIssue>),
}

impl CompileError {
    /// Stable machine-readable code for the API surface.
    pub fn code(&self) -> &'static str {
        match self {
            CompileError::InvalidSource(_) => "INVALID_SOURCE",
            CompileError::ValidationFailed(_) => "VALIDATION_FAILED",
        }
    }
}

fn format_issues(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(|i| format!("  {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

// ============================================================================
// RAW SOURCE MODEL
// ============================================================================

// Everything is optional here so that missing fields surface as schema
// issues with a field path instead of opaque deserialization errors.

#[derive(Debug, Deserialize)]
struct RawDefinition {
    metadata: Option<RawMetadata>,
    environment: Option<RawEnvironment>,
    #[serde(default)]
    steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMetadata {
    title: Option<String>,
    description: Option<String>,
    version: Option<u32>,
    estimated_minutes: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvironment {
    image: Option<String>,
    memory_limit: Option<String>,
    cpu_limit: Option<String>,
    network_mode: Option<String>,
    env: Option<HashMap<String, String>>,
    working_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    title: Option<String>,
    instructions: Option<String>,
    #[serde(default)]
    checks: Vec<RawCheck>,
}

#[derive(Debug, Deserialize)]
struct RawCheck {
    name: Option<String>,
    command: Option<String>,
    expected: Option<String>,
    hint: Option<String>,
    timeout: Option<u64>,
}

// ============================================================================
// COMPILATION
// ============================================================================

/// Fallback limits applied to plans whose environment omits them. The
/// server feeds its configured sandbox limits through here so an operator
/// default reaches plans that do not pin their own.
#[derive(Debug, Clone)]
pub struct CompileDefaults {
    pub memory_limit: String,
    pub cpu_limit: String,
}

impl Default for CompileDefaults {
    fn default() -> Self {
        Self {
            memory_limit: DEFAULT_MEMORY_LIMIT.into(),
            cpu_limit: DEFAULT_CPU_LIMIT.into(),
        }
    }
}

/// Compile a YAML lab definition into an executable plan.
pub fn compile_lab_definition(source: &str) -> Result<LabDefinition, CompileError> {
    compile_with_defaults(source, &CompileDefaults::default())
}

/// Compile with explicit fallback limits. Deterministic for a fixed
/// source + defaults pair.
pub fn compile_with_defaults(
    source: &str,
    defaults: &CompileDefaults,
) -> Result<LabDefinition, CompileError> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(source).map_err(|e| CompileError::InvalidSource(e.to_string()))?;

    if !value.is_mapping() {
        return Err(CompileError::InvalidSource(
            "expected a mapping at the top level".into(),
        ));
    }

    let raw: RawDefinition = serde_yaml::from_value(value)
        .map_err(|e| CompileError::ValidationFailed(vec![FieldIssue {
            path: "$".into(),
            message: e.to_string(),
        }]))?;

    validate(raw, defaults)
}

fn validate(raw: RawDefinition, defaults: &CompileDefaults) -> Result<LabDefinition, CompileError> {
    let mut issues = Vec::new();

    let title = require_string(&mut issues, "metadata.title", raw.metadata.as_ref().and_then(|m| m.title.clone()));
    let image = require_string(&mut issues, "environment.image", raw.environment.as_ref().and_then(|e| e.image.clone()));

    if raw.steps.is_empty() {
        issues.push(FieldIssue {
            path: "steps".into(),
            message: "at least one step is required".into(),
        });
    }

    let mut steps = Vec::with_capacity(raw.steps.len());
    let mut total_timeout_ms: u64 = 0;

    for (index, step) in raw.steps.into_iter().enumerate() {
        let step_path = format!("steps[{index}]");
        let step_title =
            require_string(&mut issues, &format!("{step_path}.title"), step.title);
        let instructions =
            require_string(&mut issues, &format!("{step_path}.instructions"), step.instructions);

        if step.checks.is_empty() {
            issues.push(FieldIssue {
                path: format!("{step_path}.checks"),
                message: "at least one check is required".into(),
            });
        }

        let mut checks = Vec::with_capacity(step.checks.len());
        for (ci, check) in step.checks.into_iter().enumerate() {
            let check_path = format!("{step_path}.checks[{ci}]");
            let name = require_string(&mut issues, &format!("{check_path}.name"), check.name);
            let command =
                require_string(&mut issues, &format!("{check_path}.command"), check.command);
            let expected =
                require_string(&mut issues, &format!("{check_path}.expected"), check.expected);

            if let Some(0) = check.timeout {
                issues.push(FieldIssue {
                    path: format!("{check_path}.timeout"),
                    message: "timeout must be positive".into(),
                });
            }

            let compiled = PlanCheck {
                name,
                command,
                expected,
                hint: check.hint,
                timeout: check.timeout,
            };
            total_timeout_ms = total_timeout_ms.saturating_add(compiled.timeout_ms());
            checks.push(compiled);
        }

        // Index assigned by position, never read from the source.
        steps.push(PlanStep {
            index,
            title: step_title,
            instructions,
            checks,
        });
    }

    if total_timeout_ms > MAX_TOTAL_CHECK_TIMEOUT_MS {
        issues.push(FieldIssue {
            path: "steps".into(),
            message: format!(
                "total check timeout {total_timeout_ms}ms exceeds the {MAX_TOTAL_CHECK_TIMEOUT_MS}ms cap"
            ),
        });
    }

    if !issues.is_empty() {
        return Err(CompileError::ValidationFailed(issues));
    }

    let metadata = raw.metadata.unwrap_or(RawMetadata {
        title: None,
        description: None,
        version: None,
        estimated_minutes: None,
    });
    let environment = raw.environment.unwrap_or(RawEnvironment {
        image: None,
        memory_limit: None,
        cpu_limit: None,
        network_mode: None,
        env: None,
        working_dir: None,
    });

    Ok(LabDefinition {
        metadata: PlanMetadata {
            title,
            description: metadata.description,
            version: metadata.version.unwrap_or(1),
            estimated_minutes: metadata.estimated_minutes,
        },
        environment: EnvironmentSpec {
            image,
            memory_limit: environment
                .memory_limit
                .unwrap_or_else(|| defaults.memory_limit.clone()),
            cpu_limit: environment
                .cpu_limit
                .unwrap_or_else(|| defaults.cpu_limit.clone()),
            network_mode: environment
                .network_mode
                .unwrap_or_else(|| DEFAULT_NETWORK_MODE.into()),
            env: environment.env,
            working_dir: environment.working_dir,
        },
        steps,
    })
}

fn require_string(issues: &mut Vec<FieldIssue>, path: &str, value: Option<String>) -> String {
    match value {
        Some(s) if !s.trim().is_empty() => s,
        _ => {
            issues.push(FieldIssue {
                path: path.into(),
                message: "must be a non-empty string".into(),
            });
            String::new()
        }
    }
}
