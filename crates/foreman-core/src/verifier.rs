//! Branch gate (Gate-1): type-check, lint, and test a worktree.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Cap on captured combined stdout+stderr per verification step.
pub const OUTPUT_CAP_CHARS: usize = 5_000;

/// Default per-step timeout.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(600);

/// Commands run by the Verifier. A `None` command is skipped and counts as
/// passing with empty output, letting a project opt out of one leg of the
/// gate without disabling verification entirely.
#[derive(Debug, Clone, Default)]
pub struct VerifierConfig {
    pub type_check_command: Option<String>,
    pub lint_command: Option<String>,
    pub test_command: Option<String>,
    pub step_timeout: Duration,
}

impl VerifierConfig {
    pub fn new(
        type_check_command: Option<String>,
        lint_command: Option<String>,
        test_command: Option<String>,
    ) -> Self {
        Self {
            type_check_command,
            lint_command,
            test_command,
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }
}

/// Structured pass/fail result of running the branch gate in a directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub passed: bool,
    pub type_check_output: String,
    pub lint_output: String,
    pub test_output: String,
}

/// Run the three-step quality gate in `dir`. Never mutates the filesystem
/// beyond what the invoked commands themselves do; never returns `Err` for a
/// failing step — a non-zero exit or timeout is captured as failed output,
/// not propagated as an error. The only error path is an inability to spawn
/// a shell at all, which the caller maps to `ForemanError::Internal`.
pub async fn verify(dir: &Path, config: &VerifierConfig) -> VerificationResult {
    let type_check = run_step(dir, config.type_check_command.as_deref(), config.step_timeout).await;
    let lint = run_step(dir, config.lint_command.as_deref(), config.step_timeout).await;
    let test = run_step(dir, config.test_command.as_deref(), config.step_timeout).await;

    let passed = type_check.passed && lint.passed && test.passed;

    VerificationResult {
        passed,
        type_check_output: type_check.output,
        lint_output: lint.output,
        test_output: test.output,
    }
}

struct StepOutcome {
    passed: bool,
    output: String,
}

async fn run_step(dir: &Path, command: Option<&str>, timeout: Duration) -> StepOutcome {
    let Some(command) = command else {
        return StepOutcome {
            passed: true,
            output: String::new(),
        };
    };

    debug!(command, dir = %dir.display(), "running verification step");

    #[cfg(unix)]
    let (program, mut args) = ("sh", vec!["-c"]);
    #[cfg(windows)]
    let (program, mut args) = ("cmd", vec!["/C"]);
    args.push(command);

    let spawned = tokio::process::Command::new(program)
        .args(&args)
        .current_dir(dir)
        .env_remove("ANTHROPIC_API_KEY")
        .env_remove("OPENAI_API_KEY")
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn();

    let child = match spawned {
        Ok(c) => c,
        Err(e) => {
            return StepOutcome {
                passed: false,
                output: truncate(&format!("failed to spawn '{command}': {e}")),
            }
        }
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let combined = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            StepOutcome {
                passed: output.status.success(),
                output: truncate(&combined),
            }
        }
        Ok(Err(e)) => StepOutcome {
            passed: false,
            output: truncate(&format!("command '{command}' failed: {e}")),
        },
        Err(_) => StepOutcome {
            passed: false,
            output: truncate(&format!("TIMEOUT after {} seconds", timeout.as_secs())),
        },
    }
}

fn truncate(s: &str) -> String {
    if s.chars().count() <= OUTPUT_CAP_CHARS {
        s.to_string()
    } else {
        s.chars().take(OUTPUT_CAP_CHARS).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn all_steps_passing() {
        let dir = tempfile::tempdir().unwrap();
        let config = VerifierConfig::new(
            Some("exit 0".to_string()),
            Some("exit 0".to_string()),
            Some("exit 0".to_string()),
        );
        let result = verify(dir.path(), &config).await;
        assert!(result.passed);
    }

    #[tokio::test]
    async fn one_failing_step_fails_aggregate() {
        let dir = tempfile::tempdir().unwrap();
        let config = VerifierConfig::new(
            Some("echo 'error TS2345' && exit 1".to_string()),
            Some("exit 0".to_string()),
            Some("exit 0".to_string()),
        );
        let result = verify(dir.path(), &config).await;
        assert!(!result.passed);
        assert!(result.type_check_output.contains("error TS2345"));
    }

    #[tokio::test]
    async fn missing_command_is_skipped_and_passes() {
        let dir = tempfile::tempdir().unwrap();
        let config = VerifierConfig::new(None, None, Some("exit 0".to_string()));
        let result = verify(dir.path(), &config).await;
        assert!(result.passed);
        assert!(result.type_check_output.is_empty());
        assert!(result.lint_output.is_empty());
    }

    #[tokio::test]
    async fn timed_out_step_fails_with_message() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = VerifierConfig::new(Some("sleep 5".to_string()), None, None);
        config.step_timeout = Duration::from_millis(50);
        let result = verify(dir.path(), &config).await;
        assert!(!result.passed);
        assert!(result.type_check_output.contains("TIMEOUT"));
    }

    #[test]
    fn output_is_truncated() {
        let long = "a".repeat(OUTPUT_CAP_CHARS + 500);
        let truncated = truncate(&long);
        assert_eq!(truncated.chars().count(), OUTPUT_CAP_CHARS);
    }
}
