//! Readiness checks run by `foreman doctor`: git availability plus an
//! adapter probe report, used both by the CLI and by Gate-0's capability
//! check.

use std::path::Path;
use std::process::Command;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::adapter::{AdapterRegistry, AdapterTier, ProbeReport, ProbeResult};
use crate::config::AdaptersConfig;

/// Full doctor report aggregating git checks and adapter probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorReport {
    pub git: GitCheck,
    pub adapters: ProbeReport,
    pub overall_ready: bool,
}

/// Result of checking git availability and repository status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCheck {
    pub git_available: bool,
    pub git_version: Option<String>,
    pub in_git_repo: bool,
    pub repo_root: Option<String>,
}

impl DoctorReport {
    /// Run all doctor checks against the real system and configured adapters.
    pub fn run(repo_path: Option<&Path>, adapters_config: &AdaptersConfig) -> Self {
        let git = check_git(repo_path);
        let registry = AdapterRegistry::from_config(adapters_config);
        let adapters = probe_registry(&registry);
        let overall_ready = git.git_available && git.in_git_repo && adapters.all_tier1_ready;

        Self {
            git,
            adapters,
            overall_ready,
        }
    }

    /// Human-readable reasons the system is not ready. Empty when
    /// `overall_ready` is true.
    pub fn not_ready_reasons(&self) -> Vec<String> {
        let mut reasons = Vec::new();

        if !self.git.git_available {
            reasons.push("git is not installed or not in PATH".to_string());
        }
        if !self.git.in_git_repo {
            reasons.push("not inside a git repository".to_string());
        }

        for result in &self.adapters.results {
            if result.tier == AdapterTier::Tier1 && !result.detect.status.is_available() {
                reasons.push(format!(
                    "Tier-1 adapter \"{}\" is {}",
                    result.adapter_key,
                    result.detect.status_label()
                ));
            }
        }

        reasons
    }
}

fn check_git(repo_path: Option<&Path>) -> GitCheck {
    let version_output = Command::new("git").arg("--version").output();
    let (git_available, git_version) = match version_output {
        Ok(output) if output.status.success() => {
            let raw = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let version = raw
                .strip_prefix("git version ")
                .map(|v| v.to_string())
                .unwrap_or(raw);
            debug!(version = %version, "git found");
            (true, Some(version))
        }
        Ok(_) => {
            warn!("git --version exited non-zero");
            (false, None)
        }
        Err(e) => {
            warn!(error = %e, "git not found");
            (false, None)
        }
    };

    if !git_available {
        return GitCheck {
            git_available: false,
            git_version: None,
            in_git_repo: false,
            repo_root: None,
        };
    }

    let mut cmd = Command::new("git");
    if let Some(path) = repo_path {
        cmd.current_dir(path);
    }
    cmd.args(["rev-parse", "--show-toplevel"]);

    let (in_git_repo, repo_root) = match cmd.output() {
        Ok(output) if output.status.success() => {
            let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
            debug!(root = %root, "inside git repo");
            (true, Some(root))
        }
        _ => {
            debug!("not inside a git repository");
            (false, None)
        }
    };

    GitCheck {
        git_available,
        git_version,
        in_git_repo,
        repo_root,
    }
}

fn probe_registry(registry: &AdapterRegistry) -> ProbeReport {
    let mut results: Vec<ProbeResult> = Vec::new();
    let mut all_tier1_ready = true;

    for adapter in registry.all() {
        let detect = adapter.detect();
        let capabilities = adapter.capabilities();
        let tier = adapter.tier();

        if tier == AdapterTier::Tier1 && !detect.status.is_available() {
            all_tier1_ready = false;
        }

        results.push(ProbeResult {
            adapter_key: adapter.key().to_string(),
            tier,
            detect,
            capabilities,
        });
    }

    ProbeReport {
        timestamp: Utc::now(),
        results,
        all_tier1_ready,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{CapabilityConfidence, CapabilityEntry, CapabilitySet, DetectResult, DetectStatus};

    fn missing_adapters_config() -> AdaptersConfig {
        AdaptersConfig {
            claude: Some("/nonexistent/claude".to_string()),
            codex: Some("/nonexistent/codex".to_string()),
            cursor: Some("/nonexistent/cursor".to_string()),
        }
    }

    #[test]
    fn doctor_report_serde_round_trip() {
        let report = DoctorReport {
            git: GitCheck {
                git_available: true,
                git_version: Some("2.43.0".to_string()),
                in_git_repo: true,
                repo_root: Some("/home/user/project".to_string()),
            },
            adapters: ProbeReport {
                timestamp: Utc::now(),
                results: vec![],
                all_tier1_ready: true,
            },
            overall_ready: true,
        };

        let json = serde_json::to_string(&report).unwrap();
        let deser: DoctorReport = serde_json::from_str(&json).unwrap();

        assert!(deser.overall_ready);
        assert!(deser.git.git_available);
        assert_eq!(deser.git.git_version.as_deref(), Some("2.43.0"));
        assert!(deser.git.in_git_repo);
        assert_eq!(deser.git.repo_root.as_deref(), Some("/home/user/project"));
    }

    #[test]
    fn overall_ready_false_when_tier1_adapter_missing() {
        let report = DoctorReport::run(None, &missing_adapters_config());
        assert!(!report.overall_ready);
        assert!(!report.adapters.all_tier1_ready);
    }

    #[test]
    fn not_ready_reasons_when_git_missing() {
        let report = DoctorReport {
            git: GitCheck {
                git_available: false,
                git_version: None,
                in_git_repo: false,
                repo_root: None,
            },
            adapters: ProbeReport {
                timestamp: Utc::now(),
                results: vec![],
                all_tier1_ready: true,
            },
            overall_ready: false,
        };

        let reasons = report.not_ready_reasons();
        assert!(reasons.iter().any(|r| r.contains("git")));
    }

    #[test]
    fn not_ready_reasons_when_tier1_adapter_missing() {
        let report = DoctorReport {
            git: GitCheck {
                git_available: true,
                git_version: Some("2.43.0".to_string()),
                in_git_repo: true,
                repo_root: Some("/repo".to_string()),
            },
            adapters: ProbeReport {
                timestamp: Utc::now(),
                results: vec![ProbeResult {
                    adapter_key: "codex".to_string(),
                    tier: AdapterTier::Tier1,
                    detect: DetectResult {
                        status: DetectStatus::Missing,
                        binary_path: None,
                        version: None,
                        supported_flags: vec![],
                        confidence: CapabilityConfidence::Verified,
                        error: Some("codex binary not found in PATH".to_string()),
                    },
                    capabilities: CapabilitySet {
                        json_stream: CapabilityEntry::unknown(),
                        plain_text: CapabilityEntry::unknown(),
                        force_edit_mode: CapabilityEntry::unknown(),
                        sandbox_controls: CapabilityEntry::unknown(),
                        approval_controls: CapabilityEntry::unknown(),
                        session_resume: CapabilityEntry::unknown(),
                        emits_usage: CapabilityEntry::unknown(),
                    },
                }],
                all_tier1_ready: false,
            },
            overall_ready: false,
        };

        let reasons = report.not_ready_reasons();
        assert!(reasons
            .iter()
            .any(|r| r.contains("codex") && r.contains("missing")));
    }
}
