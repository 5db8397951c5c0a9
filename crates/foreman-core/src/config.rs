//! `foreman.toml` configuration: timeouts, concurrency, the Verifier's
//! quality-gate commands, adapter binary overrides, and retention policy.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::{ForemanError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForemanConfig {
    pub general: GeneralConfig,
    pub verifier: VerifierSettings,
    pub adapters: AdaptersConfig,
    pub retention: RetentionConfig,
}

impl ForemanConfig {
    /// Load config from a specific `foreman.toml` file path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ForemanError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&contents).map_err(|e| {
            ForemanError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `./foreman.toml` if it exists, otherwise return defaults.
    pub fn load_or_default() -> Self {
        let path = PathBuf::from("foreman.toml");
        if path.exists() {
            match Self::load(&path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(%e, "failed to load foreman.toml, falling back to defaults");
                    Self::default()
                }
            }
        } else {
            Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.general.default_timeout_seconds == 0 {
            return Err(ForemanError::Config(
                "general.default_timeout_seconds must be > 0".into(),
            ));
        }
        if self.general.hard_timeout_seconds == 0 {
            return Err(ForemanError::Config(
                "general.hard_timeout_seconds must be > 0".into(),
            ));
        }
        if self.general.idle_timeout_seconds == 0 {
            return Err(ForemanError::Config(
                "general.idle_timeout_seconds must be > 0".into(),
            ));
        }
        if self.general.hard_timeout_seconds <= self.general.default_timeout_seconds {
            return Err(ForemanError::Config(
                "general.hard_timeout_seconds must be greater than general.default_timeout_seconds"
                    .into(),
            ));
        }
        if self.general.max_concurrent_agents == 0 {
            return Err(ForemanError::Config(
                "general.max_concurrent_agents must be > 0".into(),
            ));
        }
        if self.general.heartbeat_interval_seconds == 0 {
            return Err(ForemanError::Config(
                "general.heartbeat_interval_seconds must be > 0".into(),
            ));
        }

        let valid_policies = ["none", "failed", "all"];
        if !valid_policies.contains(&self.retention.policy.as_str()) {
            return Err(ForemanError::Config(format!(
                "retention.policy '{}' is not recognised; valid policies: {}",
                self.retention.policy,
                valid_policies.join(", ")
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Default soft timeout for agent execution in seconds.
    pub default_timeout_seconds: u64,
    /// Hard timeout that kills the process regardless of progress.
    pub hard_timeout_seconds: u64,
    /// Idle timeout (no output) before killing the agent.
    pub idle_timeout_seconds: u64,
    /// Global cap on simultaneously running agents (Gate-0).
    pub max_concurrent_agents: u32,
    /// Per-project cap on simultaneously running agents (Gate-0).
    pub max_concurrent_agents_per_project: u32,
    /// Heartbeat tick interval in seconds.
    pub heartbeat_interval_seconds: u64,
    /// Synthesizer (merge-gate) tick interval in seconds.
    pub synthesizer_interval_seconds: u64,
    /// Allow experimental-tier adapters to be selected.
    pub allow_experimental_adapters: bool,
    /// Disable sandbox path checks (allow writes outside the worktree).
    pub unsafe_mode: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 600,
            hard_timeout_seconds: 900,
            idle_timeout_seconds: 120,
            max_concurrent_agents: 3,
            max_concurrent_agents_per_project: 1,
            heartbeat_interval_seconds: 15,
            synthesizer_interval_seconds: 30,
            allow_experimental_adapters: false,
            unsafe_mode: false,
        }
    }
}

/// Commands run by the Verifier (Gate-1). Per-project profile presets mirror
/// common toolchains; `custom` leaves every command unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierSettings {
    pub profile: String,
    pub type_check_command: Option<String>,
    pub lint_command: Option<String>,
    pub test_command: Option<String>,
    pub step_timeout_seconds: u64,
}

impl Default for VerifierSettings {
    fn default() -> Self {
        Self {
            profile: "custom".into(),
            type_check_command: None,
            lint_command: None,
            test_command: None,
            step_timeout_seconds: 600,
        }
    }
}

impl VerifierSettings {
    /// Build verifier settings from a named profile preset.
    ///
    /// Recognised profiles: `"js-node"`, `"rust"`, `"python"`, `"custom"`.
    pub fn from_profile(name: &str) -> Result<Self> {
        let mut cfg = Self {
            profile: name.into(),
            ..Self::default()
        };

        match name {
            "js-node" => {
                cfg.type_check_command = Some("npm run typecheck".into());
                cfg.lint_command = Some("npm run lint".into());
                cfg.test_command = Some("npm test -- --runInBand".into());
            }
            "rust" => {
                cfg.type_check_command = Some("cargo check --all-targets".into());
                cfg.lint_command = Some("cargo clippy --all-targets -- -D warnings".into());
                cfg.test_command = Some("cargo test".into());
            }
            "python" => {
                cfg.type_check_command = None;
                cfg.lint_command = Some("ruff check .".into());
                cfg.test_command = Some("pytest -q".into());
            }
            "custom" => {}
            other => {
                return Err(ForemanError::Config(format!(
                    "unknown verifier profile '{other}'; valid profiles: js-node, rust, python, custom"
                )));
            }
        }

        Ok(cfg)
    }

    pub fn to_verifier_config(&self) -> crate::verifier::VerifierConfig {
        crate::verifier::VerifierConfig {
            type_check_command: self.type_check_command.clone(),
            lint_command: self.lint_command.clone(),
            test_command: self.test_command.clone(),
            step_timeout: std::time::Duration::from_secs(self.step_timeout_seconds),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptersConfig {
    pub claude: Option<String>,
    pub codex: Option<String>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Retention policy for completed worktrees/branches: "none", "failed", or "all".
    pub policy: String,
    pub max_age_days: Option<u64>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            policy: "failed".into(),
            max_age_days: None,
        }
    }
}

impl RetentionConfig {
    /// Whether a run's worktree/branch should survive past its terminal
    /// state, given whether that run failed (any non-`Completed` outcome).
    pub fn should_keep(&self, failed: bool) -> bool {
        match self.policy.as_str() {
            "all" => true,
            "failed" => failed,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_TOML: &str = r#"
[general]
default_timeout_seconds = 300
hard_timeout_seconds = 600
idle_timeout_seconds = 60
max_concurrent_agents = 5
max_concurrent_agents_per_project = 2
heartbeat_interval_seconds = 10
synthesizer_interval_seconds = 20
allow_experimental_adapters = true
unsafe_mode = false

[verifier]
profile = "rust"
type_check_command = "cargo check"
lint_command = "cargo clippy"
test_command = "cargo test"
step_timeout_seconds = 120

[adapters]
claude = "/usr/local/bin/claude"

[retention]
policy = "all"
max_age_days = 30
"#;

    #[test]
    fn parse_full_toml() {
        let cfg: ForemanConfig = toml::from_str(FULL_TOML).expect("parse full TOML");
        assert_eq!(cfg.general.default_timeout_seconds, 300);
        assert_eq!(cfg.general.max_concurrent_agents, 5);
        assert!(cfg.general.allow_experimental_adapters);
        assert_eq!(cfg.verifier.profile, "rust");
        assert_eq!(cfg.adapters.claude.as_deref(), Some("/usr/local/bin/claude"));
        assert_eq!(cfg.retention.policy, "all");
        assert_eq!(cfg.retention.max_age_days, Some(30));
        cfg.validate().expect("full config is valid");
    }

    #[test]
    fn parse_minimal_toml_gets_defaults() {
        let cfg: ForemanConfig = toml::from_str("").expect("parse empty TOML");
        assert_eq!(cfg.general.default_timeout_seconds, 600);
        assert_eq!(cfg.general.hard_timeout_seconds, 900);
        assert_eq!(cfg.general.max_concurrent_agents, 3);
        assert_eq!(cfg.retention.policy, "failed");
        cfg.validate().expect("default config is valid");
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let mut cfg = ForemanConfig::default();
        cfg.general.default_timeout_seconds = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("default_timeout_seconds"));
    }

    #[test]
    fn validate_rejects_hard_lte_default() {
        let mut cfg = ForemanConfig::default();
        cfg.general.hard_timeout_seconds = cfg.general.default_timeout_seconds;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("hard_timeout_seconds"));
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut cfg = ForemanConfig::default();
        cfg.general.max_concurrent_agents = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_concurrent_agents"));
    }

    #[test]
    fn validate_rejects_unknown_retention_policy() {
        let mut cfg = ForemanConfig::default();
        cfg.retention.policy = "forever".into();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("forever"));
    }

    #[test]
    fn verifier_profile_rust() {
        let cfg = VerifierSettings::from_profile("rust").unwrap();
        assert_eq!(cfg.test_command.as_deref(), Some("cargo test"));
        assert_eq!(
            cfg.lint_command.as_deref(),
            Some("cargo clippy --all-targets -- -D warnings")
        );
    }

    #[test]
    fn verifier_profile_python_has_no_type_check() {
        let cfg = VerifierSettings::from_profile("python").unwrap();
        assert!(cfg.type_check_command.is_none());
        assert_eq!(cfg.test_command.as_deref(), Some("pytest -q"));
    }

    #[test]
    fn verifier_profile_unknown_errors() {
        let err = VerifierSettings::from_profile("go").unwrap_err();
        assert!(err.to_string().contains("go"));
    }

    #[test]
    fn default_config_is_valid() {
        ForemanConfig::default().validate().expect("default is valid");
    }

    #[test]
    fn serialization_round_trip() {
        let original = ForemanConfig::default();
        let toml_str = toml::to_string_pretty(&original).expect("serialize");
        let restored: ForemanConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(
            original.general.default_timeout_seconds,
            restored.general.default_timeout_seconds
        );
        restored.validate().expect("round-tripped config is valid");
    }

    #[test]
    fn retention_should_keep_matches_policy() {
        let mut cfg = RetentionConfig::default();
        cfg.policy = "failed".into();
        assert!(cfg.should_keep(true));
        assert!(!cfg.should_keep(false));

        cfg.policy = "all".into();
        assert!(cfg.should_keep(true));
        assert!(cfg.should_keep(false));

        cfg.policy = "none".into();
        assert!(!cfg.should_keep(true));
        assert!(!cfg.should_keep(false));
    }

    #[test]
    fn parse_invalid_toml_returns_error() {
        let bad = "this is not [valid toml";
        let result = toml::from_str::<ForemanConfig>(bad);
        assert!(result.is_err());
    }
}
