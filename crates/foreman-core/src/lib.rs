pub mod adapter;
pub mod agent_supervisor;
pub mod broadcaster;
pub mod card;
pub mod config;
pub mod doctor;
pub mod error;
pub mod event;
pub mod git_exec;
pub mod heartbeat;
pub mod notifier;
pub mod orchestrator;
pub mod prompt_assembler;
pub mod security;
pub mod supervisor;
pub mod synthesizer;
pub mod verifier;
pub mod worktree;

pub use error::{ForemanError, Result};

use tracing::info;

/// Initialise a default tracing subscriber for the library consumer.
///
/// Call this once at program start. Uses `RUST_LOG` env var for filtering,
/// defaulting to `info` level.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).init();

    info!("foreman tracing initialised");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ForemanError::Config("missing field".into());
        assert_eq!(err.to_string(), "config error: missing field");
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let foreman_err: ForemanError = io_err.into();
        assert!(matches!(foreman_err, ForemanError::Io(_)));
    }
}
