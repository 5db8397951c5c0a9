use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::ProbeResult;
use super::AgentAdapter;

/// Aggregated probe report for all registered adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeReport {
    pub timestamp: DateTime<Utc>,
    pub results: Vec<ProbeResult>,
    pub all_tier1_ready: bool,
}

/// Runs probes against a set of registered adapters and produces a unified report.
pub struct ProbeRunner {
    adapters: Vec<Box<dyn AgentAdapter>>,
}

impl ProbeRunner {
    pub fn new(adapters: Vec<Box<dyn AgentAdapter>>) -> Self {
        Self { adapters }
    }

    pub fn run(&self) -> ProbeReport {
        let timestamp = Utc::now();
        let mut results = Vec::with_capacity(self.adapters.len());
        let mut all_tier1_ready = true;

        for adapter in &self.adapters {
            let detect = adapter.detect();
            let capabilities = adapter.capabilities();
            let tier = adapter.tier();

            if tier == super::types::AdapterTier::Tier1 && !detect.status.is_available() {
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
            timestamp,
            results,
            all_tier1_ready,
        }
    }
}
