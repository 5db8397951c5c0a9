//! `foreman doctor`: print git + adapter readiness, used before `serve`.

use std::path::Path;

use foreman_core::config::ForemanConfig;
use foreman_core::doctor::DoctorReport;

pub fn run(repo: &Path, config: &ForemanConfig, json: bool) {
    let report = DoctorReport::run(Some(repo), &config.adapters);

    if json {
        println!("{}", serde_json::to_string_pretty(&report).expect("serializable"));
        return;
    }

    print_human(&report);
}

fn print_human(report: &DoctorReport) {
    println!("Foreman Doctor Report");
    println!("======================");
    println!();

    println!("Git:");
    if report.git.git_available {
        println!("  git: {}", report.git.git_version.as_deref().unwrap_or("unknown version"));
    } else {
        println!("  git: NOT FOUND");
    }
    match &report.git.repo_root {
        Some(root) => println!("  repo: {root}"),
        None => println!("  repo: not inside a git repository"),
    }

    println!();
    println!("Adapters:");
    for result in &report.adapters.results {
        let tier = match result.tier {
            foreman_core::adapter::AdapterTier::Tier1 => "tier-1",
            foreman_core::adapter::AdapterTier::Experimental => "experimental",
        };
        println!(
            "  [{tier}] {key}: {status}",
            key = result.adapter_key,
            status = result.detect.status.label()
        );
        if let Some(path) = &result.detect.binary_path {
            println!("      binary: {}", path.display());
        }
        if let Some(err) = &result.detect.error {
            println!("      error: {err}");
        }
    }

    println!();
    if report.overall_ready {
        println!("Overall: READY");
    } else {
        println!("Overall: NOT READY");
        for reason in report.not_ready_reasons() {
            println!("  - {reason}");
        }
    }
}
