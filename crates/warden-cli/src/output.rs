use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use warden_core::WardenConfig;
use warden_runtime::{BudgetStatus, ComponentStatus};

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render JSON")?;
    println!("{rendered}");
    Ok(())
}

/// Effective settings, as `check-config` shows them.
#[derive(Serialize)]
struct ConfigSummary<'a> {
    source: String,
    capacity: u64,
    failure_threshold: u32,
    reset_timeout_ms: u64,
    rate_per_second: u32,
    rate_burst: u32,
    health_interval_ms: u64,
    wake_deadline_ms: u64,
    transition_timeout_ms: u64,
    retention_count: usize,
    registry_dir: &'a Path,
    snapshot_dir: &'a Path,
}

pub fn print_config(config: &WardenConfig, source: Option<&Path>) -> Result<()> {
    let registry_dir = config.storage.registry_dir();
    let snapshot_dir = config.storage.snapshot_dir();
    let summary = ConfigSummary {
        source: source.map_or_else(|| "built-in defaults".to_string(), |p| p.display().to_string()),
        capacity: config.budget.capacity,
        failure_threshold: config.breaker.failure_threshold,
        reset_timeout_ms: config.breaker.reset_timeout_ms,
        rate_per_second: config.rate_limit.per_second,
        rate_burst: config.rate_limit.burst(),
        health_interval_ms: config.health.interval_ms,
        wake_deadline_ms: config.lifecycle.wake_deadline_ms,
        transition_timeout_ms: config.lifecycle.transition_timeout_ms,
        retention_count: config.snapshots.retention_count,
        registry_dir: &registry_dir,
        snapshot_dir: &snapshot_dir,
    };
    println!("config ok");
    print_json(&summary)
}

pub fn print_components(components: &[ComponentStatus]) {
    if components.is_empty() {
        println!("no components registered");
        return;
    }
    println!(
        "{:<24} {:<10} {:>6}  {:<32} LAST ERROR",
        "ID", "CRIT", "COST", "STATE"
    );
    for c in components {
        println!(
            "{:<24} {:<10} {:>6}  {:<32} {}",
            c.id,
            c.criticality.to_string(),
            c.resource_cost,
            c.state.to_string(),
            c.last_error.as_deref().unwrap_or("-")
        );
    }
}

pub fn print_budget(budget: &BudgetStatus) {
    println!(
        "capacity {}  allocated {}  available {}",
        budget.capacity, budget.allocated, budget.available
    );
    for holding in &budget.holdings {
        println!("  {:<24} {:>6}", holding.component_id, holding.cost);
    }
}
