use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::WardenError;

/// Environment variable that overrides `[budget] capacity`.
pub const CAPACITY_ENV: &str = "WARDEN_BUDGET_CAPACITY";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub snapshots: SnapshotConfig,
    #[serde(default)]
    pub demand: DemandConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_capacity")]
    pub capacity: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

fn default_capacity() -> u64 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_per_second")]
    pub per_second: u32,
    /// Defaults to `per_second` when omitted.
    pub burst: Option<u32>,
}

impl RateLimitConfig {
    pub fn burst(&self) -> u32 {
        self.burst.unwrap_or(self.per_second)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: default_per_second(),
            burst: None,
        }
    }
}

fn default_per_second() -> u32 {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// A probe still pending after this long marks the component unresponsive.
    #[serde(default = "default_hard_timeout_ms")]
    pub hard_timeout_ms: u64,
    #[serde(default = "default_failure_limit")]
    pub failure_limit: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            hard_timeout_ms: default_hard_timeout_ms(),
            failure_limit: default_failure_limit(),
        }
    }
}

fn default_interval_ms() -> u64 {
    10_000
}
fn default_probe_timeout_ms() -> u64 {
    2_000
}
fn default_hard_timeout_ms() -> u64 {
    10_000
}
fn default_failure_limit() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// How long a caller waits on a wake before `WakeTimeout`.
    #[serde(default = "default_wake_deadline_ms")]
    pub wake_deadline_ms: u64,
    /// Bound on a single step (snapshot save/restore, state import/export).
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    /// Bound on a whole transition; exceeding it forces `Disabled`.
    #[serde(default = "default_transition_timeout_ms")]
    pub transition_timeout_ms: u64,
    #[serde(default = "default_cas_retries")]
    pub cas_retries: u32,
    #[serde(default = "default_eviction_rounds")]
    pub eviction_rounds: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            wake_deadline_ms: default_wake_deadline_ms(),
            step_timeout_ms: default_step_timeout_ms(),
            transition_timeout_ms: default_transition_timeout_ms(),
            cas_retries: default_cas_retries(),
            eviction_rounds: default_eviction_rounds(),
        }
    }
}

fn default_wake_deadline_ms() -> u64 {
    5_000
}
fn default_step_timeout_ms() -> u64 {
    10_000
}
fn default_transition_timeout_ms() -> u64 {
    30_000
}
fn default_cas_retries() -> u32 {
    3
}
fn default_eviction_rounds() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    /// Snapshots kept per component beyond the newest.
    #[serde(default = "default_retention_count")]
    pub retention_count: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            retention_count: default_retention_count(),
        }
    }
}

fn default_retention_count() -> usize {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct DemandConfig {
    #[serde(default = "default_half_life_ms")]
    pub half_life_ms: u64,
}

impl Default for DemandConfig {
    fn default() -> Self {
        Self {
            half_life_ms: default_half_life_ms(),
        }
    }
}

fn default_half_life_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    pub registry_dir: Option<PathBuf>,
    pub snapshot_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn registry_dir(&self) -> PathBuf {
        self.registry_dir
            .clone()
            .unwrap_or_else(|| warden_home().join("registry"))
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.snapshot_dir
            .clone()
            .unwrap_or_else(|| warden_home().join("snapshots"))
    }
}

fn warden_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".warden")
}

impl WardenConfig {
    pub fn from_file(path: &Path) -> Result<Self, WardenError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| WardenError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, WardenError> {
        let mut config: WardenConfig = toml::from_str(content)
            .map_err(|e| WardenError::Config(format!("failed to parse config: {e}")))?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), WardenError> {
        if let Ok(raw) = std::env::var(CAPACITY_ENV) {
            self.budget.capacity = raw
                .parse()
                .map_err(|_| WardenError::Config(format!("{CAPACITY_ENV}={raw:?} is not a number")))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), WardenError> {
        let checks = [
            (self.budget.capacity > 0, "budget.capacity must be positive"),
            (
                self.breaker.failure_threshold > 0,
                "breaker.failure_threshold must be positive",
            ),
            (
                self.rate_limit.per_second > 0,
                "rate_limit.per_second must be positive",
            ),
            (self.rate_limit.burst() > 0, "rate_limit.burst must be positive"),
            (
                self.snapshots.retention_count > 0,
                "snapshots.retention_count must be at least 1",
            ),
            (
                self.health.failure_limit > 0,
                "health.failure_limit must be positive",
            ),
            (
                self.lifecycle.transition_timeout_ms >= self.lifecycle.step_timeout_ms,
                "lifecycle.transition_timeout_ms must not be shorter than step_timeout_ms",
            ),
            (self.demand.half_life_ms > 0, "demand.half_life_ms must be positive"),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, msg)) => Err(WardenError::Config((*msg).into())),
            None => Ok(()),
        }
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.breaker.reset_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.health.probe_timeout_ms)
    }

    pub fn hard_timeout(&self) -> Duration {
        Duration::from_millis(self.health.hard_timeout_ms)
    }

    pub fn wake_deadline(&self) -> Duration {
        Duration::from_millis(self.lifecycle.wake_deadline_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.lifecycle.step_timeout_ms)
    }

    pub fn transition_timeout(&self) -> Duration {
        Duration::from_millis(self.lifecycle.transition_timeout_ms)
    }

    pub fn demand_half_life(&self) -> Duration {
        Duration::from_millis(self.demand.half_life_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: WardenConfig = toml::from_str("").unwrap();
        assert_eq!(config.budget.capacity, 100);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.rate_limit.burst(), 50);
        assert_eq!(config.health.failure_limit, 3);
        assert_eq!(config.snapshots.retention_count, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_full_config() {
        let toml_str = r#"
[budget]
capacity = 250

[breaker]
failure_threshold = 3
reset_timeout_ms = 1000

[rate_limit]
per_second = 5
burst = 10

[health]
interval_ms = 500
probe_timeout_ms = 100
hard_timeout_ms = 400
failure_limit = 3

[lifecycle]
wake_deadline_ms = 100
step_timeout_ms = 2000
transition_timeout_ms = 4000

[snapshots]
retention_count = 2

[storage]
registry_dir = "/var/lib/warden/registry"
"#;
        let config: WardenConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.budget.capacity, 250);
        assert_eq!(config.reset_timeout(), Duration::from_secs(1));
        assert_eq!(config.rate_limit.burst(), 10);
        assert_eq!(config.wake_deadline(), Duration::from_millis(100));
        assert_eq!(config.lifecycle.cas_retries, 3);
        assert_eq!(
            config.storage.registry_dir(),
            PathBuf::from("/var/lib/warden/registry")
        );
        assert!(config.storage.snapshot_dir().ends_with("snapshots"));
    }

    #[test]
    fn rejects_zero_capacity() {
        let config: WardenConfig = toml::from_str("[budget]\ncapacity = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(WardenError::Config(_))));
    }

    #[test]
    fn rejects_transition_shorter_than_step() {
        let toml_str = r#"
[lifecycle]
step_timeout_ms = 5000
transition_timeout_ms = 1000
"#;
        let config: WardenConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_toml_is_config_error() {
        assert!(matches!(
            WardenConfig::from_toml_str("[budget\ncapacity = 1"),
            Err(WardenError::Config(_))
        ));
    }
}
