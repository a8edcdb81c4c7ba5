//! gangway.toml configuration parser.
//!
//! Every section is optional; omitted fields take the defaults below.
//!
//! ```toml
//! [controller]
//! replica_id = "replica-a"
//! evaluation_interval_ms = 500
//!
//! [retry]
//! on_timeout = "requeue"
//! max_retries = 3
//!
//! [[queues]]
//! name = "training"
//! capacity_share = 0.6
//!
//! [[nodes]]
//! id = "gpu-1"
//! cpu_millis = 32000
//! memory_bytes = 274877906944
//! accelerators = 8
//! accelerator_type = "a100"
//! labels = { rack = "r1" }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GangwayConfig {
    pub controller: ControllerConfig,
    pub retry: RetryConfig,
    pub oracle: OracleConfig,
    pub queues: Vec<QueueConfig>,
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Identity used when acquiring per-queue leases.
    pub replica_id: String,
    pub evaluation_interval_ms: u64,
    pub sweep_interval_ms: u64,
    /// Upper bound on one two-phase commit, independent of group timeouts.
    pub commit_timeout_ms: u64,
    pub lease_ttl_ms: u64,
    pub max_evaluations_per_cycle: u32,
    /// Applied to groups that don't declare `schedule_timeout_secs`.
    pub default_schedule_timeout_secs: u64,
    pub max_hierarchy_depth: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            replica_id: "gangway-0".to_string(),
            evaluation_interval_ms: 500,
            sweep_interval_ms: 1_000,
            commit_timeout_ms: 5_000,
            lease_ttl_ms: 10_000,
            max_evaluations_per_cycle: 16,
            default_schedule_timeout_secs: 300,
            max_hierarchy_depth: 16,
        }
    }
}

impl ControllerConfig {
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }
}

/// What happens to a group once its schedule timeout expires.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Stay `TimedOut`.
    #[default]
    Expire,
    /// Move on to `Failed`.
    Fail,
    /// Go back to `Pending` with exponential backoff, up to `max_retries`.
    Requeue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub on_timeout: TimeoutAction,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Commit conflicts tolerated before the owner is told about them.
    pub conflict_budget: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            on_timeout: TimeoutAction::Expire,
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            conflict_budget: 5,
        }
    }
}

impl RetryConfig {
    /// Backoff before the `retry`-th re-admission (1-based): base · 2^(retry−1), capped.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(32);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OracleConfig {
    pub query_attempts: u32,
    pub query_backoff_ms: u64,
    /// Consecutive failed evaluations before a queue pauses.
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown_ms: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            query_attempts: 3,
            query_backoff_ms: 100,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Soft quota as a fraction of cluster capacity.
    #[serde(default = "default_share")]
    pub capacity_share: f64,
}

fn default_weight() -> u32 {
    1
}

fn default_share() -> f64 {
    1.0
}

/// A node in the static inventory backing the in-memory capacity oracle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    pub id: String,
    #[serde(default)]
    pub cpu_millis: u64,
    #[serde(default)]
    pub memory_bytes: u64,
    #[serde(default)]
    pub accelerators: u32,
    pub accelerator_type: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl GangwayConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: GangwayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let c = &self.controller;
        if c.evaluation_interval_ms == 0 || c.sweep_interval_ms == 0 {
            bail!("controller intervals must be positive");
        }
        if c.commit_timeout_ms == 0 || c.lease_ttl_ms == 0 {
            bail!("commit_timeout_ms and lease_ttl_ms must be positive");
        }
        if c.default_schedule_timeout_secs == 0 {
            bail!("default_schedule_timeout_secs must be positive");
        }
        if c.max_hierarchy_depth == 0 {
            bail!("max_hierarchy_depth must be positive");
        }
        if self.oracle.query_attempts == 0 {
            bail!("oracle.query_attempts must be at least 1");
        }

        let mut seen = HashSet::new();
        for q in &self.queues {
            if q.name.is_empty() {
                bail!("queue name must not be empty");
            }
            if !seen.insert(q.name.as_str()) {
                bail!("duplicate queue: {}", q.name);
            }
            if !(q.capacity_share > 0.0 && q.capacity_share <= 1.0) {
                bail!(
                    "queue {}: capacity_share must be in (0, 1], got {}",
                    q.name,
                    q.capacity_share
                );
            }
        }

        let mut seen = HashSet::new();
        for n in &self.nodes {
            if !seen.insert(n.id.as_str()) {
                bail!("duplicate node: {}", n.id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = GangwayConfig::from_toml_str("").unwrap();
        assert_eq!(config.controller.evaluation_interval_ms, 500);
        assert_eq!(config.controller.default_schedule_timeout_secs, 300);
        assert_eq!(config.retry.on_timeout, TimeoutAction::Expire);
        assert!(config.queues.is_empty());
    }

    #[test]
    fn parse_full() {
        let toml_str = r#"
[controller]
replica_id = "replica-b"
sweep_interval_ms = 250

[retry]
on_timeout = "requeue"
max_retries = 5

[oracle]
circuit_breaker_threshold = 2

[[queues]]
name = "training"
capacity_share = 0.5

[[queues]]
name = "batch"

[[nodes]]
id = "gpu-1"
cpu_millis = 32000
memory_bytes = 1024
accelerators = 8
accelerator_type = "a100"
labels = { rack = "r1" }
"#;
        let config = GangwayConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.controller.replica_id, "replica-b");
        assert_eq!(config.controller.sweep_interval_ms, 250);
        // Untouched fields keep defaults.
        assert_eq!(config.controller.commit_timeout_ms, 5_000);
        assert_eq!(config.retry.on_timeout, TimeoutAction::Requeue);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.oracle.circuit_breaker_threshold, 2);
        assert_eq!(config.queues.len(), 2);
        assert_eq!(config.queues[1].capacity_share, 1.0);
        assert_eq!(config.queues[1].weight, 1);
        assert_eq!(config.nodes[0].accelerator_type.as_deref(), Some("a100"));
        assert_eq!(config.nodes[0].labels.get("rack").map(String::as_str), Some("r1"));
    }

    #[test]
    fn rejects_bad_capacity_share() {
        let toml_str = r#"
[[queues]]
name = "q"
capacity_share = 1.5
"#;
        assert!(GangwayConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn rejects_duplicate_nodes() {
        let toml_str = r#"
[[nodes]]
id = "n1"

[[nodes]]
id = "n1"
"#;
        assert!(GangwayConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn rejects_zero_interval() {
        let toml_str = r#"
[controller]
sweep_interval_ms = 0
"#;
        assert!(GangwayConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryConfig {
            backoff_base_ms: 1_000,
            backoff_max_ms: 5_000,
            ..RetryConfig::default()
        };
        assert_eq!(retry.backoff_for(1), Duration::from_secs(1));
        assert_eq!(retry.backoff_for(2), Duration::from_secs(2));
        assert_eq!(retry.backoff_for(3), Duration::from_secs(4));
        assert_eq!(retry.backoff_for(4), Duration::from_secs(5));
        assert_eq!(retry.backoff_for(60), Duration::from_secs(5));
    }

    #[test]
    fn toml_roundtrip_keeps_queues() {
        let mut config = GangwayConfig::default();
        config.queues.push(QueueConfig {
            name: "training".to_string(),
            weight: 2,
            capacity_share: 0.75,
        });
        let text = config.to_toml_string().unwrap();
        let back = GangwayConfig::from_toml_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
