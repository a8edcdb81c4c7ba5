//! Workload manifest: group declarations and their member requests.
//!
//! ```toml
//! [[groups]]
//! id = "llm-train"
//! queue = "training"
//! min_member = 4
//! priority = 10
//!
//! [[requests]]
//! id = "rank-0"
//! group = "llm-train"
//! cpu_millis = 4000
//! memory_bytes = 17179869184
//! accelerators = 1
//! accelerator_type = "h100"
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, bail};
use serde::Deserialize;

use gangway_state::{GroupSpec, PlacementConstraints, Request, ResourceVector};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub groups: Vec<GroupDecl>,
    pub requests: Vec<RequestDecl>,
}

#[derive(Debug, Deserialize)]
pub struct GroupDecl {
    pub id: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    pub min_member: u32,
    pub max_member: Option<u32>,
    #[serde(default)]
    pub priority: i32,
    pub schedule_timeout_secs: Option<u64>,
    #[serde(alias = "parent")]
    pub parent_group_id: Option<String>,
    pub topology_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RequestDecl {
    pub id: String,
    pub group: String,
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

fn default_queue() -> String {
    gangway_scheduler::DEFAULT_QUEUE.to_string()
}

impl GroupDecl {
    pub fn to_spec(&self) -> GroupSpec {
        GroupSpec {
            id: self.id.clone(),
            min_member: self.min_member,
            max_member: self.max_member,
            queue: self.queue.clone(),
            priority: self.priority,
            schedule_timeout_secs: self.schedule_timeout_secs,
            parent_group_id: self.parent_group_id.clone(),
            topology_key: self.topology_key.clone(),
        }
    }
}

impl RequestDecl {
    pub fn to_request(&self) -> Request {
        Request::new(
            &self.id,
            &self.group,
            ResourceVector::new(self.cpu_millis, self.memory_bytes, self.accelerators),
        )
        .with_constraints(PlacementConstraints {
            accelerator_type: self.accelerator_type.clone(),
            required_labels: self.labels.clone(),
        })
    }
}

impl Manifest {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let manifest: Manifest = toml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Cross-references only; group specs are validated on registration.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut groups = HashSet::new();
        for g in &self.groups {
            if !groups.insert(g.id.as_str()) {
                bail!("duplicate group: {}", g.id);
            }
        }
        let mut requests = HashSet::new();
        for r in &self.requests {
            if !groups.contains(r.group.as_str()) {
                bail!("request {} names undeclared group {}", r.id, r.group);
            }
            if !requests.insert((r.group.as_str(), r.id.as_str())) {
                bail!("duplicate request {} in group {}", r.id, r.group);
            }
        }
        Ok(())
    }

    /// Every request paired with its group's spec, in file order.
    pub fn registrations(&self) -> Vec<(GroupSpec, Request)> {
        let specs: HashMap<&str, GroupSpec> = self
            .groups
            .iter()
            .map(|g| (g.id.as_str(), g.to_spec()))
            .collect();
        self.requests
            .iter()
            .filter_map(|r| specs.get(r.group.as_str()).map(|s| (s.clone(), r.to_request())))
            .collect()
    }
}
