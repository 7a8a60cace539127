use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::Display;
use typeshare::typeshare;

use super::update::ContainerUpdate;

/// Highest-magnitude change available within a stack.
#[typeshare]
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePriority {
  #[default]
  None,
  Patch,
  Minor,
  Major,
}

/// Containers grouped under one compose project or manual
/// stack definition.
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackSummary {
  pub name: String,
  #[serde(default)]
  pub containers: Vec<String>,
  #[serde(default)]
  pub has_updates: bool,
  #[serde(default)]
  pub update_priority: UpdatePriority,
}

#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckCounts {
  pub total_checked: usize,
  pub updates_found: usize,
  pub up_to_date: usize,
  pub local_images: usize,
  pub failed: usize,
  pub ignored: usize,
}

#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckTimestamps {
  /// Unix ms of the last explicit cache refresh.
  pub last_cache_refresh: Option<i64>,
  /// Unix ms of the last background run, successful or not.
  pub last_background_run: Option<i64>,
  #[serde(default)]
  pub checking: bool,
  pub next_check: Option<i64>,
  /// Seconds.
  #[serde(default)]
  pub cache_ttl: u64,
  /// Seconds.
  #[serde(default)]
  pub check_interval: u64,
}

/// Aggregate of one full discovery pass over the host.
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryResult {
  #[serde(default)]
  pub containers: Vec<ContainerUpdate>,
  #[serde(default)]
  pub stacks: IndexMap<String, StackSummary>,
  #[serde(default)]
  pub standalone_containers: Vec<String>,
  /// Topological order, dependencies first. Empty when the
  /// container graph has cycles.
  #[serde(default)]
  pub update_order: Vec<String>,
  #[serde(default)]
  pub counts: CheckCounts,
  #[serde(default)]
  pub timestamps: CheckTimestamps,
}

impl DiscoveryResult {
  pub fn container(
    &self,
    name: &str,
  ) -> Option<&ContainerUpdate> {
    self
      .containers
      .iter()
      .find(|container| container.container_name == name)
  }
}
