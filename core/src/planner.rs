use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{Context, anyhow};
use docksmith_client::entities::{
  stack::DiscoveryResult,
  update::{ContainerUpdate, UpdateStatus},
  version::ChangeType,
};
use indexmap::IndexMap;
use serde::Serialize;
use typeshare::typeshare;

/// One container in an execution plan.
#[typeshare]
#[derive(Debug, Clone, Serialize)]
pub struct PlanEntry {
  pub container_name: String,
  pub stack: String,
  pub current_version: String,
  pub target_version: String,
  pub change_type: ChangeType,
  /// Pre-update check failed; requires explicit bypass.
  pub blocked: bool,
}

#[typeshare]
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlanStats {
  pub major: usize,
  pub minor: usize,
  pub patch: usize,
  pub other: usize,
  pub by_stack: IndexMap<String, usize>,
  /// Containers moving off `latest` onto a concrete semver.
  pub semver_migrations: usize,
}

/// A validated update plan: the user's selection expanded with
/// its update-needing dependents, in execution order.
#[typeshare]
#[derive(Debug, Clone, Serialize)]
pub struct UpdatePlan {
  pub entries: Vec<PlanEntry>,
  /// Up-to-date dependents that only need a restart after
  /// their dependency updates.
  pub restart_only: Vec<String>,
  pub execution_order: Vec<String>,
  pub stats: PlanStats,
  pub warnings: Vec<String>,
}

impl UpdatePlan {
  /// name -> target version, as the orchestrator wants it.
  pub fn target_versions(&self) -> HashMap<String, String> {
    self
      .entries
      .iter()
      .map(|entry| {
        (
          entry.container_name.clone(),
          entry.target_version.clone(),
        )
      })
      .collect()
  }
}

/// Expand a selection against the latest discovery result and
/// validate it into an executable plan.
pub fn build_plan(
  selection: &[String],
  discovery: &DiscoveryResult,
  bypass_checks: &[String],
) -> anyhow::Result<UpdatePlan> {
  if selection.is_empty() {
    return Err(anyhow!("selection is empty"));
  }

  let by_name: HashMap<&str, &ContainerUpdate> = discovery
    .containers
    .iter()
    .map(|update| (update.container_name.as_str(), update))
    .collect();
  // name -> direct dependents
  let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
  for update in &discovery.containers {
    for dependency in &update.depends_on {
      reverse
        .entry(dependency.as_str())
        .or_default()
        .push(update.container_name.as_str());
    }
  }

  let mut affected: Vec<&ContainerUpdate> = Vec::new();
  let mut affected_names: HashSet<&str> = HashSet::new();
  let mut restart_only: Vec<String> = Vec::new();
  let mut frontier: VecDeque<&str> = VecDeque::new();

  for name in selection {
    let update =
      by_name.get(name.as_str()).copied().with_context(
        || format!("unknown container in selection: {name}"),
      )?;
    if affected_names.insert(update.container_name.as_str())
    {
      affected.push(update);
      frontier.push_back(update.container_name.as_str());
    }
  }

  // Pull in transitive dependents. Only those that need an
  // update themselves join the plan; the rest are surfaced as
  // restart-only.
  while let Some(current) = frontier.pop_front() {
    for &dependent in reverse
      .get(current)
      .map(Vec::as_slice)
      .unwrap_or_default()
    {
      if affected_names.contains(dependent)
        || restart_only.iter().any(|name| name == dependent)
      {
        continue;
      }
      let update = by_name[dependent];
      if update.has_update() {
        affected_names.insert(dependent);
        affected.push(update);
        frontier.push_back(dependent);
      } else {
        restart_only.push(dependent.to_string());
      }
    }
  }

  if discovery.update_order.is_empty() {
    return Err(anyhow!(
      "no update order available, the container graph has cycles"
    ));
  }
  let execution_order: Vec<String> = discovery
    .update_order
    .iter()
    .filter(|name| affected_names.contains(name.as_str()))
    .cloned()
    .collect();
  if execution_order.len() != affected.len() {
    return Err(anyhow!(
      "some selected containers are missing from the update order"
    ));
  }

  let mut entries = Vec::with_capacity(affected.len());
  let mut stats = PlanStats::default();
  let mut stacks: HashSet<&str> = HashSet::new();
  let mut bypassed = 0usize;
  for update in &affected {
    let blocked =
      update.status == UpdateStatus::UpdateAvailableBlocked;
    if blocked {
      if !bypass_checks
        .contains(&update.container_name)
      {
        return Err(anyhow!(
          "{} is blocked by its pre-update check and not bypassed",
          update.container_name
        ));
      }
      bypassed += 1;
    }
    let target_version = update
      .recommended_tag
      .clone()
      .filter(|_| {
        update.status == UpdateStatus::UpToDatePinnable
      })
      .unwrap_or_else(|| update.latest_version.clone());
    if target_version.is_empty() {
      return Err(anyhow!(
        "{} has no target version to update to",
        update.container_name
      ));
    }
    match update.change_type {
      ChangeType::Major => stats.major += 1,
      ChangeType::Minor => stats.minor += 1,
      ChangeType::Patch => stats.patch += 1,
      _ => stats.other += 1,
    }
    if !update.stack.is_empty() {
      stacks.insert(update.stack.as_str());
      *stats
        .by_stack
        .entry(update.stack.clone())
        .or_default() += 1;
    }
    if update.using_latest_tag
      && update.recommended_tag.is_some()
    {
      stats.semver_migrations += 1;
    }
    entries.push(PlanEntry {
      container_name: update.container_name.clone(),
      stack: update.stack.clone(),
      current_version: update.current_version.clone(),
      target_version,
      change_type: update.change_type,
      blocked,
    });
  }

  let mut warnings = Vec::new();
  if stats.major > 0 {
    warnings.push(format!(
      "{} major version update(s) selected",
      stats.major
    ));
  }
  if stacks.len() > 1 {
    warnings.push(format!(
      "plan spans {} stacks",
      stacks.len()
    ));
  }
  if bypassed > 0 {
    warnings.push(format!(
      "{bypassed} failing pre-update check(s) bypassed"
    ));
  }
  if !restart_only.is_empty() {
    warnings.push(format!(
      "{} dependent container(s) will only be restarted: {}",
      restart_only.len(),
      restart_only.join(", ")
    ));
  }

  Ok(UpdatePlan {
    entries,
    restart_only,
    execution_order,
    stats,
    warnings,
  })
}

#[cfg(test)]
mod tests {
  use docksmith_client::entities::stack::DiscoveryResult;

  use super::*;

  fn update(
    name: &str,
    stack: &str,
    status: UpdateStatus,
    change: ChangeType,
    latest: &str,
    depends_on: &[&str],
  ) -> ContainerUpdate {
    ContainerUpdate {
      container_name: name.to_string(),
      stack: stack.to_string(),
      status,
      change_type: change,
      current_version: "1.0.0".to_string(),
      latest_version: latest.to_string(),
      depends_on: depends_on
        .iter()
        .map(|d| d.to_string())
        .collect(),
      ..Default::default()
    }
  }

  fn discovery(
    containers: Vec<ContainerUpdate>,
    order: &[&str],
  ) -> DiscoveryResult {
    DiscoveryResult {
      containers,
      update_order: order
        .iter()
        .map(|name| name.to_string())
        .collect(),
      ..Default::default()
    }
  }

  #[test]
  fn empty_selection_is_rejected() {
    let result =
      discovery(vec![], &[]);
    assert!(build_plan(&[], &result, &[]).is_err());
  }

  #[test]
  fn expands_with_updating_dependents() {
    let result = discovery(
      vec![
        update(
          "db",
          "app",
          UpdateStatus::UpdateAvailable,
          ChangeType::Minor,
          "14",
          &[],
        ),
        update(
          "api",
          "app",
          UpdateStatus::UpdateAvailable,
          ChangeType::Patch,
          "2.0.1",
          &["db"],
        ),
        update(
          "web",
          "app",
          UpdateStatus::UpToDate,
          ChangeType::None,
          "",
          &["api"],
        ),
      ],
      &["db", "api", "web"],
    );
    let plan = build_plan(
      &["db".to_string()],
      &result,
      &[],
    )
    .unwrap();
    let names: Vec<&str> = plan
      .entries
      .iter()
      .map(|entry| entry.container_name.as_str())
      .collect();
    assert!(names.contains(&"db"));
    assert!(names.contains(&"api"));
    assert!(!names.contains(&"web"));
    assert_eq!(plan.restart_only, ["web"]);
    assert_eq!(plan.execution_order, ["db", "api"]);
    assert!(
      plan
        .warnings
        .iter()
        .any(|warning| warning.contains("restarted"))
    );
  }

  #[test]
  fn blocked_without_bypass_fails_validation() {
    let result = discovery(
      vec![update(
        "db",
        "app",
        UpdateStatus::UpdateAvailableBlocked,
        ChangeType::Patch,
        "13.1",
        &[],
      )],
      &["db"],
    );
    assert!(
      build_plan(&["db".to_string()], &result, &[]).is_err()
    );
    let plan = build_plan(
      &["db".to_string()],
      &result,
      &["db".to_string()],
    )
    .unwrap();
    assert!(plan.entries[0].blocked);
    assert!(
      plan
        .warnings
        .iter()
        .any(|warning| warning.contains("bypassed"))
    );
  }

  #[test]
  fn cycles_invalidate_the_plan() {
    let result = discovery(
      vec![update(
        "db",
        "app",
        UpdateStatus::UpdateAvailable,
        ChangeType::Patch,
        "13.1",
        &[],
      )],
      // Empty order means the graph had cycles.
      &[],
    );
    assert!(
      build_plan(&["db".to_string()], &result, &[]).is_err()
    );
  }

  #[test]
  fn stats_and_warnings_cover_majors_and_stacks() {
    let result = discovery(
      vec![
        update(
          "a",
          "s1",
          UpdateStatus::UpdateAvailable,
          ChangeType::Major,
          "2.0.0",
          &[],
        ),
        update(
          "b",
          "s2",
          UpdateStatus::UpdateAvailable,
          ChangeType::Patch,
          "1.0.1",
          &[],
        ),
      ],
      &["a", "b"],
    );
    let plan = build_plan(
      &["a".to_string(), "b".to_string()],
      &result,
      &[],
    )
    .unwrap();
    assert_eq!(plan.stats.major, 1);
    assert_eq!(plan.stats.patch, 1);
    assert_eq!(plan.stats.by_stack.len(), 2);
    assert!(
      plan
        .warnings
        .iter()
        .any(|warning| warning.contains("major"))
    );
    assert!(
      plan
        .warnings
        .iter()
        .any(|warning| warning.contains("stacks"))
    );
  }

  #[test]
  fn pinnable_containers_migrate_to_recommended_tag() {
    let mut pinnable = update(
      "plex",
      "media",
      UpdateStatus::UpToDatePinnable,
      ChangeType::None,
      "",
      &[],
    );
    pinnable.using_latest_tag = true;
    pinnable.recommended_tag =
      Some("1.32.7.7621".to_string());
    let result = discovery(vec![pinnable], &["plex"]);
    let plan = build_plan(
      &["plex".to_string()],
      &result,
      &[],
    )
    .unwrap();
    assert_eq!(
      plan.entries[0].target_version,
      "1.32.7.7621"
    );
    assert_eq!(plan.stats.semver_migrations, 1);
  }
}
