use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use super::{container::labels, version::Version};

/// `true` / `1` / `yes`, case insensitive.
pub fn truthy(value: &str) -> bool {
  matches!(
    value.trim().to_ascii_lowercase().as_str(),
    "true" | "1" | "yes"
  )
}

/// All `docksmith.*` policy read off a container's labels,
/// parsed once so the rest of the engine never string-matches
/// label names.
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerPolicy {
  #[serde(default)]
  pub ignore: bool,
  #[serde(default)]
  pub allow_latest: bool,
  #[serde(default)]
  pub allow_prerelease: bool,
  pub pre_update_check: Option<String>,
  pub post_update: Option<PostUpdateAction>,
  /// Ordering edges, treated identically to compose depends_on.
  #[serde(default)]
  pub restart_after: Vec<String>,
  /// Peers to restart after this container updates.
  #[serde(default)]
  pub restart_depends_on: Vec<String>,
  /// Candidate tags must match. Invalid patterns fail open.
  pub tag_regex: Option<String>,
  pub version_min: Option<Version>,
  pub version_max: Option<Version>,
  #[serde(default)]
  pub pin_major: bool,
  #[serde(default)]
  pub pin_minor: bool,
  #[serde(default)]
  pub pin_patch: bool,
  /// None means fall through to stack / global policy.
  pub auto_rollback: Option<bool>,
}

impl ContainerPolicy {
  pub fn from_labels(
    container_labels: &HashMap<String, String>,
  ) -> ContainerPolicy {
    let flag = |key: &str| {
      container_labels.get(key).is_some_and(|v| truthy(v))
    };
    let list = |key: &str| -> Vec<String> {
      container_labels
        .get(key)
        .map(|value| {
          value
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
        })
        .unwrap_or_default()
    };
    ContainerPolicy {
      ignore: flag(labels::IGNORE),
      allow_latest: flag(labels::ALLOW_LATEST),
      allow_prerelease: flag(labels::ALLOW_PRERELEASE),
      pre_update_check: container_labels
        .get(labels::PRE_UPDATE_CHECK)
        .filter(|script| !script.trim().is_empty())
        .cloned(),
      post_update: container_labels
        .get(labels::POST_UPDATE)
        .and_then(|directive| {
          PostUpdateAction::parse(directive)
        }),
      restart_after: list(labels::RESTART_AFTER),
      restart_depends_on: list(labels::RESTART_DEPENDS_ON),
      tag_regex: container_labels
        .get(labels::TAG_REGEX)
        .filter(|pattern| !pattern.trim().is_empty())
        .cloned(),
      version_min: container_labels
        .get(labels::VERSION_MIN)
        .and_then(|raw| Version::parse(raw)),
      version_max: container_labels
        .get(labels::VERSION_MAX)
        .and_then(|raw| Version::parse(raw)),
      pin_major: flag(labels::VERSION_PIN_MAJOR),
      pin_minor: flag(labels::VERSION_PIN_MINOR),
      pin_patch: flag(labels::VERSION_PIN_PATCH),
      auto_rollback: container_labels
        .get(labels::AUTO_ROLLBACK)
        .map(|value| truthy(value)),
    }
  }
}

/// The `docksmith.post-update` directive, run after a
/// successful update. Failures are logged but never fail the
/// operation.
#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum PostUpdateAction {
  /// `restart:<container names>`
  Restart(Vec<String>),
  /// `compose-restart:<service names>`
  ComposeRestart(Vec<String>),
  /// `script:<path>`
  Script(String),
  /// `exec:<shell command>`
  Exec(String),
}

impl PostUpdateAction {
  pub fn parse(directive: &str) -> Option<PostUpdateAction> {
    let (action, params) = directive.split_once(':')?;
    let params = params.trim();
    if params.is_empty() {
      return None;
    }
    let names = || {
      params
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
    };
    match action.trim() {
      "restart" => Some(PostUpdateAction::Restart(names())),
      "compose-restart" => {
        Some(PostUpdateAction::ComposeRestart(names()))
      }
      "script" => {
        Some(PostUpdateAction::Script(params.to_string()))
      }
      "exec" => Some(PostUpdateAction::Exec(params.to_string())),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn labels_of(
    pairs: &[(&str, &str)],
  ) -> HashMap<String, String> {
    pairs
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect()
  }

  #[test]
  fn parses_flags_and_pins() {
    let policy = ContainerPolicy::from_labels(&labels_of(&[
      (labels::IGNORE, "yes"),
      (labels::ALLOW_PRERELEASE, "1"),
      (labels::VERSION_PIN_MINOR, "true"),
      (labels::VERSION_MIN, "1.20.0"),
      (labels::AUTO_ROLLBACK, "false"),
    ]));
    assert!(policy.ignore);
    assert!(policy.allow_prerelease);
    assert!(policy.pin_minor);
    assert!(!policy.pin_major);
    assert_eq!(policy.version_min.unwrap().major, 1);
    assert_eq!(policy.auto_rollback, Some(false));
  }

  #[test]
  fn missing_auto_rollback_falls_through() {
    let policy = ContainerPolicy::from_labels(&labels_of(&[]));
    assert_eq!(policy.auto_rollback, None);
  }

  #[test]
  fn parses_post_update_directives() {
    assert_eq!(
      PostUpdateAction::parse("restart:db, redis"),
      Some(PostUpdateAction::Restart(vec![
        "db".to_string(),
        "redis".to_string()
      ]))
    );
    assert_eq!(
      PostUpdateAction::parse("compose-restart:web"),
      Some(PostUpdateAction::ComposeRestart(vec![
        "web".to_string()
      ]))
    );
    assert_eq!(
      PostUpdateAction::parse("script:/scripts/after.sh"),
      Some(PostUpdateAction::Script(
        "/scripts/after.sh".to_string()
      ))
    );
    assert_eq!(
      PostUpdateAction::parse("exec:echo done"),
      Some(PostUpdateAction::Exec("echo done".to_string()))
    );
    assert_eq!(PostUpdateAction::parse("nonsense"), None);
    assert_eq!(PostUpdateAction::parse("restart:"), None);
  }
}
