use std::{collections::HashMap, path::Path};

use anyhow::Context;
use docksmith_client::entities::container::{
  ContainerRecord, labels,
};
use serde::Deserialize;
use tracing::info;

/// Maps containers to stacks: compose project label first, then
/// manual definitions, then standalone (empty).
#[derive(Debug, Default)]
pub struct StackResolver {
  /// container name -> stack name
  manual: HashMap<String, String>,
}

#[derive(Deserialize)]
struct StackDefinitions {
  #[serde(default)]
  stacks: HashMap<String, String>,
}

impl StackResolver {
  pub fn new(manual: HashMap<String, String>) -> StackResolver {
    StackResolver { manual }
  }

  /// Load manual definitions from an optional toml file:
  /// `[stacks]` with `container = "stack"` entries.
  pub fn load(
    path: Option<&Path>,
  ) -> anyhow::Result<StackResolver> {
    let Some(path) = path else {
      return Ok(Default::default());
    };
    let contents = std::fs::read_to_string(path)
      .with_context(|| {
        format!("failed to read stack definitions at {path:?}")
      })?;
    let definitions: StackDefinitions =
      toml::from_str(&contents).with_context(|| {
        format!("invalid stack definitions at {path:?}")
      })?;
    info!(
      "loaded {} manual stack definitions",
      definitions.stacks.len()
    );
    Ok(StackResolver {
      manual: definitions.stacks,
    })
  }

  /// Empty string means standalone.
  pub fn resolve(&self, container: &ContainerRecord) -> String {
    if let Some(project) =
      container.label(labels::COMPOSE_PROJECT)
    {
      return project.to_string();
    }
    self
      .manual
      .get(&container.name)
      .cloned()
      .unwrap_or_default()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn compose_project_label_wins() {
    let resolver = StackResolver::new(
      [("db".to_string(), "manual".to_string())].into(),
    );
    let mut container = ContainerRecord {
      name: "db".to_string(),
      ..Default::default()
    };
    container.labels.insert(
      labels::COMPOSE_PROJECT.to_string(),
      "media".to_string(),
    );
    assert_eq!(resolver.resolve(&container), "media");
  }

  #[test]
  fn manual_definition_backfills() {
    let resolver = StackResolver::new(
      [("db".to_string(), "manual".to_string())].into(),
    );
    let container = ContainerRecord {
      name: "db".to_string(),
      ..Default::default()
    };
    assert_eq!(resolver.resolve(&container), "manual");
  }

  #[test]
  fn unknown_container_is_standalone() {
    let resolver = StackResolver::default();
    let container = ContainerRecord {
      name: "adhoc".to_string(),
      ..Default::default()
    };
    assert_eq!(resolver.resolve(&container), "");
  }
}
