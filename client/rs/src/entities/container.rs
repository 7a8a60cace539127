use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::Display;
use typeshare::typeshare;

/// Label keys the engine reads off running containers.
pub mod labels {
  // Compose-controlled labels.
  pub const COMPOSE_PROJECT: &str = "com.docker.compose.project";
  pub const COMPOSE_SERVICE: &str = "com.docker.compose.service";
  pub const COMPOSE_DEPENDS_ON: &str =
    "com.docker.compose.depends_on";
  pub const COMPOSE_CONFIG_FILES: &str =
    "com.docker.compose.project.config_files";

  // OCI image metadata.
  pub const OCI_IMAGE_VERSION: &str =
    "org.opencontainers.image.version";

  // Docksmith-controlled labels.
  pub const PREFIX: &str = "docksmith.";
  pub const IGNORE: &str = "docksmith.ignore";
  pub const ALLOW_LATEST: &str = "docksmith.allow-latest";
  pub const ALLOW_PRERELEASE: &str = "docksmith.allow-prerelease";
  pub const PRE_UPDATE_CHECK: &str = "docksmith.pre-update-check";
  pub const POST_UPDATE: &str = "docksmith.post-update";
  pub const RESTART_AFTER: &str = "docksmith.restart-after";
  pub const RESTART_DEPENDS_ON: &str =
    "docksmith.restart-depends-on";
  pub const TAG_REGEX: &str = "docksmith.tag-regex";
  pub const VERSION_MIN: &str = "docksmith.version-min";
  pub const VERSION_MAX: &str = "docksmith.version-max";
  pub const VERSION_PIN_MAJOR: &str = "docksmith.version-pin-major";
  pub const VERSION_PIN_MINOR: &str = "docksmith.version-pin-minor";
  pub const VERSION_PIN_PATCH: &str = "docksmith.version-pin-patch";
  pub const AUTO_ROLLBACK: &str = "docksmith.auto_rollback";
}

#[typeshare]
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
  #[default]
  Unknown,
  Created,
  Running,
  Paused,
  Restarting,
  Exited,
  Removing,
  Dead,
}

#[typeshare]
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
  /// The container does not declare a healthcheck.
  #[default]
  None,
  Starting,
  Healthy,
  Unhealthy,
}

/// A running (or stopped) container as listed by the runtime.
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerRecord {
  pub id: String,
  pub name: String,
  pub image: String,
  #[serde(default)]
  pub labels: HashMap<String, String>,
  #[serde(default)]
  pub state: ContainerState,
  #[serde(default)]
  pub health: HealthStatus,
  /// Raw network mode as the runtime reports it. A shared
  /// namespace (`service:X` in the compose file, surfaced by
  /// the engine as `container:<id-or-name>`) makes the owner a
  /// strict predecessor in the dependency graph.
  pub network_mode: Option<String>,
}

impl ContainerRecord {
  pub fn label(&self, key: &str) -> Option<&str> {
    self.labels.get(key).map(String::as_str)
  }

  pub fn is_compose_managed(&self) -> bool {
    self.labels.contains_key(labels::COMPOSE_CONFIG_FILES)
  }

  pub fn compose_service(&self) -> &str {
    self.label(labels::COMPOSE_SERVICE).unwrap_or(&self.name)
  }
}

/// Enough of an inspected container to recreate it with a new
/// image while preserving its configuration.
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerDetails {
  pub record: ContainerRecord,
  #[serde(default)]
  pub env: Vec<String>,
  #[serde(default)]
  pub cmd: Vec<String>,
  #[serde(default)]
  pub entrypoint: Vec<String>,
  #[serde(default)]
  pub binds: Vec<String>,
  /// `host_port:container_port/proto` bindings.
  #[serde(default)]
  pub ports: Vec<String>,
  #[serde(default)]
  pub networks: Vec<String>,
  pub restart_policy: Option<String>,
  pub healthcheck: Option<HealthcheckConfig>,
}

impl ContainerDetails {
  pub fn has_healthcheck(&self) -> bool {
    self
      .healthcheck
      .as_ref()
      .is_some_and(|check| !check.test.is_empty())
  }
}

#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthcheckConfig {
  #[serde(default)]
  pub test: Vec<String>,
  pub interval: Option<i64>,
  pub timeout: Option<i64>,
  pub retries: Option<i64>,
  pub start_period: Option<i64>,
}
