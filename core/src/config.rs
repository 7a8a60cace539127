use std::{
  path::{Path, PathBuf},
  sync::OnceLock,
};

use config::ConfigLoader;
use docksmith_client::entities::logger::LogConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
  /// Max containers checked in parallel during discovery.
  #[serde(default = "default_max_concurrent_checks")]
  pub max_concurrent_checks: usize,

  /// Seconds between background check runs.
  #[serde(default = "default_check_interval")]
  pub check_interval: u64,

  /// Seconds a per-image check result stays cached.
  #[serde(default = "default_cache_ttl")]
  pub cache_ttl: u64,

  /// Total seconds to wait for a recreated container to
  /// report healthy.
  #[serde(default = "default_health_check_timeout")]
  pub health_check_timeout: u64,

  /// Seconds to wait before verifying `running` on containers
  /// without a healthcheck.
  #[serde(default = "default_health_check_fallback_wait")]
  pub health_check_fallback_wait: u64,

  /// Auto rollback for containers with a healthcheck, when no
  /// label or stored policy decides. Containers without a
  /// healthcheck never auto roll back by default.
  #[serde(default)]
  pub default_auto_rollback: bool,

  /// Pre / post update scripts must live under this directory.
  #[serde(default = "default_scripts_dir")]
  pub scripts_dir: PathBuf,

  /// Optional toml file mapping container names to stacks, for
  /// containers outside any compose project.
  #[serde(default)]
  pub stack_definitions_file: Option<PathBuf>,

  /// Bound on each event subscriber's channel. Slow
  /// subscribers past this lose events.
  #[serde(default = "default_event_channel_capacity")]
  pub event_channel_capacity: usize,

  /// Use `docker-compose` instead of `docker compose`.
  #[serde(default)]
  pub legacy_compose_cli: bool,

  #[serde(default)]
  pub logging: LogConfig,
}

fn default_max_concurrent_checks() -> usize {
  5
}
fn default_check_interval() -> u64 {
  1800
}
fn default_cache_ttl() -> u64 {
  600
}
fn default_health_check_timeout() -> u64 {
  60
}
fn default_health_check_fallback_wait() -> u64 {
  10
}
fn default_scripts_dir() -> PathBuf {
  PathBuf::from("/opt/docksmith/scripts")
}
fn default_event_channel_capacity() -> usize {
  256
}

impl Default for CoreConfig {
  fn default() -> Self {
    CoreConfig {
      max_concurrent_checks: default_max_concurrent_checks(),
      check_interval: default_check_interval(),
      cache_ttl: default_cache_ttl(),
      health_check_timeout: default_health_check_timeout(),
      health_check_fallback_wait:
        default_health_check_fallback_wait(),
      default_auto_rollback: false,
      scripts_dir: default_scripts_dir(),
      stack_definitions_file: None,
      event_channel_capacity: default_event_channel_capacity(),
      legacy_compose_cli: false,
      logging: Default::default(),
    }
  }
}

/// Environment overrides, highest precedence.
#[derive(Debug, Deserialize)]
pub struct Env {
  #[serde(default)]
  pub docksmith_config_paths: Vec<PathBuf>,
  #[serde(default)]
  pub docksmith_config_keywords: Vec<String>,
  pub docksmith_max_concurrent_checks: Option<usize>,
  pub docksmith_check_interval: Option<u64>,
  pub docksmith_cache_ttl: Option<u64>,
  pub docksmith_health_check_timeout: Option<u64>,
  pub docksmith_default_auto_rollback: Option<bool>,
  pub docksmith_scripts_dir: Option<PathBuf>,
  pub docksmith_stack_definitions_file: Option<PathBuf>,
  pub docksmith_legacy_compose_cli: Option<bool>,
}

static CORE_CONFIG: OnceLock<CoreConfig> = OnceLock::new();

/// Install the engine configuration. Must be called in the app
/// startup sequence, before any component reads it.
pub fn set_core_config(
  config: CoreConfig,
) -> anyhow::Result<()> {
  CORE_CONFIG
    .set(config)
    .map_err(|_| anyhow::anyhow!("core config already set"))
}

/// Engine configuration. Falls back to defaults when the
/// embedding application never installed one (tests).
pub fn core_config() -> &'static CoreConfig {
  CORE_CONFIG.get_or_init(Default::default)
}

/// Load configuration from files + environment. Environment
/// values override file values.
pub fn load_core_config() -> anyhow::Result<CoreConfig> {
  dotenvy::dotenv().ok();
  let env: Env = envy::from_env()
    .map_err(|e| anyhow::anyhow!("invalid environment | {e:?}"))?;

  let config: CoreConfig = if env.docksmith_config_paths.is_empty()
  {
    Default::default()
  } else {
    ConfigLoader {
      paths: &env
        .docksmith_config_paths
        .iter()
        .map(PathBuf::as_path)
        .collect::<Vec<&Path>>(),
      match_wildcards: &env
        .docksmith_config_keywords
        .iter()
        .map(String::as_str)
        .collect::<Vec<&str>>(),
      merge_nested: true,
      extend_array: false,
      debug_print: false,
    }
    .load()
    .map_err(|e| {
      anyhow::anyhow!("failed to load config files | {e:?}")
    })?
  };

  Ok(CoreConfig {
    max_concurrent_checks: env
      .docksmith_max_concurrent_checks
      .unwrap_or(config.max_concurrent_checks),
    check_interval: env
      .docksmith_check_interval
      .unwrap_or(config.check_interval),
    cache_ttl: env.docksmith_cache_ttl.unwrap_or(config.cache_ttl),
    health_check_timeout: env
      .docksmith_health_check_timeout
      .unwrap_or(config.health_check_timeout),
    health_check_fallback_wait: config
      .health_check_fallback_wait,
    default_auto_rollback: env
      .docksmith_default_auto_rollback
      .unwrap_or(config.default_auto_rollback),
    scripts_dir: env
      .docksmith_scripts_dir
      .unwrap_or(config.scripts_dir),
    stack_definitions_file: env
      .docksmith_stack_definitions_file
      .or(config.stack_definitions_file),
    event_channel_capacity: config.event_channel_capacity,
    legacy_compose_cli: env
      .docksmith_legacy_compose_cli
      .unwrap_or(config.legacy_compose_cli),
    logging: config.logging,
  })
}
