use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use typeshare::typeshare;

use super::{
  container::HealthStatus, docksmith_timestamp, version::ChangeType,
};

/// Output of one shell-level action (compose up, hook script),
/// captured for the operation record.
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Log {
  pub stage: String,
  pub command: String,
  pub stdout: String,
  pub stderr: String,
  pub success: bool,
  pub start_ts: i64,
  pub end_ts: i64,
}

impl Log {
  pub fn simple(
    stage: &str,
    msg: impl Into<String>,
  ) -> Log {
    let ts = docksmith_timestamp();
    Log {
      stage: stage.to_string(),
      stdout: msg.into(),
      success: true,
      start_ts: ts,
      end_ts: ts,
      ..Default::default()
    }
  }

  pub fn error(stage: &str, msg: impl Into<String>) -> Log {
    let ts = docksmith_timestamp();
    Log {
      stage: stage.to_string(),
      stderr: msg.into(),
      success: false,
      start_ts: ts,
      end_ts: ts,
      ..Default::default()
    }
  }

  /// stdout and stderr merged, in that order.
  pub fn combined(&self) -> String {
    match (self.stdout.is_empty(), self.stderr.is_empty()) {
      (false, false) => {
        format!("{}\n{}", self.stdout, self.stderr)
      }
      (false, true) => self.stdout.clone(),
      (true, false) => self.stderr.clone(),
      (true, true) => String::new(),
    }
  }
}

/// Outcome of checking one container for updates.
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
  EnumString,
  AsRefStr,
)]
pub enum UpdateStatus {
  #[default]
  Unknown,
  UpdateAvailable,
  /// An update exists but the pre-update check failed.
  UpdateAvailableBlocked,
  UpToDate,
  /// Tracking a meta tag whose digest matches a concrete
  /// semver tag the container could pin to instead.
  UpToDatePinnable,
  LocalImage,
  CheckFailed,
  MetadataUnavailable,
  /// The compose file names a different image than the one
  /// the container is running.
  ComposeMismatch,
  Ignored,
}

/// Everything the decision engine concluded about one container.
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerUpdate {
  pub container_name: String,
  pub image: String,
  #[serde(default)]
  pub current_tag: String,
  #[serde(default)]
  pub current_version: String,
  #[serde(default)]
  pub current_suffix: String,
  #[serde(default)]
  pub current_digest: String,
  #[serde(default)]
  pub latest_version: String,
  /// Semver resolved from the meta tag's digest. May hold the
  /// literal sentinel `latest` when only the meta tag itself
  /// matched, which callers must not treat as a real version.
  #[serde(default)]
  pub latest_resolved_version: String,
  #[serde(default)]
  pub latest_digest: String,
  #[serde(default)]
  pub available_tags: Vec<String>,
  #[serde(default)]
  pub change_type: ChangeType,
  #[serde(default)]
  pub status: UpdateStatus,
  pub error: Option<String>,
  #[serde(default)]
  pub is_local: bool,
  /// Concrete tag to pin to, set iff status is UpToDatePinnable.
  pub recommended_tag: Option<String>,
  #[serde(default)]
  pub using_latest_tag: bool,
  pub pre_update_check: Option<String>,
  pub pre_update_check_fail: Option<String>,
  #[serde(default)]
  pub pre_update_check_pass: bool,
  #[serde(default)]
  pub health_status: HealthStatus,
  /// Raw image spec from the compose file on mismatch.
  pub compose_image: Option<String>,
  #[serde(default)]
  pub env_controlled: bool,
  pub env_var_name: Option<String>,
  // Host-side metadata, computed fresh on every check.
  #[serde(default)]
  pub stack: String,
  #[serde(default)]
  pub service: String,
  #[serde(default)]
  pub depends_on: Vec<String>,
  #[serde(default)]
  pub labels_out_of_sync: bool,
}

impl ContainerUpdate {
  pub fn has_update(&self) -> bool {
    matches!(
      self.status,
      UpdateStatus::UpdateAvailable
        | UpdateStatus::UpdateAvailableBlocked
    )
  }
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
  EnumString,
  AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationType {
  #[default]
  Single,
  Batch,
  Stack,
  Rollback,
}

#[typeshare]
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationStatus {
  #[default]
  Queued,
  Validating,
  Backup,
  UpdatingCompose,
  PullingImage,
  Recreating,
  HealthCheck,
  RollingBack,
  Complete,
  Failed,
  Cancelled,
}

impl OperationStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      OperationStatus::Complete
        | OperationStatus::Failed
        | OperationStatus::Cancelled
    )
  }

  /// Nominal progress through the workflow, for progress events.
  pub fn progress_percent(&self) -> u8 {
    match self {
      OperationStatus::Queued => 0,
      OperationStatus::Validating => 0,
      OperationStatus::Backup => 10,
      OperationStatus::UpdatingCompose => 20,
      OperationStatus::PullingImage => 30,
      OperationStatus::Recreating => 60,
      OperationStatus::HealthCheck => 80,
      OperationStatus::RollingBack => 95,
      OperationStatus::Complete => 100,
      OperationStatus::Failed => 100,
      OperationStatus::Cancelled => 100,
    }
  }
}

/// A single persisted unit of update work.
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateOperation {
  /// UUID, assigned on creation.
  pub operation_id: String,
  pub container_id: Option<String>,
  pub container_name: Option<String>,
  #[serde(default)]
  pub stack_name: String,
  #[serde(default)]
  pub operation_type: OperationType,
  #[serde(default)]
  pub status: OperationStatus,
  /// The image tag before the update. Source of truth for
  /// rollback, no physical backup file is required.
  pub old_version: Option<String>,
  pub new_version: Option<String>,
  pub created_at: i64,
  pub started_at: Option<i64>,
  pub completed_at: Option<i64>,
  pub error_message: Option<String>,
  #[serde(default)]
  pub rollback_occurred: bool,
  #[serde(default)]
  pub dependents_affected: Vec<String>,
  pub batch_group_id: Option<String>,
  /// Compose file the operation edits, saved at backup stage.
  pub compose_file: Option<String>,
  /// Older operations may reference a physical
  /// `.backup.<ts>` file. Accepted when present, never written.
  pub backup_path: Option<String>,
}

impl UpdateOperation {
  pub fn new(
    operation_type: OperationType,
    stack_name: impl Into<String>,
  ) -> UpdateOperation {
    UpdateOperation {
      operation_id: uuid::Uuid::new_v4().to_string(),
      stack_name: stack_name.into(),
      operation_type,
      status: OperationStatus::Queued,
      created_at: docksmith_timestamp(),
      ..Default::default()
    }
  }
}

/// An operation parked behind a busy stack lock.
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueuedUpdate {
  pub operation_id: String,
  pub stack_name: String,
  #[serde(default)]
  pub containers: Vec<String>,
  pub queued_at: i64,
}

#[typeshare]
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RollbackEntity {
  Container,
  Stack,
  #[default]
  Global,
}

/// Whether failed updates automatically roll back, at
/// container, stack or global scope.
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackPolicy {
  #[serde(default)]
  pub entity_type: RollbackEntity,
  #[serde(default)]
  pub entity_id: String,
  #[serde(default)]
  pub auto_rollback_enabled: bool,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn terminal_statuses() {
    assert!(OperationStatus::Complete.is_terminal());
    assert!(OperationStatus::Failed.is_terminal());
    assert!(OperationStatus::Cancelled.is_terminal());
    assert!(!OperationStatus::Recreating.is_terminal());
    assert!(!OperationStatus::Queued.is_terminal());
  }

  #[test]
  fn new_operation_is_queued_with_id() {
    let op = UpdateOperation::new(OperationType::Single, "media");
    assert_eq!(op.status, OperationStatus::Queued);
    assert_eq!(op.stack_name, "media");
    assert!(!op.operation_id.is_empty());
    assert!(!op.rollback_occurred);
  }

  #[test]
  fn log_combined_merges_streams() {
    let log = Log {
      stdout: "out".to_string(),
      stderr: "err".to_string(),
      ..Default::default()
    };
    assert_eq!(log.combined(), "out\nerr");
    assert_eq!(Log::simple("s", "hi").combined(), "hi");
  }
}
