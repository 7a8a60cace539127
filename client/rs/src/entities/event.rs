use derive_variants::EnumVariants;
use serde::{Deserialize, Serialize};
use strum::Display;
use typeshare::typeshare;

use super::update::OperationStatus;

/// Stage markers published while a discovery pass runs.
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
#[strum(serialize_all = "snake_case")]
pub enum CheckStage {
  #[default]
  Discovering,
  Checked,
  Complete,
}

#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckProgress {
  #[serde(default)]
  pub stage: CheckStage,
  pub total: usize,
  pub checked: usize,
  pub percent: u8,
  pub container_name: Option<String>,
  #[serde(default)]
  pub message: String,
}

#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateProgress {
  pub operation_id: String,
  pub container_id: Option<String>,
  #[serde(default)]
  pub container_name: String,
  #[serde(default)]
  pub stack_name: String,
  #[serde(default)]
  pub stage: OperationStatus,
  pub progress: u8,
  #[serde(default)]
  pub message: String,
  pub timestamp: i64,
}

#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerUpdated {
  pub container_id: Option<String>,
  pub container_name: Option<String>,
  pub operation_id: Option<String>,
  #[serde(default)]
  pub status: String,
  /// Producer marker, eg `background_checker`, used to break
  /// event loops.
  pub source: Option<String>,
  /// Updates found, on background-check completion events.
  pub count: Option<usize>,
}

/// Everything the engine publishes over the event bus.
#[typeshare]
#[derive(
  Debug, Clone, Serialize, Deserialize, EnumVariants,
)]
#[variant_derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display
)]
#[serde(tag = "type", content = "payload")]
pub enum Event {
  CheckProgress(CheckProgress),
  ContainerUpdated(ContainerUpdated),
  UpdateProgress(UpdateProgress),
}

/// Source marker on events produced by the background checker.
pub const SOURCE_BACKGROUND_CHECKER: &str = "background_checker";
