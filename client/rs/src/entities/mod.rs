use async_timing_util::unix_timestamp_ms;
use serde::{Deserialize, Serialize};
use typeshare::typeshare;

/// Container records and the labels the engine reads.
pub mod container;
/// [Event][event::Event] and its payloads.
pub mod event;
/// [ImageRef][image::ImageRef] and tag decomposition.
pub mod image;
/// Subtypes of [LogConfig][logger::LogConfig].
pub mod logger;
/// [ContainerPolicy][policy::ContainerPolicy], parsed from labels.
pub mod policy;
/// Discovery results and stack summaries.
pub mod stack;
/// Check results, operations, queue entries, rollback policies.
pub mod update;
/// [Version][version::Version] parsing and comparison.
pub mod version;

#[typeshare(serialized_as = "number")]
pub type I64 = i64;
#[typeshare(serialized_as = "number")]
pub type U64 = u64;
#[typeshare(serialized_as = "number")]
pub type Usize = usize;
#[typeshare(serialized_as = "any")]
pub type JsonValue = serde_json::Value;

#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct __Serror {
  pub error: String,
  pub trace: Vec<String>,
}

pub fn all_logs_success(logs: &[update::Log]) -> bool {
  for log in logs {
    if !log.success {
      return false;
    }
  }
  true
}

pub fn optional_string(string: impl Into<String>) -> Option<String> {
  let string = string.into();
  if string.is_empty() {
    None
  } else {
    Some(string)
  }
}

/// Unix timestamp in milliseconds as i64
pub fn docksmith_timestamp() -> i64 {
  unix_timestamp_ms() as i64
}
