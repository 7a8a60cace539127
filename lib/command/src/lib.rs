use std::path::Path;

use docksmith_client::entities::{
  docksmith_timestamp, update::Log,
};
use run_command::{CommandOutput, async_run_command};

/// Run a shell command, optionally from a working directory,
/// capturing the output as an operation [Log].
pub async fn run_docksmith_command(
  stage: &str,
  path: impl Into<Option<&Path>>,
  command: impl AsRef<str>,
) -> Log {
  let command = if let Some(path) = path.into() {
    format!("cd {} && {}", path.display(), command.as_ref())
  } else {
    command.as_ref().to_string()
  };
  let start_ts = docksmith_timestamp();
  let output = async_run_command(&command).await;
  output_into_log(stage, command, start_ts, output)
}

pub fn output_into_log(
  stage: &str,
  command: String,
  start_ts: i64,
  output: CommandOutput,
) -> Log {
  let success = output.success();
  Log {
    stage: stage.to_string(),
    stdout: output.stdout,
    stderr: output.stderr,
    command,
    success,
    start_ts,
    end_ts: docksmith_timestamp(),
  }
}
