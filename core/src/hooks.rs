use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, anyhow};
use docksmith_client::entities::{
  docksmith_timestamp, update::Log,
};
use tokio::process::Command;

use crate::config::core_config;

/// Pre-update checks get 30 seconds.
pub const PRE_UPDATE_TIMEOUT: Duration = Duration::from_secs(30);
/// Post-update actions get 60 seconds.
pub const POST_UPDATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of a hook script run. Exit code zero is a pass;
/// anything else fails with the merged output retained.
#[derive(Debug)]
pub struct HookResult {
  pub pass: bool,
  /// Merged stdout + stderr.
  pub output: String,
  pub log: Log,
}

/// Reject script paths containing shell metacharacters or
/// escaping the configured scripts directory.
pub fn validate_script_path(script: &str) -> anyhow::Result<()> {
  if script.trim().is_empty() {
    return Err(anyhow!("empty script path"));
  }
  if script.contains([
    ';', '&', '|', '`', '$', '<', '>', '(', ')', '\n',
  ]) {
    return Err(anyhow!(
      "script path contains shell metacharacters: {script}"
    ));
  }
  let scripts_dir = &core_config().scripts_dir;
  let path = Path::new(script);
  if path
    .components()
    .any(|c| c == std::path::Component::ParentDir)
  {
    return Err(anyhow!(
      "script path must not contain '..': {script}"
    ));
  }
  if !path.starts_with(scripts_dir) {
    return Err(anyhow!(
      "script {script} is outside the scripts directory {scripts_dir:?}"
    ));
  }
  Ok(())
}

/// Run a container's pre-update check script with
/// `CONTAINER_NAME` in the environment.
pub async fn run_pre_update_check(
  script: &str,
  container_name: &str,
) -> anyhow::Result<HookResult> {
  validate_script_path(script)?;
  run_hook(
    "Pre Update Check",
    script,
    &[],
    &[("CONTAINER_NAME", container_name)],
    PRE_UPDATE_TIMEOUT,
  )
  .await
}

/// Run a post-update script with the container id and name as
/// arguments.
pub async fn run_post_update_script(
  script: &str,
  container_id: &str,
  container_name: &str,
) -> anyhow::Result<HookResult> {
  validate_script_path(script)?;
  run_hook(
    "Post Update Script",
    script,
    &[container_id, container_name],
    &[("CONTAINER_NAME", container_name)],
    POST_UPDATE_TIMEOUT,
  )
  .await
}

async fn run_hook(
  stage: &str,
  script: &str,
  args: &[&str],
  env: &[(&str, &str)],
  timeout: Duration,
) -> anyhow::Result<HookResult> {
  let start_ts = docksmith_timestamp();
  let mut command = Command::new(script);
  command
    .args(args)
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);
  for (key, value) in env {
    command.env(key, value);
  }

  let output =
    tokio::time::timeout(timeout, command.output())
      .await
      .map_err(|_| {
        anyhow!(
          "script {script} timed out after {}s",
          timeout.as_secs()
        )
      })?
      .with_context(|| {
        format!("failed to execute script {script}")
      })?;

  let stdout =
    String::from_utf8_lossy(&output.stdout).to_string();
  let stderr =
    String::from_utf8_lossy(&output.stderr).to_string();
  let pass = output.status.success();
  let log = Log {
    stage: stage.to_string(),
    command: format!("{script} {}", args.join(" "))
      .trim_end()
      .to_string(),
    stdout: stdout.clone(),
    stderr: stderr.clone(),
    success: pass,
    start_ts,
    end_ts: docksmith_timestamp(),
  };
  Ok(HookResult {
    pass,
    output: log.combined(),
    log,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_shell_metacharacters() {
    for script in [
      "/opt/docksmith/scripts/a.sh; rm -rf /",
      "/opt/docksmith/scripts/$(whoami).sh",
      "/opt/docksmith/scripts/a.sh | tee",
      "",
    ] {
      assert!(validate_script_path(script).is_err());
    }
  }

  #[test]
  fn rejects_paths_outside_scripts_dir() {
    assert!(validate_script_path("/tmp/evil.sh").is_err());
    assert!(
      validate_script_path("/opt/docksmith/scripts/check.sh")
        .is_ok()
    );
  }
}
