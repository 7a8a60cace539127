use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use anyhow::{Context, anyhow};
use docksmith_client::entities::{
  container::ContainerRecord,
  docksmith_timestamp,
  image::ImageRef,
  policy::{ContainerPolicy, PostUpdateAction},
  update::{OperationStatus, UpdateOperation},
};
use tokio::sync::{OwnedMutexGuard, mpsc};
use tracing::{error, info, warn};

use crate::{
  compose, hooks,
  runtime::ContainerRuntime,
  store::Store,
  update::{StageFailure, UpdateOrchestrator, rollback},
};

pub(crate) const PULL_ATTEMPTS: u32 = 3;
pub(crate) const PULL_BACKOFF_BASE: Duration =
  Duration::from_secs(1);
/// Stop timeout during recreation.
pub(crate) const STOP_TIMEOUT_SECS: u32 = 10;

pub(crate) async fn execute_single_update<R, S>(
  orchestrator: &UpdateOrchestrator<R, S>,
  mut operation: UpdateOperation,
  container: ContainerRecord,
  _guard: OwnedMutexGuard<()>,
) where
  R: ContainerRuntime + 'static,
  S: Store + 'static,
{
  operation.started_at = Some(docksmith_timestamp());
  match run_single_workflow(
    orchestrator,
    &mut operation,
    &container,
  )
  .await
  {
    Ok(()) => {
      info!(
        "updated {} to {}",
        container.name,
        operation.new_version.as_deref().unwrap_or("?")
      );
      orchestrator
        .finish_operation(
          &mut operation,
          OperationStatus::Complete,
          "updated",
        )
        .await;
    }
    Err(failure) => {
      fail_with_rollback(
        orchestrator,
        &mut operation,
        &container,
        failure,
      )
      .await;
    }
  }
}

/// The stage pipeline. Any error carries the stage it happened
/// in so the failure handler can decide about rollback.
async fn run_single_workflow<R, S>(
  orchestrator: &UpdateOrchestrator<R, S>,
  operation: &mut UpdateOperation,
  container: &ContainerRecord,
) -> Result<(), StageFailure>
where
  R: ContainerRuntime + 'static,
  S: Store + 'static,
{
  let target = operation
    .new_version
    .clone()
    .ok_or_else(|| {
      StageFailure::new(
        OperationStatus::Validating,
        anyhow!("operation has no target version"),
      )
    })?;
  let compose_file = compose::compose_file_path(container);

  // validating
  orchestrator
    .set_stage(
      operation,
      OperationStatus::Validating,
      "validating preconditions",
    )
    .await;
  validate(orchestrator, compose_file.as_deref())
    .await
    .map_err(|e| {
      StageFailure::new(OperationStatus::Validating, e)
    })?;

  // backup: persist everything needed to reconstruct the
  // pre-update state. The database record is the rollback
  // source of truth, no physical backup file is written.
  orchestrator
    .set_stage(
      operation,
      OperationStatus::Backup,
      "saving pre-update state",
    )
    .await;
  let image = ImageRef::parse(&container.image);
  operation.old_version = Some(image.tag.full.clone());
  operation.compose_file = compose_file
    .as_ref()
    .map(|path| path.display().to_string());
  if let Some(path) = &compose_file {
    let contents = tokio::fs::read_to_string(path)
      .await
      .with_context(|| {
        format!("failed to read compose file {path:?}")
      })
      .map_err(|e| {
        StageFailure::new(OperationStatus::Backup, e)
      })?;
    compose::parse_compose(&contents).map_err(|e| {
      StageFailure::new(OperationStatus::Backup, e)
    })?;
  }
  orchestrator
    .store
    .save_operation(operation)
    .await
    .context("failed to persist pre-update state")
    .map_err(|e| {
      StageFailure::new(OperationStatus::Backup, e)
    })?;

  // updating_compose
  orchestrator
    .set_stage(
      operation,
      OperationStatus::UpdatingCompose,
      "rewriting image tag",
    )
    .await;
  if let Some(path) = &compose_file {
    edit_compose_tag(path, container, &target)
      .await
      .map_err(|e| {
        StageFailure::new(OperationStatus::UpdatingCompose, e)
      })?;
  }

  // pulling_image
  let new_image = image.with_tag(&target);
  orchestrator
    .set_stage(
      operation,
      OperationStatus::PullingImage,
      &format!("pulling {new_image}"),
    )
    .await;
  pull_with_retries(orchestrator, operation, &new_image)
    .await
    .map_err(|e| {
      StageFailure::new(OperationStatus::PullingImage, e)
    })?;

  // recreating
  orchestrator
    .set_stage(
      operation,
      OperationStatus::Recreating,
      "recreating container",
    )
    .await;
  recreate_container(
    orchestrator,
    operation,
    container,
    compose_file.as_deref(),
    &new_image,
  )
  .await
  .map_err(|e| {
    StageFailure::new(OperationStatus::Recreating, e)
  })?;

  // health_check
  orchestrator
    .set_stage(
      operation,
      OperationStatus::HealthCheck,
      "verifying container health",
    )
    .await;
  super::health::verify_container_health(
    orchestrator.runtime.as_ref(),
    &container.name,
  )
  .await
  .map_err(|e| {
    StageFailure::new(OperationStatus::HealthCheck, e)
  })?;

  // post-update actions never fail the operation
  orchestrator.bus.publish_update_progress(
    operation,
    OperationStatus::HealthCheck,
    "running post-update actions",
  );
  run_post_update_actions(
    orchestrator,
    container,
    compose_file.as_deref(),
  )
  .await;

  Ok(())
}

pub(crate) async fn fail_with_rollback<R, S>(
  orchestrator: &UpdateOrchestrator<R, S>,
  operation: &mut UpdateOperation,
  container: &ContainerRecord,
  failure: StageFailure,
) where
  R: ContainerRuntime + 'static,
  S: Store + 'static,
{
  error!(
    "update of {} failed at {} | {:#}",
    container.name, failure.stage, failure.error
  );
  let mut message =
    UpdateOrchestrator::<R, S>::render_failure(&failure);

  let rollback_eligible = matches!(
    failure.stage,
    OperationStatus::PullingImage
      | OperationStatus::Recreating
      | OperationStatus::HealthCheck
  );
  if rollback_eligible
    && rollback::auto_rollback_enabled(
      orchestrator,
      container,
      &operation.stack_name,
    )
    .await
  {
    orchestrator
      .set_stage(
        operation,
        OperationStatus::RollingBack,
        "rolling back to previous version",
      )
      .await;
    match rollback::revert_in_flight(
      orchestrator,
      operation,
      container,
      failure.stage,
    )
    .await
    {
      Ok(()) => {
        operation.rollback_occurred = true;
        message.push_str(
          "\nrolled back to previous version successfully",
        );
      }
      Err(e) => {
        error!(
          "rollback of {} also failed | {e:#}",
          container.name
        );
        message
          .push_str(&format!("\nrollback failed | {e:#}"));
      }
    }
  }

  operation.error_message = Some(message);
  orchestrator
    .finish_operation(
      operation,
      OperationStatus::Failed,
      "failed",
    )
    .await;
}

pub(crate) async fn validate<R, S>(
  orchestrator: &UpdateOrchestrator<R, S>,
  compose_file: Option<&Path>,
) -> anyhow::Result<()>
where
  R: ContainerRuntime + 'static,
  S: Store + 'static,
{
  orchestrator
    .runtime
    .ping()
    .await
    .context("docker daemon unreachable")?;
  let Some(path) = compose_file else {
    return Ok(());
  };
  tokio::fs::metadata(path).await.with_context(|| {
    format!("compose file {path:?} is not readable")
  })?;
  let dir = path
    .parent()
    .context("compose file has no parent directory")?;
  ensure_writable(dir).await.with_context(|| {
    format!("compose directory {dir:?} is not writable")
  })?;
  Ok(())
}

/// Probe writability by creating and removing a scratch file.
async fn ensure_writable(dir: &Path) -> anyhow::Result<()> {
  let probe = dir.join(".docksmith-write-probe");
  tokio::fs::write(&probe, b"")
    .await
    .context("write probe failed")?;
  tokio::fs::remove_file(&probe).await.ok();
  Ok(())
}

pub(crate) async fn edit_compose_tag(
  path: &Path,
  container: &ContainerRecord,
  new_tag: &str,
) -> anyhow::Result<()> {
  let contents = tokio::fs::read_to_string(path)
    .await
    .with_context(|| {
      format!("failed to read compose file {path:?}")
    })?;
  let model = compose::parse_compose(&contents)?;
  let (service, _) =
    compose::service_for_container(&model, container)
      .with_context(|| {
        format!(
          "no compose service found for container {}",
          container.name
        )
      })?;
  let updated =
    compose::update_image_tag(&contents, service, new_tag)?;
  compose::write_atomic(path, &updated).await
}

/// Pull with exponential-backoff retries, forwarding per-layer
/// progress into `pulling_image` events.
pub(crate) async fn pull_with_retries<R, S>(
  orchestrator: &UpdateOrchestrator<R, S>,
  operation: &UpdateOperation,
  image: &str,
) -> anyhow::Result<()>
where
  R: ContainerRuntime + 'static,
  S: Store + 'static,
{
  let mut last_error = None;
  for attempt in 0..PULL_ATTEMPTS {
    if attempt > 0 {
      tokio::time::sleep(
        PULL_BACKOFF_BASE * 2u32.pow(attempt - 1),
      )
      .await;
    }
    let (tx, mut rx) = mpsc::channel::<crate::runtime::PullProgress>(32);
    let forwarder = async {
      while let Some(progress) = rx.recv().await {
        // Per-layer progress maps onto the 30-60% band.
        let percent = match (progress.current, progress.total)
        {
          (Some(current), Some(total)) if total > 0 => {
            30 + ((current.min(total) * 30) / total) as u8
          }
          _ => OperationStatus::PullingImage
            .progress_percent(),
        };
        orchestrator.bus.publish_update_progress(
          operation,
          OperationStatus::PullingImage,
          &format!("{} ({percent}%)", progress.status),
        );
      }
    };
    let (result, ()) = tokio::join!(
      orchestrator.runtime.pull_image(image, tx),
      forwarder
    );
    match result {
      Ok(()) => return Ok(()),
      Err(e) => {
        warn!(
          "pull attempt {} of {PULL_ATTEMPTS} failed for {image} | {e:#}",
          attempt + 1
        );
        last_error = Some(e);
      }
    }
  }
  Err(
    last_error
      .unwrap_or_else(|| anyhow!("pull failed"))
      .context(format!(
        "failed to pull {image} after {PULL_ATTEMPTS} attempts"
      )),
  )
}

/// Preferred: compose up against the already-edited file.
/// Fallback for non-compose containers: stop, remove, create
/// with the new image preserving config, start.
pub(crate) async fn recreate_container<R, S>(
  orchestrator: &UpdateOrchestrator<R, S>,
  operation: &UpdateOperation,
  container: &ContainerRecord,
  compose_file: Option<&Path>,
  new_image: &str,
) -> anyhow::Result<()>
where
  R: ContainerRuntime + 'static,
  S: Store + 'static,
{
  if let Some(path) = compose_file {
    let log = orchestrator
      .runtime
      .compose_up(path, Some(container.compose_service()))
      .await
      .context("docker compose up failed to launch")?;
    orchestrator.bus.publish_update_progress(
      operation,
      OperationStatus::Recreating,
      &log.combined(),
    );
    if !log.success {
      return Err(anyhow!(
        "docker compose up failed:\n{}",
        log.combined()
      ));
    }
    return Ok(());
  }

  let details = orchestrator
    .runtime
    .inspect_container(&container.name)
    .await
    .context("failed to inspect container")?;
  orchestrator
    .runtime
    .stop_container(&container.name, Some(STOP_TIMEOUT_SECS))
    .await
    .context("failed to stop container")?;
  orchestrator
    .runtime
    .remove_container(&container.name)
    .await
    .context("failed to remove container")?;
  orchestrator
    .runtime
    .create_container(&details, &container.name, new_image)
    .await
    .context("failed to create container")?;
  orchestrator
    .runtime
    .start_container(&container.name)
    .await
    .context("failed to start container")?;
  Ok(())
}

/// Restart dependent peers, then run the container's own
/// post-update directive. Failures log but never fail the
/// operation.
async fn run_post_update_actions<R, S>(
  orchestrator: &UpdateOrchestrator<R, S>,
  container: &ContainerRecord,
  compose_file: Option<&Path>,
) where
  R: ContainerRuntime + 'static,
  S: Store + 'static,
{
  // Peers declaring restart-depends-on this container.
  match orchestrator.runtime.list_containers().await {
    Ok(peers) => {
      for peer in peers {
        let peer_policy =
          ContainerPolicy::from_labels(&peer.labels);
        if !peer_policy
          .restart_depends_on
          .contains(&container.name)
        {
          continue;
        }
        if let Some(script) = &peer_policy.pre_update_check {
          match hooks::run_pre_update_check(
            script, &peer.name,
          )
          .await
          {
            Ok(result) if result.pass => {}
            Ok(_) => {
              warn!(
                "skipping restart of {}: pre-update check failed",
                peer.name
              );
              continue;
            }
            Err(e) => {
              warn!(
                "skipping restart of {}: {e:#}",
                peer.name
              );
              continue;
            }
          }
        }
        if let Err(e) = orchestrator
          .runtime
          .restart_container(&peer.name)
          .await
        {
          warn!("failed to restart {} | {e:#}", peer.name);
        }
      }
    }
    Err(e) => {
      warn!("failed to list dependent peers | {e:#}")
    }
  }

  let policy = ContainerPolicy::from_labels(&container.labels);
  let Some(action) = policy.post_update else {
    return;
  };
  if let Err(e) = run_post_update_action(
    orchestrator,
    container,
    compose_file,
    &action,
  )
  .await
  {
    warn!(
      "post-update action for {} failed | {e:#}",
      container.name
    );
  }
}

async fn run_post_update_action<R, S>(
  orchestrator: &UpdateOrchestrator<R, S>,
  container: &ContainerRecord,
  compose_file: Option<&Path>,
  action: &PostUpdateAction,
) -> anyhow::Result<()>
where
  R: ContainerRuntime + 'static,
  S: Store + 'static,
{
  match action {
    PostUpdateAction::Restart(names) => {
      for name in names {
        orchestrator
          .runtime
          .restart_container(name)
          .await
          .with_context(|| {
            format!("failed to restart {name}")
          })?;
      }
    }
    PostUpdateAction::ComposeRestart(services) => {
      let path: PathBuf = compose_file
        .context("compose-restart without a compose file")?
        .to_path_buf();
      orchestrator
        .runtime
        .compose_restart(&path, services)
        .await?;
    }
    PostUpdateAction::Script(script) => {
      let result = hooks::run_post_update_script(
        script,
        &container.id,
        &container.name,
      )
      .await?;
      if !result.pass {
        return Err(anyhow!(
          "post-update script failed:\n{}",
          result.output
        ));
      }
    }
    PostUpdateAction::Exec(shell) => {
      let log = tokio::time::timeout(
        hooks::POST_UPDATE_TIMEOUT,
        command::run_docksmith_command(
          "Post Update Exec",
          None,
          shell,
        ),
      )
      .await
      .map_err(|_| {
        anyhow!("post-update exec timed out")
      })?;
      if !log.success {
        return Err(anyhow!(
          "post-update exec failed:\n{}",
          log.combined()
        ));
      }
    }
  }
  Ok(())
}
