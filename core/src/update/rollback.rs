use std::sync::Arc;

use anyhow::{Context, anyhow};
use docksmith_client::entities::{
  container::ContainerRecord,
  docksmith_timestamp,
  image::ImageRef,
  optional_string,
  policy::ContainerPolicy,
  update::{
    OperationStatus, OperationType, RollbackEntity,
    UpdateOperation,
  },
};
use tokio::sync::{OwnedMutexGuard, mpsc};
use tracing::{info, warn};

use crate::{
  config::core_config,
  runtime::ContainerRuntime,
  store::Store,
  update::{
    StageFailure, UpdateOrchestrator, lock_key, single,
  },
};

/// Whether a failed update of `container` should automatically
/// roll back. Precedence: container label, stack policy,
/// global policy, then a conservative default (never without a
/// healthcheck).
pub(crate) async fn auto_rollback_enabled<R, S>(
  orchestrator: &UpdateOrchestrator<R, S>,
  container: &ContainerRecord,
  stack: &str,
) -> bool
where
  R: ContainerRuntime + 'static,
  S: Store + 'static,
{
  if let Some(explicit) =
    ContainerPolicy::from_labels(&container.labels)
      .auto_rollback
  {
    return explicit;
  }
  if !stack.is_empty()
    && let Ok(Some(policy)) = orchestrator
      .store
      .rollback_policy(RollbackEntity::Stack, stack)
      .await
  {
    return policy.auto_rollback_enabled;
  }
  if let Ok(Some(policy)) = orchestrator
    .store
    .rollback_policy(RollbackEntity::Global, "")
    .await
  {
    return policy.auto_rollback_enabled;
  }
  let has_healthcheck = orchestrator
    .runtime
    .inspect_container(&container.name)
    .await
    .map(|details| details.has_healthcheck())
    .unwrap_or(false);
  if !has_healthcheck {
    return false;
  }
  core_config().default_auto_rollback
}

/// Undo a partially applied update in place: compose back to
/// the old tag, best-effort pull, recreate when the new
/// container already replaced the old one, health verified
/// best-effort.
pub(crate) async fn revert_in_flight<R, S>(
  orchestrator: &UpdateOrchestrator<R, S>,
  operation: &UpdateOperation,
  container: &ContainerRecord,
  failed_stage: OperationStatus,
) -> anyhow::Result<()>
where
  R: ContainerRuntime + 'static,
  S: Store + 'static,
{
  let old_version = operation
    .old_version
    .as_deref()
    .context("operation has no saved old version")?;

  if let Some(path) = &operation.compose_file {
    single::edit_compose_tag(
      std::path::Path::new(path),
      container,
      old_version,
    )
    .await
    .context("failed to revert compose file")?;
  }

  // The container was only touched from `recreating` onwards.
  if matches!(
    failed_stage,
    OperationStatus::Recreating | OperationStatus::HealthCheck
  ) {
    let old_image =
      ImageRef::parse(&container.image).with_tag(old_version);
    best_effort_pull(orchestrator, &old_image).await;
    single::recreate_container(
      orchestrator,
      operation,
      container,
      operation
        .compose_file
        .as_deref()
        .map(std::path::Path::new),
      &old_image,
    )
    .await
    .context("failed to recreate on previous version")?;
    if let Err(e) = super::health::verify_container_health(
      orchestrator.runtime.as_ref(),
      &container.name,
    )
    .await
    {
      warn!(
        "rolled back container {} is not healthy | {e:#}",
        container.name
      );
    }
  }
  Ok(())
}

async fn best_effort_pull<R, S>(
  orchestrator: &UpdateOrchestrator<R, S>,
  image: &str,
) where
  R: ContainerRuntime + 'static,
  S: Store + 'static,
{
  let (tx, mut rx) = mpsc::channel(32);
  let drain = async {
    while rx.recv().await.is_some() {}
  };
  let (result, ()) =
    tokio::join!(orchestrator.runtime.pull_image(image, tx), drain);
  if let Err(e) = result {
    warn!("best-effort pull of {image} failed | {e:#}");
  }
}

/// User-requested rollback of a persisted operation. The saved
/// `old_version` is the source of truth; legacy operations
/// carrying only a physical backup path are still accepted as
/// long as the old version was recorded.
pub(crate) async fn rollback_operation<R, S>(
  orchestrator: &Arc<UpdateOrchestrator<R, S>>,
  original_operation_id: &str,
) -> anyhow::Result<String>
where
  R: ContainerRuntime + 'static,
  S: Store + 'static,
{
  let original = orchestrator
    .store
    .get_operation(original_operation_id)
    .await?
    .with_context(|| {
      format!("no operation {original_operation_id}")
    })?;
  let old_version =
    original.old_version.clone().context(
      "operation has no saved version to roll back to",
    )?;
  let container_name = original
    .container_name
    .clone()
    .context("operation has no container")?;
  let container =
    orchestrator.find_container(&container_name).await?;

  let mut operation = UpdateOperation::new(
    OperationType::Rollback,
    &original.stack_name,
  );
  operation.container_id = optional_string(&container.id);
  operation.container_name = Some(container_name.clone());
  operation.new_version = Some(old_version);
  operation.old_version =
    Some(ImageRef::parse(&container.image).tag.full.clone());
  operation.compose_file = original.compose_file.clone();
  operation.batch_group_id =
    Some(original.operation_id.clone());
  orchestrator
    .store
    .save_operation(&operation)
    .await
    .context("failed to persist rollback operation")?;

  let key = lock_key(&original.stack_name, &container_name);
  match orchestrator.try_lock_stack(&key).await {
    Some(guard) => {
      let orchestrator = orchestrator.clone();
      let spawned = operation.clone();
      tokio::spawn(async move {
        execute_rollback(
          &orchestrator,
          spawned,
          original,
          container,
          guard,
        )
        .await;
      });
    }
    None => {
      orchestrator
        .enqueue(&operation, &[container_name])
        .await?;
    }
  }
  Ok(operation.operation_id)
}

pub(crate) async fn execute_rollback<R, S>(
  orchestrator: &UpdateOrchestrator<R, S>,
  mut operation: UpdateOperation,
  mut original: UpdateOperation,
  container: ContainerRecord,
  _guard: OwnedMutexGuard<()>,
) where
  R: ContainerRuntime + 'static,
  S: Store + 'static,
{
  operation.started_at = Some(docksmith_timestamp());
  match run_rollback_workflow(
    orchestrator,
    &mut operation,
    &container,
  )
  .await
  {
    Ok(()) => {
      original.rollback_occurred = true;
      if let Err(e) =
        orchestrator.store.save_operation(&original).await
      {
        warn!(
          "failed to mark original operation rolled back | {e:#}"
        );
      }
      info!(
        "rolled {} back to {}",
        container.name,
        operation.new_version.as_deref().unwrap_or("?")
      );
      orchestrator
        .finish_operation(
          &mut operation,
          OperationStatus::Complete,
          "complete",
        )
        .await;
    }
    Err(failure) => {
      operation.error_message = Some(
        UpdateOrchestrator::<R, S>::render_failure(&failure),
      );
      orchestrator
        .finish_operation(
          &mut operation,
          OperationStatus::Failed,
          "failed",
        )
        .await;
    }
  }
}

async fn run_rollback_workflow<R, S>(
  orchestrator: &UpdateOrchestrator<R, S>,
  operation: &mut UpdateOperation,
  container: &ContainerRecord,
) -> Result<(), StageFailure>
where
  R: ContainerRuntime + 'static,
  S: Store + 'static,
{
  let target =
    operation.new_version.clone().ok_or_else(|| {
      StageFailure::new(
        OperationStatus::Validating,
        anyhow!("rollback has no target version"),
      )
    })?;

  orchestrator
    .set_stage(
      operation,
      OperationStatus::Validating,
      "validating rollback preconditions",
    )
    .await;
  orchestrator
    .runtime
    .ping()
    .await
    .context("docker daemon unreachable")
    .map_err(|e| {
      StageFailure::new(OperationStatus::Validating, e)
    })?;

  orchestrator
    .set_stage(
      operation,
      OperationStatus::UpdatingCompose,
      "restoring previous image tag",
    )
    .await;
  if let Some(path) = &operation.compose_file {
    single::edit_compose_tag(
      std::path::Path::new(path),
      container,
      &target,
    )
    .await
    .map_err(|e| {
      StageFailure::new(OperationStatus::UpdatingCompose, e)
    })?;
  }

  let old_image =
    ImageRef::parse(&container.image).with_tag(&target);
  orchestrator
    .set_stage(
      operation,
      OperationStatus::PullingImage,
      &format!("pulling {old_image}"),
    )
    .await;
  // Best effort: the old image usually still exists locally.
  best_effort_pull(orchestrator, &old_image).await;

  orchestrator
    .set_stage(
      operation,
      OperationStatus::Recreating,
      "restarting on previous version",
    )
    .await;
  single::recreate_container(
    orchestrator,
    operation,
    container,
    operation
      .compose_file
      .as_deref()
      .map(std::path::Path::new),
    &old_image,
  )
  .await
  .map_err(|e| {
    StageFailure::new(OperationStatus::Recreating, e)
  })?;

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

  Ok(())
}
