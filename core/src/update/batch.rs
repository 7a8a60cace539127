use std::{
  collections::HashMap, path::PathBuf, sync::Arc,
};

use anyhow::{Context, anyhow};
use docksmith_client::entities::{
  container::ContainerRecord,
  docksmith_timestamp,
  image::ImageRef,
  optional_string,
  update::{
    OperationStatus, OperationType, UpdateOperation,
  },
};
use futures_util::future::join_all;
use indexmap::IndexMap;
use tokio::sync::OwnedMutexGuard;
use tracing::info;

use crate::{
  compose,
  graph::DependencyGraph,
  runtime::ContainerRuntime,
  store::Store,
  update::{
    StageFailure, UpdateOrchestrator, lock_key, single,
  },
};

pub(crate) async fn update_batch<R, S>(
  orchestrator: &Arc<UpdateOrchestrator<R, S>>,
  container_names: &[String],
  target_versions: &HashMap<String, String>,
) -> anyhow::Result<Vec<String>>
where
  R: ContainerRuntime + 'static,
  S: Store + 'static,
{
  update_batch_as(
    orchestrator,
    OperationType::Batch,
    container_names,
    target_versions,
  )
  .await
}

/// Create one operation per targeted container, grouped per
/// stack under a shared batch id, and start (or queue) each
/// stack group. Containers without a target version are
/// skipped.
pub(crate) async fn update_batch_as<R, S>(
  orchestrator: &Arc<UpdateOrchestrator<R, S>>,
  operation_type: OperationType,
  container_names: &[String],
  target_versions: &HashMap<String, String>,
) -> anyhow::Result<Vec<String>>
where
  R: ContainerRuntime + 'static,
  S: Store + 'static,
{
  if container_names.is_empty() {
    return Err(anyhow!("no containers selected"));
  }
  let all = orchestrator
    .runtime
    .list_containers()
    .await
    .context("failed to list containers")?;

  let mut by_stack: IndexMap<String, Vec<ContainerRecord>> =
    IndexMap::new();
  for name in container_names {
    let container = all
      .iter()
      .find(|container| &container.name == name)
      .with_context(|| {
        format!("no container named {name}")
      })?;
    if !target_versions.contains_key(name) {
      continue;
    }
    let stack = orchestrator.resolver.resolve(container);
    by_stack
      .entry(stack)
      .or_default()
      .push(container.clone());
  }
  if by_stack.is_empty() {
    return Err(anyhow!(
      "none of the selected containers has a target version"
    ));
  }

  // Refuse before any side effect when the dependency graph
  // cannot produce an order.
  for group in by_stack.values() {
    DependencyGraph::build(group)
      .update_order()
      .context("cannot order batch update")?;
  }

  let mut operation_ids = Vec::new();
  for (stack, group) in by_stack {
    let batch_group_id = uuid::Uuid::new_v4().to_string();
    let mut operations = Vec::with_capacity(group.len());
    for container in &group {
      let mut operation =
        UpdateOperation::new(operation_type, &stack);
      operation.container_id =
        optional_string(&container.id);
      operation.container_name =
        Some(container.name.clone());
      operation.new_version =
        target_versions.get(&container.name).cloned();
      operation.batch_group_id =
        Some(batch_group_id.clone());
      operation.dependents_affected = group
        .iter()
        .filter(|peer| peer.name != container.name)
        .map(|peer| peer.name.clone())
        .collect();
      orchestrator
        .store
        .save_operation(&operation)
        .await
        .context("failed to persist operation")?;
      operation_ids.push(operation.operation_id.clone());
      operations.push(operation);
    }

    let key = lock_key(&stack, &group[0].name);
    match orchestrator.try_lock_stack(&key).await {
      Some(guard) => {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
          execute_batch_update(
            &orchestrator,
            operations,
            group,
            guard,
          )
          .await;
        });
      }
      None => {
        let names: Vec<String> = group
          .iter()
          .map(|container| container.name.clone())
          .collect();
        orchestrator
          .enqueue(&operations[0], &names)
          .await?;
      }
    }
  }
  Ok(operation_ids)
}

struct BatchItem {
  operation: UpdateOperation,
  container: ContainerRecord,
  compose_file: Option<PathBuf>,
  new_image: String,
  failure: Option<StageFailure>,
}

/// Batch execution: prepare (validate, backup, compose edit)
/// and pull in parallel, then stop dependents-first and bring
/// everything back up in dependency order.
pub(crate) async fn execute_batch_update<R, S>(
  orchestrator: &UpdateOrchestrator<R, S>,
  operations: Vec<UpdateOperation>,
  containers: Vec<ContainerRecord>,
  _guard: OwnedMutexGuard<()>,
) where
  R: ContainerRuntime + 'static,
  S: Store + 'static,
{
  let mut items: Vec<BatchItem> = operations
    .into_iter()
    .zip(containers.iter().cloned())
    .map(|(mut operation, container)| {
      operation.started_at = Some(docksmith_timestamp());
      let target = operation
        .new_version
        .clone()
        .unwrap_or_default();
      BatchItem {
        new_image: ImageRef::parse(&container.image)
          .with_tag(&target),
        compose_file: compose::compose_file_path(&container),
        operation,
        container,
        failure: None,
      }
    })
    .collect();

  // Phase 1: validation + backups, all containers at once.
  let phase1 = items.iter_mut().map(|item| async move {
    if let Err(failure) =
      prepare_item(orchestrator, item).await
    {
      item.failure = Some(failure);
    }
  });
  join_all(phase1).await;

  // Tag edits run sequentially: stack members usually share
  // one compose file, and concurrent read-modify-write cycles
  // would lose each other's edits.
  for item in items.iter_mut() {
    if item.failure.is_some() {
      continue;
    }
    let Some(target) = item.operation.new_version.clone()
    else {
      continue;
    };
    orchestrator
      .set_stage(
        &mut item.operation,
        OperationStatus::UpdatingCompose,
        "rewriting image tag",
      )
      .await;
    if let Some(path) = &item.compose_file
      && let Err(e) = single::edit_compose_tag(
        path,
        &item.container,
        &target,
      )
      .await
    {
      item.failure = Some(StageFailure::new(
        OperationStatus::UpdatingCompose,
        e,
      ));
    }
  }

  // Phase 2: image pulls, all containers at once.
  let phase2 = items.iter_mut().map(|item| async move {
    if item.failure.is_some() {
      return;
    }
    orchestrator
      .set_stage(
        &mut item.operation,
        OperationStatus::PullingImage,
        &format!("pulling {}", item.new_image),
      )
      .await;
    if let Err(e) = single::pull_with_retries(
      orchestrator,
      &item.operation,
      &item.new_image,
    )
    .await
    {
      item.failure = Some(StageFailure::new(
        OperationStatus::PullingImage,
        e,
      ));
    }
  });
  join_all(phase2).await;

  // Phase 3: stop in reverse dependency order, then recreate
  // and verify forward.
  let graph = DependencyGraph::build(&containers);
  let order = graph.update_order().unwrap_or_else(|_| {
    containers
      .iter()
      .map(|container| container.name.clone())
      .collect()
  });

  for name in order.iter().rev() {
    let Some(item) = items.iter_mut().find(|item| {
      item.container.name == *name && item.failure.is_none()
    }) else {
      continue;
    };
    orchestrator
      .set_stage(
        &mut item.operation,
        OperationStatus::Recreating,
        "stopping for recreate",
      )
      .await;
    if let Err(e) = orchestrator
      .runtime
      .stop_container(
        &item.container.name,
        Some(single::STOP_TIMEOUT_SECS),
      )
      .await
    {
      item.failure = Some(StageFailure::new(
        OperationStatus::Recreating,
        e.context("failed to stop container"),
      ));
    }
  }

  for name in &order {
    let Some(item) = items.iter_mut().find(|item| {
      item.container.name == *name && item.failure.is_none()
    }) else {
      continue;
    };
    if let Err(e) = single::recreate_container(
      orchestrator,
      &item.operation,
      &item.container,
      item.compose_file.as_deref(),
      &item.new_image,
    )
    .await
    {
      item.failure = Some(StageFailure::new(
        OperationStatus::Recreating,
        e,
      ));
      continue;
    }
    orchestrator
      .set_stage(
        &mut item.operation,
        OperationStatus::HealthCheck,
        "verifying container health",
      )
      .await;
    if let Err(e) = super::health::verify_container_health(
      orchestrator.runtime.as_ref(),
      &item.container.name,
    )
    .await
    {
      item.failure = Some(StageFailure::new(
        OperationStatus::HealthCheck,
        e,
      ));
    }
  }

  for mut item in items {
    match item.failure {
      None => {
        info!(
          "updated {} to {}",
          item.container.name,
          item
            .operation
            .new_version
            .as_deref()
            .unwrap_or("?")
        );
        orchestrator
          .finish_operation(
            &mut item.operation,
            OperationStatus::Complete,
            "updated",
          )
          .await;
      }
      Some(failure) => {
        single::fail_with_rollback(
          orchestrator,
          &mut item.operation,
          &item.container,
          failure,
        )
        .await;
      }
    }
  }
}

async fn prepare_item<R, S>(
  orchestrator: &UpdateOrchestrator<R, S>,
  item: &mut BatchItem,
) -> Result<(), StageFailure>
where
  R: ContainerRuntime + 'static,
  S: Store + 'static,
{
  if item.operation.new_version.is_none() {
    return Err(StageFailure::new(
      OperationStatus::Validating,
      anyhow!("operation has no target version"),
    ));
  }

  orchestrator
    .set_stage(
      &mut item.operation,
      OperationStatus::Validating,
      "validating preconditions",
    )
    .await;
  single::validate(
    orchestrator,
    item.compose_file.as_deref(),
  )
  .await
  .map_err(|e| {
    StageFailure::new(OperationStatus::Validating, e)
  })?;

  orchestrator
    .set_stage(
      &mut item.operation,
      OperationStatus::Backup,
      "saving pre-update state",
    )
    .await;
  item.operation.old_version = Some(
    ImageRef::parse(&item.container.image).tag.full.clone(),
  );
  item.operation.compose_file = item
    .compose_file
    .as_ref()
    .map(|path| path.display().to_string());
  orchestrator
    .store
    .save_operation(&item.operation)
    .await
    .context("failed to persist pre-update state")
    .map_err(|e| {
      StageFailure::new(OperationStatus::Backup, e)
    })?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use docksmith_client::entities::container::labels;

  use super::*;
  use crate::{
    events::EventBus,
    stack::StackResolver,
    store::MemoryStore,
    testing::StubRuntime,
  };

  const COMPOSE: &str = r#"services:
  vpn:
    image: gluetun:3.38.0
  net-app:
    image: qbittorrent:4.6.0
"#;

  const VPN_ID: &str =
    "4f5ca1b2d3e4f5a6b7c8d9e0f1a2b3c4d5e6f7a8b9c0d1e2f3a4b5c6d7e8f9a0";

  fn record(
    name: &str,
    id: &str,
    image: &str,
    compose_path: &std::path::Path,
    network_mode: Option<String>,
  ) -> docksmith_client::entities::container::ContainerRecord
  {
    use docksmith_client::entities::container::{
      ContainerRecord, ContainerState,
    };
    let mut record = ContainerRecord {
      id: id.to_string(),
      name: name.to_string(),
      image: image.to_string(),
      state: ContainerState::Running,
      network_mode,
      ..Default::default()
    };
    record.labels.insert(
      labels::COMPOSE_PROJECT.to_string(),
      "app".to_string(),
    );
    record.labels.insert(
      labels::COMPOSE_SERVICE.to_string(),
      name.to_string(),
    );
    record.labels.insert(
      labels::COMPOSE_CONFIG_FILES.to_string(),
      compose_path.display().to_string(),
    );
    record
  }

  async fn wait_terminal(
    orchestrator: &Arc<
      UpdateOrchestrator<StubRuntime, MemoryStore>,
    >,
    operation_id: &str,
  ) -> UpdateOperation {
    for _ in 0..60_000 {
      let operation = orchestrator
        .store
        .get_operation(operation_id)
        .await
        .unwrap()
        .unwrap();
      if operation.status.is_terminal() {
        return operation;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("operation {operation_id} never finished");
  }

  /// A `network_mode: service:vpn` deployment reaches the
  /// engine as `container:<vpn id>`; the batch ordering must
  /// still treat the namespace owner as a dependency.
  #[tokio::test(start_paused = true)]
  async fn network_namespace_owner_orders_batch_recreate() {
    let dir = std::env::temp_dir().join(format!(
      "docksmith-batch-{}",
      uuid::Uuid::new_v4()
    ));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let compose_path = dir.join("compose.yaml");
    tokio::fs::write(&compose_path, COMPOSE).await.unwrap();

    let runtime = Arc::new(StubRuntime::with_containers(vec![
      record(
        "net-app",
        "netapp-0123456789abcdef",
        "qbittorrent:4.6.0",
        &compose_path,
        // Exactly what docker/mod.rs passes through from the
        // engine for a compose `network_mode: service:vpn`.
        Some(format!("container:{VPN_ID}")),
      ),
      record(
        "vpn",
        VPN_ID,
        "gluetun:3.38.0",
        &compose_path,
        None,
      ),
    ]));
    let orchestrator = UpdateOrchestrator::new(
      runtime,
      Arc::new(MemoryStore::default()),
      Arc::new(EventBus::default()),
      Arc::new(StackResolver::default()),
    );

    let targets: HashMap<String, String> = [
      ("vpn".to_string(), "3.39.0".to_string()),
      ("net-app".to_string(), "4.6.1".to_string()),
    ]
    .into();
    let ids = orchestrator
      .update_batch_containers(
        &["net-app".to_string(), "vpn".to_string()],
        &targets,
      )
      .await
      .unwrap();
    assert_eq!(ids.len(), 2);
    for id in &ids {
      let operation =
        wait_terminal(&orchestrator, id).await;
      assert_eq!(
        operation.status,
        OperationStatus::Complete
      );
    }

    let actions = orchestrator.runtime.recorded();
    let stop_app = actions
      .iter()
      .position(|action| action == "stop:net-app")
      .unwrap();
    let stop_vpn = actions
      .iter()
      .position(|action| action == "stop:vpn")
      .unwrap();
    // The namespace consumer stops before its owner.
    assert!(stop_app < stop_vpn);
    let up_vpn = actions
      .iter()
      .rposition(|action| {
        action.starts_with("compose_up")
          && action.ends_with(":vpn")
      })
      .unwrap();
    let up_app = actions
      .iter()
      .rposition(|action| {
        action.starts_with("compose_up")
          && action.ends_with(":net-app")
      })
      .unwrap();
    // And comes back only after the owner is up.
    assert!(up_vpn < up_app);

    tokio::fs::remove_dir_all(&dir).await.ok();
  }
}
