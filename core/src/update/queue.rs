use std::{sync::Arc, time::Duration};

use docksmith_client::entities::update::{
  OperationStatus, OperationType, QueuedUpdate,
};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::{
  runtime::ContainerRuntime,
  store::Store,
  update::{
    UpdateOrchestrator, batch, lock_key, rollback, single,
  },
};

/// How often the worker looks for dispatchable queue entries.
pub const QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Handle on the background queue worker. Dropping it does not
/// stop the worker; call [QueueWorker::stop].
pub struct QueueWorker {
  stop: watch::Sender<bool>,
  handle: tokio::task::JoinHandle<()>,
}

impl QueueWorker {
  pub async fn stop(self) {
    let _ = self.stop.send(true);
    let _ = self.handle.await;
  }
}

/// Spawn the worker draining queued operations whose stack
/// lock has freed up.
pub fn spawn_queue_worker<R, S>(
  orchestrator: Arc<UpdateOrchestrator<R, S>>,
) -> QueueWorker
where
  R: ContainerRuntime + 'static,
  S: Store + 'static,
{
  let (stop, mut stop_rx) = watch::channel(false);
  let handle = tokio::spawn(async move {
    let mut ticker =
      tokio::time::interval(QUEUE_POLL_INTERVAL);
    loop {
      tokio::select! {
        _ = stop_rx.changed() => break,
        _ = ticker.tick() => {
          drain_queue(&orchestrator).await;
        }
      }
    }
  });
  QueueWorker { stop, handle }
}

/// One drain pass: for each queued entry whose stack lock can
/// be acquired now, dequeue and dispatch. Dequeue happens
/// under the lock so an entry is taken exactly once.
pub(crate) async fn drain_queue<R, S>(
  orchestrator: &Arc<UpdateOrchestrator<R, S>>,
) where
  R: ContainerRuntime + 'static,
  S: Store + 'static,
{
  let entries =
    match orchestrator.store.queued_updates().await {
      Ok(entries) => entries,
      Err(e) => {
        warn!("failed to read update queue | {e:#}");
        return;
      }
    };
  for entry in entries {
    let container_hint = entry
      .containers
      .first()
      .map(String::as_str)
      .unwrap_or_default();
    let key = lock_key(&entry.stack_name, container_hint);
    let Some(guard) = orchestrator.try_lock_stack(&key).await
    else {
      continue;
    };
    if let Err(e) = orchestrator
      .store
      .dequeue_update(&entry.operation_id)
      .await
    {
      error!(
        "failed to dequeue {} | {e:#}",
        entry.operation_id
      );
      continue;
    }
    dispatch_entry(orchestrator, entry, guard).await;
  }
}

async fn dispatch_entry<R, S>(
  orchestrator: &Arc<UpdateOrchestrator<R, S>>,
  entry: QueuedUpdate,
  guard: tokio::sync::OwnedMutexGuard<()>,
) where
  R: ContainerRuntime + 'static,
  S: Store + 'static,
{
  let operation = match orchestrator
    .store
    .get_operation(&entry.operation_id)
    .await
  {
    Ok(Some(operation)) => operation,
    Ok(None) => {
      warn!(
        "queued operation {} no longer exists",
        entry.operation_id
      );
      return;
    }
    Err(e) => {
      error!(
        "failed to load queued operation {} | {e:#}",
        entry.operation_id
      );
      return;
    }
  };
  // Cancelled while waiting.
  if operation.status != OperationStatus::Queued {
    debug!(
      "skipping queued operation {} in state {}",
      operation.operation_id, operation.status
    );
    return;
  }

  match operation.operation_type {
    OperationType::Single => {
      let Some(name) = operation.container_name.clone()
      else {
        error!(
          "queued single operation {} has no container",
          operation.operation_id
        );
        return;
      };
      let Ok(container) =
        orchestrator.find_container(&name).await
      else {
        fail_missing_container(orchestrator, &operation)
          .await;
        return;
      };
      let orchestrator = orchestrator.clone();
      tokio::spawn(async move {
        single::execute_single_update(
          &orchestrator,
          operation,
          container,
          guard,
        )
        .await;
      });
    }
    OperationType::Batch | OperationType::Stack => {
      let group_id = operation
        .batch_group_id
        .clone()
        .unwrap_or_else(|| operation.operation_id.clone());
      let operations = match orchestrator
        .store
        .operations_by_batch(&group_id)
        .await
      {
        Ok(operations) if !operations.is_empty() => {
          operations
        }
        _ => vec![operation],
      };
      let mut containers = Vec::new();
      for op in &operations {
        let Some(name) = op.container_name.clone() else {
          continue;
        };
        match orchestrator.find_container(&name).await {
          Ok(container) => containers.push(container),
          Err(_) => {
            fail_missing_container(orchestrator, op).await
          }
        }
      }
      let operations: Vec<_> = operations
        .into_iter()
        .filter(|op| {
          containers.iter().any(|container| {
            Some(&container.name) == op.container_name.as_ref()
          })
        })
        .collect();
      if operations.is_empty() {
        return;
      }
      let orchestrator = orchestrator.clone();
      tokio::spawn(async move {
        batch::execute_batch_update(
          &orchestrator,
          operations,
          containers,
          guard,
        )
        .await;
      });
    }
    OperationType::Rollback => {
      let Some(original_id) =
        operation.batch_group_id.clone()
      else {
        error!(
          "queued rollback {} lost its original operation",
          operation.operation_id
        );
        return;
      };
      let Ok(Some(original)) = orchestrator
        .store
        .get_operation(&original_id)
        .await
      else {
        fail_missing_container(orchestrator, &operation)
          .await;
        return;
      };
      let Some(name) = operation.container_name.clone()
      else {
        return;
      };
      let Ok(container) =
        orchestrator.find_container(&name).await
      else {
        fail_missing_container(orchestrator, &operation)
          .await;
        return;
      };
      let orchestrator = orchestrator.clone();
      tokio::spawn(async move {
        rollback::execute_rollback(
          &orchestrator,
          operation,
          original,
          container,
          guard,
        )
        .await;
      });
    }
  }
}

async fn fail_missing_container<R, S>(
  orchestrator: &Arc<UpdateOrchestrator<R, S>>,
  operation: &docksmith_client::entities::update::UpdateOperation,
) where
  R: ContainerRuntime + 'static,
  S: Store + 'static,
{
  if let Err(e) = orchestrator
    .store
    .update_operation_status(
      &operation.operation_id,
      OperationStatus::Failed,
      Some("container disappeared while queued"),
    )
    .await
  {
    error!(
      "failed to mark {} failed | {e:#}",
      operation.operation_id
    );
  }
}
