use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, anyhow};
use cache::CloneCache;
use docksmith_client::entities::{
  container::ContainerRecord,
  docksmith_timestamp,
  event::{ContainerUpdated, Event},
  optional_string,
  update::{
    OperationStatus, OperationType, QueuedUpdate,
    UpdateOperation,
  },
};
use formatting::format_serror;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, warn};

use crate::{
  events::EventBus, runtime::ContainerRuntime,
  stack::StackResolver, store::Store,
};

pub mod batch;
pub mod health;
pub mod queue;
pub mod rollback;
pub mod single;

/// Drives update operations through their state machine:
/// validate, backup, edit compose, pull, recreate, verify
/// health, then finalize or roll back. At most one operation
/// runs per stack; contenders queue.
pub struct UpdateOrchestrator<R, S> {
  pub runtime: Arc<R>,
  pub store: Arc<S>,
  pub bus: Arc<EventBus>,
  pub resolver: Arc<StackResolver>,
  /// Lazily created per-stack mutexes. The map lock guards
  /// only the map; entries are full mutexes.
  stack_locks: CloneCache<String, Arc<Mutex<()>>>,
}

/// Standalone containers get their own lock key so unrelated
/// updates never serialize.
pub fn lock_key(stack: &str, container: &str) -> String {
  if stack.is_empty() {
    format!("standalone:{container}")
  } else {
    stack.to_string()
  }
}

/// Stage + cause of a workflow failure, for the rollback
/// decision.
pub(crate) struct StageFailure {
  pub stage: OperationStatus,
  pub error: anyhow::Error,
}

impl StageFailure {
  pub fn new(
    stage: OperationStatus,
    error: anyhow::Error,
  ) -> StageFailure {
    StageFailure { stage, error }
  }
}

impl<R, S> UpdateOrchestrator<R, S>
where
  R: ContainerRuntime + 'static,
  S: Store + 'static,
{
  pub fn new(
    runtime: Arc<R>,
    store: Arc<S>,
    bus: Arc<EventBus>,
    resolver: Arc<StackResolver>,
  ) -> Arc<UpdateOrchestrator<R, S>> {
    Arc::new(UpdateOrchestrator {
      runtime,
      store,
      bus,
      resolver,
      stack_locks: Default::default(),
    })
  }

  pub(crate) async fn try_lock_stack(
    &self,
    key: &str,
  ) -> Option<OwnedMutexGuard<()>> {
    let lock = self
      .stack_locks
      .get_or_insert_default(&key.to_string())
      .await;
    lock.try_lock_owned().ok()
  }

  pub(crate) async fn find_container(
    &self,
    name: &str,
  ) -> anyhow::Result<ContainerRecord> {
    self
      .runtime
      .list_containers()
      .await
      .context("failed to list containers")?
      .into_iter()
      .find(|container| container.name == name)
      .with_context(|| format!("no container named {name}"))
  }

  /// Update one container to `target_version`. Returns the
  /// operation id immediately; progress flows over the event
  /// bus and the store.
  pub async fn update_single_container(
    self: &Arc<Self>,
    container_name: &str,
    target_version: String,
  ) -> anyhow::Result<String> {
    if target_version.trim().is_empty() {
      return Err(anyhow!("target version must not be empty"));
    }
    let container =
      self.find_container(container_name).await?;
    let stack = self.resolver.resolve(&container);
    let mut operation =
      UpdateOperation::new(OperationType::Single, &stack);
    operation.container_id = optional_string(&container.id);
    operation.container_name = Some(container.name.clone());
    operation.new_version = Some(target_version);
    self
      .store
      .save_operation(&operation)
      .await
      .context("failed to persist operation")?;

    let key = lock_key(&stack, &container.name);
    match self.try_lock_stack(&key).await {
      Some(guard) => {
        let orchestrator = self.clone();
        let spawned = operation.clone();
        tokio::spawn(async move {
          single::execute_single_update(
            &orchestrator,
            spawned,
            container,
            guard,
          )
          .await;
        });
      }
      None => {
        self.enqueue(&operation, &[container.name]).await?;
      }
    }
    Ok(operation.operation_id)
  }

  /// Update a set of containers, each to its entry in
  /// `target_versions`. Containers without a target are
  /// skipped. Returns one operation id per started container,
  /// grouped by a shared batch id per stack.
  pub async fn update_batch_containers(
    self: &Arc<Self>,
    container_names: &[String],
    target_versions: &HashMap<String, String>,
  ) -> anyhow::Result<Vec<String>> {
    batch::update_batch(self, container_names, target_versions)
      .await
  }

  /// Update every named container of one stack.
  pub async fn update_stack(
    self: &Arc<Self>,
    stack_name: &str,
    target_versions: &HashMap<String, String>,
  ) -> anyhow::Result<Vec<String>> {
    let containers = self
      .runtime
      .list_containers()
      .await
      .context("failed to list containers")?;
    let names: Vec<String> = containers
      .iter()
      .filter(|container| {
        self.resolver.resolve(container) == stack_name
      })
      .map(|container| container.name.clone())
      .collect();
    if names.is_empty() {
      return Err(anyhow!(
        "no containers found in stack {stack_name}"
      ));
    }
    batch::update_batch_as(
      self,
      OperationType::Stack,
      &names,
      target_versions,
    )
    .await
  }

  /// Roll a completed (or failed) operation back to its saved
  /// old version.
  pub async fn rollback_operation(
    self: &Arc<Self>,
    original_operation_id: &str,
  ) -> anyhow::Result<String> {
    rollback::rollback_operation(self, original_operation_id)
      .await
  }

  /// Cancel an operation that is still waiting in the queue.
  pub async fn cancel_queued_operation(
    &self,
    operation_id: &str,
  ) -> anyhow::Result<()> {
    let operation = self
      .store
      .get_operation(operation_id)
      .await?
      .with_context(|| {
        format!("no operation {operation_id}")
      })?;
    if operation.status != OperationStatus::Queued {
      return Err(anyhow!(
        "only queued operations can be cancelled, {operation_id} is {}",
        operation.status
      ));
    }
    self
      .store
      .update_operation_status(
        operation_id,
        OperationStatus::Cancelled,
        None,
      )
      .await?;
    self.store.dequeue_update(operation_id).await?;
    self.bus.publish(Event::ContainerUpdated(
      ContainerUpdated {
        operation_id: Some(operation_id.to_string()),
        container_name: operation.container_name.clone(),
        status: "cancelled".to_string(),
        ..Default::default()
      },
    ));
    Ok(())
  }

  /// Operation history for one container, for API surfaces.
  pub async fn operation_history(
    &self,
    container_name: &str,
  ) -> anyhow::Result<Vec<UpdateOperation>> {
    self
      .store
      .operations_by_container(container_name)
      .await
  }

  /// Operations created in `[from, to]` (unix ms).
  pub async fn operations_between(
    &self,
    from: i64,
    to: i64,
  ) -> anyhow::Result<Vec<UpdateOperation>> {
    self.store.operations_in_range(from, to).await
  }

  /// Install a container / stack / global auto-rollback policy.
  pub async fn set_rollback_policy(
    &self,
    policy: &docksmith_client::entities::update::RollbackPolicy,
  ) -> anyhow::Result<()> {
    self.store.set_rollback_policy(policy).await
  }

  pub(crate) async fn enqueue(
    &self,
    operation: &UpdateOperation,
    containers: &[String],
  ) -> anyhow::Result<()> {
    self
      .store
      .queue_update(&QueuedUpdate {
        operation_id: operation.operation_id.clone(),
        stack_name: operation.stack_name.clone(),
        containers: containers.to_vec(),
        queued_at: docksmith_timestamp(),
      })
      .await
      .context("failed to enqueue operation")
  }

  /// Persist a stage transition and publish progress. Store
  /// errors on transitions are logged, not fatal.
  pub(crate) async fn set_stage(
    &self,
    operation: &mut UpdateOperation,
    stage: OperationStatus,
    message: &str,
  ) {
    operation.status = stage;
    if let Err(e) = self
      .store
      .update_operation_status(
        &operation.operation_id,
        stage,
        None,
      )
      .await
    {
      warn!(
        "failed to persist stage {stage} for {} | {e:#}",
        operation.operation_id
      );
    }
    self.bus.publish_update_progress(operation, stage, message);
  }

  /// Terminal bookkeeping shared by every executor.
  pub(crate) async fn finish_operation(
    &self,
    operation: &mut UpdateOperation,
    status: OperationStatus,
    container_updated_status: &str,
  ) {
    operation.status = status;
    operation.completed_at = Some(docksmith_timestamp());
    if let Err(e) = self.store.save_operation(operation).await
    {
      error!(
        "failed to persist terminal state of {} | {e:#}",
        operation.operation_id
      );
    }
    self.bus.publish_update_progress(
      operation,
      status,
      container_updated_status,
    );
    self.bus.publish(Event::ContainerUpdated(
      ContainerUpdated {
        container_id: operation.container_id.clone(),
        container_name: operation.container_name.clone(),
        operation_id: Some(operation.operation_id.clone()),
        status: container_updated_status.to_string(),
        ..Default::default()
      },
    ));
  }

  pub(crate) fn render_failure(
    failure: &StageFailure,
  ) -> String {
    format_serror(
      &anyhow::anyhow!("{:#}", failure.error)
        .context(format!("failed at {}", failure.stage))
        .into(),
    )
  }
}

#[cfg(test)]
mod tests {
  use std::{path::PathBuf, time::Duration};

  use docksmith_client::entities::container::{
    ContainerDetails, ContainerState, HealthStatus,
    HealthcheckConfig, labels,
  };

  use super::*;
  use crate::{
    store::MemoryStore,
    testing::{StubRegistry, StubRuntime},
  };

  const COMPOSE: &str = r#"services:
  web:
    image: nginx:1.25.0
  db:
    image: postgres:13
"#;

  struct TestBed {
    orchestrator:
      Arc<UpdateOrchestrator<StubRuntime, MemoryStore>>,
    compose_path: PathBuf,
    dir: PathBuf,
  }

  impl Drop for TestBed {
    fn drop(&mut self) {
      std::fs::remove_dir_all(&self.dir).ok();
    }
  }

  async fn testbed(containers: Vec<(&str, &str)>) -> TestBed {
    let dir = std::env::temp_dir().join(format!(
      "docksmith-test-{}",
      uuid::Uuid::new_v4()
    ));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let compose_path = dir.join("compose.yaml");
    tokio::fs::write(&compose_path, COMPOSE).await.unwrap();

    let records: Vec<ContainerRecord> = containers
      .iter()
      .map(|(name, image)| {
        let mut record = ContainerRecord {
          id: format!("{name}-0123456789abcdef"),
          name: name.to_string(),
          image: image.to_string(),
          state: ContainerState::Running,
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
      })
      .collect();
    let runtime =
      Arc::new(StubRuntime::with_containers(records));
    let orchestrator = UpdateOrchestrator::new(
      runtime,
      Arc::new(MemoryStore::default()),
      Arc::new(crate::events::EventBus::default()),
      Arc::new(crate::stack::StackResolver::default()),
    );
    TestBed {
      orchestrator,
      compose_path,
      dir,
    }
  }

  async fn wait_terminal(
    orchestrator: &Arc<
      UpdateOrchestrator<StubRuntime, MemoryStore>,
    >,
    operation_id: &str,
  ) -> UpdateOperation {
    // Generous virtual-time budget: health timeouts alone can
    // consume minutes of paused clock.
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

  #[tokio::test(start_paused = true)]
  async fn single_update_edits_compose_and_completes() {
    let bed =
      testbed(vec![("web", "nginx:1.25.0")]).await;
    let id = bed
      .orchestrator
      .update_single_container("web", "1.26.1".to_string())
      .await
      .unwrap();
    let operation =
      wait_terminal(&bed.orchestrator, &id).await;

    assert_eq!(operation.status, OperationStatus::Complete);
    assert_eq!(
      operation.new_version.as_deref(),
      Some("1.26.1")
    );
    assert_eq!(
      operation.old_version.as_deref(),
      Some("1.25.0")
    );
    assert!(operation.completed_at.is_some());
    // The persisted new version matches the compose file.
    let contents =
      tokio::fs::read_to_string(&bed.compose_path)
        .await
        .unwrap();
    assert!(contents.contains("image: nginx:1.26.1"));
    assert!(contents.contains("image: postgres:13"));
    // Compose path was preferred over raw recreate.
    let actions =
      bed.orchestrator.runtime.recorded();
    assert!(
      actions
        .iter()
        .any(|action| action.starts_with("compose_up"))
    );
    assert!(
      !actions
        .iter()
        .any(|action| action.starts_with("remove"))
    );
  }

  #[tokio::test(start_paused = true)]
  async fn missing_container_is_not_found() {
    let bed =
      testbed(vec![("web", "nginx:1.25.0")]).await;
    let error = bed
      .orchestrator
      .update_single_container("ghost", "1.0".to_string())
      .await
      .unwrap_err();
    assert!(error.to_string().contains("ghost"));
  }

  #[tokio::test(start_paused = true)]
  async fn concurrent_same_stack_update_queues() {
    let bed = testbed(vec![
      ("web", "nginx:1.25.0"),
      ("db", "postgres:13"),
    ])
    .await;
    // Hold the stack lock, as a running operation would.
    let guard = bed
      .orchestrator
      .try_lock_stack("app")
      .await
      .expect("lock free");

    let id = bed
      .orchestrator
      .update_single_container("db", "14".to_string())
      .await
      .unwrap();
    let operation = bed
      .orchestrator
      .store
      .get_operation(&id)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(operation.status, OperationStatus::Queued);
    let queued = bed
      .orchestrator
      .store
      .queued_updates()
      .await
      .unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].operation_id, id);

    // Lock released: the drain pass dispatches it.
    drop(guard);
    queue::drain_queue(&bed.orchestrator).await;
    let operation =
      wait_terminal(&bed.orchestrator, &id).await;
    assert_eq!(operation.status, OperationStatus::Complete);
    assert!(
      bed
        .orchestrator
        .store
        .queued_updates()
        .await
        .unwrap()
        .is_empty()
    );
  }

  #[tokio::test(start_paused = true)]
  async fn unhealthy_after_update_rolls_back() {
    let bed =
      testbed(vec![("db", "postgres:13")]).await;
    {
      // Opt in to auto rollback and declare a healthcheck
      // that never reports healthy.
      let mut containers = bed
        .orchestrator
        .runtime
        .containers
        .lock()
        .unwrap();
      containers[0].labels.insert(
        labels::AUTO_ROLLBACK.to_string(),
        "true".to_string(),
      );
      let record = containers[0].clone();
      drop(containers);
      bed.orchestrator.runtime.set_details(
        "db",
        ContainerDetails {
          record: ContainerRecord {
            health: HealthStatus::Starting,
            ..record
          },
          healthcheck: Some(HealthcheckConfig {
            test: vec![
              "CMD".to_string(),
              "pg_isready".to_string(),
            ],
            ..Default::default()
          }),
          ..Default::default()
        },
      );
    }

    let id = bed
      .orchestrator
      .update_single_container("db", "14".to_string())
      .await
      .unwrap();
    let operation =
      wait_terminal(&bed.orchestrator, &id).await;

    assert_eq!(operation.status, OperationStatus::Failed);
    assert!(operation.rollback_occurred);
    // Compose file carries the old version again.
    let contents =
      tokio::fs::read_to_string(&bed.compose_path)
        .await
        .unwrap();
    assert!(contents.contains("image: postgres:13"));
    assert!(!contents.contains("postgres:14"));
  }

  #[tokio::test(start_paused = true)]
  async fn stack_policy_enables_rollback() {
    use docksmith_client::entities::update::{
      RollbackEntity, RollbackPolicy,
    };
    let bed = testbed(vec![("db", "postgres:13")]).await;
    bed
      .orchestrator
      .set_rollback_policy(&RollbackPolicy {
        entity_type: RollbackEntity::Stack,
        entity_id: "app".to_string(),
        auto_rollback_enabled: true,
      })
      .await
      .unwrap();
    {
      // Healthcheck that never turns healthy, no container
      // label: the stack policy decides.
      let record = bed
        .orchestrator
        .runtime
        .containers
        .lock()
        .unwrap()[0]
        .clone();
      bed.orchestrator.runtime.set_details(
        "db",
        ContainerDetails {
          record: ContainerRecord {
            health: HealthStatus::Starting,
            ..record
          },
          healthcheck: Some(HealthcheckConfig {
            test: vec!["CMD".to_string()],
            ..Default::default()
          }),
          ..Default::default()
        },
      );
    }
    let id = bed
      .orchestrator
      .update_single_container("db", "14".to_string())
      .await
      .unwrap();
    let operation =
      wait_terminal(&bed.orchestrator, &id).await;
    assert_eq!(operation.status, OperationStatus::Failed);
    assert!(operation.rollback_occurred);

    let history = bed
      .orchestrator
      .operation_history("db")
      .await
      .unwrap();
    assert_eq!(history.len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn failure_without_policy_does_not_roll_back() {
    let bed =
      testbed(vec![("web", "nginx:1.25.0")]).await;
    // Every pull attempt fails.
    bed
      .orchestrator
      .runtime
      .failing_pulls
      .store(usize::MAX, std::sync::atomic::Ordering::SeqCst);

    let id = bed
      .orchestrator
      .update_single_container("web", "1.26.0".to_string())
      .await
      .unwrap();
    let operation =
      wait_terminal(&bed.orchestrator, &id).await;
    assert_eq!(operation.status, OperationStatus::Failed);
    assert!(!operation.rollback_occurred);
    assert!(operation.error_message.is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn cancel_only_affects_queued_operations() {
    let bed =
      testbed(vec![("web", "nginx:1.25.0")]).await;
    let guard = bed
      .orchestrator
      .try_lock_stack("app")
      .await
      .expect("lock free");
    let id = bed
      .orchestrator
      .update_single_container("web", "1.26.0".to_string())
      .await
      .unwrap();

    bed
      .orchestrator
      .cancel_queued_operation(&id)
      .await
      .unwrap();
    let operation = bed
      .orchestrator
      .store
      .get_operation(&id)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(
      operation.status,
      OperationStatus::Cancelled
    );
    assert!(
      bed
        .orchestrator
        .store
        .queued_updates()
        .await
        .unwrap()
        .is_empty()
    );
    // A second cancel is rejected.
    assert!(
      bed
        .orchestrator
        .cancel_queued_operation(&id)
        .await
        .is_err()
    );
    drop(guard);
    // The worker ignores the cancelled entry.
    queue::drain_queue(&bed.orchestrator).await;
    let operation = bed
      .orchestrator
      .store
      .get_operation(&id)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(
      operation.status,
      OperationStatus::Cancelled
    );
  }

  #[tokio::test(start_paused = true)]
  async fn rollback_operation_restores_old_version() {
    let bed =
      testbed(vec![("web", "nginx:1.25.0")]).await;
    let id = bed
      .orchestrator
      .update_single_container("web", "1.26.1".to_string())
      .await
      .unwrap();
    let updated =
      wait_terminal(&bed.orchestrator, &id).await;
    assert_eq!(updated.status, OperationStatus::Complete);

    let rollback_id = bed
      .orchestrator
      .rollback_operation(&id)
      .await
      .unwrap();
    let rollback =
      wait_terminal(&bed.orchestrator, &rollback_id).await;
    assert_eq!(rollback.status, OperationStatus::Complete);
    assert_eq!(
      rollback.new_version.as_deref(),
      Some("1.25.0")
    );

    let original = bed
      .orchestrator
      .store
      .get_operation(&id)
      .await
      .unwrap()
      .unwrap();
    assert!(original.rollback_occurred);
    let contents =
      tokio::fs::read_to_string(&bed.compose_path)
        .await
        .unwrap();
    assert!(contents.contains("image: nginx:1.25.0"));
  }

  #[tokio::test(start_paused = true)]
  async fn batch_update_recreates_in_dependency_order() {
    let bed = testbed(vec![
      ("web", "nginx:1.25.0"),
      ("db", "postgres:13"),
    ])
    .await;
    {
      let mut containers = bed
        .orchestrator
        .runtime
        .containers
        .lock()
        .unwrap();
      // web depends on db.
      containers
        .iter_mut()
        .find(|container| container.name == "web")
        .unwrap()
        .labels
        .insert(
          labels::COMPOSE_DEPENDS_ON.to_string(),
          "db".to_string(),
        );
    }
    let targets: HashMap<String, String> = [
      ("web".to_string(), "1.26.1".to_string()),
      ("db".to_string(), "14".to_string()),
    ]
    .into();
    let ids = bed
      .orchestrator
      .update_batch_containers(
        &["web".to_string(), "db".to_string()],
        &targets,
      )
      .await
      .unwrap();
    assert_eq!(ids.len(), 2);
    for id in &ids {
      let operation =
        wait_terminal(&bed.orchestrator, id).await;
      assert_eq!(
        operation.status,
        OperationStatus::Complete
      );
      assert!(
        operation.batch_group_id.is_some()
      );
    }

    let actions = bed.orchestrator.runtime.recorded();
    let stop_web = actions
      .iter()
      .position(|action| action == "stop:web")
      .unwrap();
    let stop_db = actions
      .iter()
      .position(|action| action == "stop:db")
      .unwrap();
    // Dependents stop before their dependencies.
    assert!(stop_web < stop_db);
    let up_db = actions
      .iter()
      .rposition(|action| {
        action.starts_with("compose_up") && action.ends_with(":db")
      })
      .unwrap();
    let up_web = actions
      .iter()
      .rposition(|action| {
        action.starts_with("compose_up")
          && action.ends_with(":web")
      })
      .unwrap();
    // And come back in forward order.
    assert!(up_db < up_web);

    let contents =
      tokio::fs::read_to_string(&bed.compose_path)
        .await
        .unwrap();
    assert!(contents.contains("nginx:1.26.1"));
    assert!(contents.contains("postgres:14"));
  }

  #[tokio::test(start_paused = true)]
  async fn empty_batch_selection_errors() {
    let bed =
      testbed(vec![("web", "nginx:1.25.0")]).await;
    assert!(
      bed
        .orchestrator
        .update_batch_containers(&[], &HashMap::new())
        .await
        .is_err()
    );
  }

  #[tokio::test(start_paused = true)]
  async fn update_stack_targets_stack_members() {
    let bed = testbed(vec![
      ("web", "nginx:1.25.0"),
      ("db", "postgres:13"),
    ])
    .await;
    let targets: HashMap<String, String> =
      [("web".to_string(), "1.26.1".to_string())].into();
    let ids = bed
      .orchestrator
      .update_stack("app", &targets)
      .await
      .unwrap();
    // db has no target version and is skipped.
    assert_eq!(ids.len(), 1);
    let operation =
      wait_terminal(&bed.orchestrator, &ids[0]).await;
    assert_eq!(
      operation.operation_type,
      OperationType::Stack
    );
    assert_eq!(operation.status, OperationStatus::Complete);
  }
}
