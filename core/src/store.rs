use std::{
  collections::HashMap,
  future::Future,
  sync::Mutex,
};

use docksmith_client::entities::update::{
  ContainerUpdate, OperationStatus, QueuedUpdate, RollbackEntity,
  RollbackPolicy, UpdateOperation,
};

/// Key under which the background checker persists the last
/// cache refresh time, as RFC3339.
pub const LAST_CACHE_REFRESH_KEY: &str = "last_cache_refresh";

/// Contract the engine demands from the persistent store. The
/// on-disk schema is the embedding application's concern.
pub trait Store: Send + Sync {
  /// Upsert by operation id.
  fn save_operation(
    &self,
    operation: &UpdateOperation,
  ) -> impl Future<Output = anyhow::Result<()>> + Send;

  fn get_operation(
    &self,
    operation_id: &str,
  ) -> impl Future<Output = anyhow::Result<Option<UpdateOperation>>>
  + Send;

  fn update_operation_status(
    &self,
    operation_id: &str,
    status: OperationStatus,
    error_message: Option<&str>,
  ) -> impl Future<Output = anyhow::Result<()>> + Send;

  fn operations_by_status(
    &self,
    status: OperationStatus,
  ) -> impl Future<Output = anyhow::Result<Vec<UpdateOperation>>>
  + Send;

  fn operations_by_container(
    &self,
    container_name: &str,
  ) -> impl Future<Output = anyhow::Result<Vec<UpdateOperation>>>
  + Send;

  /// Operations created within `[from, to]` (unix ms).
  fn operations_in_range(
    &self,
    from: i64,
    to: i64,
  ) -> impl Future<Output = anyhow::Result<Vec<UpdateOperation>>>
  + Send;

  fn operations_by_batch(
    &self,
    batch_group_id: &str,
  ) -> impl Future<Output = anyhow::Result<Vec<UpdateOperation>>>
  + Send;

  fn queue_update(
    &self,
    entry: &QueuedUpdate,
  ) -> impl Future<Output = anyhow::Result<()>> + Send;

  fn dequeue_update(
    &self,
    operation_id: &str,
  ) -> impl Future<Output = anyhow::Result<()>> + Send;

  /// FIFO by queue time.
  fn queued_updates(
    &self,
  ) -> impl Future<Output = anyhow::Result<Vec<QueuedUpdate>>>
  + Send;

  fn set_config(
    &self,
    key: &str,
    value: &str,
  ) -> impl Future<Output = anyhow::Result<()>> + Send;

  fn get_config(
    &self,
    key: &str,
  ) -> impl Future<Output = anyhow::Result<Option<String>>> + Send;

  fn save_version_cache(
    &self,
    digest: &str,
    image: &str,
    arch: &str,
    version: &str,
  ) -> impl Future<Output = anyhow::Result<()>> + Send;

  fn get_version_cache(
    &self,
    digest: &str,
    image: &str,
    arch: &str,
  ) -> impl Future<Output = anyhow::Result<Option<String>>> + Send;

  /// Record one discovery pass for history. Failures here are
  /// logged and swallowed by callers.
  fn log_check_batch(
    &self,
    results: &[ContainerUpdate],
  ) -> impl Future<Output = anyhow::Result<()>> + Send;

  fn set_rollback_policy(
    &self,
    policy: &RollbackPolicy,
  ) -> impl Future<Output = anyhow::Result<()>> + Send;

  fn rollback_policy(
    &self,
    entity_type: RollbackEntity,
    entity_id: &str,
  ) -> impl Future<Output = anyhow::Result<Option<RollbackPolicy>>>
  + Send;
}

#[derive(Default)]
struct MemoryStoreInner {
  operations: HashMap<String, UpdateOperation>,
  queue: Vec<QueuedUpdate>,
  config: HashMap<String, String>,
  version_cache: HashMap<(String, String, String), String>,
  check_batches: Vec<Vec<ContainerUpdate>>,
  rollback_policies: HashMap<(RollbackEntity, String), RollbackPolicy>,
}

/// In-memory [Store]. Backs the test suite and storeless
/// operation; state does not survive a restart.
#[derive(Default)]
pub struct MemoryStore {
  inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
  fn lock(
    &self,
  ) -> std::sync::MutexGuard<'_, MemoryStoreInner> {
    self.inner.lock().expect("memory store poisoned")
  }
}

impl Store for MemoryStore {
  async fn save_operation(
    &self,
    operation: &UpdateOperation,
  ) -> anyhow::Result<()> {
    self.lock().operations.insert(
      operation.operation_id.clone(),
      operation.clone(),
    );
    Ok(())
  }

  async fn get_operation(
    &self,
    operation_id: &str,
  ) -> anyhow::Result<Option<UpdateOperation>> {
    Ok(self.lock().operations.get(operation_id).cloned())
  }

  async fn update_operation_status(
    &self,
    operation_id: &str,
    status: OperationStatus,
    error_message: Option<&str>,
  ) -> anyhow::Result<()> {
    let mut inner = self.lock();
    let Some(operation) =
      inner.operations.get_mut(operation_id)
    else {
      return Err(anyhow::anyhow!(
        "no operation {operation_id}"
      ));
    };
    operation.status = status;
    if let Some(message) = error_message {
      operation.error_message = Some(message.to_string());
    }
    Ok(())
  }

  async fn operations_by_status(
    &self,
    status: OperationStatus,
  ) -> anyhow::Result<Vec<UpdateOperation>> {
    Ok(
      self
        .lock()
        .operations
        .values()
        .filter(|op| op.status == status)
        .cloned()
        .collect(),
    )
  }

  async fn operations_by_container(
    &self,
    container_name: &str,
  ) -> anyhow::Result<Vec<UpdateOperation>> {
    Ok(
      self
        .lock()
        .operations
        .values()
        .filter(|op| {
          op.container_name.as_deref() == Some(container_name)
        })
        .cloned()
        .collect(),
    )
  }

  async fn operations_in_range(
    &self,
    from: i64,
    to: i64,
  ) -> anyhow::Result<Vec<UpdateOperation>> {
    Ok(
      self
        .lock()
        .operations
        .values()
        .filter(|op| {
          op.created_at >= from && op.created_at <= to
        })
        .cloned()
        .collect(),
    )
  }

  async fn operations_by_batch(
    &self,
    batch_group_id: &str,
  ) -> anyhow::Result<Vec<UpdateOperation>> {
    Ok(
      self
        .lock()
        .operations
        .values()
        .filter(|op| {
          op.batch_group_id.as_deref() == Some(batch_group_id)
        })
        .cloned()
        .collect(),
    )
  }

  async fn queue_update(
    &self,
    entry: &QueuedUpdate,
  ) -> anyhow::Result<()> {
    self.lock().queue.push(entry.clone());
    Ok(())
  }

  async fn dequeue_update(
    &self,
    operation_id: &str,
  ) -> anyhow::Result<()> {
    self
      .lock()
      .queue
      .retain(|entry| entry.operation_id != operation_id);
    Ok(())
  }

  async fn queued_updates(
    &self,
  ) -> anyhow::Result<Vec<QueuedUpdate>> {
    let mut queue = self.lock().queue.clone();
    queue.sort_by_key(|entry| entry.queued_at);
    Ok(queue)
  }

  async fn set_config(
    &self,
    key: &str,
    value: &str,
  ) -> anyhow::Result<()> {
    self
      .lock()
      .config
      .insert(key.to_string(), value.to_string());
    Ok(())
  }

  async fn get_config(
    &self,
    key: &str,
  ) -> anyhow::Result<Option<String>> {
    Ok(self.lock().config.get(key).cloned())
  }

  async fn save_version_cache(
    &self,
    digest: &str,
    image: &str,
    arch: &str,
    version: &str,
  ) -> anyhow::Result<()> {
    self.lock().version_cache.insert(
      (
        digest.to_string(),
        image.to_string(),
        arch.to_string(),
      ),
      version.to_string(),
    );
    Ok(())
  }

  async fn get_version_cache(
    &self,
    digest: &str,
    image: &str,
    arch: &str,
  ) -> anyhow::Result<Option<String>> {
    Ok(
      self
        .lock()
        .version_cache
        .get(&(
          digest.to_string(),
          image.to_string(),
          arch.to_string(),
        ))
        .cloned(),
    )
  }

  async fn log_check_batch(
    &self,
    results: &[ContainerUpdate],
  ) -> anyhow::Result<()> {
    self.lock().check_batches.push(results.to_vec());
    Ok(())
  }

  async fn set_rollback_policy(
    &self,
    policy: &RollbackPolicy,
  ) -> anyhow::Result<()> {
    self.lock().rollback_policies.insert(
      (policy.entity_type, policy.entity_id.clone()),
      policy.clone(),
    );
    Ok(())
  }

  async fn rollback_policy(
    &self,
    entity_type: RollbackEntity,
    entity_id: &str,
  ) -> anyhow::Result<Option<RollbackPolicy>> {
    Ok(
      self
        .lock()
        .rollback_policies
        .get(&(entity_type, entity_id.to_string()))
        .cloned(),
    )
  }
}

#[cfg(test)]
mod tests {
  use docksmith_client::entities::update::OperationType;

  use super::*;

  #[tokio::test]
  async fn operation_round_trip() {
    let store = MemoryStore::default();
    let op = UpdateOperation::new(OperationType::Single, "media");
    store.save_operation(&op).await.unwrap();
    let loaded = store
      .get_operation(&op.operation_id)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(loaded.stack_name, "media");

    store
      .update_operation_status(
        &op.operation_id,
        OperationStatus::Failed,
        Some("boom"),
      )
      .await
      .unwrap();
    let failed = store
      .get_operation(&op.operation_id)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(failed.status, OperationStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("boom"));
  }

  #[tokio::test]
  async fn queue_is_fifo_and_dequeues_once() {
    let store = MemoryStore::default();
    for (id, ts) in [("b", 2), ("a", 1)] {
      store
        .queue_update(&QueuedUpdate {
          operation_id: id.to_string(),
          stack_name: "s".to_string(),
          queued_at: ts,
          ..Default::default()
        })
        .await
        .unwrap();
    }
    let queued = store.queued_updates().await.unwrap();
    assert_eq!(queued[0].operation_id, "a");
    store.dequeue_update("a").await.unwrap();
    let queued = store.queued_updates().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].operation_id, "b");
  }

  #[tokio::test]
  async fn version_cache_round_trip() {
    let store = MemoryStore::default();
    store
      .save_version_cache("abc", "nginx", "x86_64", "1.25.3")
      .await
      .unwrap();
    assert_eq!(
      store
        .get_version_cache("abc", "nginx", "x86_64")
        .await
        .unwrap()
        .as_deref(),
      Some("1.25.3")
    );
    assert_eq!(
      store
        .get_version_cache("abc", "nginx", "arm64")
        .await
        .unwrap(),
      None
    );
  }
}
