use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};

use anyhow::Context;
use docksmith_client::entities::{
  container::ContainerRecord,
  event::{CheckProgress, CheckStage, Event},
  stack::{
    CheckCounts, DiscoveryResult, StackSummary, UpdatePriority,
  },
  update::{ContainerUpdate, UpdateStatus},
  version::ChangeType,
};
use futures_util::future::join_all;
use indexmap::IndexMap;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::{
  checker::{Checker, cache_key},
  compose,
  config::core_config,
  events::EventBus,
  graph::DependencyGraph,
  hooks,
  registry::Registry,
  runtime::ContainerRuntime,
  stack::StackResolver,
  store::Store,
};

pub mod background;

/// Bounded-parallel fan-out of the decision engine over every
/// container on the host, aggregated into a [DiscoveryResult].
pub struct Discovery<R, G, S> {
  pub checker: Arc<Checker<R, G, S>>,
  pub resolver: Arc<StackResolver>,
  pub bus: Arc<EventBus>,
}

impl<R, G, S> Discovery<R, G, S>
where
  R: ContainerRuntime,
  G: Registry,
  S: Store,
{
  pub fn new(
    checker: Arc<Checker<R, G, S>>,
    resolver: Arc<StackResolver>,
    bus: Arc<EventBus>,
  ) -> Discovery<R, G, S> {
    Discovery {
      checker,
      resolver,
      bus,
    }
  }

  pub async fn discover_and_check(
    &self,
  ) -> anyhow::Result<DiscoveryResult> {
    self.bus.publish(Event::CheckProgress(CheckProgress {
      stage: CheckStage::Discovering,
      message: "listing containers".to_string(),
      ..Default::default()
    }));

    let containers = self
      .checker
      .runtime
      .list_containers()
      .await
      .context("failed to list containers")?;
    let total = containers.len();

    let semaphore = Arc::new(Semaphore::new(
      core_config().max_concurrent_checks,
    ));
    let checked = AtomicUsize::new(0);

    let futures = containers.iter().map(|container| {
      let semaphore = semaphore.clone();
      let checked = &checked;
      async move {
        let _permit = semaphore
          .acquire()
          .await
          .expect("check semaphore closed");
        let update =
          self.check_one(container, total, checked).await;
        (container, update)
      }
    });
    let mut updates: Vec<ContainerUpdate> =
      join_all(futures)
        .await
        .into_iter()
        .map(|(_, update)| update)
        .collect();

    // Dependency metadata is derived over the full set.
    let graph = DependencyGraph::build(&containers);
    for update in &mut updates {
      update.depends_on = graph
        .dependencies_of(&update.container_name)
        .to_vec();
    }
    let update_order = match graph.update_order() {
      Ok(order) => order,
      Err(e) => {
        warn!("no update order available | {e:#}");
        Vec::new()
      }
    };

    let mut stacks: IndexMap<String, StackSummary> =
      IndexMap::new();
    let mut standalone_containers = Vec::new();
    for update in &updates {
      if update.stack.is_empty() {
        standalone_containers
          .push(update.container_name.clone());
        continue;
      }
      let summary = stacks
        .entry(update.stack.clone())
        .or_insert_with(|| StackSummary {
          name: update.stack.clone(),
          ..Default::default()
        });
      summary.containers.push(update.container_name.clone());
      if update.has_update() {
        summary.has_updates = true;
      }
      let priority = match update.change_type {
        ChangeType::Major => UpdatePriority::Major,
        ChangeType::Minor => UpdatePriority::Minor,
        ChangeType::Patch => UpdatePriority::Patch,
        _ => UpdatePriority::None,
      };
      if priority > summary.update_priority {
        summary.update_priority = priority;
      }
    }

    let counts = count_statuses(&updates);

    if let Err(e) =
      self.checker.store.log_check_batch(&updates).await
    {
      debug!("failed to log check batch | {e:#}");
    }

    self.bus.publish(Event::CheckProgress(CheckProgress {
      stage: CheckStage::Complete,
      total,
      checked: total,
      percent: 100,
      message: format!(
        "{} containers checked, {} updates",
        counts.total_checked, counts.updates_found
      ),
      ..Default::default()
    }));

    Ok(DiscoveryResult {
      containers: updates,
      stacks,
      standalone_containers,
      update_order,
      counts,
      timestamps: Default::default(),
    })
  }

  /// Check one container, consulting the result cache first.
  /// Host-side metadata (stack, service, label sync) is always
  /// computed fresh, cached or not.
  async fn check_one(
    &self,
    container: &ContainerRecord,
    total: usize,
    checked: &AtomicUsize,
  ) -> ContainerUpdate {
    let key = cache_key(container);
    let mut update =
      match self.checker.cache.get(&key).await {
        Some(cached) => {
          let mut cached = cached;
          let compose_check =
            compose::check_compose(container).await;
          cached.labels_out_of_sync =
            compose_check.labels_out_of_sync;
          cached
        }
        None => {
          let update =
            self.checker.check_container(container).await;
          if update.status != UpdateStatus::LocalImage {
            self
              .checker
              .cache
              .insert(
                key,
                update.clone(),
                self.checker.cache_ttl(),
              )
              .await;
          }
          update
        }
      };

    update.stack = self.resolver.resolve(container);
    update.service = container.compose_service().to_string();

    // An update behind an invalid pre-update hook cannot be
    // trusted either way.
    if update.status == UpdateStatus::UpdateAvailable
      && let Some(script) = &update.pre_update_check
      && let Err(e) = hooks::validate_script_path(script)
    {
      update.status = UpdateStatus::Unknown;
      update.error =
        Some(format!("pre-update check rejected | {e:#}"));
    }

    let done = checked.fetch_add(1, Ordering::SeqCst) + 1;
    self.bus.publish(Event::CheckProgress(CheckProgress {
      stage: CheckStage::Checked,
      total,
      checked: done,
      percent: if total == 0 {
        100
      } else {
        ((done * 100) / total) as u8
      },
      container_name: Some(update.container_name.clone()),
      message: update.status.to_string(),
    }));
    update
  }
}

fn count_statuses(updates: &[ContainerUpdate]) -> CheckCounts {
  let mut counts = CheckCounts {
    total_checked: updates.len(),
    ..Default::default()
  };
  for update in updates {
    match update.status {
      UpdateStatus::UpdateAvailable
      | UpdateStatus::UpdateAvailableBlocked => {
        counts.updates_found += 1
      }
      UpdateStatus::UpToDate
      | UpdateStatus::UpToDatePinnable => {
        counts.up_to_date += 1
      }
      UpdateStatus::LocalImage => counts.local_images += 1,
      UpdateStatus::CheckFailed
      | UpdateStatus::MetadataUnavailable => {
        counts.failed += 1
      }
      UpdateStatus::Ignored => counts.ignored += 1,
      _ => {}
    }
  }
  counts
}

#[cfg(test)]
mod tests {
  use derive_variants::ExtractVariant;
  use docksmith_client::entities::{
    container::labels, event::EventVariant,
  };

  use super::*;
  use crate::{
    store::MemoryStore,
    testing::{StubRegistry, StubRuntime},
  };

  fn compose_container(
    name: &str,
    image: &str,
    project: &str,
    depends_on: Option<&str>,
  ) -> ContainerRecord {
    let mut record = ContainerRecord {
      id: format!("{name}-0123456789abcdef"),
      name: name.to_string(),
      image: image.to_string(),
      ..Default::default()
    };
    record.labels.insert(
      labels::COMPOSE_PROJECT.to_string(),
      project.to_string(),
    );
    if let Some(raw) = depends_on {
      record.labels.insert(
        labels::COMPOSE_DEPENDS_ON.to_string(),
        raw.to_string(),
      );
    }
    record
  }

  fn discovery(
    runtime: StubRuntime,
    registry: StubRegistry,
  ) -> Discovery<StubRuntime, StubRegistry, MemoryStore> {
    let checker = Arc::new(Checker::new(
      Arc::new(runtime),
      Arc::new(registry),
      Arc::new(MemoryStore::default()),
    ));
    Discovery::new(
      checker,
      Arc::new(StackResolver::default()),
      Arc::new(EventBus::default()),
    )
  }

  #[tokio::test]
  async fn groups_stacks_and_orders_updates() {
    let runtime = StubRuntime::with_containers(vec![
      compose_container(
        "web",
        "nginx:1.25.0",
        "media",
        Some("db"),
      ),
      compose_container("db", "postgres:13", "media", None),
      ContainerRecord {
        id: "solo-0123456789abcdef".to_string(),
        name: "solo".to_string(),
        image: "redis:7.2.0".to_string(),
        ..Default::default()
      },
    ]);
    let mut registry = StubRegistry::with_tags(
      "nginx",
      &["1.25.0", "1.26.0"],
    );
    registry.tags.insert(
      "postgres".to_string(),
      vec!["13".to_string()],
    );
    registry.tags.insert(
      "redis".to_string(),
      vec!["7.2.0".to_string()],
    );

    let discovery = discovery(runtime, registry);
    let result =
      discovery.discover_and_check().await.unwrap();

    assert_eq!(result.counts.total_checked, 3);
    assert_eq!(result.counts.updates_found, 1);
    assert_eq!(result.standalone_containers, ["solo"]);
    let media = &result.stacks["media"];
    assert!(media.has_updates);
    assert_eq!(media.update_priority, UpdatePriority::Minor);
    let position = |name: &str| {
      result
        .update_order
        .iter()
        .position(|n| n == name)
        .unwrap()
    };
    assert!(position("db") < position("web"));
    assert_eq!(
      result.container("web").unwrap().depends_on,
      ["db"]
    );
  }

  #[tokio::test]
  async fn publishes_progress_events() {
    let runtime =
      StubRuntime::with_containers(vec![compose_container(
        "web",
        "nginx:1.25.0",
        "media",
        None,
      )]);
    let registry =
      StubRegistry::with_tags("nginx", &["1.25.0"]);
    let discovery = discovery(runtime, registry);
    let mut subscription = discovery
      .bus
      .subscribe(Some(EventVariant::CheckProgress));

    discovery.discover_and_check().await.unwrap();

    let mut stages = Vec::new();
    while let Ok(event) = subscription.receiver.try_recv() {
      assert_eq!(
        event.extract_variant(),
        EventVariant::CheckProgress
      );
      let Event::CheckProgress(progress) = event else {
        unreachable!()
      };
      stages.push(progress.stage);
    }
    assert_eq!(
      stages,
      [
        CheckStage::Discovering,
        CheckStage::Checked,
        CheckStage::Complete
      ]
    );
  }

  #[tokio::test]
  async fn cached_results_skip_the_registry() {
    let runtime =
      StubRuntime::with_containers(vec![compose_container(
        "web",
        "nginx:1.25.0",
        "media",
        None,
      )]);
    let registry = StubRegistry::with_tags(
      "nginx",
      &["1.25.0", "1.26.0"],
    );
    let discovery = discovery(runtime, registry);
    discovery.discover_and_check().await.unwrap();

    // Second pass is served from the cache: a registry that
    // now fails never surfaces.
    discovery
      .checker
      .registry
      .set_error(Some("registry offline"));
    let result =
      discovery.discover_and_check().await.unwrap();
    assert_eq!(
      result.container("web").unwrap().status,
      UpdateStatus::UpdateAvailable
    );
  }

  #[tokio::test]
  async fn cycles_leave_update_order_empty() {
    let runtime = StubRuntime::with_containers(vec![
      compose_container(
        "a",
        "nginx:1.25.0",
        "s",
        Some("b"),
      ),
      compose_container(
        "b",
        "nginx:1.25.0",
        "s",
        Some("a"),
      ),
    ]);
    let registry =
      StubRegistry::with_tags("nginx", &["1.25.0"]);
    let discovery = discovery(runtime, registry);
    let result =
      discovery.discover_and_check().await.unwrap();
    assert!(result.update_order.is_empty());
  }
}
