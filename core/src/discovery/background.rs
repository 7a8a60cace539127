use std::{
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  time::Duration,
};

use chrono::DateTime;
use docksmith_client::entities::{
  docksmith_timestamp,
  event::{
    ContainerUpdated, Event, EventVariant,
    SOURCE_BACKGROUND_CHECKER,
  },
  stack::{CheckTimestamps, DiscoveryResult},
};
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tracing::{error, info, warn};

use crate::{
  config::core_config,
  discovery::Discovery,
  events::EventBus,
  registry::Registry,
  runtime::ContainerRuntime,
  store::{LAST_CACHE_REFRESH_KEY, Store},
};

/// Debounce window for event-driven refreshes.
const REFRESH_DEBOUNCE: Duration = Duration::from_secs(2);
/// Bound on the persistence write after a cache refresh.
const REFRESH_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct CheckSnapshot {
  result: Option<DiscoveryResult>,
  last_cache_refresh: Option<i64>,
  last_background_run: Option<i64>,
}

struct BackgroundInner<R, G, S> {
  discovery: Discovery<R, G, S>,
  store: Arc<S>,
  bus: Arc<EventBus>,
  snapshot: RwLock<CheckSnapshot>,
  checking: AtomicBool,
  cache_cleared: AtomicBool,
  running: AtomicBool,
  stop: watch::Sender<bool>,
  debounce: Mutex<Option<tokio::task::JoinHandle<()>>>,
  subscription_id: Mutex<Option<u64>>,
}

/// Periodic discovery loop holding one cached snapshot, with
/// debounced event-driven refresh on top of the interval
/// ticker.
pub struct BackgroundChecker<R, G, S> {
  inner: Arc<BackgroundInner<R, G, S>>,
}

impl<R, G, S> Clone for BackgroundChecker<R, G, S> {
  fn clone(&self) -> Self {
    BackgroundChecker {
      inner: self.inner.clone(),
    }
  }
}

impl<R, G, S> BackgroundChecker<R, G, S>
where
  R: ContainerRuntime + 'static,
  G: Registry + 'static,
  S: Store + 'static,
{
  pub fn new(
    discovery: Discovery<R, G, S>,
    store: Arc<S>,
    bus: Arc<EventBus>,
  ) -> BackgroundChecker<R, G, S> {
    let (stop, _) = watch::channel(false);
    BackgroundChecker {
      inner: Arc::new(BackgroundInner {
        discovery,
        store,
        bus,
        snapshot: Default::default(),
        checking: AtomicBool::new(false),
        cache_cleared: AtomicBool::new(false),
        running: AtomicBool::new(false),
        stop,
        debounce: Default::default(),
        subscription_id: Default::default(),
      }),
    }
  }

  /// Restore persisted state, subscribe to container-update
  /// events, and spawn the consumer and the check loop (with
  /// an immediate first run).
  pub async fn start(&self) {
    if self.inner.running.swap(true, Ordering::SeqCst) {
      warn!("background checker already started");
      return;
    }

    if let Ok(Some(raw)) = self
      .inner
      .store
      .get_config(LAST_CACHE_REFRESH_KEY)
      .await
      && let Ok(parsed) = DateTime::parse_from_rfc3339(&raw)
    {
      self.inner.snapshot.write().await.last_cache_refresh =
        Some(parsed.timestamp_millis());
    }

    let subscription = self
      .inner
      .bus
      .subscribe(Some(EventVariant::ContainerUpdated));
    *self.inner.subscription_id.lock().await =
      Some(subscription.id);

    let consumer = self.clone();
    let stop_rx = self.inner.stop.subscribe();
    tokio::spawn(async move {
      consumer
        .consume_events(subscription.receiver, stop_rx)
        .await;
    });

    let looper = self.clone();
    let stop_rx = self.inner.stop.subscribe();
    tokio::spawn(async move {
      looper.check_loop(stop_rx).await;
    });
  }

  async fn check_loop(&self, mut stop: watch::Receiver<bool>) {
    self.run_check().await;
    let mut ticker = tokio::time::interval(
      Duration::from_secs(core_config().check_interval),
    );
    // The immediate tick was just covered by the first run.
    ticker.tick().await;
    loop {
      tokio::select! {
        _ = stop.changed() => break,
        _ = ticker.tick() => self.run_check().await,
      }
    }
  }

  async fn consume_events(
    &self,
    mut receiver: mpsc::Receiver<Event>,
    mut stop: watch::Receiver<bool>,
  ) {
    loop {
      let event = tokio::select! {
        _ = stop.changed() => break,
        event = receiver.recv() => event,
      };
      let Some(Event::ContainerUpdated(updated)) = event
      else {
        break;
      };
      // Our own completion events must not re-trigger us.
      if updated.source.as_deref()
        == Some(SOURCE_BACKGROUND_CHECKER)
      {
        continue;
      }
      // Only operation outcomes warrant a refresh.
      if updated.operation_id.is_none() {
        continue;
      }
      let checker = self.clone();
      let mut debounce = self.inner.debounce.lock().await;
      if let Some(pending) = debounce.take() {
        pending.abort();
      }
      *debounce = Some(tokio::spawn(async move {
        tokio::time::sleep(REFRESH_DEBOUNCE).await;
        checker.run_check().await;
      }));
    }
  }

  /// One full check pass. Re-entry is rejected; a concurrent
  /// caller returns immediately.
  pub async fn run_check(&self) {
    if self.inner.checking.swap(true, Ordering::SeqCst) {
      info!("check already in progress, skipping");
      return;
    }
    self.inner.discovery.checker.cache.cleanup().await;

    let outcome =
      self.inner.discovery.discover_and_check().await;
    let now = docksmith_timestamp();

    match outcome {
      Ok(mut result) => {
        let updates_found = result.counts.updates_found;
        {
          let mut snapshot =
            self.inner.snapshot.write().await;
          snapshot.last_background_run = Some(now);
          result.timestamps =
            self.timestamps_with(&snapshot, false);
          snapshot.result = Some(result);
        }
        self.inner.bus.publish(Event::ContainerUpdated(
          ContainerUpdated {
            status: "checked".to_string(),
            source: Some(
              SOURCE_BACKGROUND_CHECKER.to_string(),
            ),
            count: Some(updates_found),
            ..Default::default()
          },
        ));
      }
      Err(e) => {
        error!("background check failed | {e:#}");
        self.inner.snapshot.write().await.last_background_run =
          Some(now);
      }
    }

    if self.inner.cache_cleared.swap(false, Ordering::SeqCst) {
      self.inner.snapshot.write().await.last_cache_refresh =
        Some(now);
      self.persist_cache_refresh(now).await;
    }

    self.inner.checking.store(false, Ordering::SeqCst);
  }

  async fn persist_cache_refresh(&self, now: i64) {
    let Some(datetime) =
      DateTime::from_timestamp_millis(now)
    else {
      return;
    };
    let value = datetime.to_rfc3339();
    match tokio::time::timeout(
      REFRESH_WRITE_TIMEOUT,
      self
        .inner
        .store
        .set_config(LAST_CACHE_REFRESH_KEY, &value),
    )
    .await
    {
      Ok(Ok(())) => {}
      Ok(Err(e)) => {
        warn!("failed to persist cache refresh time | {e:#}")
      }
      Err(_) => {
        warn!("timed out persisting cache refresh time")
      }
    }
  }

  /// Tell the next check to treat the cache as freshly
  /// cleared and persist the refresh time.
  pub fn mark_cache_cleared(&self) {
    self.inner.cache_cleared.store(true, Ordering::SeqCst);
  }

  /// The latest snapshot, with live timestamps. Empty result
  /// before the first completed run.
  pub async fn snapshot(&self) -> DiscoveryResult {
    let snapshot = self.inner.snapshot.read().await;
    let mut result =
      snapshot.result.clone().unwrap_or_default();
    result.timestamps = self.timestamps_with(
      &snapshot,
      self.inner.checking.load(Ordering::SeqCst),
    );
    result
  }

  fn timestamps_with(
    &self,
    snapshot: &CheckSnapshot,
    checking: bool,
  ) -> CheckTimestamps {
    let config = core_config();
    CheckTimestamps {
      last_cache_refresh: snapshot.last_cache_refresh,
      last_background_run: snapshot.last_background_run,
      checking,
      next_check: snapshot.last_background_run.map(|last| {
        last + (config.check_interval * 1000) as i64
      }),
      cache_ttl: config.cache_ttl,
      check_interval: config.check_interval,
    }
  }

  /// Stop the loop and the consumer, cancel any pending
  /// debounced refresh, unsubscribe. Idempotent.
  pub async fn stop(&self) {
    if !self.inner.running.swap(false, Ordering::SeqCst) {
      return;
    }
    if let Some(pending) =
      self.inner.debounce.lock().await.take()
    {
      pending.abort();
    }
    if let Some(id) =
      self.inner.subscription_id.lock().await.take()
    {
      self.inner.bus.unsubscribe(id);
    }
    let _ = self.inner.stop.send(true);
  }
}

#[cfg(test)]
mod tests {
  use docksmith_client::entities::container::{
    ContainerRecord, labels,
  };

  use super::*;
  use crate::{
    checker::Checker,
    stack::StackResolver,
    store::MemoryStore,
    testing::{StubRegistry, StubRuntime},
  };

  fn background() -> BackgroundChecker<
    StubRuntime,
    StubRegistry,
    MemoryStore,
  > {
    let mut record = ContainerRecord {
      id: "web-0123456789abcdef".to_string(),
      name: "web".to_string(),
      image: "nginx:1.25.0".to_string(),
      ..Default::default()
    };
    record.labels.insert(
      labels::COMPOSE_PROJECT.to_string(),
      "media".to_string(),
    );
    let runtime =
      StubRuntime::with_containers(vec![record]);
    let registry = StubRegistry::with_tags(
      "nginx",
      &["1.25.0", "1.26.0"],
    );
    let store = Arc::new(MemoryStore::default());
    let bus = Arc::new(EventBus::default());
    let checker = Arc::new(Checker::new(
      Arc::new(runtime),
      Arc::new(registry),
      store.clone(),
    ));
    let discovery = Discovery::new(
      checker,
      Arc::new(StackResolver::default()),
      bus.clone(),
    );
    BackgroundChecker::new(discovery, store, bus)
  }

  #[tokio::test]
  async fn run_check_fills_snapshot_and_publishes() {
    let checker = background();
    let mut subscription = checker
      .inner
      .bus
      .subscribe(Some(EventVariant::ContainerUpdated));

    checker.run_check().await;

    let snapshot = checker.snapshot().await;
    assert_eq!(snapshot.counts.total_checked, 1);
    assert_eq!(snapshot.counts.updates_found, 1);
    assert!(
      snapshot.timestamps.last_background_run.is_some()
    );

    let Ok(Event::ContainerUpdated(event)) =
      subscription.receiver.try_recv()
    else {
      panic!("expected a container updated event");
    };
    assert_eq!(
      event.source.as_deref(),
      Some(SOURCE_BACKGROUND_CHECKER)
    );
    assert_eq!(event.count, Some(1));
  }

  #[tokio::test]
  async fn cache_refresh_round_trips_through_store() {
    let checker = background();
    checker.mark_cache_cleared();
    checker.run_check().await;

    let raw = checker
      .inner
      .store
      .get_config(LAST_CACHE_REFRESH_KEY)
      .await
      .unwrap()
      .expect("refresh time persisted");
    let parsed = DateTime::parse_from_rfc3339(&raw).unwrap();
    let in_memory = checker
      .snapshot()
      .await
      .timestamps
      .last_cache_refresh
      .unwrap();
    assert_eq!(parsed.timestamp_millis(), in_memory);
  }

  #[tokio::test]
  async fn start_and_stop_are_idempotent() {
    let checker = background();
    checker.start().await;
    // Double start warns and does nothing.
    checker.start().await;
    checker.stop().await;
    checker.stop().await;
  }

  #[tokio::test]
  async fn own_events_do_not_retrigger() {
    let checker = background();
    checker.start().await;
    // Give the immediate run a chance to finish.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let runs_before = checker
      .snapshot()
      .await
      .timestamps
      .last_background_run;
    assert!(runs_before.is_some());

    checker.inner.bus.publish(Event::ContainerUpdated(
      ContainerUpdated {
        operation_id: Some("op".to_string()),
        source: Some(SOURCE_BACKGROUND_CHECKER.to_string()),
        ..Default::default()
      },
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    // No debounce task was scheduled for our own event.
    assert!(
      checker.inner.debounce.lock().await.is_none()
    );
    checker.stop().await;
  }
}
