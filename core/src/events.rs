use std::sync::{
  Mutex,
  atomic::{AtomicU64, Ordering},
};

use derive_variants::ExtractVariant;
use docksmith_client::entities::{
  docksmith_timestamp,
  event::{Event, EventVariant, UpdateProgress},
  update::{OperationStatus, UpdateOperation},
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::core_config;

struct Subscriber {
  id: u64,
  /// None subscribes to every event type.
  kind: Option<EventVariant>,
  tx: mpsc::Sender<Event>,
}

/// Fan-out broker for engine progress events. Publication never
/// blocks: subscribers consume from a bounded channel and slow
/// ones drop events rather than stalling the publisher.
pub struct EventBus {
  subscribers: Mutex<Vec<Subscriber>>,
  next_id: AtomicU64,
}

impl Default for EventBus {
  fn default() -> Self {
    EventBus {
      subscribers: Mutex::new(Vec::new()),
      next_id: AtomicU64::new(1),
    }
  }
}

pub struct EventSubscription {
  pub receiver: mpsc::Receiver<Event>,
  pub id: u64,
}

impl EventBus {
  pub fn publish(&self, event: Event) {
    let kind = event.extract_variant();
    let mut subscribers = self
      .subscribers
      .lock()
      .expect("event bus subscriber list poisoned");
    subscribers.retain(|sub| {
      if sub.kind.is_some_and(|k| k != kind) {
        return true;
      }
      match sub.tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
          debug!(
            "subscriber {} lagging, dropped {kind} event",
            sub.id
          );
          true
        }
        // Receiver gone, prune the subscription.
        Err(mpsc::error::TrySendError::Closed(_)) => false,
      }
    });
  }

  /// Subscribe to one event type, or all with `kind: None`.
  pub fn subscribe(
    &self,
    kind: Option<EventVariant>,
  ) -> EventSubscription {
    let (tx, receiver) =
      mpsc::channel(core_config().event_channel_capacity);
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    self
      .subscribers
      .lock()
      .expect("event bus subscriber list poisoned")
      .push(Subscriber { id, kind, tx });
    EventSubscription { receiver, id }
  }

  pub fn unsubscribe(&self, id: u64) {
    self
      .subscribers
      .lock()
      .expect("event bus subscriber list poisoned")
      .retain(|sub| sub.id != id);
  }

  /// Progress event for one operation stage transition.
  pub fn publish_update_progress(
    &self,
    operation: &UpdateOperation,
    stage: OperationStatus,
    message: impl Into<String>,
  ) {
    self.publish(Event::UpdateProgress(UpdateProgress {
      operation_id: operation.operation_id.clone(),
      container_id: operation.container_id.clone(),
      container_name: operation
        .container_name
        .clone()
        .unwrap_or_default(),
      stack_name: operation.stack_name.clone(),
      stage,
      progress: stage.progress_percent(),
      message: message.into(),
      timestamp: docksmith_timestamp(),
    }));
  }
}
