//! In-memory collaborator implementations backing the test
//! suite. No Docker daemon or registry is touched.

use std::{
  collections::{HashMap, HashSet},
  path::Path,
  sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
  },
};

use anyhow::anyhow;
use docksmith_client::entities::{
  container::{ContainerDetails, ContainerRecord},
  update::Log,
};
use tokio::sync::mpsc;

use crate::runtime::{ContainerRuntime, PullProgress};
use crate::registry::Registry;

#[derive(Default)]
pub struct StubRuntime {
  pub containers: Mutex<Vec<ContainerRecord>>,
  pub details: Mutex<HashMap<String, ContainerDetails>>,
  /// Images that exist only locally.
  pub local_images: HashSet<String>,
  /// image -> repo digest
  pub digests: HashMap<String, String>,
  /// image -> org.opencontainers.image.version label
  pub version_labels: HashMap<String, String>,
  /// Verbs recorded in execution order, eg `stop:web`.
  pub actions: Mutex<Vec<String>>,
  /// Remaining pull attempts that should fail.
  pub failing_pulls: AtomicUsize,
  pub fail_ping: bool,
  pub fail_compose_up: bool,
}

impl StubRuntime {
  pub fn with_containers(
    containers: Vec<ContainerRecord>,
  ) -> StubRuntime {
    StubRuntime {
      containers: Mutex::new(containers),
      ..Default::default()
    }
  }

  pub fn record(&self, action: impl Into<String>) {
    self
      .actions
      .lock()
      .expect("actions poisoned")
      .push(action.into());
  }

  pub fn recorded(&self) -> Vec<String> {
    self.actions.lock().expect("actions poisoned").clone()
  }

  pub fn set_details(
    &self,
    name: &str,
    details: ContainerDetails,
  ) {
    self
      .details
      .lock()
      .expect("details poisoned")
      .insert(name.to_string(), details);
  }
}

impl ContainerRuntime for StubRuntime {
  async fn ping(&self) -> anyhow::Result<()> {
    if self.fail_ping {
      return Err(anyhow!("docker daemon unreachable"));
    }
    Ok(())
  }

  async fn list_containers(
    &self,
  ) -> anyhow::Result<Vec<ContainerRecord>> {
    Ok(
      self
        .containers
        .lock()
        .expect("containers poisoned")
        .clone(),
    )
  }

  async fn inspect_container(
    &self,
    name: &str,
  ) -> anyhow::Result<ContainerDetails> {
    if let Some(details) = self
      .details
      .lock()
      .expect("details poisoned")
      .get(name)
    {
      return Ok(details.clone());
    }
    let containers =
      self.containers.lock().expect("containers poisoned");
    containers
      .iter()
      .find(|container| container.name == name)
      .map(|record| ContainerDetails {
        record: record.clone(),
        ..Default::default()
      })
      .ok_or_else(|| anyhow!("no such container: {name}"))
  }

  async fn is_local_image(
    &self,
    image: &str,
  ) -> anyhow::Result<bool> {
    Ok(self.local_images.contains(image))
  }

  async fn image_version_label(
    &self,
    image: &str,
  ) -> anyhow::Result<Option<String>> {
    Ok(self.version_labels.get(image).cloned())
  }

  async fn image_digest(
    &self,
    image: &str,
  ) -> anyhow::Result<Option<String>> {
    Ok(self.digests.get(image).cloned())
  }

  async fn pull_image(
    &self,
    image: &str,
    progress: mpsc::Sender<PullProgress>,
  ) -> anyhow::Result<()> {
    self.record(format!("pull:{image}"));
    if self
      .failing_pulls
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
        n.checked_sub(1)
      })
      .is_ok()
    {
      return Err(anyhow!("pull failed: {image}"));
    }
    let _ = progress
      .send(PullProgress {
        status: "Pull complete".to_string(),
        current: Some(1),
        total: Some(1),
      })
      .await;
    Ok(())
  }

  async fn stop_container(
    &self,
    name: &str,
    _timeout_secs: Option<u32>,
  ) -> anyhow::Result<()> {
    self.record(format!("stop:{name}"));
    Ok(())
  }

  async fn remove_container(
    &self,
    name: &str,
  ) -> anyhow::Result<()> {
    self.record(format!("remove:{name}"));
    Ok(())
  }

  async fn create_container(
    &self,
    _details: &ContainerDetails,
    name: &str,
    image: &str,
  ) -> anyhow::Result<()> {
    self.record(format!("create:{name}:{image}"));
    Ok(())
  }

  async fn start_container(
    &self,
    name: &str,
  ) -> anyhow::Result<()> {
    self.record(format!("start:{name}"));
    Ok(())
  }

  async fn restart_container(
    &self,
    name: &str,
  ) -> anyhow::Result<()> {
    self.record(format!("restart:{name}"));
    Ok(())
  }

  async fn compose_up(
    &self,
    compose_file: &Path,
    service: Option<&str>,
  ) -> anyhow::Result<Log> {
    self.record(format!(
      "compose_up:{}:{}",
      compose_file.display(),
      service.unwrap_or("")
    ));
    if self.fail_compose_up {
      return Ok(Log::error(
        "Compose Up",
        "service failed to start",
      ));
    }
    Ok(Log::simple("Compose Up", "Started"))
  }

  async fn compose_restart(
    &self,
    compose_file: &Path,
    services: &[String],
  ) -> anyhow::Result<Log> {
    self.record(format!(
      "compose_restart:{}:{}",
      compose_file.display(),
      services.join(",")
    ));
    Ok(Log::simple("Compose Restart", "Restarted"))
  }
}

#[derive(Default)]
pub struct StubRegistry {
  /// repo -> published tags
  pub tags: HashMap<String, Vec<String>>,
  /// (repo, tag) -> digest
  pub tag_digests: HashMap<(String, String), String>,
  /// repo -> tag -> digests, for reverse lookup
  pub digest_tags: HashMap<String, HashMap<String, Vec<String>>>,
  /// Force every call to fail with this message.
  pub error: Mutex<Option<String>>,
}

impl StubRegistry {
  pub fn with_tags(
    repo: &str,
    tags: &[&str],
  ) -> StubRegistry {
    StubRegistry {
      tags: [(
        repo.to_string(),
        tags.iter().map(|t| t.to_string()).collect(),
      )]
      .into(),
      ..Default::default()
    }
  }

  pub fn failing(message: &str) -> StubRegistry {
    StubRegistry {
      error: Mutex::new(Some(message.to_string())),
      ..Default::default()
    }
  }

  pub fn set_error(&self, message: Option<&str>) {
    *self.error.lock().expect("error flag poisoned") =
      message.map(str::to_string);
  }

  fn current_error(&self) -> Option<String> {
    self.error.lock().expect("error flag poisoned").clone()
  }

  pub fn set_tag_digest(
    &mut self,
    repo: &str,
    tag: &str,
    digest: &str,
  ) {
    self.tag_digests.insert(
      (repo.to_string(), tag.to_string()),
      digest.to_string(),
    );
    self
      .digest_tags
      .entry(repo.to_string())
      .or_default()
      .entry(tag.to_string())
      .or_default()
      .push(digest.to_string());
  }
}

impl Registry for StubRegistry {
  async fn list_tags(
    &self,
    image: &str,
  ) -> anyhow::Result<Vec<String>> {
    if let Some(error) = self.current_error() {
      return Err(anyhow!("{error}"));
    }
    self
      .tags
      .get(image)
      .cloned()
      .ok_or_else(|| anyhow!("404: repository {image} not found"))
  }

  async fn tag_digest(
    &self,
    image: &str,
    tag: &str,
  ) -> anyhow::Result<String> {
    if let Some(error) = self.current_error() {
      return Err(anyhow!("{error}"));
    }
    self
      .tag_digests
      .get(&(image.to_string(), tag.to_string()))
      .cloned()
      .ok_or_else(|| {
        anyhow!("no digest found for {image}:{tag}")
      })
  }

  async fn tags_with_digests(
    &self,
    image: &str,
  ) -> anyhow::Result<HashMap<String, Vec<String>>> {
    if let Some(error) = self.current_error() {
      return Err(anyhow!("{error}"));
    }
    Ok(
      self
        .digest_tags
        .get(image)
        .cloned()
        .unwrap_or_default(),
    )
  }

  async fn latest_tag(
    &self,
    image: &str,
  ) -> anyhow::Result<String> {
    self.tag_digest(image, "latest").await.map(|_| {
      "latest".to_string()
    })
  }
}
