use std::{future::Future, path::Path};

use docksmith_client::entities::{
  container::{ContainerDetails, ContainerRecord},
  update::Log,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// One step of a streamed image pull. The runtime pushes these
/// into the channel the caller supplies and closes it on EOF.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullProgress {
  pub status: String,
  pub current: Option<u64>,
  pub total: Option<u64>,
}

/// Contract the engine demands from the container runtime SDK.
/// Implemented for production by [crate::docker::DockerClient],
/// and by in-memory fakes in tests.
///
/// Methods are declared as `impl Future + Send` so orchestrator
/// work can be spawned onto the runtime from generic code.
pub trait ContainerRuntime: Send + Sync {
  fn ping(
    &self,
  ) -> impl Future<Output = anyhow::Result<()>> + Send;

  fn list_containers(
    &self,
  ) -> impl Future<Output = anyhow::Result<Vec<ContainerRecord>>>
  + Send;

  fn inspect_container(
    &self,
    name: &str,
  ) -> impl Future<Output = anyhow::Result<ContainerDetails>>
  + Send;

  /// Whether the image exists only locally, ie was never
  /// pulled from (or pushed to) a remote.
  fn is_local_image(
    &self,
    image: &str,
  ) -> impl Future<Output = anyhow::Result<bool>> + Send;

  /// The `org.opencontainers.image.version` label baked into
  /// the image, when present.
  fn image_version_label(
    &self,
    image: &str,
  ) -> impl Future<Output = anyhow::Result<Option<String>>>
  + Send;

  /// Repo digest of the local image, when known.
  fn image_digest(
    &self,
    image: &str,
  ) -> impl Future<Output = anyhow::Result<Option<String>>>
  + Send;

  fn pull_image(
    &self,
    image: &str,
    progress: mpsc::Sender<PullProgress>,
  ) -> impl Future<Output = anyhow::Result<()>> + Send;

  fn stop_container(
    &self,
    name: &str,
    timeout_secs: Option<u32>,
  ) -> impl Future<Output = anyhow::Result<()>> + Send;

  fn remove_container(
    &self,
    name: &str,
  ) -> impl Future<Output = anyhow::Result<()>> + Send;

  /// Create a container preserving `details` config and
  /// networks, with a new name / image.
  fn create_container(
    &self,
    details: &ContainerDetails,
    name: &str,
    image: &str,
  ) -> impl Future<Output = anyhow::Result<()>> + Send;

  fn start_container(
    &self,
    name: &str,
  ) -> impl Future<Output = anyhow::Result<()>> + Send;

  fn restart_container(
    &self,
    name: &str,
  ) -> impl Future<Output = anyhow::Result<()>> + Send;

  /// `docker compose -f <file> up -d [service]`. The compose
  /// file on disk already reflects the desired state.
  fn compose_up(
    &self,
    compose_file: &Path,
    service: Option<&str>,
  ) -> impl Future<Output = anyhow::Result<Log>> + Send;

  /// `docker compose -f <file> restart <services>`.
  fn compose_restart(
    &self,
    compose_file: &Path,
    services: &[String],
  ) -> impl Future<Output = anyhow::Result<Log>> + Send;
}
