use std::{collections::HashMap, path::Path};

use anyhow::{Context, anyhow};
use bollard::{
  Docker,
  secret::{
    ContainerCreateBody, HealthConfig, HostConfig,
    PortBinding, RestartPolicy, RestartPolicyNameEnum,
  },
  query_parameters::{
    CreateContainerOptions, CreateImageOptions,
    InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, RestartContainerOptions,
    StartContainerOptions, StopContainerOptions,
  },
};
use command::run_docksmith_command;
use docksmith_client::entities::{
  container::{
    ContainerDetails, ContainerRecord, ContainerState,
    HealthStatus, HealthcheckConfig, labels,
  },
  update::Log,
};
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::{
  config::core_config,
  runtime::{ContainerRuntime, PullProgress},
};

pub fn docker_compose() -> &'static str {
  if core_config().legacy_compose_cli {
    "docker-compose"
  } else {
    "docker compose"
  }
}

/// Bollard-backed [ContainerRuntime] implementation talking to
/// the local docker daemon.
pub struct DockerClient {
  docker: Docker,
}

impl DockerClient {
  pub fn new() -> anyhow::Result<DockerClient> {
    Ok(DockerClient {
      docker: Docker::connect_with_defaults()
        .context("failed to connect to docker daemon")?,
    })
  }
}

impl ContainerRuntime for DockerClient {
  async fn ping(&self) -> anyhow::Result<()> {
    self
      .docker
      .ping()
      .await
      .context("docker daemon did not answer ping")?;
    Ok(())
  }

  async fn list_containers(
    &self,
  ) -> anyhow::Result<Vec<ContainerRecord>> {
    let containers = self
      .docker
      .list_containers(Some(ListContainersOptions {
        all: true,
        ..Default::default()
      }))
      .await?;
    let records = containers
      .into_iter()
      .flat_map(|container| {
        let name = container
          .names
          .context("no names on container")?
          .pop()
          .context("no names on container (empty vec)")?
          .replace('/', "");
        anyhow::Ok(ContainerRecord {
          name,
          id: container.id.unwrap_or_default(),
          image: container.image.unwrap_or_default(),
          labels: container.labels.unwrap_or_default(),
          state: container
            .state
            .map(convert_summary_state)
            .unwrap_or_default(),
          health: container
            .status
            .as_deref()
            .map(health_from_status)
            .unwrap_or_default(),
          network_mode: container
            .host_config
            .and_then(|config| config.network_mode),
        })
      })
      .collect();
    Ok(records)
  }

  async fn inspect_container(
    &self,
    name: &str,
  ) -> anyhow::Result<ContainerDetails> {
    let container = self
      .docker
      .inspect_container(
        name,
        Option::<InspectContainerOptions>::None,
      )
      .await?;
    let config = container.config.unwrap_or_default();
    let host_config =
      container.host_config.unwrap_or_default();
    let state = container.state.unwrap_or_default();
    Ok(ContainerDetails {
      record: ContainerRecord {
        id: container.id.unwrap_or_default(),
        name: container
          .name
          .unwrap_or_default()
          .replace('/', ""),
        image: config.image.clone().unwrap_or_default(),
        labels: config.labels.clone().unwrap_or_default(),
        state: state
          .status
          .map(convert_state_status)
          .unwrap_or_default(),
        health: state
          .health
          .and_then(|health| health.status)
          .map(convert_health_status)
          .unwrap_or_default(),
        network_mode: host_config.network_mode.clone(),
      },
      env: config.env.unwrap_or_default(),
      cmd: config.cmd.unwrap_or_default(),
      entrypoint: config.entrypoint.unwrap_or_default(),
      binds: host_config.binds.unwrap_or_default(),
      ports: host_config
        .port_bindings
        .unwrap_or_default()
        .into_iter()
        .flat_map(|(container_port, bindings)| {
          bindings
            .unwrap_or_default()
            .into_iter()
            .map(move |binding| {
              format!(
                "{}:{}:{container_port}",
                binding.host_ip.unwrap_or_default(),
                binding.host_port.unwrap_or_default(),
              )
            })
        })
        .collect(),
      networks: container
        .network_settings
        .and_then(|settings| settings.networks)
        .map(|networks| {
          let mut keys =
            networks.into_keys().collect::<Vec<_>>();
          keys.sort();
          keys
        })
        .unwrap_or_default(),
      restart_policy: host_config
        .restart_policy
        .and_then(|policy| policy.name)
        .map(|name| format!("{name:?}").to_lowercase()),
      healthcheck: config.healthcheck.map(|health| {
        HealthcheckConfig {
          test: health.test.unwrap_or_default(),
          interval: health.interval,
          timeout: health.timeout,
          retries: health.retries,
          start_period: health.start_period,
        }
      }),
    })
  }

  /// An image never pulled from (or pushed to) a registry has
  /// no repo digests.
  async fn is_local_image(
    &self,
    image: &str,
  ) -> anyhow::Result<bool> {
    match self.docker.inspect_image(image).await {
      Ok(inspect) => Ok(
        inspect
          .repo_digests
          .map(|digests| digests.is_empty())
          .unwrap_or(true),
      ),
      Err(e) => Err(anyhow!(
        "failed to inspect image {image} | {e:?}"
      )),
    }
  }

  async fn image_version_label(
    &self,
    image: &str,
  ) -> anyhow::Result<Option<String>> {
    let inspect = self.docker.inspect_image(image).await?;
    Ok(
      inspect
        .config
        .and_then(|config| config.labels)
        .and_then(|image_labels| {
          image_labels
            .get(labels::OCI_IMAGE_VERSION)
            .cloned()
        }),
    )
  }

  async fn image_digest(
    &self,
    image: &str,
  ) -> anyhow::Result<Option<String>> {
    let inspect = self.docker.inspect_image(image).await?;
    Ok(
      inspect
        .repo_digests
        .unwrap_or_default()
        .into_iter()
        .next()
        .and_then(|repo_digest| {
          repo_digest
            .split_once('@')
            .map(|(_, digest)| digest.to_string())
        }),
    )
  }

  async fn pull_image(
    &self,
    image: &str,
    progress: mpsc::Sender<PullProgress>,
  ) -> anyhow::Result<()> {
    let mut stream = self.docker.create_image(
      Some(CreateImageOptions {
        from_image: Some(image.to_string()),
        ..Default::default()
      }),
      None,
      None,
    );
    while let Some(info) = stream.next().await {
      let info = info.with_context(|| {
        format!("failed to pull {image}")
      })?;
      let detail = info.progress_detail.unwrap_or_default();
      // Slow consumers only lose progress updates.
      let _ = progress.try_send(PullProgress {
        status: info.status.unwrap_or_default(),
        current: detail.current.map(|c| c as u64),
        total: detail.total.map(|t| t as u64),
      });
    }
    Ok(())
  }

  async fn stop_container(
    &self,
    name: &str,
    timeout_secs: Option<u32>,
  ) -> anyhow::Result<()> {
    self
      .docker
      .stop_container(
        name,
        Some(StopContainerOptions {
          t: timeout_secs.map(|t| t as i32),
          ..Default::default()
        }),
      )
      .await
      .with_context(|| format!("failed to stop {name}"))?;
    Ok(())
  }

  async fn remove_container(
    &self,
    name: &str,
  ) -> anyhow::Result<()> {
    self
      .docker
      .remove_container(
        name,
        Some(RemoveContainerOptions {
          force: true,
          ..Default::default()
        }),
      )
      .await
      .with_context(|| format!("failed to remove {name}"))?;
    Ok(())
  }

  async fn create_container(
    &self,
    details: &ContainerDetails,
    name: &str,
    image: &str,
  ) -> anyhow::Result<()> {
    let port_bindings = parse_port_bindings(&details.ports);
    let body = ContainerCreateBody {
      image: Some(image.to_string()),
      env: Some(details.env.clone()),
      cmd: Some(details.cmd.clone()),
      entrypoint: Some(details.entrypoint.clone()),
      labels: Some(details.record.labels.clone()),
      healthcheck: details.healthcheck.as_ref().map(
        |health| HealthConfig {
          test: Some(health.test.clone()),
          interval: health.interval,
          timeout: health.timeout,
          retries: health.retries,
          start_period: health.start_period,
          ..Default::default()
        },
      ),
      host_config: Some(HostConfig {
        binds: Some(details.binds.clone()),
        network_mode: details.record.network_mode.clone(),
        port_bindings: Some(port_bindings),
        restart_policy: details.restart_policy.as_deref().map(
          convert_restart_policy,
        ),
        ..Default::default()
      }),
      ..Default::default()
    };
    self
      .docker
      .create_container(
        Some(CreateContainerOptions {
          name: Some(name.to_string()),
          ..Default::default()
        }),
        body,
      )
      .await
      .with_context(|| {
        format!("failed to create {name} from {image}")
      })?;
    Ok(())
  }

  async fn start_container(
    &self,
    name: &str,
  ) -> anyhow::Result<()> {
    self
      .docker
      .start_container(
        name,
        Option::<StartContainerOptions>::None,
      )
      .await
      .with_context(|| format!("failed to start {name}"))?;
    Ok(())
  }

  async fn restart_container(
    &self,
    name: &str,
  ) -> anyhow::Result<()> {
    self
      .docker
      .restart_container(
        name,
        Option::<RestartContainerOptions>::None,
      )
      .await
      .with_context(|| {
        format!("failed to restart {name}")
      })?;
    Ok(())
  }

  async fn compose_up(
    &self,
    compose_file: &Path,
    service: Option<&str>,
  ) -> anyhow::Result<Log> {
    let docker_compose = docker_compose();
    let service = service
      .map(|service| format!(" {service}"))
      .unwrap_or_default();
    Ok(
      run_docksmith_command(
        "Compose Up",
        None,
        format!(
          "{docker_compose} -f {} up -d{service}",
          compose_file.display()
        ),
      )
      .await,
    )
  }

  async fn compose_restart(
    &self,
    compose_file: &Path,
    services: &[String],
  ) -> anyhow::Result<Log> {
    let docker_compose = docker_compose();
    Ok(
      run_docksmith_command(
        "Compose Restart",
        None,
        format!(
          "{docker_compose} -f {} restart {}",
          compose_file.display(),
          services.join(" ")
        ),
      )
      .await,
    )
  }
}

/// `host_ip:host_port:container_port[/proto]` strings back
/// into the daemon's binding map.
fn parse_port_bindings(
  ports: &[String],
) -> HashMap<String, Option<Vec<PortBinding>>> {
  let mut bindings: HashMap<String, Option<Vec<PortBinding>>> =
    HashMap::new();
  for port in ports {
    let mut parts = port.splitn(3, ':');
    let (Some(host_ip), Some(host_port), Some(container)) =
      (parts.next(), parts.next(), parts.next())
    else {
      continue;
    };
    bindings
      .entry(container.to_string())
      .or_insert_with(|| Some(Vec::new()))
      .get_or_insert_with(Vec::new)
      .push(PortBinding {
        host_ip: (!host_ip.is_empty())
          .then(|| host_ip.to_string()),
        host_port: Some(host_port.to_string()),
      });
  }
  bindings
}

fn convert_restart_policy(name: &str) -> RestartPolicy {
  let name = match name {
    "always" => RestartPolicyNameEnum::ALWAYS,
    "unless_stopped" | "unless-stopped" => {
      RestartPolicyNameEnum::UNLESS_STOPPED
    }
    "on_failure" | "on-failure" => {
      RestartPolicyNameEnum::ON_FAILURE
    }
    "no" => RestartPolicyNameEnum::NO,
    _ => RestartPolicyNameEnum::EMPTY,
  };
  RestartPolicy {
    name: Some(name),
    maximum_retry_count: None,
  }
}

fn convert_summary_state(
  state: bollard::secret::ContainerSummaryStateEnum,
) -> ContainerState {
  use bollard::secret::ContainerSummaryStateEnum as Summary;
  match state {
    Summary::EMPTY => ContainerState::Unknown,
    Summary::CREATED => ContainerState::Created,
    Summary::RUNNING => ContainerState::Running,
    Summary::PAUSED => ContainerState::Paused,
    Summary::RESTARTING => ContainerState::Restarting,
    Summary::EXITED => ContainerState::Exited,
    Summary::REMOVING => ContainerState::Removing,
    Summary::DEAD => ContainerState::Dead,
  }
}

fn convert_state_status(
  state: bollard::secret::ContainerStateStatusEnum,
) -> ContainerState {
  use bollard::secret::ContainerStateStatusEnum as Status;
  match state {
    Status::EMPTY => ContainerState::Unknown,
    Status::CREATED => ContainerState::Created,
    Status::RUNNING => ContainerState::Running,
    Status::PAUSED => ContainerState::Paused,
    Status::RESTARTING => ContainerState::Restarting,
    Status::EXITED => ContainerState::Exited,
    Status::REMOVING => ContainerState::Removing,
    Status::DEAD => ContainerState::Dead,
  }
}

fn convert_health_status(
  status: bollard::secret::HealthStatusEnum,
) -> HealthStatus {
  use bollard::secret::HealthStatusEnum as Health;
  match status {
    Health::EMPTY | Health::NONE => HealthStatus::None,
    Health::STARTING => HealthStatus::Starting,
    Health::HEALTHY => HealthStatus::Healthy,
    Health::UNHEALTHY => HealthStatus::Unhealthy,
  }
}

/// The list endpoint only exposes health through the status
/// string, eg `Up 3 hours (healthy)`.
fn health_from_status(status: &str) -> HealthStatus {
  if status.contains("(healthy)") {
    HealthStatus::Healthy
  } else if status.contains("(unhealthy)") {
    HealthStatus::Unhealthy
  } else if status.contains("health: starting") {
    HealthStatus::Starting
  } else {
    HealthStatus::None
  }
}
