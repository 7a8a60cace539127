use std::time::Duration;

use anyhow::{Context, anyhow};
use docksmith_client::entities::container::{
  ContainerState, HealthStatus,
};
use tokio::time::Instant;

use crate::{config::core_config, runtime::ContainerRuntime};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Wait for a recreated container to prove itself. Containers
/// with a healthcheck are polled until `healthy` (failing hard
/// on `unhealthy` or timeout); containers without one get a
/// fixed grace period and a `running` check.
pub async fn verify_container_health<R: ContainerRuntime>(
  runtime: &R,
  container_name: &str,
) -> anyhow::Result<()> {
  let config = core_config();
  let details = runtime
    .inspect_container(container_name)
    .await
    .context("failed to inspect container for health check")?;

  if details.has_healthcheck() {
    let deadline = Instant::now()
      + Duration::from_secs(config.health_check_timeout);
    loop {
      let details = runtime
        .inspect_container(container_name)
        .await
        .context("failed to poll container health")?;
      match details.record.health {
        HealthStatus::Healthy => return Ok(()),
        HealthStatus::Unhealthy => {
          return Err(anyhow!(
            "container {container_name} reported unhealthy"
          ));
        }
        HealthStatus::Starting | HealthStatus::None => {}
      }
      if Instant::now() >= deadline {
        return Err(anyhow!(
          "container {container_name} did not become healthy within {}s",
          config.health_check_timeout
        ));
      }
      tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
    }
  }

  // No healthcheck declared: give it a moment, then require
  // the container to still be running.
  tokio::time::sleep(Duration::from_secs(
    config.health_check_fallback_wait,
  ))
  .await;
  let details = runtime
    .inspect_container(container_name)
    .await
    .context("failed to verify container state")?;
  if details.record.state != ContainerState::Running {
    return Err(anyhow!(
      "container {container_name} is {} after recreate",
      details.record.state
    ));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use docksmith_client::entities::container::{
    ContainerDetails, ContainerRecord, HealthcheckConfig,
  };

  use super::*;
  use crate::testing::StubRuntime;

  fn with_health(
    name: &str,
    health: HealthStatus,
  ) -> ContainerDetails {
    ContainerDetails {
      record: ContainerRecord {
        name: name.to_string(),
        health,
        state: ContainerState::Running,
        ..Default::default()
      },
      healthcheck: Some(HealthcheckConfig {
        test: vec!["CMD".to_string(), "true".to_string()],
        ..Default::default()
      }),
      ..Default::default()
    }
  }

  #[tokio::test(start_paused = true)]
  async fn healthy_container_passes() {
    let runtime = StubRuntime::default();
    runtime.set_details(
      "web",
      with_health("web", HealthStatus::Healthy),
    );
    verify_container_health(&runtime, "web").await.unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn unhealthy_container_fails_fast() {
    let runtime = StubRuntime::default();
    runtime.set_details(
      "web",
      with_health("web", HealthStatus::Unhealthy),
    );
    let error = verify_container_health(&runtime, "web")
      .await
      .unwrap_err();
    assert!(error.to_string().contains("unhealthy"));
  }

  #[tokio::test(start_paused = true)]
  async fn starting_container_times_out() {
    let runtime = StubRuntime::default();
    runtime.set_details(
      "web",
      with_health("web", HealthStatus::Starting),
    );
    let error = verify_container_health(&runtime, "web")
      .await
      .unwrap_err();
    assert!(
      error.to_string().contains("did not become healthy")
    );
  }

  #[tokio::test(start_paused = true)]
  async fn no_healthcheck_requires_running() {
    let runtime = StubRuntime::default();
    runtime.set_details(
      "web",
      ContainerDetails {
        record: ContainerRecord {
          name: "web".to_string(),
          state: ContainerState::Running,
          ..Default::default()
        },
        ..Default::default()
      },
    );
    verify_container_health(&runtime, "web").await.unwrap();

    runtime.set_details(
      "down",
      ContainerDetails {
        record: ContainerRecord {
          name: "down".to_string(),
          state: ContainerState::Exited,
          ..Default::default()
        },
        ..Default::default()
      },
    );
    assert!(
      verify_container_health(&runtime, "down")
        .await
        .is_err()
    );
  }
}
