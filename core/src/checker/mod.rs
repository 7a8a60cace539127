use std::{sync::Arc, time::Duration};

use docksmith_client::entities::{
  container::ContainerRecord,
  image::ImageRef,
  policy::ContainerPolicy,
  update::{ContainerUpdate, UpdateStatus},
  version::{
    ChangeType, Version, change_type, is_meta_tag,
  },
};
use tracing::debug;

use crate::{
  compose,
  config::core_config,
  hooks,
  registry::{Registry, is_metadata_error},
  runtime::ContainerRuntime,
  store::Store,
};

pub mod digest;
pub mod latest;

use digest::{
  LATEST_SENTINEL, normalize_digest,
  resolve_version_from_digest,
};
use latest::find_latest_version;

/// The per-container update decision engine. Stateless apart
/// from the shared result cache; every decision reads the
/// container's labels fresh.
pub struct Checker<R, G, S> {
  pub runtime: Arc<R>,
  pub registry: Arc<G>,
  pub store: Arc<S>,
  /// Result cache keyed `image:id_prefix`, consulted by the
  /// discovery fan-out.
  pub cache: cache::TtlCache<String, ContainerUpdate>,
}

pub fn cache_key(container: &ContainerRecord) -> String {
  let id_prefix =
    &container.id[..container.id.len().min(12)];
  format!("{}:{id_prefix}", container.image)
}

impl<R, G, S> Checker<R, G, S>
where
  R: ContainerRuntime,
  G: Registry,
  S: Store,
{
  pub fn new(
    runtime: Arc<R>,
    registry: Arc<G>,
    store: Arc<S>,
  ) -> Checker<R, G, S> {
    Checker {
      runtime,
      registry,
      store,
      cache: Default::default(),
    }
  }

  pub fn cache_ttl(&self) -> Duration {
    Duration::from_secs(core_config().cache_ttl)
  }

  /// Decide the update state of one container.
  pub async fn check_container(
    &self,
    container: &ContainerRecord,
  ) -> ContainerUpdate {
    let policy = ContainerPolicy::from_labels(&container.labels);
    let image = ImageRef::parse(&container.image);

    let mut update = ContainerUpdate {
      container_name: container.name.clone(),
      image: container.image.clone(),
      current_tag: image.tag.full.clone(),
      current_suffix: image.tag.suffix.clone(),
      using_latest_tag: image.tag.is_latest
        || image.tag.full.is_empty(),
      health_status: container.health,
      pre_update_check: policy.pre_update_check.clone(),
      service: container.compose_service().to_string(),
      ..Default::default()
    };

    if policy.ignore {
      update.status = UpdateStatus::Ignored;
      return update;
    }

    // Compose drift, env-var control and label sync.
    let compose_check =
      compose::check_compose(container).await;
    update.env_controlled = compose_check.env_controlled;
    update.env_var_name = compose_check.env_var_name.clone();
    update.labels_out_of_sync =
      compose_check.labels_out_of_sync;
    if compose_check.bare_digest {
      update.status = UpdateStatus::ComposeMismatch;
      update.error = Some(
        "running image reference is a bare digest, tag was lost"
          .to_string(),
      );
      return update;
    }
    if let Some(spec) = compose_check.mismatch {
      update.status = UpdateStatus::ComposeMismatch;
      update.compose_image = Some(spec);
      return update;
    }

    match self.runtime.is_local_image(&container.image).await {
      Ok(true) => {
        update.is_local = true;
        update.status = UpdateStatus::LocalImage;
        return update;
      }
      Ok(false) => {}
      Err(e) => {
        update.status = UpdateStatus::CheckFailed;
        update.error = Some(format!(
          "failed to inspect local image | {e:#}"
        ));
        return update;
      }
    }

    update.current_digest = self
      .runtime
      .image_digest(&container.image)
      .await
      .ok()
      .flatten()
      .unwrap_or_default();

    let repository = image.repository_full();
    let tags =
      match self.registry.list_tags(&repository).await {
        Ok(tags) => tags,
        Err(e) => {
          self.classify_registry_error(&mut update, &e);
          return update;
        }
      };
    update.available_tags = tags.clone();

    let current_version = self
      .resolve_current_version(container, &image, &tags)
      .await;
    if let Some(version) = &current_version {
      update.current_version = version.original.clone();
    }

    let tracks_meta = image.tag.full.is_empty()
      || is_meta_tag(&image.tag.full);
    if tracks_meta {
      self
        .check_meta_tracking(&mut update, &image, &policy)
        .await;
    } else {
      match &current_version {
        Some(current) => {
          match find_latest_version(
            &tags,
            &image.tag.suffix,
            current,
            &policy,
          ) {
            Some((latest_tag, latest_version)) => {
              let change =
                change_type(current, &latest_version);
              update.change_type = change;
              update.latest_version = latest_tag;
              update.status = match change {
                ChangeType::Patch
                | ChangeType::Minor
                | ChangeType::Major => {
                  UpdateStatus::UpdateAvailable
                }
                _ => UpdateStatus::UpToDate,
              };
            }
            None => {
              // No candidate survived the filters. The tag
              // may still have been re-pushed.
              self.sha_fallback(&mut update, &image).await;
            }
          }
        }
        None => {
          self.sha_fallback(&mut update, &image).await;
        }
      }
    }

    self.run_pre_update_hook(&mut update, &policy).await;
    update
  }

  fn classify_registry_error(
    &self,
    update: &mut ContainerUpdate,
    e: &anyhow::Error,
  ) {
    if is_metadata_error(e) {
      update.status = UpdateStatus::MetadataUnavailable;
      update.error = Some(format!(
        "registry has no metadata for {} | {e:#}",
        update.image
      ));
    } else {
      update.status = UpdateStatus::CheckFailed;
      update.error =
        Some(format!("registry check failed | {e:#}"));
    }
  }

  /// Choose the version the container is currently on. The OCI
  /// version label wins over the tag, except when the label
  /// carries a prerelease the tag does not (stale label), or
  /// when the label matches no published tag at all (likely
  /// base image metadata).
  async fn resolve_current_version(
    &self,
    container: &ContainerRecord,
    image: &ImageRef,
    tags: &[String],
  ) -> Option<Version> {
    let label_version = self
      .runtime
      .image_version_label(&container.image)
      .await
      .ok()
      .flatten()
      .and_then(|raw| Version::parse(&raw));
    let tag_version = image.tag.version.clone();

    let mut from_label = false;
    let mut chosen = match (label_version, tag_version) {
      (Some(label), Some(tag)) => {
        if !label.is_stable() && tag.is_stable() {
          Some(tag)
        } else {
          from_label = true;
          Some(label)
        }
      }
      (Some(label), None) => {
        from_label = true;
        Some(label)
      }
      (None, Some(tag)) => Some(tag),
      (None, None) => None,
    };

    if from_label
      && image.tag.is_versioned
      && let Some(version) = &chosen
      && !tags
        .iter()
        .any(|tag| tag.contains(version.original.as_str()))
    {
      chosen = image.tag.version.clone();
    }

    if chosen.is_none() {
      if let Ok(Some(digest)) =
        self.runtime.image_digest(&container.image).await
        && let Ok(Some(resolved)) =
          resolve_version_from_digest(
            self.registry.as_ref(),
            self.store.as_ref(),
            &digest,
            image,
            &image.tag.suffix,
          )
          .await
        && resolved != LATEST_SENTINEL
      {
        chosen = Version::parse(&resolved);
      }
    }
    chosen
  }

  /// Digest-first path for containers tracking a meta tag
  /// (`latest`, `stable`, ...). Compares the local digest to
  /// the tag's remote digest and tries to name the semver
  /// behind either side.
  async fn check_meta_tracking(
    &self,
    update: &mut ContainerUpdate,
    image: &ImageRef,
    policy: &ContainerPolicy,
  ) {
    let tracked_tag = if image.tag.full.is_empty() {
      "latest"
    } else {
      image.tag.full.as_str()
    };
    let repository = image.repository_full();
    let remote_digest = match self
      .registry
      .tag_digest(&repository, tracked_tag)
      .await
    {
      Ok(digest) => digest,
      Err(e) => {
        self.classify_registry_error(update, &e);
        return;
      }
    };
    update.latest_digest = remote_digest.clone();

    let differs = !update.current_digest.is_empty()
      && normalize_digest(&update.current_digest)
        != normalize_digest(&remote_digest);

    if differs {
      update.status = UpdateStatus::UpdateAvailable;
      update.latest_version = tracked_tag.to_string();
      update.change_type = ChangeType::Unknown;
      if let Ok(Some(resolved)) =
        resolve_version_from_digest(
          self.registry.as_ref(),
          self.store.as_ref(),
          &remote_digest,
          image,
          &image.tag.suffix,
        )
        .await
      {
        update.latest_resolved_version = resolved;
      }
      return;
    }

    update.status = UpdateStatus::UpToDate;
    let Ok(Some(resolved)) = resolve_version_from_digest(
      self.registry.as_ref(),
      self.store.as_ref(),
      &update.current_digest,
      image,
      &image.tag.suffix,
    )
    .await
    else {
      return;
    };
    update.latest_resolved_version = resolved.clone();

    // Tracking exactly `:latest`, current with the meta tag,
    // and a concrete semver names the same bytes: offer the
    // pin. The `latest` sentinel never qualifies.
    let exactly_latest = image.tag.full.is_empty()
      || image.tag.full == "latest";
    if exactly_latest
      && resolved != LATEST_SENTINEL
      && !policy.allow_latest
    {
      update.status = UpdateStatus::UpToDatePinnable;
      update.recommended_tag = Some(resolved);
    }
  }

  /// Last resort when the semver path produced nothing: the
  /// current tag may have been re-pushed with new content.
  async fn sha_fallback(
    &self,
    update: &mut ContainerUpdate,
    image: &ImageRef,
  ) {
    if update.current_digest.is_empty()
      || update.current_tag.is_empty()
    {
      if update.status == UpdateStatus::Unknown
        && update.error.is_none()
      {
        update.error = Some(
          "could not determine a comparable version"
            .to_string(),
        );
      }
      return;
    }
    let repository = image.repository_full();
    let remote_digest = match self
      .registry
      .tag_digest(&repository, &update.current_tag)
      .await
    {
      Ok(digest) => digest,
      Err(e) => {
        self.classify_registry_error(update, &e);
        return;
      }
    };
    update.latest_digest = remote_digest.clone();
    if normalize_digest(&update.current_digest)
      != normalize_digest(&remote_digest)
    {
      update.status = UpdateStatus::UpdateAvailable;
      update.latest_version = update.current_tag.clone();
      update.change_type = ChangeType::Unknown;
      if let Ok(Some(resolved)) =
        resolve_version_from_digest(
          self.registry.as_ref(),
          self.store.as_ref(),
          &remote_digest,
          image,
          &image.tag.suffix,
        )
        .await
      {
        update.latest_resolved_version = resolved;
      }
    } else {
      update.status = UpdateStatus::UpToDate;
    }
  }

  /// Run the container's pre-update check when an update (or a
  /// pin) is on offer. Failure blocks an available update.
  async fn run_pre_update_hook(
    &self,
    update: &mut ContainerUpdate,
    policy: &ContainerPolicy,
  ) {
    let Some(script) = &policy.pre_update_check else {
      return;
    };
    if !matches!(
      update.status,
      UpdateStatus::UpdateAvailable
        | UpdateStatus::UpToDatePinnable
    ) {
      return;
    }
    match hooks::run_pre_update_check(
      script,
      &update.container_name,
    )
    .await
    {
      Ok(result) if result.pass => {
        update.pre_update_check_pass = true;
      }
      Ok(result) => {
        debug!(
          "pre-update check failed for {}",
          update.container_name
        );
        update.pre_update_check_fail = Some(result.output);
        if update.status == UpdateStatus::UpdateAvailable {
          update.status =
            UpdateStatus::UpdateAvailableBlocked;
        }
      }
      Err(e) => {
        update.pre_update_check_fail =
          Some(format!("{e:#}"));
        if update.status == UpdateStatus::UpdateAvailable {
          update.status =
            UpdateStatus::UpdateAvailableBlocked;
        }
      }
    }
  }
}
