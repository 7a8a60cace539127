use std::cmp::Ordering;

use docksmith_client::entities::{
  image::ImageRef,
  version::{Version, parse_tag},
};
use tracing::debug;

use crate::{registry::Registry, store::Store};

/// Sentinel returned when only the `latest` meta tag matched
/// the digest. Callers must not treat it as a real semver.
pub const LATEST_SENTINEL: &str = "latest";

pub fn normalize_digest(digest: &str) -> &str {
  digest.strip_prefix("sha256:").unwrap_or(digest)
}

/// Reverse-resolve a digest to the most specific version tag
/// publishing it. Results are memoized in the store's version
/// cache keyed by (digest, image, arch).
pub async fn resolve_version_from_digest<
  G: Registry,
  S: Store,
>(
  registry: &G,
  store: &S,
  digest: &str,
  image: &ImageRef,
  required_suffix: &str,
) -> anyhow::Result<Option<String>> {
  let digest = normalize_digest(digest);
  if digest.is_empty() {
    return Ok(None);
  }
  let repository = image.repository_full();
  let arch = std::env::consts::ARCH;

  if let Ok(Some(hit)) =
    store.get_version_cache(digest, &repository, arch).await
  {
    return Ok(Some(hit));
  }

  let tags_with_digests =
    registry.tags_with_digests(&repository).await?;

  // Most specific tag wins: highest dot count, then higher
  // version.
  let mut best: Option<(String, Version, usize)> = None;
  let mut latest_matched = false;
  for (tag, digests) in &tags_with_digests {
    let matched = digests
      .iter()
      .any(|candidate| normalize_digest(candidate) == digest);
    if !matched {
      continue;
    }
    if tag == LATEST_SENTINEL {
      latest_matched = true;
      continue;
    }
    let (version, suffix) = parse_tag(tag);
    let Some(version) = version else {
      continue;
    };
    if suffix != required_suffix {
      continue;
    }
    let dots = tag.matches('.').count();
    let better = match &best {
      None => true,
      Some((_, best_version, best_dots)) => {
        dots > *best_dots
          || (dots == *best_dots
            && version.compare(best_version)
              == Some(Ordering::Greater))
      }
    };
    if better {
      best = Some((tag.clone(), version, dots));
    }
  }

  if let Some((tag, _, _)) = best {
    if let Err(e) = store
      .save_version_cache(digest, &repository, arch, &tag)
      .await
    {
      debug!(
        "failed to persist version cache for {repository} | {e:#}"
      );
    }
    return Ok(Some(tag));
  }
  if latest_matched {
    // Not cached: a later push may move `latest` to a
    // resolvable semver.
    return Ok(Some(LATEST_SENTINEL.to_string()));
  }
  Ok(None)
}
