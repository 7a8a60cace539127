use std::cmp::Ordering;

use docksmith_client::entities::{
  policy::ContainerPolicy,
  version::{Version, is_meta_tag, parse_tag},
};

/// Constrained selection of the newest tag a container may move
/// to. Filters discard, in order: meta tags, non-versions, kind
/// mismatches, variant mismatches, tag-regex failures (invalid
/// patterns fail open), prereleases (unless allowed or already
/// on one), pin violations and min/max bounds. Survivors sort
/// descending and the winner's original tag string is returned.
pub fn find_latest_version(
  tags: &[String],
  required_suffix: &str,
  current: &Version,
  policy: &ContainerPolicy,
) -> Option<(String, Version)> {
  let tag_regex = policy
    .tag_regex
    .as_deref()
    .and_then(|pattern| regex::Regex::new(pattern).ok());
  let allow_prerelease =
    policy.allow_prerelease || !current.is_stable();

  let mut candidates: Vec<(String, Version)> = tags
    .iter()
    .filter_map(|tag| {
      if is_meta_tag(tag) {
        return None;
      }
      let (version, suffix) = parse_tag(tag);
      let version = version?;
      if version.kind != current.kind {
        return None;
      }
      if suffix != required_suffix {
        return None;
      }
      if let Some(re) = &tag_regex
        && !re.is_match(tag)
      {
        return None;
      }
      if !version.is_stable() && !allow_prerelease {
        return None;
      }
      if policy.pin_major && version.major != current.major {
        return None;
      }
      if policy.pin_minor
        && (version.major != current.major
          || version.minor != current.minor)
      {
        return None;
      }
      if policy.pin_patch
        && (version.major != current.major
          || version.minor != current.minor
          || version.patch != current.patch)
      {
        return None;
      }
      if let Some(min) = &policy.version_min
        && version.compare(min) != Some(Ordering::Greater)
        && version.compare(min) != Some(Ordering::Equal)
      {
        return None;
      }
      if let Some(max) = &policy.version_max
        && version.compare(max) == Some(Ordering::Greater)
      {
        return None;
      }
      Some((tag.clone(), version))
    })
    .collect();

  candidates.sort_by(|a, b| {
    b.1.compare(&a.1).unwrap_or(Ordering::Equal)
  });
  candidates.into_iter().next()
}
