use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use strum::Display;
use typeshare::typeshare;

/// Tags conventionally used as moving pointers rather than
/// pinned versions. `<meta>-<suffix>` forms (eg `latest-alpine`)
/// are also treated as meta tags.
pub const META_TAGS: &[&str] = &[
  "latest", "stable", "main", "master", "develop", "dev", "edge",
  "nightly", "beta", "alpha", "rc",
];

pub fn is_meta_tag(tag: &str) -> bool {
  let base =
    tag.split_once('-').map(|(base, _)| base).unwrap_or(tag);
  META_TAGS.contains(&base)
}

/// What family of version string a tag parsed into.
/// Versions are only comparable within a single kind,
/// so `3.23.3` never compares to `20260127`.
#[typeshare]
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "lowercase")]
pub enum VersionKind {
  #[default]
  Semver,
  /// `YYYYMMDD`
  Date,
  /// `YYYY.M[.D]`
  Calver,
}

#[typeshare]
#[derive(
  Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct Version {
  pub major: u64,
  #[serde(default)]
  pub minor: u64,
  #[serde(default)]
  pub patch: u64,
  /// Empty when the version is stable.
  #[serde(default)]
  pub prerelease: String,
  /// Fourth numeric component or `+N` build metadata.
  #[serde(default)]
  pub build: u64,
  /// The tag string this version was parsed from.
  pub original: String,
  #[serde(default)]
  pub kind: VersionKind,
}

impl std::fmt::Display for Version {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.original)
  }
}

impl Version {
  /// Parse a tag string of the shape
  /// `[v]?MAJOR[.MINOR[.PATCH]][-PRERELEASE][+BUILD][-SUFFIX]`
  /// or a calendar variant (`YYYY.M.D` / `YYYYMMDD`).
  /// Returns None for anything else, including meta tags.
  pub fn parse(tag: &str) -> Option<Version> {
    parse_tag(tag).0
  }

  pub fn is_stable(&self) -> bool {
    self.prerelease.is_empty()
  }

  /// Compare two versions, or None when their kinds differ.
  pub fn compare(&self, other: &Version) -> Option<Ordering> {
    if self.kind != other.kind {
      return None;
    }
    let ord = self
      .major
      .cmp(&other.major)
      .then(self.minor.cmp(&other.minor))
      .then(self.patch.cmp(&other.patch))
      .then(cmp_prerelease(&self.prerelease, &other.prerelease))
      .then(self.build.cmp(&other.build));
    Some(ord)
  }
}

/// Absence of a prerelease beats presence, otherwise lexicographic.
fn cmp_prerelease(a: &str, b: &str) -> Ordering {
  match (a.is_empty(), b.is_empty()) {
    (true, true) => Ordering::Equal,
    (true, false) => Ordering::Greater,
    (false, true) => Ordering::Less,
    (false, false) => a.cmp(b),
  }
}

#[typeshare]
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
  #[default]
  None,
  Patch,
  Minor,
  Major,
  Downgrade,
  Unknown,
}

/// Classify the change from `current` to `latest` as the
/// smallest-magnitude non-identity component change.
pub fn change_type(
  current: &Version,
  latest: &Version,
) -> ChangeType {
  match current.compare(latest) {
    None => ChangeType::Unknown,
    Some(Ordering::Equal) => ChangeType::None,
    Some(Ordering::Greater) => ChangeType::Downgrade,
    Some(Ordering::Less) => {
      if latest.major != current.major {
        ChangeType::Major
      } else if latest.minor != current.minor {
        ChangeType::Minor
      } else {
        // Covers patch bumps as well as build / prerelease movement.
        ChangeType::Patch
      }
    }
  }
}

/// Parse a tag into its version (if any) and variant suffix.
/// The suffix is the trailing non-numeric variant (`alpine`,
/// `bookworm`, `tensorrt`) and is retained even for meta tags.
pub fn parse_tag(tag: &str) -> (Option<Version>, String) {
  let tag = tag.trim();
  if tag.is_empty() {
    return (None, String::new());
  }
  if is_meta_tag(tag) {
    let suffix = tag
      .split_once('-')
      .map(|(_, suffix)| suffix.to_string())
      .unwrap_or_default();
    return (None, suffix);
  }
  match parse_versioned(tag) {
    Some((version, suffix)) => (Some(version), suffix),
    None => (None, String::new()),
  }
}

fn parse_versioned(tag: &str) -> Option<(Version, String)> {
  let stripped = match tag.strip_prefix('v') {
    Some(rest)
      if rest.starts_with(|c: char| c.is_ascii_digit()) =>
    {
      rest
    }
    _ => tag,
  };

  // Pure date form: YYYYMMDD
  if stripped.len() == 8
    && stripped.bytes().all(|b| b.is_ascii_digit())
    && (stripped.starts_with("19") || stripped.starts_with("20"))
  {
    let major = stripped.parse().ok()?;
    return Some((
      Version {
        major,
        original: tag.to_string(),
        kind: VersionKind::Date,
        ..Default::default()
      },
      String::new(),
    ));
  }

  let core_len = numeric_core_len(stripped);
  if core_len == 0 {
    return None;
  }
  let core = &stripped[..core_len];
  let rest = &stripped[core_len..];

  let mut parts = core.split('.').filter(|part| !part.is_empty());
  let major: u64 = parts.next()?.parse().ok()?;
  let minor: u64 =
    parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
  let patch: u64 =
    parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
  // Four-component tags (eg plex `1.32.7.7621`) carry the
  // extra component as the build number.
  let mut build: u64 =
    parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);

  // Split off `+BUILD` before walking the remaining `-` segments.
  let mut rest = rest.to_string();
  if let Some(pos) = rest.find('+') {
    let digits: String = rest[pos + 1..]
      .chars()
      .take_while(|c| c.is_ascii_digit())
      .collect();
    if let Ok(parsed) = digits.parse() {
      build = parsed;
    }
    let tail = rest[pos + 1 + digits.len()..].to_string();
    rest = format!("{}{}", &rest[..pos], tail);
  }

  let mut prerelease = String::new();
  let mut suffix_parts = Vec::new();
  for segment in rest.split('-').filter(|s| !s.is_empty()) {
    if prerelease.is_empty() && is_prerelease_segment(segment) {
      prerelease = segment.to_string();
    } else {
      suffix_parts.push(segment);
    }
  }

  let dotted = core.contains('.');
  let kind = if dotted && (1970..=2100).contains(&major) {
    VersionKind::Calver
  } else {
    VersionKind::Semver
  };

  Some((
    Version {
      major,
      minor,
      patch,
      prerelease,
      build,
      original: tag.to_string(),
      kind,
    },
    suffix_parts.join("-"),
  ))
}

/// Length of the leading `\d+(\.\d+)*` span.
fn numeric_core_len(tag: &str) -> usize {
  let bytes = tag.as_bytes();
  if bytes.first().is_none_or(|b| !b.is_ascii_digit()) {
    return 0;
  }
  let mut idx = 0;
  while idx < bytes.len() {
    match bytes[idx] {
      b'0'..=b'9' => idx += 1,
      b'.'
        if bytes
          .get(idx + 1)
          .is_some_and(|b| b.is_ascii_digit()) =>
      {
        idx += 1
      }
      _ => break,
    }
  }
  idx
}

fn is_prerelease_segment(segment: &str) -> bool {
  let segment = segment.to_ascii_lowercase();
  // Longer markers first so `pre` doesn't shadow `preview`.
  for marker in
    ["preview", "snapshot", "alpha", "beta", "rc", "pre", "dev"]
  {
    if let Some(rest) = segment.strip_prefix(marker) {
      let rest = rest
        .strip_prefix('.')
        .or_else(|| rest.strip_prefix('-'))
        .unwrap_or(rest);
      return rest.chars().all(|c| c.is_ascii_digit());
    }
  }
  false
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_plain_semver() {
    let version = Version::parse("1.25.3").unwrap();
    assert_eq!(version.major, 1);
    assert_eq!(version.minor, 25);
    assert_eq!(version.patch, 3);
    assert_eq!(version.kind, VersionKind::Semver);
    assert!(version.is_stable());
  }

  #[test]
  fn parses_v_prefix_and_prerelease() {
    let version = Version::parse("v2.1.0-rc1").unwrap();
    assert_eq!(version.major, 2);
    assert_eq!(version.prerelease, "rc1");
    assert!(!version.is_stable());
  }

  #[test]
  fn parses_four_component_version() {
    let version = Version::parse("1.32.7.7621").unwrap();
    assert_eq!(
      (version.major, version.minor, version.patch, version.build),
      (1, 32, 7, 7621)
    );
  }

  #[test]
  fn parses_build_metadata() {
    let version = Version::parse("1.2.3+45").unwrap();
    assert_eq!(version.build, 45);
  }

  #[test]
  fn separates_suffix_from_prerelease() {
    let (version, suffix) = parse_tag("3.11.2-rc2-alpine");
    let version = version.unwrap();
    assert_eq!(version.prerelease, "rc2");
    assert_eq!(suffix, "alpine");

    let (version, suffix) = parse_tag("12.1-slim-bookworm");
    assert!(version.unwrap().is_stable());
    assert_eq!(suffix, "slim-bookworm");
  }

  #[test]
  fn classifies_date_and_calver() {
    assert_eq!(
      Version::parse("20260127").unwrap().kind,
      VersionKind::Date
    );
    assert_eq!(
      Version::parse("2026.1.27").unwrap().kind,
      VersionKind::Calver
    );
    assert_eq!(
      Version::parse("3.23.3").unwrap().kind,
      VersionKind::Semver
    );
  }

  #[test]
  fn meta_tags_do_not_parse() {
    assert!(Version::parse("latest").is_none());
    assert!(Version::parse("stable").is_none());
    let (version, suffix) = parse_tag("latest-alpine");
    assert!(version.is_none());
    assert_eq!(suffix, "alpine");
  }

  #[test]
  fn garbage_does_not_parse() {
    assert!(Version::parse("bookworm").is_none());
    assert!(Version::parse("").is_none());
    assert!(Version::parse("sha256").is_none());
  }

  #[test]
  fn kinds_do_not_compare() {
    let semver = Version::parse("3.23.3").unwrap();
    let date = Version::parse("20260127").unwrap();
    assert_eq!(semver.compare(&date), None);
    assert_eq!(change_type(&semver, &date), ChangeType::Unknown);
  }

  #[test]
  fn stable_beats_prerelease() {
    let stable = Version::parse("2.0.0").unwrap();
    let pre = Version::parse("2.0.0-rc1").unwrap();
    assert_eq!(stable.compare(&pre), Some(Ordering::Greater));
  }

  #[test]
  fn change_type_magnitudes() {
    let base = Version::parse("1.25.0").unwrap();
    assert_eq!(
      change_type(&base, &Version::parse("1.25.2").unwrap()),
      ChangeType::Patch
    );
    assert_eq!(
      change_type(&base, &Version::parse("1.26.0").unwrap()),
      ChangeType::Minor
    );
    assert_eq!(
      change_type(&base, &Version::parse("2.0.0").unwrap()),
      ChangeType::Major
    );
    assert_eq!(
      change_type(&base, &Version::parse("1.24.9").unwrap()),
      ChangeType::Downgrade
    );
    assert_eq!(
      change_type(&base, &Version::parse("1.25.0").unwrap()),
      ChangeType::None
    );
  }
}
