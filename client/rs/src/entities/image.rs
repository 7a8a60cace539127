use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use super::version::{Version, parse_tag};

/// A container image tag, decomposed for update decisions.
#[typeshare]
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
pub struct TagInfo {
  /// The tag exactly as written, eg `1.25.3-alpine`.
  pub full: String,
  /// Parsed version, when the tag is versioned.
  pub version: Option<Version>,
  /// Trailing non-numeric variant (`alpine`, `bookworm`, ...).
  /// Tags with different suffixes are different variants and
  /// are never compared to one another.
  #[serde(default)]
  pub suffix: String,
  #[serde(default)]
  pub is_latest: bool,
  #[serde(default)]
  pub is_versioned: bool,
}

impl TagInfo {
  pub fn parse(full: &str) -> TagInfo {
    let (version, suffix) = parse_tag(full);
    TagInfo {
      is_latest: full == "latest"
        || full.starts_with("latest-"),
      is_versioned: version.is_some(),
      version,
      suffix,
      full: full.to_string(),
    }
  }
}

/// Decomposition of an image string into registry, repository
/// and tag. Reserializing with [ImageRef::to_string] preserves
/// every component.
#[typeshare]
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
pub struct ImageRef {
  /// Empty for Docker Hub library images.
  #[serde(default)]
  pub registry: String,
  pub repository: String,
  pub tag: TagInfo,
  /// `sha256:...` digest pin, when the reference carries one.
  pub digest: Option<String>,
}

impl ImageRef {
  pub fn parse(image: &str) -> ImageRef {
    let image = image.trim();
    let (rest, digest) = match image.split_once('@') {
      Some((rest, digest)) => (rest, Some(digest.to_string())),
      None => (image, None),
    };
    // The tag separator is a ':' after the last '/', so
    // registry ports are not mistaken for tags.
    let (repo_full, tag) = match rest.rfind(':') {
      Some(idx) if !rest[idx + 1..].contains('/') => {
        (&rest[..idx], &rest[idx + 1..])
      }
      _ => (rest, ""),
    };
    // A first path component with a '.', ':' or `localhost`
    // names a registry, everything else is repository path.
    let (registry, repository) = match repo_full.split_once('/') {
      Some((first, remainder))
        if first.contains('.')
          || first.contains(':')
          || first == "localhost" =>
      {
        (first.to_string(), remainder.to_string())
      }
      _ => (String::new(), repo_full.to_string()),
    };
    ImageRef {
      registry,
      repository,
      tag: TagInfo::parse(tag),
      digest,
    }
  }

  /// Repository including the registry prefix when present.
  pub fn repository_full(&self) -> String {
    if self.registry.is_empty() {
      self.repository.clone()
    } else {
      format!("{}/{}", self.registry, self.repository)
    }
  }

  /// The reference with digest stripped and an implicit
  /// `latest` made explicit. Used for compose drift compares.
  pub fn normalized(&self) -> String {
    let tag = if self.tag.full.is_empty() {
      "latest"
    } else {
      self.tag.full.as_str()
    };
    format!("{}:{tag}", self.repository_full())
  }

  /// The same reference with a different tag.
  pub fn with_tag(&self, tag: &str) -> String {
    format!("{}:{tag}", self.repository_full())
  }
}

impl std::fmt::Display for ImageRef {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.repository_full())?;
    if !self.tag.full.is_empty() {
      write!(f, ":{}", self.tag.full)?;
    }
    if let Some(digest) = &self.digest {
      write!(f, "@{digest}")?;
    }
    Ok(())
  }
}

/// Whether the image string is a bare digest, ie the running
/// container lost its tag (`sha256:...` or 64 hex chars).
pub fn is_bare_digest(image: &str) -> bool {
  let hex = image.strip_prefix("sha256:").unwrap_or(image);
  hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit())
    && (image.starts_with("sha256:") || !image.contains([':', '/']))
}

/// Strip any `@sha256:...` suffix and make an implicit
/// `latest` tag explicit.
pub fn normalize_image(image: &str) -> String {
  ImageRef::parse(image).normalized()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_hub_library_image() {
    let image = ImageRef::parse("nginx:1.25.3");
    assert_eq!(image.registry, "");
    assert_eq!(image.repository, "nginx");
    assert_eq!(image.tag.full, "1.25.3");
    assert!(image.tag.is_versioned);
  }

  #[test]
  fn parses_registry_with_port() {
    let image =
      ImageRef::parse("registry.local:5000/team/app:2.0.1-alpine");
    assert_eq!(image.registry, "registry.local:5000");
    assert_eq!(image.repository, "team/app");
    assert_eq!(image.tag.full, "2.0.1-alpine");
    assert_eq!(image.tag.suffix, "alpine");
  }

  #[test]
  fn parses_digest_pin() {
    let image = ImageRef::parse(
      "ghcr.io/owner/app:1.0.0@sha256:abcdef0123",
    );
    assert_eq!(image.registry, "ghcr.io");
    assert_eq!(
      image.digest.as_deref(),
      Some("sha256:abcdef0123")
    );
  }

  #[test]
  fn round_trips_every_component() {
    for raw in [
      "nginx",
      "nginx:latest",
      "nginx:1.25.3-alpine",
      "library/nginx:1.25",
      "ghcr.io/owner/app:2.0.0",
      "registry.local:5000/team/app:2.0.1-alpine",
      "ghcr.io/owner/app:1.0.0@sha256:abcdef0123",
    ] {
      assert_eq!(ImageRef::parse(raw).to_string(), raw);
    }
  }

  #[test]
  fn untagged_image_has_empty_tag() {
    let image = ImageRef::parse("postgres");
    assert_eq!(image.tag.full, "");
    assert_eq!(image.normalized(), "postgres:latest");
  }

  #[test]
  fn detects_bare_digests() {
    let hex = "a".repeat(64);
    assert!(is_bare_digest(&format!("sha256:{hex}")));
    assert!(is_bare_digest(&hex));
    assert!(!is_bare_digest("nginx:latest"));
    assert!(!is_bare_digest("sha256:tooshort"));
  }

  #[test]
  fn normalize_strips_digest_and_defaults_tag() {
    assert_eq!(
      normalize_image("nginx@sha256:abc"),
      "nginx:latest"
    );
    assert_eq!(normalize_image("nginx:1.26"), "nginx:1.26");
  }
}
