use std::{collections::HashMap, future::Future};

/// Contract the engine demands from the image registry client.
/// The engine never speaks the registry wire protocol itself.
pub trait Registry: Send + Sync {
  /// All tags published for the repository.
  fn list_tags(
    &self,
    image: &str,
  ) -> impl Future<Output = anyhow::Result<Vec<String>>> + Send;

  /// Manifest digest of one tag.
  fn tag_digest(
    &self,
    image: &str,
    tag: &str,
  ) -> impl Future<Output = anyhow::Result<String>> + Send;

  /// tag -> digests, for digest reverse lookup. Multi-arch
  /// tags carry one digest per platform.
  fn tags_with_digests(
    &self,
    image: &str,
  ) -> impl Future<
    Output = anyhow::Result<HashMap<String, Vec<String>>>,
  > + Send;

  fn latest_tag(
    &self,
    image: &str,
  ) -> impl Future<Output = anyhow::Result<String>> + Send;
}

/// Registry errors indicating missing metadata rather than an
/// unreachable registry. These fold into status
/// `MetadataUnavailable` instead of `CheckFailed`.
pub fn is_metadata_error(e: &anyhow::Error) -> bool {
  let message = format!("{e:#}").to_lowercase();
  [
    "404",
    "not found",
    "manifest unknown",
    "manifest invalid",
    "no digest found",
  ]
  .iter()
  .any(|marker| message.contains(marker))
}

#[cfg(test)]
mod tests {
  use anyhow::anyhow;

  use super::*;

  #[test]
  fn classifies_metadata_errors() {
    assert!(is_metadata_error(&anyhow!(
      "GET /v2/tags: 404 Not Found"
    )));
    assert!(is_metadata_error(&anyhow!("manifest unknown")));
    assert!(is_metadata_error(
      &anyhow!("no digest found for tag")
        .context("checking nginx")
    ));
    assert!(!is_metadata_error(&anyhow!(
      "connection timed out"
    )));
  }
}
