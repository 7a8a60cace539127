use std::{
  collections::HashMap,
  path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use docksmith_client::entities::{
  container::{ContainerRecord, labels},
  image::normalize_image,
};
use indexmap::IndexMap;
use serde::Deserialize;
use tokio::fs;

/// The slice of a compose file the engine cares about. Parsing
/// is lossy; edits go through [update_image_tag] instead so the
/// rest of the file survives byte for byte.
#[derive(Debug, Default, Deserialize)]
pub struct ComposeModel {
  #[serde(default)]
  pub services: IndexMap<String, ComposeService>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ComposeService {
  pub image: Option<String>,
  pub container_name: Option<String>,
  pub build: Option<serde_yaml_ng::Value>,
  /// Either `KEY: value` map or `KEY=value` list form.
  pub labels: Option<serde_yaml_ng::Value>,
}

impl ComposeService {
  pub fn labels_map(&self) -> HashMap<String, String> {
    let mut map = HashMap::new();
    match &self.labels {
      Some(serde_yaml_ng::Value::Mapping(mapping)) => {
        for (key, value) in mapping {
          let (Some(key), Some(value)) =
            (key.as_str(), yaml_scalar_to_string(value))
          else {
            continue;
          };
          map.insert(key.to_string(), value);
        }
      }
      Some(serde_yaml_ng::Value::Sequence(sequence)) => {
        for entry in sequence {
          let Some(entry) = entry.as_str() else {
            continue;
          };
          match entry.split_once('=') {
            Some((key, value)) => {
              map.insert(key.to_string(), value.to_string());
            }
            None => {
              map.insert(entry.to_string(), String::new());
            }
          }
        }
      }
      _ => {}
    }
    map
  }
}

fn yaml_scalar_to_string(
  value: &serde_yaml_ng::Value,
) -> Option<String> {
  match value {
    serde_yaml_ng::Value::String(s) => Some(s.clone()),
    serde_yaml_ng::Value::Bool(b) => Some(b.to_string()),
    serde_yaml_ng::Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

pub fn parse_compose(
  contents: &str,
) -> anyhow::Result<ComposeModel> {
  serde_yaml_ng::from_str(contents)
    .context("failed to parse compose yaml")
}

/// First compose file path from the
/// `com.docker.compose.project.config_files` label.
pub fn compose_file_path(
  container: &ContainerRecord,
) -> Option<PathBuf> {
  container
    .label(labels::COMPOSE_CONFIG_FILES)?
    .split(',')
    .map(str::trim)
    .find(|path| !path.is_empty())
    .map(PathBuf::from)
}

/// Locate the service a container belongs to: explicit
/// `container_name` match first, then service name equal to the
/// compose service label.
pub fn service_for_container<'a>(
  model: &'a ComposeModel,
  container: &ContainerRecord,
) -> Option<(&'a str, &'a ComposeService)> {
  let service_label = container.compose_service();
  if let Some((name, service)) =
    model.services.iter().find(|(_, service)| {
      service.container_name.as_deref()
        == Some(container.name.as_str())
    })
  {
    return Some((name.as_str(), service));
  }
  model
    .services
    .get_key_value(service_label)
    .map(|(name, service)| (name.as_str(), service))
}

/// Outcome of resolving a compose `image:` expression against
/// an environment.
pub struct ResolvedImage {
  /// None when a referenced variable stayed unresolved.
  pub resolved: Option<String>,
  /// First environment variable the expression references.
  pub env_var: Option<String>,
}

/// Resolve `${VAR}` / `${VAR:-default}` forms. Resolution
/// checks the supplied (compose-adjacent `.env`) environment
/// only.
pub fn resolve_image_expr(
  expr: &str,
  env: &HashMap<String, String>,
) -> ResolvedImage {
  let mut resolved = String::new();
  let mut rest = expr;
  let mut env_var = None;
  let mut unresolved = false;

  while let Some(start) = rest.find("${") {
    resolved.push_str(&rest[..start]);
    let Some(end) = rest[start..].find('}') else {
      // Unbalanced braces, treat the remainder as literal.
      resolved.push_str(&rest[start..]);
      rest = "";
      break;
    };
    let inner = &rest[start + 2..start + end];
    let (name, default) = match inner.split_once(":-") {
      Some((name, default)) => (name, Some(default)),
      None => (inner, None),
    };
    if env_var.is_none() && !name.is_empty() {
      env_var = Some(name.to_string());
    }
    match env.get(name) {
      Some(value) => resolved.push_str(value),
      None => match default {
        Some(default) => resolved.push_str(default),
        None => unresolved = true,
      },
    }
    rest = &rest[start + end + 1..];
  }
  resolved.push_str(rest);

  ResolvedImage {
    resolved: (!unresolved).then_some(resolved),
    env_var,
  }
}

/// Parse the `.env` file next to the compose file, when present.
pub async fn read_adjacent_env(
  compose_file: &Path,
) -> HashMap<String, String> {
  let Some(dir) = compose_file.parent() else {
    return Default::default();
  };
  let Ok(contents) =
    fs::read_to_string(dir.join(".env")).await
  else {
    return Default::default();
  };
  parse_env_contents(&contents)
}

pub fn parse_env_contents(
  contents: &str,
) -> HashMap<String, String> {
  contents
    .lines()
    .map(str::trim)
    .filter(|line| {
      !line.is_empty() && !line.starts_with('#')
    })
    .filter_map(|line| {
      let (key, value) = line.split_once('=')?;
      let value = value.trim().trim_matches('"').trim_matches('\'');
      Some((key.trim().to_string(), value.to_string()))
    })
    .collect()
}

/// What compose drift detection concluded for one container.
#[derive(Debug, Default)]
pub struct ComposeCheck {
  /// Raw compose `image:` spec, set when it disagrees with the
  /// running container.
  pub mismatch: Option<String>,
  /// The running container's image is a bare digest, ie the
  /// tag was lost.
  pub bare_digest: bool,
  pub env_controlled: bool,
  pub env_var_name: Option<String>,
  /// docksmith labels on the container and in the compose file
  /// disagree. The running container stays the source of truth.
  pub labels_out_of_sync: bool,
}

/// Compare a compose-managed container against its compose
/// file. Containers without compose labels check clean.
pub async fn check_compose(
  container: &ContainerRecord,
) -> ComposeCheck {
  let mut check = ComposeCheck::default();
  if !container.is_compose_managed() {
    return check;
  }
  if docksmith_client::entities::image::is_bare_digest(
    &container.image,
  ) {
    check.bare_digest = true;
    return check;
  }
  let Some(path) = compose_file_path(container) else {
    return check;
  };
  let Ok(contents) = fs::read_to_string(&path).await else {
    return check;
  };
  let Ok(model) = parse_compose(&contents) else {
    return check;
  };
  let Some((_, service)) =
    service_for_container(&model, container)
  else {
    return check;
  };

  check.labels_out_of_sync =
    docksmith_labels_out_of_sync(container, service);

  let Some(spec) = service.image.as_deref() else {
    // A build stanza without image is legitimately tagless.
    return check;
  };

  let env = read_adjacent_env(&path).await;
  let resolved = resolve_image_expr(spec, &env);
  if let Some(name) = &resolved.env_var
    && env.contains_key(name)
  {
    check.env_controlled = true;
    check.env_var_name = Some(name.clone());
  }
  let Some(resolved) = resolved.resolved else {
    // Unresolved variable, cannot judge drift.
    return check;
  };

  if normalize_image(&resolved)
    != normalize_image(&container.image)
  {
    check.mismatch = Some(spec.to_string());
  }
  check
}

/// Compare `docksmith.*` labels on the running container to the
/// compose file's, reporting any mismatch or missing key.
fn docksmith_labels_out_of_sync(
  container: &ContainerRecord,
  service: &ComposeService,
) -> bool {
  let compose_labels = service.labels_map();
  let container_docksmith = container
    .labels
    .iter()
    .filter(|(key, _)| key.starts_with(labels::PREFIX));
  for (key, value) in container_docksmith {
    if compose_labels.get(key) != Some(value) {
      return true;
    }
  }
  compose_labels
    .iter()
    .filter(|(key, _)| key.starts_with(labels::PREFIX))
    .any(|(key, value)| {
      container.labels.get(key) != Some(value)
    })
}

/// Rewrite only the tag of `services.<service>.image` in the
/// raw compose text, leaving everything else untouched.
/// `${VAR:-prefix:tag}` expressions keep their braces and
/// default structure.
pub fn update_image_tag(
  contents: &str,
  service: &str,
  new_tag: &str,
) -> anyhow::Result<String> {
  let mut lines: Vec<String> =
    contents.lines().map(str::to_string).collect();
  let image_line = find_service_image_line(contents, service)
    .with_context(|| {
      format!("no image line found for service '{service}'")
    })?;

  let line = &lines[image_line];
  let (prefix, value) = line
    .split_once("image:")
    .context("image line lost its key")?;
  let raw_value = value.trim();
  // Preserve quoting style.
  let (quote, inner) = match raw_value.chars().next() {
    Some(q @ ('"' | '\'')) => {
      (Some(q), raw_value.trim_matches(q))
    }
    _ => (None, raw_value),
  };
  let rewritten = replace_tag_in_expr(inner, new_tag);
  let rewritten = match quote {
    Some(q) => format!("{q}{rewritten}{q}"),
    None => rewritten,
  };
  lines[image_line] = format!("{prefix}image: {rewritten}");

  let mut out = lines.join("\n");
  if contents.ends_with('\n') {
    out.push('\n');
  }
  Ok(out)
}

/// Line index of the `image:` entry inside one service block,
/// located by indentation scanning.
fn find_service_image_line(
  contents: &str,
  service: &str,
) -> Option<usize> {
  let lines: Vec<&str> = contents.lines().collect();
  let services_idx = lines.iter().position(|line| {
    line.trim_end() == "services:"
  })?;
  let service_key = format!("{service}:");
  let mut service_indent = None;
  for (idx, line) in
    lines.iter().enumerate().skip(services_idx + 1)
  {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
      continue;
    }
    let indent = line.len() - trimmed.len();
    if indent == 0 {
      // Left the services block entirely.
      break;
    }
    match service_indent {
      None => {
        if trimmed.trim_end() == service_key {
          service_indent = Some(indent);
        }
      }
      Some(found_indent) => {
        if indent <= found_indent {
          // Next service begins, image not found.
          return None;
        }
        if trimmed.starts_with("image:") {
          return Some(idx);
        }
      }
    }
  }
  None
}

/// Replace the tag portion of an image expression. For
/// `${VAR:-default}` the default's tag is rewritten in place.
fn replace_tag_in_expr(expr: &str, new_tag: &str) -> String {
  if let Some(inner) = expr
    .strip_prefix("${")
    .and_then(|rest| rest.strip_suffix('}'))
    && let Some((name, default)) = inner.split_once(":-")
  {
    return format!(
      "${{{name}:-{}}}",
      replace_tag_in_expr(default, new_tag)
    );
  }
  // Tag separator is a ':' after the last '/'.
  match expr.rfind(':') {
    Some(idx) if !expr[idx + 1..].contains('/') => {
      format!("{}:{new_tag}", &expr[..idx])
    }
    _ => format!("{expr}:{new_tag}"),
  }
}

/// Write contents atomically: temp file in the same directory,
/// then rename over the target.
pub async fn write_atomic(
  path: &Path,
  contents: &str,
) -> anyhow::Result<()> {
  let parent = path
    .parent()
    .ok_or_else(|| anyhow!("compose path has no parent"))?;
  let file_name = path
    .file_name()
    .and_then(|name| name.to_str())
    .ok_or_else(|| anyhow!("compose path has no file name"))?;
  let tmp = parent.join(format!(".{file_name}.tmp"));
  fs::write(&tmp, contents).await.with_context(|| {
    format!("failed to write temp compose file at {tmp:?}")
  })?;
  fs::rename(&tmp, path).await.with_context(|| {
    format!("failed to move compose file into place at {path:?}")
  })?;
  Ok(())
}
