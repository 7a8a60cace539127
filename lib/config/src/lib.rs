//! # Docksmith Config
//!
//! Loads layered configuration files (toml / yaml / json) and
//! merges them into a final configuration object. Supports
//! interpolating environment variables ('${VAR}' syntax only) and
//! matching file names in directories against wildcard patterns.

use std::path::{Path, PathBuf};

use colored::Colorize;
use serde::de::DeserializeOwned;

mod error;
mod merge;

pub use error::Error;
pub use merge::{merge_config, merge_objects};

pub type Result<T> = ::core::result::Result<T, Error>;

/// Set the configuration for loading config files.
pub struct ConfigLoader<'outer, 'inner> {
  /// Paths to either files or directories to include in the
  /// final configuration. Paths coming later in the array
  /// (higher index) override configuration in earlier paths.
  pub paths: &'outer [&'inner Path],
  /// Wildcard patterns to match file names in given
  /// directories, eg `docksmith*.toml`.
  pub match_wildcards: &'outer [&'inner str],
  /// Whether to merge nested config objects. Otherwise the
  /// object is replaced at the top-level key by the highest
  /// priority file in which it appears.
  pub merge_nested: bool,
  /// Whether to extend arrays across files instead of
  /// replacing them.
  pub extend_array: bool,
  /// Print the resolved file list on load.
  pub debug_print: bool,
}

impl ConfigLoader<'_, '_> {
  pub fn load<T: DeserializeOwned>(self) -> Result<T> {
    let mut wildcards =
      Vec::with_capacity(self.match_wildcards.len());
    for &pattern in self.match_wildcards {
      match wildcard::Wildcard::new(pattern.as_bytes()) {
        Ok(wc) => wildcards.push(wc),
        Err(e) => {
          eprintln!(
            "{}: '{}' is not a valid wildcard | {e:?}",
            "ERROR".red(),
            pattern.bold(),
          );
        }
      }
    }

    let mut files = Vec::new();
    for &path in self.paths {
      collect_config_files(&mut files, path, &wildcards);
    }

    if self.debug_print {
      println!(
        "{}: {}: {files:?}",
        "DEBUG".cyan(),
        "Config Files".dimmed()
      );
    }

    let mut target = serde_json::Map::new();
    for file in &files {
      let source = match parse_config_file(file) {
        Ok(source) => source,
        Err(e) => {
          eprintln!("{}: {e}", "WARN".yellow());
          continue;
        }
      };
      target = merge_objects(
        target,
        source,
        self.merge_nested,
        self.extend_array,
      )?;
    }

    serde_json::from_value(serde_json::Value::Object(target))
      .map_err(|e| Error::ParseFinalJson { e })
  }
}

fn collect_config_files(
  files: &mut Vec<PathBuf>,
  path: &Path,
  wildcards: &[wildcard::Wildcard],
) {
  if path.is_file() {
    files.push(path.to_path_buf());
    return;
  }
  let Ok(read_dir) = std::fs::read_dir(path) else {
    return;
  };
  let mut matched = Vec::new();
  for entry in read_dir.flatten() {
    let entry_path = entry.path();
    if !entry_path.is_file() {
      continue;
    }
    let file_name = entry.file_name();
    let Some(file_name) = file_name.to_str() else {
      continue;
    };
    if wildcards.is_empty()
      || wildcards
        .iter()
        .any(|wc| wc.is_match(file_name.as_bytes()))
    {
      matched.push(entry_path);
    }
  }
  // Deterministic priority within a directory.
  matched.sort();
  files.extend(matched);
}

fn parse_config_file(
  file: &Path,
) -> Result<serde_json::Map<String, serde_json::Value>> {
  let contents = std::fs::read_to_string(file).map_err(|e| {
    Error::ReadFile {
      e,
      path: file.to_path_buf(),
    }
  })?;
  let contents = interpolate_env(&contents);
  let value: serde_json::Value =
    match file.extension().and_then(|ext| ext.to_str()) {
      Some("toml") => toml::from_str(&contents).map_err(|e| {
        Error::ParseToml {
          e,
          path: file.to_path_buf(),
        }
      })?,
      Some("yaml") | Some("yml") => {
        serde_yaml_ng::from_str(&contents).map_err(|e| {
          Error::ParseYaml {
            e,
            path: file.to_path_buf(),
          }
        })?
      }
      Some("json") => {
        serde_json::from_str(&contents).map_err(|e| {
          Error::ParseJson {
            e,
            path: file.to_path_buf(),
          }
        })?
      }
      _ => {
        return Err(Error::UnsupportedFileType {
          path: file.to_path_buf(),
        });
      }
    };
  match value {
    serde_json::Value::Object(object) => Ok(object),
    _ => Err(Error::ValueIsNotObject),
  }
}

/// Only supports '${VAR}' syntax. Runs twice so env vars
/// expanding to further '${VAR}' references still resolve.
fn interpolate_env(input: &str) -> String {
  let re = regex::Regex::new(r"\$\{([A-Za-z0-9_]+)\}").unwrap();
  let first_pass = re
    .replace_all(input, |caps: &regex::Captures| {
      std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned();
  re.replace_all(&first_pass, |caps: &regex::Captures| {
    std::env::var(&caps[1]).unwrap_or_default()
  })
  .into_owned()
}
