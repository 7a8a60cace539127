use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::anyhow;
use docksmith_client::entities::container::{
  ContainerRecord, labels,
};
use indexmap::IndexMap;

/// Dependency graph over the current container set. Edges point
/// from a container to the containers it depends on, derived
/// from compose `depends_on`, a shared network namespace (the
/// namespace owner is a strict predecessor) and the
/// `docksmith.restart-after` label.
#[derive(Debug, Default)]
pub struct DependencyGraph {
  /// container -> direct dependencies, insertion ordered for
  /// deterministic output.
  edges: IndexMap<String, Vec<String>>,
}

impl DependencyGraph {
  pub fn build(containers: &[ContainerRecord]) -> DependencyGraph {
    let names: HashSet<&str> = containers
      .iter()
      .map(|container| container.name.as_str())
      .collect();
    // `service:X` references use the compose service name
    // rather than the container name.
    let service_to_name: HashMap<&str, &str> = containers
      .iter()
      .filter_map(|container| {
        container
          .label(labels::COMPOSE_SERVICE)
          .map(|service| (service, container.name.as_str()))
      })
      .collect();

    let mut edges = IndexMap::new();
    for container in containers {
      let mut dependencies = Vec::new();

      if let Some(raw) =
        container.label(labels::COMPOSE_DEPENDS_ON)
      {
        dependencies.extend(parse_depends_on(raw));
      }
      if let Some(owner) =
        namespace_owner(container, containers, &service_to_name)
      {
        dependencies.push(owner);
      }
      if let Some(raw) = container.label(labels::RESTART_AFTER) {
        dependencies.extend(parse_depends_on(raw));
      }

      // References outside the current container set are
      // filtered out.
      let mut seen = HashSet::new();
      dependencies.retain(|dependency| {
        names.contains(dependency.as_str())
          && dependency != &container.name
          && seen.insert(dependency.clone())
      });
      edges.insert(container.name.clone(), dependencies);
    }
    DependencyGraph { edges }
  }

  pub fn contains(&self, name: &str) -> bool {
    self.edges.contains_key(name)
  }

  pub fn dependencies_of(&self, name: &str) -> &[String] {
    self
      .edges
      .get(name)
      .map(Vec::as_slice)
      .unwrap_or_default()
  }

  /// Topological order, dependencies first. Errors naming the
  /// offending containers when the graph has a cycle.
  pub fn update_order(&self) -> anyhow::Result<Vec<String>> {
    // in_degree counts unresolved dependencies per container.
    let mut in_degree: IndexMap<&str, usize> = self
      .edges
      .iter()
      .map(|(name, dependencies)| {
        (name.as_str(), dependencies.len())
      })
      .collect();
    let mut ready: VecDeque<&str> = in_degree
      .iter()
      .filter(|(_, degree)| **degree == 0)
      .map(|(name, _)| *name)
      .collect();
    // container -> containers waiting on it
    let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
    for (name, dependencies) in &self.edges {
      for dependency in dependencies {
        reverse
          .entry(dependency.as_str())
          .or_default()
          .push(name.as_str());
      }
    }

    let mut order = Vec::with_capacity(self.edges.len());
    while let Some(name) = ready.pop_front() {
      order.push(name.to_string());
      for &dependent in
        reverse.get(name).map(Vec::as_slice).unwrap_or_default()
      {
        let degree = in_degree
          .get_mut(dependent)
          .expect("dependent not registered in graph");
        *degree -= 1;
        if *degree == 0 {
          ready.push_back(dependent);
        }
      }
    }

    if order.len() != self.edges.len() {
      let mut cyclic: Vec<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree > 0)
        .map(|(name, _)| *name)
        .collect();
      cyclic.sort();
      return Err(anyhow!(
        "dependency cycle involving: {}",
        cyclic.join(", ")
      ));
    }
    Ok(order)
  }

  /// Transitive reverse closure of `name`, in graph order.
  pub fn dependents(&self, name: &str) -> Vec<String> {
    let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
    for (container, dependencies) in &self.edges {
      for dependency in dependencies {
        reverse
          .entry(dependency.as_str())
          .or_default()
          .push(container.as_str());
      }
    }
    let mut seen = HashSet::new();
    let mut frontier = VecDeque::from([name]);
    while let Some(current) = frontier.pop_front() {
      for &dependent in reverse
        .get(current)
        .map(Vec::as_slice)
        .unwrap_or_default()
      {
        if seen.insert(dependent) {
          frontier.push_back(dependent);
        }
      }
    }
    // Graph order: the order containers were inserted.
    self
      .edges
      .keys()
      .filter(|container| seen.contains(container.as_str()))
      .cloned()
      .collect()
  }
}

/// Resolve the owner of a shared network namespace to a
/// container name. Compose files write `service:X`, but the
/// engine API reports the mode on the running container as
/// `container:<id-or-name>`, so both forms are handled. Docker
/// also accepts id prefixes.
fn namespace_owner(
  container: &ContainerRecord,
  containers: &[ContainerRecord],
  service_to_name: &HashMap<&str, &str>,
) -> Option<String> {
  let mode = container.network_mode.as_deref()?;
  if let Some(service) = mode.strip_prefix("service:") {
    let owner = service_to_name
      .get(service)
      .copied()
      .unwrap_or(service);
    return Some(owner.to_string());
  }
  let reference = mode.strip_prefix("container:")?;
  if reference.is_empty() {
    return None;
  }
  containers
    .iter()
    .find(|owner| {
      owner.name == reference
        || (!owner.id.is_empty()
          && owner.id.starts_with(reference))
    })
    .map(|owner| owner.name.clone())
}

/// `name[:condition[:required]]`, comma separated.
fn parse_depends_on(raw: &str) -> Vec<String> {
  raw
    .split(',')
    .map(str::trim)
    .filter(|entry| !entry.is_empty())
    .map(|entry| {
      entry
        .split_once(':')
        .map(|(name, _)| name)
        .unwrap_or(entry)
        .to_string()
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn container(
    name: &str,
    depends_on: Option<&str>,
    network_mode: Option<&str>,
  ) -> ContainerRecord {
    let mut record = ContainerRecord {
      name: name.to_string(),
      network_mode: network_mode.map(str::to_string),
      ..Default::default()
    };
    if let Some(raw) = depends_on {
      record.labels.insert(
        labels::COMPOSE_DEPENDS_ON.to_string(),
        raw.to_string(),
      );
    }
    record
  }

  #[test]
  fn orders_dependencies_first() {
    let graph = DependencyGraph::build(&[
      container("web", Some("db:service_healthy:true"), None),
      container("db", None, None),
      container("worker", Some("db,web"), None),
    ]);
    let order = graph.update_order().unwrap();
    let position = |name: &str| {
      order.iter().position(|n| n == name).unwrap()
    };
    assert!(position("db") < position("web"));
    assert!(position("web") < position("worker"));
  }

  #[test]
  fn network_mode_owner_is_predecessor() {
    let graph = DependencyGraph::build(&[
      container("app", None, Some("service:vpn")),
      {
        let mut vpn = container("vpn", None, None);
        vpn.labels.insert(
          labels::COMPOSE_SERVICE.to_string(),
          "vpn".to_string(),
        );
        vpn
      },
    ]);
    assert_eq!(graph.dependencies_of("app"), ["vpn"]);
    let order = graph.update_order().unwrap();
    assert_eq!(order, ["vpn", "app"]);
  }

  #[test]
  fn engine_reported_container_mode_resolves_to_owner() {
    // The engine API reports `network_mode: service:X` back as
    // `container:<id>`; the edge must survive that shape.
    let vpn_id =
      "4f5ca1b2d3e4f5a6b7c8d9e0f1a2b3c4d5e6f7a8b9c0d1e2f3a4b5c6d7e8f9a0";
    let mut vpn = container("vpn", None, None);
    vpn.id = vpn_id.to_string();
    let app = container(
      "app",
      None,
      Some(&format!("container:{vpn_id}")),
    );
    let graph = DependencyGraph::build(&[app, vpn]);
    assert_eq!(graph.dependencies_of("app"), ["vpn"]);
    assert_eq!(
      graph.update_order().unwrap(),
      ["vpn", "app"]
    );

    // Truncated ids (docker accepts prefixes) still resolve.
    let mut vpn = container("vpn", None, None);
    vpn.id = vpn_id.to_string();
    let app = container(
      "app",
      None,
      Some(&format!("container:{}", &vpn_id[..12])),
    );
    let graph = DependencyGraph::build(&[app, vpn]);
    assert_eq!(graph.dependencies_of("app"), ["vpn"]);

    // References to containers outside the set drop cleanly.
    let orphan = container(
      "orphan",
      None,
      Some("container:deadbeefdeadbeef"),
    );
    let graph = DependencyGraph::build(&[orphan]);
    assert!(graph.dependencies_of("orphan").is_empty());
  }

  #[test]
  fn restart_after_adds_edges() {
    let mut late = container("late", None, None);
    late.labels.insert(
      labels::RESTART_AFTER.to_string(),
      "early".to_string(),
    );
    let graph = DependencyGraph::build(&[
      late,
      container("early", None, None),
    ]);
    assert_eq!(graph.dependencies_of("late"), ["early"]);
  }

  #[test]
  fn out_of_set_references_are_filtered() {
    let graph = DependencyGraph::build(&[container(
      "app",
      Some("missing,other"),
      None,
    )]);
    assert!(graph.dependencies_of("app").is_empty());
  }

  #[test]
  fn cycle_surfaces_offending_nodes() {
    let graph = DependencyGraph::build(&[
      container("a", Some("b"), None),
      container("b", Some("a"), None),
      container("c", None, None),
    ]);
    let error =
      graph.update_order().unwrap_err().to_string();
    assert!(error.contains("a"));
    assert!(error.contains("b"));
  }

  #[test]
  fn dependents_are_transitive_in_graph_order() {
    let graph = DependencyGraph::build(&[
      container("db", None, None),
      container("api", Some("db"), None),
      container("web", Some("api"), None),
      container("unrelated", None, None),
    ]);
    assert_eq!(graph.dependents("db"), ["api", "web"]);
    assert_eq!(graph.dependents("api"), ["web"]);
    assert!(graph.dependents("web").is_empty());
  }
}
