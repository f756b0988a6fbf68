//! Dependency tracking between configured handles.
//!
//! Every subdevice, controller device slot and sub-controller slot is an edge
//! from the dependent handle to the handle it uses, labelled with the local role
//! name. The graph answers three questions about a configuration:
//! - which handles use a given handle (and in what role)
//! - whether a handle can be dropped without breaking another one
//! - whether the edges form a cycle
//!
//! Nodes are plain strings. [`Configuration`](super::Configuration) namespaces
//! them as `devices.<handle>` and `controllers.<handle>` so both sections share
//! one graph.
//!
//! # Example
//!
//! ```rust
//! use automat::config::dependencies::DependencyGraph;
//!
//! let mut graph = DependencyGraph::new();
//! graph.add_dependency("devices.pump", "board", "devices.controller_board");
//! graph.add_dependency("controllers.dosing", "pump", "devices.pump");
//!
//! assert!(graph.can_remove("devices.controller_board").is_err());
//! assert!(graph.find_cycle().is_none());
//! ```

use std::collections::{BTreeMap, BTreeSet};

/// Directed graph of `dependent --role--> dependency` edges.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    // dependent -> {(role, dependency)}
    forward: BTreeMap<String, BTreeSet<(String, String)>>,
    // dependency -> {(dependent, role)}
    reverse: BTreeMap<String, BTreeSet<(String, String)>>,
}

impl DependencyGraph {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `dependent` uses `dependency` under the local name `role`.
    ///
    /// Adding the same edge twice is a no-op.
    pub fn add_dependency(&mut self, dependent: &str, role: &str, dependency: &str) {
        self.forward
            .entry(dependent.to_string())
            .or_default()
            .insert((role.to_string(), dependency.to_string()));
        self.reverse
            .entry(dependency.to_string())
            .or_default()
            .insert((dependent.to_string(), role.to_string()));
    }

    /// Records a node that has no edges yet, so it shows up in [`nodes`](Self::nodes).
    pub fn add_node(&mut self, node: &str) {
        self.forward.entry(node.to_string()).or_default();
    }

    /// Every node that appears on either side of an edge, sorted.
    pub fn nodes(&self) -> BTreeSet<&str> {
        self.forward
            .keys()
            .chain(self.reverse.keys())
            .map(String::as_str)
            .collect()
    }

    /// `(dependent, role)` pairs that use `dependency`, sorted.
    pub fn get_dependents(&self, dependency: &str) -> Vec<(String, String)> {
        self.reverse
            .get(dependency)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// `(role, dependency)` pairs used by `dependent`, sorted.
    pub fn dependencies_of(&self, dependent: &str) -> Vec<(String, String)> {
        self.forward
            .get(dependent)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// `Ok(())` when nothing uses `dependency`, otherwise the dependents that do.
    pub fn can_remove(&self, dependency: &str) -> Result<(), Vec<String>> {
        let mut dependents: Vec<String> = self
            .get_dependents(dependency)
            .into_iter()
            .map(|(dependent, _)| dependent)
            .collect();
        dependents.dedup();
        if dependents.is_empty() {
            Ok(())
        } else {
            Err(dependents)
        }
    }

    /// Drops every edge that points at `dependency`.
    pub fn remove_all(&mut self, dependency: &str) {
        if let Some(dependents) = self.reverse.remove(dependency) {
            for (dependent, role) in dependents {
                if let Some(edges) = self.forward.get_mut(&dependent) {
                    edges.remove(&(role, dependency.to_string()));
                }
            }
        }
    }

    /// Drops every edge that starts at `dependent`.
    pub fn remove_dependent(&mut self, dependent: &str) {
        if let Some(edges) = self.forward.remove(dependent) {
            for (role, dependency) in edges {
                if let Some(dependents) = self.reverse.get_mut(&dependency) {
                    dependents.remove(&(dependent.to_string(), role));
                    if dependents.is_empty() {
                        self.reverse.remove(&dependency);
                    }
                }
            }
        }
    }

    /// First cycle found, as a path that starts and ends on the same node.
    ///
    /// Nodes are visited in sorted order so the reported cycle is stable for a
    /// given graph.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            graph: &'a DependencyGraph,
            node: &'a str,
            marks: &mut BTreeMap<&'a str, Mark>,
            path: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            match marks.get(node) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|n| *n == node).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|n| n.to_string()).collect();
                    cycle.push(node.to_string());
                    return Some(cycle);
                }
                None => {}
            }
            marks.insert(node, Mark::Visiting);
            path.push(node);
            if let Some(edges) = graph.forward.get(node) {
                for (_, next) in edges {
                    if let Some(cycle) = visit(graph, next, marks, path) {
                        return Some(cycle);
                    }
                }
            }
            path.pop();
            marks.insert(node, Mark::Done);
            None
        }

        let mut marks = BTreeMap::new();
        for node in self.forward.keys() {
            let mut path = Vec::new();
            if let Some(cycle) = visit(self, node, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependents_are_tracked_per_role() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("pump", "board", "controller_board");
        graph.add_dependency("valve", "board", "controller_board");
        graph.add_dependency("valve", "board", "controller_board");

        assert_eq!(
            graph.get_dependents("controller_board"),
            vec![
                ("pump".to_string(), "board".to_string()),
                ("valve".to_string(), "board".to_string()),
            ]
        );
        assert_eq!(
            graph.dependencies_of("pump"),
            vec![("board".to_string(), "controller_board".to_string())]
        );
    }

    #[test]
    fn removal_is_refused_while_in_use() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("pump", "board", "controller_board");
        graph.add_dependency("pump", "spare", "controller_board");

        assert_eq!(graph.can_remove("controller_board"), Err(vec!["pump".to_string()]));
        assert!(graph.can_remove("pump").is_ok());

        graph.remove_dependent("pump");
        assert!(graph.can_remove("controller_board").is_ok());
    }

    #[test]
    fn remove_all_clears_forward_edges() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("pump", "board", "controller_board");
        graph.remove_all("controller_board");

        assert!(graph.get_dependents("controller_board").is_empty());
        assert!(graph.dependencies_of("pump").is_empty());
    }

    #[test]
    fn finds_cycle_path() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("a", "next", "b");
        graph.add_dependency("b", "next", "c");
        graph.add_dependency("c", "next", "a");
        graph.add_dependency("d", "next", "a");

        assert_eq!(graph.find_cycle().unwrap(), vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("loop", "me", "loop");
        assert_eq!(graph.find_cycle().unwrap(), vec!["loop", "loop"]);
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("top", "left", "l");
        graph.add_dependency("top", "right", "r");
        graph.add_dependency("l", "base", "bottom");
        graph.add_dependency("r", "base", "bottom");
        graph.add_node("lonely");

        assert!(graph.find_cycle().is_none());
        assert!(graph.nodes().contains("lonely"));
        assert_eq!(graph.nodes().len(), 5);
    }
}
