//! Deterministic directed acyclic graph.
//!
//! Edges point from a dependent to its dependency. Both the resource graph
//! and the plan's step graph use this type, so ordering and cycle
//! reporting behave identically for both.

use std::collections::{BTreeMap, BTreeSet};

/// Directed graph keyed by `K`, with dependent -> dependency edges.
#[derive(Debug, Clone)]
pub struct Dag<K: Ord + Clone> {
    dependencies: BTreeMap<K, BTreeSet<K>>,
    dependents: BTreeMap<K, BTreeSet<K>>,
}

impl<K: Ord + Clone> Default for Dag<K> {
    fn default() -> Self {
        Self {
            dependencies: BTreeMap::new(),
            dependents: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone> Dag<K> {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node. Adding an existing node is a no-op.
    pub fn add_node(&mut self, node: K) {
        self.dependents.entry(node.clone()).or_default();
        self.dependencies.entry(node).or_default();
    }

    /// Records that `dependent` requires `dependency`. Both nodes are added.
    pub fn add_edge(&mut self, dependent: K, dependency: K) {
        self.add_node(dependent.clone());
        self.add_node(dependency.clone());
        self.dependencies
            .entry(dependent.clone())
            .or_default()
            .insert(dependency.clone());
        self.dependents.entry(dependency).or_default().insert(dependent);
    }

    /// Returns true if the node exists.
    pub fn contains(&self, node: &K) -> bool {
        self.dependencies.contains_key(node)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    /// Returns true if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// All nodes in key order.
    pub fn nodes(&self) -> impl Iterator<Item = &K> {
        self.dependencies.keys()
    }

    /// Direct dependencies of a node.
    pub fn dependencies_of(&self, node: &K) -> impl Iterator<Item = &K> {
        self.dependencies.get(node).into_iter().flatten()
    }

    /// Direct dependents of a node.
    pub fn dependents_of(&self, node: &K) -> impl Iterator<Item = &K> {
        self.dependents.get(node).into_iter().flatten()
    }

    /// Every node that transitively depends on `node`, excluding `node` itself.
    pub fn transitive_dependents(&self, node: &K) -> BTreeSet<K> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&K> = self.dependents_of(node).collect();

        while let Some(current) = stack.pop() {
            if seen.insert(current.clone()) {
                stack.extend(self.dependents_of(current));
            }
        }

        seen
    }

    /// Returns nodes with dependencies before dependents.
    ///
    /// Ties are broken by key order, so the result is stable across runs.
    ///
    /// # Errors
    ///
    /// Returns the nodes along one cycle, first node repeated at the end,
    /// if the graph is not acyclic.
    pub fn topological_order(&self) -> Result<Vec<K>, Vec<K>> {
        let mut remaining: BTreeMap<&K, usize> = self
            .dependencies
            .iter()
            .map(|(node, deps)| (node, deps.len()))
            .collect();
        let mut ready: BTreeSet<&K> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(node, _)| *node)
            .collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(node) = ready.pop_first() {
            remaining.remove(node);
            order.push(node.clone());
            for dependent in self.dependents_of(node) {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if remaining.is_empty() {
            Ok(order)
        } else {
            let stuck: BTreeSet<&K> = remaining.into_keys().collect();
            Err(self.find_cycle(&stuck))
        }
    }

    /// Walks dependency edges inside `stuck` until a node repeats.
    ///
    /// Every node left over by Kahn's algorithm has at least one dependency
    /// that is also left over, so the walk always closes a cycle.
    fn find_cycle(&self, stuck: &BTreeSet<&K>) -> Vec<K> {
        let Some(start) = stuck.first() else {
            return Vec::new();
        };

        let mut path: Vec<&K> = vec![*start];
        let mut position: BTreeMap<&K, usize> = BTreeMap::from([(*start, 0)]);
        let mut current = *start;

        loop {
            let Some(next) = self
                .dependencies_of(current)
                .find(|dep| stuck.contains(dep))
            else {
                return path.into_iter().cloned().collect();
            };

            if let Some(&at) = position.get(next) {
                let mut cycle: Vec<K> = path[at..].iter().map(|k| (*k).clone()).collect();
                cycle.push(next.clone());
                return cycle;
            }

            position.insert(next, path.len());
            path.push(next);
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topological_order_puts_dependencies_first() {
        let mut dag = Dag::new();
        dag.add_edge("app", "db");
        dag.add_edge("app", "net");
        dag.add_edge("db", "net");
        dag.add_node("dns");

        let order = dag.topological_order().expect("acyclic");
        let pos = |n: &str| order.iter().position(|x| *x == n).expect("present");
        assert!(pos("net") < pos("db"));
        assert!(pos("db") < pos("app"));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_order_is_deterministic() {
        let mut dag = Dag::new();
        for node in ["c", "a", "b"] {
            dag.add_node(node);
        }
        assert_eq!(dag.topological_order(), Ok(vec!["a", "b", "c"]));
    }

    #[test]
    fn test_cycle_reports_full_path() {
        let mut dag = Dag::new();
        dag.add_edge("a", "b");
        dag.add_edge("b", "c");
        dag.add_edge("c", "a");
        dag.add_edge("d", "a");

        let cycle = dag.topological_order().expect_err("cyclic");
        assert_eq!(cycle, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn test_self_loop() {
        let mut dag = Dag::new();
        dag.add_edge("a", "a");
        assert_eq!(dag.topological_order(), Err(vec!["a", "a"]));
    }

    #[test]
    fn test_transitive_dependents() {
        let mut dag = Dag::new();
        dag.add_edge("b", "a");
        dag.add_edge("c", "b");
        dag.add_edge("d", "c");
        dag.add_node("e");

        let deps = dag.transitive_dependents(&"a");
        assert_eq!(deps, BTreeSet::from(["b", "c", "d"]));
        assert!(dag.transitive_dependents(&"e").is_empty());
    }
}
