// src/dag/graph.rs

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::dag::query::{QueryDefinition, QueryName};
use crate::errors::{Result, StatdagError};

/// Internal node structure: stores immediate deps and dependents.
#[derive(Debug, Clone, Default)]
struct DagNode {
    /// Direct dependencies: queries that must succeed before this one runs.
    deps: Vec<QueryName>,
    /// Direct dependents: queries that depend on this one.
    dependents: Vec<QueryName>,
}

/// In-memory query DAG keyed by query name, with declaration order kept.
#[derive(Debug, Clone, Default)]
pub struct DagGraph {
    order: Vec<QueryName>,
    nodes: HashMap<QueryName, DagNode>,
}

impl DagGraph {
    /// Validate and build a DAG from declared queries.
    pub fn from_definitions(defs: &[QueryDefinition]) -> Result<Self> {
        validate_definitions(defs)?;

        let mut order = Vec::with_capacity(defs.len());
        let mut nodes: HashMap<QueryName, DagNode> = HashMap::new();

        for def in defs {
            order.push(def.name.clone());
            nodes.insert(
                def.name.clone(),
                DagNode {
                    deps: dedup(&def.dependencies),
                    dependents: Vec::new(),
                },
            );
        }

        for name in &order {
            let deps = nodes.get(name).map(|n| n.deps.clone()).unwrap_or_default();
            for dep in deps {
                if let Some(dep_node) = nodes.get_mut(&dep) {
                    dep_node.dependents.push(name.clone());
                }
            }
        }

        Ok(Self { order, nodes })
    }

    /// All query names, in declaration order.
    pub fn queries(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Immediate dependencies of a query.
    pub fn dependencies_of(&self, name: &str) -> &[QueryName] {
        self.nodes
            .get(name)
            .map(|n| n.deps.as_slice())
            .unwrap_or(&[])
    }

    /// Immediate dependents of a query.
    pub fn dependents_of(&self, name: &str) -> &[QueryName] {
        self.nodes
            .get(name)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }
}

fn dedup(names: &[QueryName]) -> Vec<QueryName> {
    let mut seen = HashSet::new();
    names
        .iter()
        .filter(|n| seen.insert(n.as_str()))
        .cloned()
        .collect()
}

/// Check a declared query set: unique names, known dependencies, no
/// self-dependency, no `run_at_end` dependency from a regular query, and no
/// cycles.
pub fn validate_definitions(defs: &[QueryDefinition]) -> Result<()> {
    let mut by_name: HashMap<&str, &QueryDefinition> = HashMap::new();
    for def in defs {
        if def.name.trim().is_empty() {
            return Err(StatdagError::ConfigError(
                "query name must not be empty".to_string(),
            ));
        }
        if by_name.insert(def.name.as_str(), def).is_some() {
            return Err(StatdagError::ConfigError(format!(
                "query '{}' is declared more than once",
                def.name
            )));
        }
    }

    for def in defs {
        for dep in &def.dependencies {
            if dep == &def.name {
                return Err(StatdagError::ConfigError(format!(
                    "query '{}' cannot depend on itself",
                    def.name
                )));
            }
            let Some(dep_def) = by_name.get(dep.as_str()) else {
                return Err(StatdagError::ConfigError(format!(
                    "query '{}' has unknown dependency '{}'",
                    def.name, dep
                )));
            };
            if dep_def.run_at_end && !def.run_at_end {
                return Err(StatdagError::ConfigError(format!(
                    "query '{}' cannot depend on run_at_end query '{}'",
                    def.name, dep
                )));
            }
        }
    }

    // Edge direction: dep -> query.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for def in defs {
        graph.add_node(def.name.as_str());
    }
    for def in defs {
        for dep in &def.dependencies {
            graph.add_edge(dep.as_str(), def.name.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(StatdagError::DagCycle(format!(
            "cycle detected in query DAG involving query '{}'",
            cycle.node_id()
        ))),
    }
}
