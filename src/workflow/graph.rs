//! Job graph builder.
//!
//! Takes a workflow document, expands matrices and constructs the directed
//! acyclic graph of jobs a run is created from. Nodes live in an arena and
//! refer to each other by index, in both directions: `needs` (what a job
//! waits for) and `needed_by` (the reverse-edge index fan-out walks).

use std::collections::HashMap;

use crate::errors::GraphError;

use super::doc::{JobDef, WorkflowDoc};
use super::matrix::{self, Combination};

/// Index into the node arena.
pub type JobIndex = usize;

/// One expanded job.
#[derive(Debug, Clone)]
pub struct JobNode {
    pub key: String,
    pub base_key: String,
    pub name: String,
    pub runs_on: Vec<String>,
    pub matrix: Combination,
    pub if_expr: Option<String>,
    pub runs_regardless: bool,
    /// Longest path from a root; roots are depth 0.
    pub depth: u32,
    /// Job definition forwarded to the runner, as JSON.
    pub payload: String,
}

#[derive(Debug)]
pub struct JobGraph {
    nodes: Vec<JobNode>,
    index_map: HashMap<String, JobIndex>,
    /// index -> jobs it needs
    needs: Vec<Vec<JobIndex>>,
    /// index -> jobs that need it
    needed_by: Vec<Vec<JobIndex>>,
}

impl JobGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: JobIndex) -> Option<&JobNode> {
        self.nodes.get(index)
    }

    pub fn nodes(&self) -> &[JobNode] {
        &self.nodes
    }

    pub fn index_of(&self, key: &str) -> Option<JobIndex> {
        self.index_map.get(key).copied()
    }

    pub fn needs(&self, index: JobIndex) -> &[JobIndex] {
        self.needs.get(index).map_or(&[], |v| v.as_slice())
    }

    pub fn needed_by(&self, index: JobIndex) -> &[JobIndex] {
        self.needed_by.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Keys of the jobs `index` needs.
    pub fn need_keys(&self, index: JobIndex) -> Vec<String> {
        self.needs(index)
            .iter()
            .map(|&i| self.nodes[i].key.clone())
            .collect()
    }

    /// Jobs with no needs; these start out `Waiting`.
    pub fn roots(&self) -> Vec<JobIndex> {
        self.needs
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }
}

/// Builder for constructing job graphs from a workflow.
pub struct WorkflowGraphBuilder<'a> {
    doc: &'a WorkflowDoc,
}

impl<'a> WorkflowGraphBuilder<'a> {
    pub fn new(doc: &'a WorkflowDoc) -> Self {
        Self { doc }
    }

    /// Build the job graph.
    ///
    /// This validates the graph structure:
    /// - All `needs` must reference jobs in the same workflow
    /// - Expanded keys must be unique
    /// - No cycles are allowed
    pub fn build(self) -> Result<JobGraph, GraphError> {
        if self.doc.jobs.is_empty() {
            return Err(GraphError::Empty);
        }

        // Expand every job; remember which expanded indices each base key owns.
        let mut nodes = Vec::new();
        let mut by_base: HashMap<&str, Vec<JobIndex>> = HashMap::new();
        for def in &self.doc.jobs {
            let combos = match &def.matrix {
                Some(m) => matrix::expand(&def.id, m)?,
                None => vec![Combination::new()],
            };
            let entry = by_base.entry(def.id.as_str()).or_default();
            for combo in combos {
                entry.push(nodes.len());
                nodes.push(expand_node(def, combo)?);
            }
        }

        let mut index_map = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            if index_map.insert(node.key.clone(), i).is_some() {
                return Err(GraphError::DuplicateJob(node.key.clone()));
            }
        }

        let mut needs: Vec<Vec<JobIndex>> = vec![Vec::new(); nodes.len()];
        let mut needed_by: Vec<Vec<JobIndex>> = vec![Vec::new(); nodes.len()];
        for def in &self.doc.jobs {
            for dep in &def.needs {
                let Some(from) = by_base.get(dep.as_str()) else {
                    return Err(GraphError::UnknownDependency {
                        job: def.id.clone(),
                        dependency: dep.clone(),
                    });
                };
                for &to in &by_base[def.id.as_str()] {
                    for &from_idx in from {
                        if !needs[to].contains(&from_idx) {
                            needs[to].push(from_idx);
                            needed_by[from_idx].push(to);
                        }
                    }
                }
            }
        }

        let mut graph = JobGraph {
            nodes,
            index_map,
            needs,
            needed_by,
        };
        Self::assign_depths(&mut graph)?;
        Ok(graph)
    }

    /// Kahn's algorithm: rejects cycles and records each node's depth.
    fn assign_depths(graph: &mut JobGraph) -> Result<(), GraphError> {
        let mut in_degree: Vec<usize> = graph.needs.iter().map(|deps| deps.len()).collect();
        let mut queue: Vec<JobIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;
        while let Some(node) = queue.pop() {
            processed += 1;
            let depth = graph.nodes[node].depth;
            for &dependent in &graph.needed_by[node] {
                let d = &mut graph.nodes[dependent].depth;
                *d = (*d).max(depth + 1);
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != graph.len() {
            let mut jobs: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| graph.nodes[i].base_key.clone())
                .collect();
            jobs.dedup();
            return Err(GraphError::Cycle { jobs });
        }
        Ok(())
    }
}

fn expand_node(def: &JobDef, combo: Combination) -> Result<JobNode, GraphError> {
    let base_name = def.name.clone().unwrap_or_else(|| def.id.clone());
    let name = if def.name.as_deref().is_some_and(|n| n.contains("matrix.")) {
        matrix::substitute(&base_name, &combo)
    } else {
        matrix::suffixed(&base_name, &combo)
    };
    let runs_on = def
        .runs_on
        .iter()
        .map(|l| matrix::substitute(l, &combo).to_lowercase())
        .collect();

    let mut raw = serde_json::to_value(&def.raw)
        .map_err(|e| GraphError::Parse(format!("job '{}': {}", def.id, e)))?;
    if !combo.is_empty() {
        if let Some(obj) = raw.as_object_mut() {
            obj.insert(
                "matrix".to_string(),
                serde_json::to_value(&combo).unwrap_or_default(),
            );
        }
    }

    Ok(JobNode {
        key: matrix::suffixed(&def.id, &combo),
        base_key: def.id.clone(),
        name,
        runs_on,
        if_expr: def.if_expr.clone(),
        runs_regardless: def.runs_regardless(),
        depth: 0,
        payload: raw.to_string(),
        matrix: combo,
    })
}

/// Parse and build in one step.
pub fn build_graph(content: &str) -> Result<(WorkflowDoc, JobGraph), GraphError> {
    let doc = WorkflowDoc::parse(content)?;
    let graph = WorkflowGraphBuilder::new(&doc).build()?;
    Ok((doc, graph))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow(jobs: &[(&str, &[&str])]) -> String {
        let mut yaml = String::from("on: push\njobs:\n");
        for (id, needs) in jobs {
            yaml.push_str(&format!("  {}:\n    runs-on: ubuntu-latest\n", id));
            if !needs.is_empty() {
                yaml.push_str(&format!("    needs: [{}]\n", needs.join(", ")));
            }
        }
        yaml
    }

    #[test]
    fn test_build_simple_graph() {
        let (_, graph) = build_graph(&workflow(&[
            ("job1", &[]),
            ("job2", &["job1"]),
            ("job3", &["job1"]),
            ("job4", &["job2", "job3"]),
        ]))
        .unwrap();

        assert_eq!(graph.len(), 4);
        assert_eq!(graph.roots(), vec![0]);
        assert_eq!(graph.node(3).unwrap().depth, 2);
        assert_eq!(graph.need_keys(3), vec!["job2", "job3"]);
    }

    #[test]
    fn test_needs_and_needed_by() {
        let (_, graph) = build_graph(&workflow(&[
            ("job1", &[]),
            ("job2", &["job1"]),
            ("job3", &["job1"]),
        ]))
        .unwrap();

        assert!(graph.needs(0).is_empty());
        assert_eq!(graph.needs(1), &[0]);
        assert_eq!(graph.needs(2), &[0]);
        let dependents = graph.needed_by(0);
        assert!(dependents.contains(&1));
        assert!(dependents.contains(&2));
    }

    #[test]
    fn test_cycle_detection() {
        let err = build_graph(&workflow(&[
            ("a", &["c"]),
            ("b", &["a"]),
            ("c", &["b"]),
        ]))
        .unwrap_err();
        match err {
            GraphError::Cycle { jobs } => assert_eq!(jobs.len(), 3),
            other => panic!("Expected Cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = build_graph(&workflow(&[("a", &["a"])])).unwrap_err();
        assert!(matches!(err, GraphError::Cycle { .. }));
    }

    #[test]
    fn test_unknown_dependency() {
        let err = build_graph(&workflow(&[("a", &["nonexistent"])])).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownDependency {
                job: "a".to_string(),
                dependency: "nonexistent".to_string()
            }
        );
    }

    #[test]
    fn test_empty_workflow() {
        let err = build_graph("on: push\njobs: {}\n").unwrap_err();
        assert_eq!(err, GraphError::Empty);
    }

    #[test]
    fn test_matrix_fan_in() {
        let yaml = r#"
on: push
jobs:
  build:
    runs-on: ${{ matrix.os }}
    strategy:
      matrix:
        os: [Ubuntu-Latest, windows-latest]
  publish:
    needs: build
    runs-on: ubuntu-latest
"#;
        let (_, graph) = build_graph(yaml).unwrap();
        assert_eq!(graph.len(), 3);

        let ubuntu = graph.index_of("build (Ubuntu-Latest)").unwrap();
        let windows = graph.index_of("build (windows-latest)").unwrap();
        assert_eq!(graph.node(ubuntu).unwrap().runs_on, vec!["ubuntu-latest"]);
        assert_eq!(graph.node(windows).unwrap().runs_on, vec!["windows-latest"]);

        let publish = graph.index_of("publish").unwrap();
        assert_eq!(graph.needs(publish).len(), 2);
        assert_eq!(graph.node(publish).unwrap().depth, 1);

        let payload: serde_json::Value =
            serde_json::from_str(&graph.node(windows).unwrap().payload).unwrap();
        assert_eq!(payload["matrix"]["os"], "windows-latest");
    }

    #[test]
    fn test_duplicate_expanded_key() {
        let yaml = r#"
on: push
jobs:
  "build (x)":
    runs-on: a
  build:
    runs-on: a
    strategy:
      matrix:
        v: [x]
"#;
        let err = build_graph(yaml).unwrap_err();
        assert_eq!(err, GraphError::DuplicateJob("build (x)".to_string()));
    }
}
