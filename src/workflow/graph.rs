//! Dependency graph for step execution ordering.

use std::collections::{HashMap, HashSet};

use crate::error::{OpsctlError, Result};

/// Dependency relationships between workflow steps.
///
/// Declaration order is preserved so that [`ready`](Self::ready) and
/// [`layers`](Self::layers) produce stable output for equal-priority steps.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Step names in declaration order.
    order: Vec<String>,
    /// Map of step name to its direct dependencies.
    dependencies: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    /// Create a new dependency graph builder.
    pub fn builder() -> DependencyGraphBuilder {
        DependencyGraphBuilder::default()
    }

    /// Get the direct dependencies of a step.
    pub fn dependencies_of(&self, step: &str) -> Option<&HashSet<String>> {
        self.dependencies.get(step)
    }

    /// All step names in declaration order.
    pub fn steps(&self) -> &[String] {
        &self.order
    }

    /// Get the number of steps in the graph.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Steps whose predecessors are all in `completed` and which are not
    /// themselves in `completed`, in declaration order.
    pub fn ready(&self, completed: &HashSet<String>) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| !completed.contains(*name))
            .filter(|name| {
                self.dependencies
                    .get(*name)
                    .map_or(true, |deps| deps.iter().all(|d| completed.contains(d)))
            })
            .cloned()
            .collect()
    }

    /// Topological layering: layer `i + 1` contains only steps whose
    /// predecessors all lie in layers `0..=i`.
    ///
    /// Kahn's algorithm; ties broken by declaration order so output is
    /// deterministic. Returns an error if the graph has a cycle.
    pub fn layers(&self) -> Result<Vec<Vec<String>>> {
        if let Some(cycle) = self.find_cycle() {
            return Err(OpsctlError::CircularDependency {
                cycle: cycle.join(" -> "),
            });
        }

        let mut layers: Vec<Vec<String>> = Vec::new();
        let mut completed: HashSet<String> = HashSet::new();

        while completed.len() < self.order.len() {
            let ready = self.ready(&completed);
            if ready.is_empty() {
                break;
            }
            completed.extend(ready.iter().cloned());
            layers.push(ready);
        }

        Ok(layers)
    }

    /// Find a cycle in the graph, returning the path if one exists.
    ///
    /// Depth-first search with color marking, driven iteratively: a node on
    /// the current trail is gray, a fully explored node is black, and an
    /// unmarked node is unvisited. A dependency edge that lands on a gray
    /// node closes a cycle; the returned path runs from that node along the
    /// trail and repeats it at the end.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Gray,
            Black,
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();

        for root in &self.order {
            if marks.contains_key(root.as_str()) {
                continue;
            }

            // each trail frame pairs a node with the dependencies it has
            // not yet explored
            let mut trail: Vec<(&str, Vec<&str>)> =
                vec![(root.as_str(), self.deps_to_visit(root))];
            marks.insert(root.as_str(), Mark::Gray);

            while !trail.is_empty() {
                let next = trail.last_mut().expect("trail is non-empty").1.pop();
                match next {
                    None => {
                        let (done, _) = trail.pop().expect("trail is non-empty");
                        marks.insert(done, Mark::Black);
                    }
                    Some(dep) => match marks.get(dep).copied() {
                        Some(Mark::Gray) => {
                            let mut cycle: Vec<String> = trail
                                .iter()
                                .skip_while(|(node, _)| *node != dep)
                                .map(|(node, _)| (*node).to_string())
                                .collect();
                            cycle.push(dep.to_string());
                            return Some(cycle);
                        }
                        Some(Mark::Black) => {}
                        None => {
                            marks.insert(dep, Mark::Gray);
                            trail.push((dep, self.deps_to_visit(dep)));
                        }
                    },
                }
            }
        }

        None
    }

    fn deps_to_visit(&self, node: &str) -> Vec<&str> {
        self.dependencies
            .get(node)
            .map(|deps| deps.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

/// Builder for constructing a [`DependencyGraph`].
#[derive(Debug, Default)]
pub struct DependencyGraphBuilder {
    order: Vec<String>,
    dependencies: HashMap<String, HashSet<String>>,
}

impl DependencyGraphBuilder {
    /// Add a step with its dependencies, preserving declaration order.
    pub fn add_step(mut self, name: impl Into<String>, depends_on: &[String]) -> Self {
        let name = name.into();
        if !self.dependencies.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.dependencies
            .entry(name)
            .or_default()
            .extend(depends_on.iter().cloned());
        self
    }

    /// Build the dependency graph.
    ///
    /// Rejects dependencies on undeclared steps, self-dependencies, and
    /// cyclic graphs.
    pub fn build(self) -> Result<DependencyGraph> {
        for (step, deps) in &self.dependencies {
            for dep in deps {
                if dep == step {
                    return Err(OpsctlError::CircularDependency {
                        cycle: format!("{step} -> {step}"),
                    });
                }
                if !self.dependencies.contains_key(dep) {
                    return Err(OpsctlError::UnknownDependency {
                        step: step.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let graph = DependencyGraph {
            order: self.order,
            dependencies: self.dependencies,
        };

        if let Some(cycle) = graph.find_cycle() {
            return Err(OpsctlError::CircularDependency {
                cycle: cycle.join(" -> "),
            });
        }

        Ok(graph)
    }
}
