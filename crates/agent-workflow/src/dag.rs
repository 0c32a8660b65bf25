//! Stage dependency graph
//!
//! Stages live in an arena indexed by their position in the input. Edges are
//! stored twice, as dependency lists and as dependent lists, so both the
//! topological sort and the cycle search are plain array walks.

use crate::error::{Result, WorkflowError};
use crate::stage::StageDefinition;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Validated, acyclic stage graph with a fixed execution order
#[derive(Debug, Clone)]
pub struct StageGraph {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl StageGraph {
    /// Build and validate the graph for `stages`
    ///
    /// Fails with `DuplicateStage`, `UnknownDependency` or `CyclicDependency`.
    pub fn build(stages: &[StageDefinition]) -> Result<Self> {
        let mut index = HashMap::with_capacity(stages.len());
        for (i, stage) in stages.iter().enumerate() {
            if index.insert(stage.stage_id.clone(), i).is_some() {
                return Err(WorkflowError::DuplicateStage(stage.stage_id.clone()));
            }
        }

        let mut dependencies = vec![Vec::new(); stages.len()];
        let mut dependents = vec![Vec::new(); stages.len()];
        for (i, stage) in stages.iter().enumerate() {
            for dependency in &stage.dependencies {
                let Some(&d) = index.get(dependency) else {
                    return Err(WorkflowError::UnknownDependency {
                        stage_id: stage.stage_id.clone(),
                        dependency: dependency.clone(),
                    });
                };
                if !dependencies[i].contains(&d) {
                    dependencies[i].push(d);
                    dependents[d].push(i);
                }
            }
        }

        let mut graph = Self {
            ids: stages.iter().map(|s| s.stage_id.clone()).collect(),
            index,
            dependencies,
            dependents,
            order: Vec::new(),
        };
        graph.order = graph.topological_order()?;
        Ok(graph)
    }

    /// Number of stages
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Arena index of a stage id
    pub fn index_of(&self, stage_id: &str) -> Option<usize> {
        self.index.get(stage_id).copied()
    }

    pub fn stage_id(&self, index: usize) -> Option<&str> {
        self.ids.get(index).map(String::as_str)
    }

    /// Stages that must finish before `index`
    pub fn dependencies(&self, index: usize) -> &[usize] {
        self.dependencies.get(index).map_or(&[], Vec::as_slice)
    }

    /// Stages waiting on `index`
    pub fn dependents(&self, index: usize) -> &[usize] {
        self.dependents.get(index).map_or(&[], Vec::as_slice)
    }

    /// Execution order as arena indices
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Execution order as stage ids
    pub fn ordered_ids(&self) -> Vec<String> {
        self.order.iter().map(|&i| self.ids[i].clone()).collect()
    }

    // Kahn's algorithm; ties go to the stage that came first in the input.
    fn topological_order(&self) -> Result<Vec<usize>> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &d)| d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);
            for &dependent in &self.dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        if order.len() == self.len() {
            Ok(order)
        } else {
            Err(WorkflowError::CyclicDependency {
                cycle: self.find_cycle(&in_degree),
            })
        }
    }

    // Every stage left with a non-zero in-degree has at least one dependency
    // that is also left, so following dependencies from any of them must
    // revisit a stage.
    fn find_cycle(&self, in_degree: &[usize]) -> Vec<String> {
        let remaining = |i: usize| in_degree[i] > 0;
        let Some(start) = (0..self.len()).find(|&i| remaining(i)) else {
            return Vec::new();
        };

        let mut position: HashMap<usize, usize> = HashMap::new();
        let mut path: Vec<usize> = Vec::new();
        let mut current = start;
        loop {
            if let Some(&at) = position.get(&current) {
                let mut cycle: Vec<String> =
                    path[at..].iter().map(|&i| self.ids[i].clone()).collect();
                cycle.push(self.ids[current].clone());
                // Walked dependent -> dependency; report in execution direction.
                cycle.reverse();
                return cycle;
            }
            position.insert(current, path.len());
            path.push(current);

            match self.dependencies[current].iter().find(|&&d| remaining(d)) {
                Some(&next) => current = next,
                None => return path.iter().map(|&i| self.ids[i].clone()).collect(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stage(id: &str, deps: &[&str]) -> StageDefinition {
        deps.iter()
            .fold(StageDefinition::new(id, "agent"), |s, d| s.depends_on(*d))
    }

    #[test]
    fn test_diamond_order() {
        let graph = StageGraph::build(&[
            stage("report", &["left", "right"]),
            stage("left", &["root"]),
            stage("right", &["root"]),
            stage("root", &[]),
        ])
        .unwrap();

        assert_eq!(graph.ordered_ids(), vec!["root", "left", "right", "report"]);
        assert_eq!(graph.dependents(3), &[1, 2]);
        assert_eq!(graph.dependencies(0), &[1, 2]);
    }

    #[test]
    fn test_ties_follow_input_order() {
        let graph = StageGraph::build(&[
            stage("c", &["a"]),
            stage("b", &["a"]),
            stage("a", &[]),
        ])
        .unwrap();
        assert_eq!(graph.ordered_ids(), vec!["a", "c", "b"]);
    }

    #[test]
    fn test_duplicate_stage() {
        let err = StageGraph::build(&[stage("a", &[]), stage("a", &[])]).unwrap_err();
        assert!(matches!(err, WorkflowError::DuplicateStage(id) if id == "a"));
    }

    #[test]
    fn test_unknown_dependency() {
        let err = StageGraph::build(&[stage("a", &["ghost"])]).unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::UnknownDependency { stage_id, dependency }
                if stage_id == "a" && dependency == "ghost"
        ));
    }

    #[test]
    fn test_two_cycle() {
        let err = StageGraph::build(&[stage("a", &["b"]), stage("b", &["a"])]).unwrap_err();
        match err {
            WorkflowError::CyclicDependency { cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_loop() {
        let err = StageGraph::build(&[stage("a", &[]), stage("b", &["b"])]).unwrap_err();
        assert!(matches!(err, WorkflowError::CyclicDependency { cycle } if cycle == ["b", "b"]));
    }

    #[test]
    fn test_cycle_reported_in_execution_direction() {
        // a -> b -> c -> a, plus an independent stage before it
        let err = StageGraph::build(&[
            stage("free", &[]),
            stage("a", &["c"]),
            stage("b", &["a"]),
            stage("c", &["b"]),
        ])
        .unwrap_err();
        assert!(
            matches!(err, WorkflowError::CyclicDependency { cycle } if cycle == ["a", "b", "c", "a"])
        );
    }

    #[test]
    fn test_repeated_dependency_counts_once() {
        let graph = StageGraph::build(&[stage("a", &[]), stage("b", &["a", "a"])]).unwrap();
        assert_eq!(graph.dependencies(1), &[0]);
        assert_eq!(graph.ordered_ids(), vec!["a", "b"]);
    }

    fn dag_strategy() -> impl Strategy<Value = Vec<StageDefinition>> {
        (1usize..12).prop_flat_map(|n| {
            proptest::collection::vec(proptest::collection::vec(any::<bool>(), n), n)
                .prop_map(move |edges| {
                    (0..n)
                        .map(|i| StageDefinition {
                            stage_id: format!("s{i}"),
                            agent_id: "agent".to_string(),
                            stage_config: Default::default(),
                            dependencies: (0..i)
                                .filter(|&j| edges[i][j])
                                .map(|j| format!("s{j}"))
                                .collect(),
                        })
                        .collect::<Vec<_>>()
                })
                .prop_shuffle()
        })
    }

    fn cycle_strategy() -> impl Strategy<Value = Vec<StageDefinition>> {
        (1usize..10)
            .prop_map(|n| {
                (0..n)
                    .map(|i| {
                        let previous = if i == 0 { n - 1 } else { i - 1 };
                        stage(&format!("s{i}"), &[format!("s{previous}").as_str()])
                    })
                    .collect::<Vec<_>>()
            })
            .prop_shuffle()
    }

    proptest! {
        #[test]
        fn prop_dag_order_is_topological(stages in dag_strategy()) {
            let graph = StageGraph::build(&stages).unwrap();
            let order = graph.ordered_ids();
            prop_assert_eq!(order.len(), stages.len());

            let position: HashMap<&str, usize> =
                order.iter().enumerate().map(|(p, id)| (id.as_str(), p)).collect();
            for stage in &stages {
                for dependency in &stage.dependencies {
                    prop_assert!(position[dependency.as_str()] < position[stage.stage_id.as_str()]);
                }
            }
        }

        #[test]
        fn prop_ring_is_cyclic(stages in cycle_strategy()) {
            let err = StageGraph::build(&stages).unwrap_err();
            let is_cycle = matches!(err, WorkflowError::CyclicDependency { .. });
            prop_assert!(is_cycle);
        }
    }
}
