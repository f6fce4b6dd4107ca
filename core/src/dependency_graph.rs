use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use crate::artifact::Producer;
use crate::errors::PipelineError;
use crate::stage::{StageId, StageSet};

/// Stage dependency graph. Nodes keep their declaration index, which breaks
/// ties between independent stages.
#[derive(Debug, Clone, Default)]
pub struct PipelineGraph {
    stages: Vec<StageId>,
    index: HashMap<StageId, usize>,
    adjacency: Vec<BTreeSet<usize>>,
    in_degree: Vec<usize>,
}

impl PipelineGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an edge A -> B whenever B consumes an artifact produced by A.
    pub fn from_stage_set(set: &StageSet) -> Self {
        let mut graph = Self::new();

        for stage in set.stages() {
            graph.add_stage(stage.id.clone());
        }

        for stage in set.stages() {
            for input in &stage.inputs {
                if let Some(Producer::Stage(producer)) = set.producer(input) {
                    graph.add_dependency(producer, &stage.id);
                }
            }
        }

        graph
    }

    pub fn add_stage(&mut self, stage: StageId) -> usize {
        if let Some(&idx) = self.index.get(&stage) {
            return idx;
        }

        let idx = self.stages.len();
        self.index.insert(stage.clone(), idx);
        self.stages.push(stage);
        self.adjacency.push(BTreeSet::new());
        self.in_degree.push(0);
        idx
    }

    pub fn add_dependency(&mut self, from: &StageId, to: &StageId) {
        let from = self.add_stage(from.clone());
        let to = self.add_stage(to.clone());

        if self.adjacency[from].insert(to) {
            self.in_degree[to] += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stages(&self) -> &[StageId] {
        &self.stages
    }

    /// Kahn's algorithm; among ready stages the earliest declared goes first.
    pub fn topological_order(&self) -> Result<Vec<StageId>, PipelineError> {
        Ok(self
            .topological_indices()?
            .into_iter()
            .map(|idx| self.stages[idx].clone())
            .collect())
    }

    pub fn topological_indices(&self) -> Result<Vec<usize>, PipelineError> {
        let mut in_degree = self.in_degree.clone();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &degree)| degree == 0)
            .map(|(idx, _)| Reverse(idx))
            .collect();
        let mut order = Vec::with_capacity(self.stages.len());

        while let Some(Reverse(idx)) = ready.pop() {
            order.push(idx);
            for &dependent in &self.adjacency[idx] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        if order.len() != self.stages.len() {
            let remaining = in_degree
                .iter()
                .enumerate()
                .filter(|(_, &degree)| degree > 0)
                .map(|(idx, _)| self.stages[idx].to_string())
                .collect();
            return Err(PipelineError::CyclicDependency(remaining));
        }

        Ok(order)
    }

    /// Groups stages by dependency depth; stages in one layer are independent.
    pub fn layers(&self) -> Result<Vec<Vec<StageId>>, PipelineError> {
        let order = self.topological_indices()?;
        let mut depth = vec![0usize; self.stages.len()];
        let mut layers: Vec<Vec<usize>> = Vec::new();

        for &idx in &order {
            let level = depth[idx];
            if layers.len() <= level {
                layers.resize_with(level + 1, Vec::new);
            }
            layers[level].push(idx);

            for &dependent in &self.adjacency[idx] {
                depth[dependent] = depth[dependent].max(level + 1);
            }
        }

        Ok(layers
            .into_iter()
            .map(|mut layer| {
                layer.sort_unstable();
                layer
                    .into_iter()
                    .map(|idx| self.stages[idx].clone())
                    .collect()
            })
            .collect())
    }

    pub fn dependencies(&self, stage: &StageId) -> Vec<StageId> {
        let Some(&target) = self.index.get(stage) else {
            return Vec::new();
        };

        self.adjacency
            .iter()
            .enumerate()
            .filter(|(_, dependents)| dependents.contains(&target))
            .map(|(idx, _)| self.stages[idx].clone())
            .collect()
    }

    pub fn dependency_indices(&self, idx: usize) -> Vec<usize> {
        self.adjacency
            .iter()
            .enumerate()
            .filter(|(_, dependents)| dependents.contains(&idx))
            .map(|(from, _)| from)
            .collect()
    }

    pub fn dependents(&self, stage: &StageId) -> Vec<StageId> {
        self.index
            .get(stage)
            .map(|&idx| {
                self.adjacency[idx]
                    .iter()
                    .map(|&dependent| self.stages[dependent].clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}
