//! Wave schedule derived from the dependency DAG.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use smallvec::SmallVec;

use super::error::GraphError;
use super::operation::OperationId;

/// Level-by-level schedule: every node of wave `n` has all predecessors in waves `< n`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    waves: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl ExecutionPlan {
    /// Node indices grouped by wave, ascending within each wave.
    pub fn waves(&self) -> &[Vec<usize>] {
        &self.waves
    }

    /// A topological order of node indices.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn widest_wave(&self) -> usize {
        self.waves.iter().map(Vec::len).max().unwrap_or(0)
    }
}

/// Runs Kahn's algorithm over `nodes` (id plus predecessor ids) and groups nodes by depth.
pub fn build_plan(
    nodes: &[(OperationId, SmallVec<[OperationId; 4]>)],
) -> Result<ExecutionPlan, GraphError> {
    let index: HashMap<OperationId, usize> = nodes
        .iter()
        .enumerate()
        .map(|(position, (id, _))| (*id, position))
        .collect();

    let mut indegree = vec![0usize; nodes.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (position, (_, predecessors)) in nodes.iter().enumerate() {
        for predecessor in predecessors {
            if let Some(&from) = index.get(predecessor) {
                successors[from].push(position);
                indegree[position] += 1;
            }
        }
    }

    let mut level = vec![0usize; nodes.len()];
    let mut ready: VecDeque<usize> = (0..nodes.len())
        .filter(|&position| indegree[position] == 0)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(position) = ready.pop_front() {
        order.push(position);
        for &next in &successors[position] {
            level[next] = level[next].max(level[position] + 1);
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    if order.len() != nodes.len() {
        return Err(GraphError::CycleDetected {
            remaining: nodes.len() - order.len(),
        });
    }

    let depth = level.iter().copied().max().map_or(0, |max| max + 1);
    let mut waves = vec![Vec::new(); depth];
    for position in 0..nodes.len() {
        waves[level[position]].push(position);
    }
    Ok(ExecutionPlan { waves, order })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u64, predecessors: &[u64]) -> (OperationId, SmallVec<[OperationId; 4]>) {
        (
            OperationId(id),
            predecessors.iter().map(|p| OperationId(*p)).collect(),
        )
    }

    #[test]
    fn chain_yields_one_node_per_wave() {
        let plan = build_plan(&[node(1, &[]), node(2, &[1]), node(3, &[2])]).unwrap();
        assert_eq!(plan.waves(), &[vec![0], vec![1], vec![2]]);
        assert_eq!(plan.order(), &[0, 1, 2]);
    }

    #[test]
    fn independent_nodes_share_a_wave() {
        let plan = build_plan(&[node(1, &[]), node(2, &[]), node(3, &[]), node(4, &[1, 3])])
            .unwrap();
        assert_eq!(plan.waves(), &[vec![0, 1, 2], vec![3]]);
        assert_eq!(plan.widest_wave(), 3);
    }

    #[test]
    fn diamond_respects_longest_path() {
        let plan = build_plan(&[
            node(1, &[]),
            node(2, &[1]),
            node(3, &[1]),
            node(4, &[2]),
            node(5, &[3, 4]),
        ])
        .unwrap();
        assert_eq!(plan.waves(), &[vec![0], vec![1, 2], vec![3], vec![4]]);
    }

    #[test]
    fn cycles_are_reported() {
        let err = build_plan(&[node(1, &[2]), node(2, &[1]), node(3, &[])]).unwrap_err();
        assert_eq!(err, GraphError::CycleDetected { remaining: 2 });
    }

    #[test]
    fn empty_graph_has_no_waves() {
        let plan = build_plan(&[]).unwrap();
        assert!(plan.waves().is_empty());
    }
}
