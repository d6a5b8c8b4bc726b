use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;
use smallvec::SmallVec;

use crate::backend::spec::BackendResult;
use crate::memory::AccessRecord;
use crate::runtime::dispatch::{dispatch, LoweredCommand};
use crate::runtime::Context;

use super::operation::{DependencyEdge, Operation, OperationId, OperationKind};
use super::plan::ExecutionPlan;
use super::recorder::collect_edges;

pub(crate) struct ExecutableNode {
    operation: Arc<Operation>,
    predecessors: SmallVec<[OperationId; 4]>,
    command: LoweredCommand,
}

impl ExecutableNode {
    pub(crate) fn new(
        operation: Arc<Operation>,
        predecessors: SmallVec<[OperationId; 4]>,
        command: LoweredCommand,
    ) -> Self {
        Self {
            operation,
            predecessors,
            command,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutableSummary {
    pub nodes: Vec<NodeSummary>,
    pub edges: Vec<DependencyEdge>,
    pub waves: Vec<Vec<OperationId>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub id: OperationId,
    pub kind: OperationKind,
    pub label: String,
    pub image: Option<String>,
}

struct ExecutableInner {
    context: Context,
    nodes: Vec<ExecutableNode>,
    plan: ExecutionPlan,
    accesses: Vec<AccessRecord>,
}

/// Finalized graph. Holds no state shared with its source graph and may be submitted any
/// number of times.
#[derive(Clone)]
pub struct ExecutableGraph {
    inner: Arc<ExecutableInner>,
}

impl ExecutableGraph {
    pub(crate) fn new(context: Context, nodes: Vec<ExecutableNode>, plan: ExecutionPlan) -> Self {
        let accesses = nodes
            .iter()
            .flat_map(|node| node.operation.accesses().iter().copied())
            .collect();
        Self {
            inner: Arc::new(ExecutableInner {
                context,
                nodes,
                plan,
                accesses,
            }),
        }
    }

    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    pub fn node_count(&self) -> usize {
        self.inner.nodes.len()
    }

    pub fn wave_count(&self) -> usize {
        self.inner.plan.waves().len()
    }

    pub fn operation_ids(&self) -> Vec<OperationId> {
        self.inner
            .nodes
            .iter()
            .map(|node| node.operation.id())
            .collect()
    }

    pub fn contains(&self, id: OperationId) -> bool {
        self.inner.nodes.iter().any(|node| node.operation.id() == id)
    }

    pub fn edges(&self) -> Vec<DependencyEdge> {
        let operations: Vec<Arc<Operation>> = self
            .inner
            .nodes
            .iter()
            .map(|node| Arc::clone(&node.operation))
            .collect();
        let predecessors: Vec<_> = self
            .inner
            .nodes
            .iter()
            .map(|node| node.predecessors.clone())
            .collect();
        collect_edges(&operations, &predecessors)
    }

    /// Operation ids grouped into the frozen wave schedule.
    pub fn waves(&self) -> Vec<Vec<OperationId>> {
        self.inner
            .plan
            .waves()
            .iter()
            .map(|wave| {
                wave.iter()
                    .map(|&index| self.inner.nodes[index].operation.id())
                    .collect()
            })
            .collect()
    }

    pub fn summary(&self) -> ExecutableSummary {
        let nodes = self
            .inner
            .nodes
            .iter()
            .map(|node| NodeSummary {
                id: node.operation.id(),
                kind: node.operation.kind(),
                label: node.operation.label(),
                image: node.command.image_id().map(str::to_string),
            })
            .collect();
        ExecutableSummary {
            nodes,
            edges: self.edges(),
            waves: self.waves(),
        }
    }

    pub(crate) fn accesses(&self) -> &[AccessRecord] {
        &self.inner.accesses
    }

    /// Executes every wave in order; stops at the first failing wave.
    pub(crate) fn run(&self) -> BackendResult<()> {
        let context = &self.inner.context;
        let parallel =
            context.config().parallel_waves && context.backend().supports_concurrent_execution();
        for wave in self.inner.plan.waves() {
            if parallel && wave.len() > 1 {
                wave.par_iter()
                    .try_for_each(|&index| dispatch(context, &self.inner.nodes[index].command))?;
            } else {
                for &index in wave {
                    dispatch(context, &self.inner.nodes[index].command)?;
                }
            }
        }
        Ok(())
    }
}
