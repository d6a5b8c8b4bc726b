//! Command graph recording.
//!
//! A [`CommandGraph`] is `Idle` until [`CommandGraph::begin_recording`] attaches it to a queue.
//! While attached, every command group submitted on that queue (or through the returned
//! [`RecordingSession`]) is captured as a node instead of executing. Several sessions may append
//! to the same graph; dependency tracking always runs against the full node history.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use serde::Serialize;
use smallvec::SmallVec;

use crate::backend::topology::validate_graph_topology;
use crate::runtime::dispatch::lower;
use crate::runtime::{CommandGroupHandler, Context, Queue, QueueId};

use super::error::GraphError;
use super::executable::{ExecutableGraph, ExecutableNode};
use super::operation::{DependencyEdge, Operation, OperationId};
use super::plan::build_plan;
use super::tracker::track;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecorderState {
    Idle,
    Recording { queue: QueueId },
}

#[derive(Default)]
struct GraphState {
    active: Option<Queue>,
    operations: Vec<Arc<Operation>>,
    predecessors: Vec<SmallVec<[OperationId; 4]>>,
    last_in_order: HashMap<QueueId, OperationId>,
    sessions: usize,
}

pub(crate) struct GraphShared {
    context: Context,
    state: Mutex<GraphState>,
}

impl GraphShared {
    /// Appends `operation` as a node, inferring its predecessors.
    pub(crate) fn capture(&self, operation: Operation) -> Result<OperationId, GraphError> {
        let mut state = self.state.lock().expect("graph state poisoned");
        let active = state.active.as_ref().ok_or(GraphError::NotRecording)?;
        if active.id() != operation.queue() {
            return Err(GraphError::QueueMismatch {
                active: active.id(),
                requested: operation.queue(),
            });
        }
        let in_order = active.is_in_order();

        let mut predecessors = track(&operation, &state.operations);
        if in_order {
            if let Some(previous) = state.last_in_order.get(&operation.queue()) {
                predecessors.push(*previous);
                predecessors.sort();
                predecessors.dedup();
            }
            state.last_in_order.insert(operation.queue(), operation.id());
        }

        let id = operation.id();
        log::debug!(
            "captured {} with {} predecessor(s)",
            operation.label(),
            predecessors.len()
        );
        state.operations.push(Arc::new(operation));
        state.predecessors.push(predecessors);
        Ok(id)
    }
}

/// Mutable graph of recorded device operations.
#[derive(Clone)]
pub struct CommandGraph {
    shared: Arc<GraphShared>,
}

impl CommandGraph {
    pub fn new(context: &Context) -> Self {
        Self {
            shared: Arc::new(GraphShared {
                context: context.clone(),
                state: Mutex::new(GraphState::default()),
            }),
        }
    }

    pub fn context(&self) -> &Context {
        &self.shared.context
    }

    pub fn begin_recording(&self, queue: &Queue) -> Result<RecordingSession, GraphError> {
        let mut state = self.shared.state.lock().expect("graph state poisoned");
        if let Some(active) = &state.active {
            return Err(GraphError::AlreadyRecording { queue: active.id() });
        }
        if !queue.context().same_as(&self.shared.context) {
            return Err(GraphError::ContextMismatch { queue: queue.id() });
        }
        queue.attach_recording(&self.shared)?;
        state.active = Some(queue.clone());
        state.sessions += 1;
        log::debug!(
            "recording session {} started on queue {}",
            state.sessions,
            queue.id()
        );
        Ok(RecordingSession {
            graph: self.clone(),
            queue: queue.clone(),
        })
    }

    /// Ends the active session, whichever queue it records.
    pub fn end_recording(&self) -> Result<(), GraphError> {
        let mut state = self.shared.state.lock().expect("graph state poisoned");
        finish_session(&mut state)
    }

    /// Ends the active session, which must have been started on `queue`.
    pub fn end_recording_on(&self, queue: &Queue) -> Result<(), GraphError> {
        let mut state = self.shared.state.lock().expect("graph state poisoned");
        match &state.active {
            Some(active) if active.id() != queue.id() => Err(GraphError::QueueMismatch {
                active: active.id(),
                requested: queue.id(),
            }),
            _ => finish_session(&mut state),
        }
    }

    pub fn state(&self) -> RecorderState {
        let state = self.shared.state.lock().expect("graph state poisoned");
        match &state.active {
            Some(queue) => RecorderState::Recording { queue: queue.id() },
            None => RecorderState::Idle,
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state(), RecorderState::Recording { .. })
    }

    pub fn session_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .expect("graph state poisoned")
            .sessions
    }

    pub fn node_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .expect("graph state poisoned")
            .operations
            .len()
    }

    /// Recorded operation ids in recording order.
    pub fn operation_ids(&self) -> Vec<OperationId> {
        self.shared
            .state
            .lock()
            .expect("graph state poisoned")
            .operations
            .iter()
            .map(|op| op.id())
            .collect()
    }

    pub fn operations(&self) -> Vec<Arc<Operation>> {
        self.shared
            .state
            .lock()
            .expect("graph state poisoned")
            .operations
            .clone()
    }

    pub fn edges(&self) -> Vec<DependencyEdge> {
        let state = self.shared.state.lock().expect("graph state poisoned");
        collect_edges(&state.operations, &state.predecessors)
    }

    /// Snapshots the graph into an executable; later recording does not affect the result.
    pub fn finalize(&self) -> Result<ExecutableGraph> {
        let (operations, predecessors) = {
            let state = self.shared.state.lock().expect("graph state poisoned");
            (state.operations.clone(), state.predecessors.clone())
        };

        validate_graph_topology(
            operations
                .iter()
                .zip(&predecessors)
                .map(|(op, preds)| (op.id(), preds.as_slice())),
        )
        .map_err(GraphError::from)?;

        let dag: Vec<(OperationId, SmallVec<[OperationId; 4]>)> = operations
            .iter()
            .zip(&predecessors)
            .map(|(op, preds)| (op.id(), preds.clone()))
            .collect();
        let plan = build_plan(&dag)?;

        let context = &self.shared.context;
        let mut nodes = Vec::with_capacity(operations.len());
        for (operation, preds) in operations.iter().zip(predecessors) {
            let command = lower(context, operation.payload())
                .with_context(|| format!("failed to lower {}", operation.label()))?;
            nodes.push(ExecutableNode::new(Arc::clone(operation), preds, command));
        }

        let executable = ExecutableGraph::new(context.clone(), nodes, plan);
        log::debug!(
            "finalized graph: {} node(s) in {} wave(s)",
            executable.node_count(),
            executable.wave_count()
        );
        Ok(executable)
    }
}

fn finish_session(state: &mut GraphState) -> Result<(), GraphError> {
    let queue = state.active.take().ok_or(GraphError::NotRecording)?;
    queue.detach_recording();
    log::debug!(
        "recording ended on queue {} with {} node(s)",
        queue.id(),
        state.operations.len()
    );
    Ok(())
}

pub(crate) fn collect_edges(
    operations: &[Arc<Operation>],
    predecessors: &[SmallVec<[OperationId; 4]>],
) -> Vec<DependencyEdge> {
    operations
        .iter()
        .zip(predecessors)
        .flat_map(|(op, preds)| {
            preds.iter().map(move |predecessor| DependencyEdge {
                predecessor: *predecessor,
                successor: op.id(),
            })
        })
        .collect()
}

/// Handle for one recording session; operations submitted through it are always captured.
pub struct RecordingSession {
    graph: CommandGraph,
    queue: Queue,
}

impl RecordingSession {
    pub fn graph(&self) -> &CommandGraph {
        &self.graph
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn submit<F>(&self, cgf: F) -> Result<OperationId>
    where
        F: FnOnce(&mut CommandGroupHandler<'_>) -> Result<()>,
    {
        let operation = self.queue.build_operation(cgf)?;
        Ok(self.graph.shared.capture(operation)?)
    }

    pub fn end(self) -> Result<(), GraphError> {
        self.graph.end_recording_on(&self.queue)
    }
}
