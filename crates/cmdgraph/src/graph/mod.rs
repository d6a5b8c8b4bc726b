//! Graph recording, dependency inference and finalization.

mod error;
mod executable;
mod operation;
mod plan;
mod recorder;
pub mod tracker;

pub use error::GraphError;
pub use executable::{ExecutableGraph, ExecutableSummary, NodeSummary};
pub use operation::{DependencyEdge, Operation, OperationId, OperationKind, Payload};
pub use plan::{build_plan, ExecutionPlan};
pub use recorder::{CommandGraph, RecorderState, RecordingSession};

pub(crate) use recorder::GraphShared;
