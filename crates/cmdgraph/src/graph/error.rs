use thiserror::Error;

use crate::backend::topology::TopologyError;
use crate::runtime::QueueId;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("graph is already recording queue {queue}")]
    AlreadyRecording { queue: QueueId },
    #[error("graph is not recording")]
    NotRecording,
    #[error("graph is recording queue {active}, not queue {requested}")]
    QueueMismatch { active: QueueId, requested: QueueId },
    #[error("queue {queue} is already being recorded by another graph")]
    QueueBusy { queue: QueueId },
    #[error("queue {queue} belongs to a different context than the graph")]
    ContextMismatch { queue: QueueId },
    #[error("cannot submit an executable graph to queue {queue} while it is being recorded")]
    SubmitWhileRecording { queue: QueueId },
    #[error("dependency cycle detected among {remaining} operation(s)")]
    CycleDetected { remaining: usize },
    #[error(transparent)]
    Topology(#[from] TopologyError),
}
