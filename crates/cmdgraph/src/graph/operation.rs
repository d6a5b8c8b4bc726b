use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::kernel::{Kernel, NdRange};
use crate::memory::{AccessRecord, UsmPtr};
use crate::runtime::QueueId;
use crate::specialization::SpecializationConstantSet;

/// Context-unique identity of a submitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    KernelLaunch,
    MemoryCopy,
    MemoryCopy2d,
    Fill,
}

/// Device work carried by an operation, before image selection.
#[derive(Debug, Clone)]
pub enum Payload {
    Kernel {
        kernel: Kernel,
        range: NdRange,
        constants: SpecializationConstantSet,
    },
    Copy {
        src: UsmPtr,
        dst: UsmPtr,
        bytes: u64,
    },
    Copy2d {
        src: UsmPtr,
        src_pitch: u64,
        dst: UsmPtr,
        dst_pitch: u64,
        width: u64,
        height: u64,
    },
    Fill {
        dst: UsmPtr,
        pattern: SmallVec<[u8; 16]>,
        bytes: u64,
    },
}

impl Payload {
    pub fn kind(&self) -> OperationKind {
        match self {
            Payload::Kernel { .. } => OperationKind::KernelLaunch,
            Payload::Copy { .. } => OperationKind::MemoryCopy,
            Payload::Copy2d { .. } => OperationKind::MemoryCopy2d,
            Payload::Fill { .. } => OperationKind::Fill,
        }
    }
}

/// One recorded unit of device work. Immutable after creation.
#[derive(Debug, Clone)]
pub struct Operation {
    id: OperationId,
    queue: QueueId,
    payload: Payload,
    accesses: SmallVec<[AccessRecord; 4]>,
}

impl Operation {
    pub(crate) fn new(
        id: OperationId,
        queue: QueueId,
        payload: Payload,
        accesses: SmallVec<[AccessRecord; 4]>,
    ) -> Self {
        Self {
            id,
            queue,
            payload,
            accesses,
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn queue(&self) -> QueueId {
        self.queue
    }

    pub fn kind(&self) -> OperationKind {
        self.payload.kind()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn accesses(&self) -> &[AccessRecord] {
        &self.accesses
    }

    pub fn label(&self) -> String {
        match &self.payload {
            Payload::Kernel { kernel, .. } => format!("{} kernel {}", self.id, kernel.name()),
            Payload::Copy { bytes, .. } => format!("{} memcpy {bytes}B", self.id),
            Payload::Copy2d { width, height, .. } => {
                format!("{} memcpy_2d {width}x{height}", self.id)
            }
            Payload::Fill { bytes, .. } => format!("{} fill {bytes}B", self.id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub predecessor: OperationId,
    pub successor: OperationId,
}
