use std::fmt;
use std::mem::size_of;
use std::sync::Arc;

use bytemuck::Pod;
use serde::{Deserialize, Serialize};

use crate::backend::hashing::Fingerprint;
use crate::backend::spec::{BackendError, BackendResult, ConstantArgument, DeviceMemory, KernelLaunch};
use crate::memory::UsmPtr;
use crate::specialization::{ConstantDecl, SpecConstType, SpecConstValue, SpecializationId};

use super::atomic::{self, AtomicElement, AtomicOp};

type KernelBody = dyn Fn(&KernelContext<'_>, WorkItem) -> BackendResult<()> + Send + Sync;

/// Device kernel: a name, the specialization constants it references and a body invoked once
/// per work item.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

struct KernelInner {
    name: Arc<str>,
    constants: Vec<ConstantDecl>,
    body: Box<KernelBody>,
}

impl Kernel {
    pub fn new<F>(name: impl Into<Arc<str>>, body: F) -> Self
    where
        F: Fn(&KernelContext<'_>, WorkItem) -> BackendResult<()> + Send + Sync + 'static,
    {
        Self::with_constants(name, Vec::new(), body)
    }

    /// Creates a kernel that references `constants`; duplicate ids keep the first declaration.
    pub fn with_constants<F>(
        name: impl Into<Arc<str>>,
        constants: impl IntoIterator<Item = ConstantDecl>,
        body: F,
    ) -> Self
    where
        F: Fn(&KernelContext<'_>, WorkItem) -> BackendResult<()> + Send + Sync + 'static,
    {
        let mut decls: Vec<ConstantDecl> = Vec::new();
        for decl in constants {
            if !decls.iter().any(|existing| existing.id == decl.id) {
                decls.push(decl);
            }
        }
        Self {
            inner: Arc::new(KernelInner {
                name: name.into(),
                constants: decls,
                body: Box::new(body),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn constants(&self) -> &[ConstantDecl] {
        &self.inner.constants
    }

    pub fn references_constants(&self) -> bool {
        !self.inner.constants.is_empty()
    }

    pub fn fingerprint(&self) -> u64 {
        self.inner
            .constants
            .iter()
            .fold(Fingerprint::new().write_str(&self.inner.name), |fp, decl| {
                fp.write_u64(decl.id as u64)
                    .write_bytes(&decl.default.to_slot())
            })
            .finish()
    }

    pub fn invoke(&self, ctx: &KernelContext<'_>, item: WorkItem) -> BackendResult<()> {
        (self.inner.body)(ctx, item)
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.inner.name)
            .field("constants", &self.inner.constants)
            .finish()
    }
}

/// Iteration space of a launch, up to three dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NdRange {
    extents: [usize; 3],
    dims: u8,
}

impl NdRange {
    pub fn d1(x: usize) -> Self {
        Self {
            extents: [x, 1, 1],
            dims: 1,
        }
    }

    pub fn d2(x: usize, y: usize) -> Self {
        Self {
            extents: [x, y, 1],
            dims: 2,
        }
    }

    pub fn d3(x: usize, y: usize, z: usize) -> Self {
        Self {
            extents: [x, y, z],
            dims: 3,
        }
    }

    pub fn single() -> Self {
        Self::d1(1)
    }

    pub fn dims(&self) -> usize {
        self.dims as usize
    }

    pub fn extent(&self, dim: usize) -> usize {
        self.extents.get(dim).copied().unwrap_or(1)
    }

    pub fn len(&self) -> usize {
        self.extents.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Work items in row-major order (last dimension fastest).
    pub fn iter(&self) -> impl Iterator<Item = WorkItem> {
        let extents = self.extents;
        (0..self.len()).map(move |linear| {
            let z = linear % extents[2];
            let y = (linear / extents[2]) % extents[1];
            let x = linear / (extents[1] * extents[2]);
            WorkItem {
                index: [x, y, z],
                linear,
            }
        })
    }
}

impl From<usize> for NdRange {
    fn from(x: usize) -> Self {
        NdRange::d1(x)
    }
}

impl From<(usize, usize)> for NdRange {
    fn from((x, y): (usize, usize)) -> Self {
        NdRange::d2(x, y)
    }
}

impl From<(usize, usize, usize)> for NdRange {
    fn from((x, y, z): (usize, usize, usize)) -> Self {
        NdRange::d3(x, y, z)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    index: [usize; 3],
    linear: usize,
}

impl WorkItem {
    pub fn id(&self, dim: usize) -> usize {
        self.index.get(dim).copied().unwrap_or(0)
    }

    pub fn linear_id(&self) -> usize {
        self.linear
    }
}

/// Device-side view handed to a kernel body for the duration of one launch.
pub struct KernelContext<'a> {
    memory: &'a dyn DeviceMemory,
    launch: &'a KernelLaunch,
}

impl<'a> KernelContext<'a> {
    pub fn new(memory: &'a dyn DeviceMemory, launch: &'a KernelLaunch) -> Self {
        Self { memory, launch }
    }

    pub fn range(&self) -> NdRange {
        self.launch.range
    }

    pub fn image_id(&self) -> &str {
        &self.launch.image.image_id
    }

    fn element_offset(ptr: &UsmPtr, index: usize, size: usize) -> BackendResult<u64> {
        let start = (index as u64).checked_mul(size as u64);
        match start {
            Some(start) if start < ptr.byte_len() && ptr.byte_len() - start >= size as u64 => {
                Ok(ptr.offset() + start)
            }
            _ => Err(BackendError::out_of_bounds(
                ptr.id(),
                ptr.offset().saturating_add(start.unwrap_or(u64::MAX)),
                size as u64,
                ptr.offset() + ptr.byte_len(),
            )),
        }
    }

    pub fn load<T: Pod>(&self, ptr: &UsmPtr, index: usize) -> BackendResult<T> {
        let offset = Self::element_offset(ptr, index, size_of::<T>())?;
        let mut value = T::zeroed();
        self.memory
            .read_bytes(ptr.id(), offset, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    pub fn store<T: Pod>(&self, ptr: &UsmPtr, index: usize, value: T) -> BackendResult<()> {
        let offset = Self::element_offset(ptr, index, size_of::<T>())?;
        self.memory
            .write_bytes(ptr.id(), offset, bytemuck::bytes_of(&value))
    }

    /// Atomically applies `op` to element `index` and returns the previous value.
    pub fn atomic_update<T: AtomicElement>(
        &self,
        ptr: &UsmPtr,
        index: usize,
        op: AtomicOp,
        operands: &[T],
    ) -> BackendResult<T> {
        atomic::validate(op, T::KIND, operands.len())
            .map_err(|err| BackendError::execution(err.to_string()))?;
        let offset = Self::element_offset(ptr, index, size_of::<T>())?;
        let bits: Vec<u32> = operands.iter().map(|value| value.to_bits()).collect();
        let old = self.memory.atomic_update(ptr.id(), offset, &mut |current| {
            atomic::apply(op, T::KIND, current, &bits)
                .map_err(|err| BackendError::execution(err.to_string()))
        })?;
        Ok(T::from_bits(old))
    }

    /// Reads the value of a specialization constant as bound for this launch.
    pub fn spec_constant<T: SpecConstType>(&self, id: &SpecializationId<T>) -> BackendResult<T> {
        let value = match &self.launch.constants {
            ConstantArgument::Unused => {
                return Err(BackendError::execution(format!(
                    "kernel {} does not reference specialization constant {}",
                    self.launch.kernel.name(),
                    id.id()
                )))
            }
            ConstantArgument::Null => self
                .launch
                .image
                .constant(id.id())
                .map(|decl| decl.default)
                .ok_or_else(|| {
                    BackendError::execution(format!(
                        "image {} has no baked value for constant {}",
                        self.launch.image.image_id,
                        id.id()
                    ))
                })?,
            ConstantArgument::Buffer { ptr, layout } => {
                let slot = layout.slot(id.id()).ok_or_else(|| {
                    BackendError::execution(format!(
                        "constant buffer has no slot for constant {}",
                        id.id()
                    ))
                })?;
                let mut raw = [0u8; 8];
                self.memory
                    .read_bytes(ptr.id(), ptr.offset() + slot.offset, &mut raw)?;
                SpecConstValue::from_slot(slot.kind, raw)
            }
        };
        T::from_value(value).ok_or_else(|| {
            BackendError::execution(format!(
                "constant {} holds {:?}, requested {:?}",
                id.id(),
                value.kind(),
                T::KIND
            ))
        })
    }
}
