use crate::kernel::Kernel;

use super::constants::{SpecConstType, SpecializationConstantSet, SpecializationId};

/// Set of kernels submitted together with their own specialization-constant values.
#[derive(Debug, Clone, Default)]
pub struct KernelBundle {
    kernels: Vec<String>,
    constants: SpecializationConstantSet,
}

impl KernelBundle {
    pub fn new(kernels: &[&Kernel]) -> Self {
        Self {
            kernels: kernels.iter().map(|k| k.name().to_string()).collect(),
            constants: SpecializationConstantSet::new(),
        }
    }

    pub fn contains(&self, kernel: &Kernel) -> bool {
        self.kernels.iter().any(|name| name == kernel.name())
    }

    pub fn kernel_names(&self) -> &[String] {
        &self.kernels
    }

    pub fn set_specialization_constant<T: SpecConstType>(
        &mut self,
        id: &SpecializationId<T>,
        value: T,
    ) {
        self.constants.set(id, value);
    }

    pub fn has_specialization_constant(&self, id: u32) -> bool {
        self.constants.is_set(id)
    }

    pub fn constants(&self) -> &SpecializationConstantSet {
        &self.constants
    }
}
