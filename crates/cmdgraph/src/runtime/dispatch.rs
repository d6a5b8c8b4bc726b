//! Lowering of recorded payloads into device commands and their dispatch on a backend.

use crate::backend::spec::{
    BackendError, BackendResult, ConstantArgument, DeviceCommand, KernelLaunch,
};
use crate::graph::Payload;
use crate::kernel::{Kernel, NdRange};
use crate::memory::{MemoryError, Placement, UsmPtr};
use crate::specialization::{ConstantBinding, Selection, SelectionError};

use super::context::Context;

/// Argument index of the specialization-constant buffer in every kernel signature.
pub const SPEC_CONST_ARG_INDEX: u32 = 0;

/// Payload with its image already chosen; constant buffers are materialized per dispatch.
#[derive(Debug, Clone)]
pub(crate) enum LoweredCommand {
    Direct(DeviceCommand),
    Kernel {
        kernel: Kernel,
        range: NdRange,
        selection: Selection,
    },
}

impl LoweredCommand {
    pub(crate) fn image_id(&self) -> Option<&str> {
        match self {
            LoweredCommand::Kernel { selection, .. } => Some(&selection.image.image_id),
            LoweredCommand::Direct(_) => None,
        }
    }
}

pub(crate) fn lower(context: &Context, payload: &Payload) -> Result<LoweredCommand, SelectionError> {
    let command = match payload {
        Payload::Kernel {
            kernel,
            range,
            constants,
        } => LoweredCommand::Kernel {
            kernel: kernel.clone(),
            range: *range,
            selection: context.selector().select(kernel, constants)?,
        },
        Payload::Copy { src, dst, bytes } => LoweredCommand::Direct(DeviceCommand::Copy {
            src: *src,
            dst: *dst,
            bytes: *bytes,
        }),
        Payload::Copy2d {
            src,
            src_pitch,
            dst,
            dst_pitch,
            width,
            height,
        } => LoweredCommand::Direct(DeviceCommand::Copy2d {
            src: *src,
            src_pitch: *src_pitch,
            dst: *dst,
            dst_pitch: *dst_pitch,
            width: *width,
            height: *height,
        }),
        Payload::Fill {
            dst,
            pattern,
            bytes,
        } => LoweredCommand::Direct(DeviceCommand::Fill {
            dst: *dst,
            pattern: pattern.clone(),
            bytes: *bytes,
        }),
    };
    Ok(command)
}

fn memory_error(err: MemoryError) -> BackendError {
    match err {
        MemoryError::Backend(err) => err,
        other => BackendError::execution(other.to_string()),
    }
}

fn address(context: &Context, ptr: &UsmPtr) -> String {
    format!("{:#x}", context.backend().device_address(ptr))
}

pub(crate) fn dispatch(context: &Context, command: &LoweredCommand) -> BackendResult<()> {
    match command {
        LoweredCommand::Direct(command) => dispatch_direct(context, command),
        LoweredCommand::Kernel {
            kernel,
            range,
            selection,
        } => dispatch_kernel(context, kernel, *range, selection),
    }
}

fn dispatch_direct(context: &Context, command: &DeviceCommand) -> BackendResult<()> {
    let result = context.backend().execute(command);
    let trace = context.api_trace();
    if trace.is_enabled() {
        let (name, args) = match command {
            DeviceCommand::Copy { src, dst, bytes } => (
                "enqueue_memcpy",
                vec![address(context, dst), address(context, src), bytes.to_string()],
            ),
            DeviceCommand::Copy2d {
                src,
                src_pitch,
                dst,
                dst_pitch,
                width,
                height,
            } => (
                "enqueue_memcpy_2d",
                vec![
                    address(context, dst),
                    dst_pitch.to_string(),
                    address(context, src),
                    src_pitch.to_string(),
                    width.to_string(),
                    height.to_string(),
                ],
            ),
            DeviceCommand::Fill {
                dst,
                pattern,
                bytes,
            } => (
                "enqueue_fill",
                vec![
                    address(context, dst),
                    pattern.len().to_string(),
                    bytes.to_string(),
                ],
            ),
            DeviceCommand::Kernel(launch) => (
                "enqueue_kernel_launch",
                vec![launch.kernel.name().to_string()],
            ),
        };
        trace.record(name, args, &result);
    }
    result
}

fn dispatch_kernel(
    context: &Context,
    kernel: &Kernel,
    range: NdRange,
    selection: &Selection,
) -> BackendResult<()> {
    let trace = context.api_trace();
    let (constants, scratch) = match &selection.binding {
        ConstantBinding::Unused => (ConstantArgument::Unused, None),
        ConstantBinding::Null => {
            trace.record::<()>(
                "kernel_set_arg_mem_obj",
                vec![
                    kernel.name().to_string(),
                    SPEC_CONST_ARG_INDEX.to_string(),
                    "0".to_string(),
                    "0".to_string(),
                ],
                &Ok(()),
            );
            (ConstantArgument::Null, None)
        }
        ConstantBinding::Buffer { layout, bytes } => {
            let allocator = context.allocator();
            let ptr = allocator
                .allocate(bytes.len() as u64, Placement::Device)
                .map_err(memory_error)?;
            if let Err(err) = allocator.write_elements(&ptr, bytes) {
                let _ = allocator.free(ptr);
                return Err(memory_error(err));
            }
            trace.record::<()>(
                "kernel_set_arg_mem_obj",
                vec![
                    kernel.name().to_string(),
                    SPEC_CONST_ARG_INDEX.to_string(),
                    bytes.len().to_string(),
                    address(context, &ptr),
                ],
                &Ok(()),
            );
            (
                ConstantArgument::Buffer {
                    ptr,
                    layout: layout.clone(),
                },
                Some(ptr),
            )
        }
    };

    let launch = KernelLaunch {
        kernel: kernel.clone(),
        range,
        image: selection.image.clone(),
        constants,
    };
    let result = context.backend().execute(&DeviceCommand::Kernel(launch));
    trace.record(
        "enqueue_kernel_launch",
        vec![
            kernel.name().to_string(),
            selection.image.image_id.clone(),
            range.len().to_string(),
        ],
        &result,
    );

    let freed = match scratch {
        Some(ptr) => context.allocator().free(ptr).map_err(memory_error),
        None => Ok(()),
    };
    result.and(freed)
}
