use std::sync::Arc;

use anyhow::{ensure, Context as _, Result};
use cmdgraph::backend::spec::{BackendError, DeviceBackend};
use cmdgraph::graph::CommandGraph;
use cmdgraph::runtime::Queue;
use cmdgraph::{AtomicOp, Kernel};

use crate::graph_scenarios::context;

const N: usize = 32;

pub fn dword_atomic_add_and_inc(backend: Arc<dyn DeviceBackend>) -> Result<()> {
    let ctx = context(backend);
    let queue = Queue::new(&ctx);
    let counters = ctx.malloc_shared::<u32>(2)?;
    let previous = ctx.malloc_shared::<u32>(N)?;
    queue.fill(&counters, 0u32, 2)?.wait()?;

    let kernel = Kernel::new("count", move |ctx, item| {
        let old = ctx.atomic_update(&counters, 0, AtomicOp::Add, &[3u32])?;
        ctx.atomic_update::<u32>(&counters, 1, AtomicOp::Inc, &[])?;
        ctx.store(&previous, item.linear_id(), old)
    });
    queue
        .submit(|cgh| {
            cgh.read_write(&counters)?;
            cgh.write(&previous)?;
            cgh.parallel_for(N, &kernel)
        })?
        .wait()?;

    let totals: Vec<u32> = queue.copy_to_host(&counters)?;
    ensure!(totals == vec![3 * N as u32, N as u32], "totals {totals:?}");
    let mut olds: Vec<u32> = queue.copy_to_host(&previous)?;
    olds.sort_unstable();
    let expected: Vec<u32> = (0..N as u32).map(|i| i * 3).collect();
    ensure!(olds == expected, "every add must observe a distinct prior value");

    ctx.free(counters)?;
    ctx.free(previous)?;
    Ok(())
}

/// Each work item swaps its own slot once; a second exchange with the stale expectation fails.
pub fn dword_atomic_cmpxchg(backend: Arc<dyn DeviceBackend>) -> Result<()> {
    let ctx = context(backend);
    let queue = Queue::new(&ctx);
    let graph = CommandGraph::new(&ctx);
    let data = ctx.malloc_device::<i32>(N)?;
    let observed = ctx.malloc_device::<i32>(2 * N)?;
    let initial: Vec<i32> = (0..N as i32).collect();
    queue.copy_from_host(&data, &initial)?;

    let kernel = Kernel::new("swap_once", move |ctx, item| {
        let i = item.linear_id();
        let expected = i as i32;
        let first = ctx.atomic_update(&data, i, AtomicOp::CmpXchg, &[expected, -expected - 1])?;
        let second = ctx.atomic_update(&data, i, AtomicOp::CmpXchg, &[expected, 1000])?;
        ctx.store(&observed, 2 * i, first)?;
        ctx.store(&observed, 2 * i + 1, second)
    });
    let session = graph.begin_recording(&queue)?;
    session.submit(|cgh| {
        cgh.read_write(&data)?;
        cgh.write(&observed)?;
        cgh.parallel_for(N, &kernel)
    })?;
    session.end()?;
    queue.submit_graph(&graph.finalize()?)?.wait()?;

    let swapped: Vec<i32> = queue.copy_to_host(&data)?;
    let returned: Vec<i32> = queue.copy_to_host(&observed)?;
    for i in 0..N {
        let replaced = -(i as i32) - 1;
        ensure!(swapped[i] == replaced, "slot {i} holds {}", swapped[i]);
        ensure!(returned[2 * i] == i as i32, "first exchange at {i} saw {}", returned[2 * i]);
        ensure!(returned[2 * i + 1] == replaced, "second exchange at {i} saw {}", returned[2 * i + 1]);
    }

    ctx.free(data)?;
    ctx.free(observed)?;
    Ok(())
}

pub fn dword_atomic_float_and_bitwise(backend: Arc<dyn DeviceBackend>) -> Result<()> {
    let ctx = context(backend);
    let queue = Queue::new(&ctx);
    let floats = ctx.malloc_shared::<f32>(3)?;
    let bits = ctx.malloc_shared::<u32>(2)?;
    queue.copy_from_host(&floats, &[0.0f32, f32::MAX, f32::MIN])?;
    queue.copy_from_host(&bits, &[0u32, u32::MAX])?;

    let kernel = Kernel::new("float_and_bits", move |ctx, item| {
        let i = item.linear_id();
        let sample = i as f32 - 8.0;
        ctx.atomic_update(&floats, 0, AtomicOp::FAdd, &[0.5f32])?;
        ctx.atomic_update(&floats, 1, AtomicOp::FMin, &[sample])?;
        ctx.atomic_update(&floats, 2, AtomicOp::FMax, &[sample])?;
        ctx.atomic_update(&bits, 0, AtomicOp::Or, &[1u32 << i])?;
        ctx.atomic_update(&bits, 1, AtomicOp::Xor, &[1u32 << i])?;
        Ok(())
    });
    queue
        .submit(|cgh| {
            cgh.read_write(&floats)?;
            cgh.read_write(&bits)?;
            cgh.parallel_for(N, &kernel)
        })?
        .wait()?;

    let float_result: Vec<f32> = queue.copy_to_host(&floats)?;
    ensure!(float_result[0] == N as f32 * 0.5, "fadd total {}", float_result[0]);
    ensure!(float_result[1] == -8.0, "fmin {}", float_result[1]);
    ensure!(float_result[2] == N as f32 - 9.0, "fmax {}", float_result[2]);
    let bit_result: Vec<u32> = queue.copy_to_host(&bits)?;
    ensure!(bit_result == vec![u32::MAX, 0], "bitwise results {bit_result:?}");

    ctx.free(floats)?;
    ctx.free(bits)?;
    Ok(())
}

/// Integer arithmetic on float elements and wrong operand counts fail the launch.
pub fn dword_atomic_invalid_use_fails(backend: Arc<dyn DeviceBackend>) -> Result<()> {
    let ctx = context(backend);
    let queue = Queue::new(&ctx);
    let value = ctx.malloc_shared::<f32>(1)?;
    let counter = ctx.malloc_shared::<u32>(1)?;

    let integer_add = Kernel::new("integer_add_on_float", move |ctx, _| {
        ctx.atomic_update(&value, 0, AtomicOp::Add, &[1.0f32])
            .map(|_| ())
    });
    let event = queue.submit(|cgh| {
        cgh.read_write(&value)?;
        cgh.single_task(&integer_add)
    })?;
    let err = event.wait().err().context("Add on f32 must fail")?;
    ensure!(matches!(
        err.downcast_ref::<BackendError>(),
        Some(BackendError::Execution { .. })
    ));

    let extra_operand = Kernel::new("inc_with_operand", move |ctx, _| {
        ctx.atomic_update(&counter, 0, AtomicOp::Inc, &[1u32])
            .map(|_| ())
    });
    let event = queue.submit(|cgh| {
        cgh.read_write(&counter)?;
        cgh.single_task(&extra_operand)
    })?;
    ensure!(event.wait().is_err(), "Inc takes no operands");
    ensure!(queue.copy_to_host::<u32>(&counter)? == vec![0]);

    ctx.free(value)?;
    ctx.free(counter)?;
    Ok(())
}
