use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{ensure, Context as _, Result};
use cmdgraph::backend::spec::{BackendError, DeviceBackend};
use cmdgraph::graph::{CommandGraph, DependencyEdge, GraphError};
use cmdgraph::runtime::{Context, EventStatus, Queue};
use cmdgraph::{Kernel, RuntimeConfig, UsmPtr};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::recording_device::RecordingDevice;

pub(crate) fn context(backend: Arc<dyn DeviceBackend>) -> Context {
    Context::with_config(backend, RuntimeConfig::default())
}

/// Kernel storing `value` into every element of `ptr`.
pub(crate) fn set_kernel(name: &str, ptr: UsmPtr, value: i32) -> Kernel {
    Kernel::new(name.to_string(), move |ctx, item| {
        ctx.store(&ptr, item.linear_id(), value)
    })
}

/// Kernel adding `delta` to every element of `ptr`.
pub(crate) fn add_kernel(name: &str, ptr: UsmPtr, delta: i32) -> Kernel {
    Kernel::new(name.to_string(), move |ctx, item| {
        let current: i32 = ctx.load(&ptr, item.linear_id())?;
        ctx.store(&ptr, item.linear_id(), current + delta)
    })
}

fn scale_kernel(name: &str, ptr: UsmPtr, factor: i32) -> Kernel {
    Kernel::new(name.to_string(), move |ctx, item| {
        let current: i32 = ctx.load(&ptr, item.linear_id())?;
        ctx.store(&ptr, item.linear_id(), current * factor)
    })
}

/// memcpy(Y, X); Y *= 2; memcpy(Z, Y) recorded from an in-order queue, with initialization
/// recorded in an earlier session and unrelated work submitted between sessions.
pub fn usm_copy_in_order(backend: Arc<dyn DeviceBackend>) -> Result<()> {
    const N: usize = 10;
    let ctx = context(backend);
    let queue = Queue::in_order(&ctx);
    let graph = CommandGraph::new(&ctx);

    let x = ctx.malloc_device::<i32>(N)?;
    let y = ctx.malloc_device::<i32>(N)?;
    let z = ctx.malloc_device::<i32>(N)?;
    let bytes = (N * std::mem::size_of::<i32>()) as u64;

    for (name, ptr) in [("zero_x", x), ("zero_y", y), ("zero_z", z)] {
        let zero = set_kernel(name, ptr, 0);
        queue.submit(|cgh| {
            cgh.write(&ptr)?;
            cgh.parallel_for(N, &zero)
        })?;
    }

    graph.begin_recording(&queue)?;
    for (name, ptr, value) in [("init_x", x, 1), ("init_y", y, 2), ("init_z", z, 3)] {
        let init = set_kernel(name, ptr, value);
        queue.submit(|cgh| {
            cgh.write(&ptr)?;
            cgh.parallel_for(N, &init)
        })?;
    }
    graph.end_recording_on(&queue)?;

    for (name, ptr) in [("bump_x", x), ("bump_y", y), ("bump_z", z)] {
        let bump = add_kernel(name, ptr, 7);
        queue.submit(|cgh| {
            cgh.read_write(&ptr)?;
            cgh.parallel_for(N, &bump)
        })?;
    }

    graph.begin_recording(&queue)?;
    queue.memcpy(&y, &x, bytes)?;
    let double = scale_kernel("double_y", y, 2);
    queue.submit(|cgh| {
        cgh.read_write(&y)?;
        cgh.parallel_for(N, &double)
    })?;
    queue.memcpy(&z, &y, bytes)?;
    graph.end_recording()?;

    ensure!(graph.node_count() == 6, "expected 6 nodes, got {}", graph.node_count());
    ensure!(graph.session_count() == 2, "expected two recording sessions");

    let exec = graph.finalize()?;
    queue.submit_graph(&exec)?.wait()?;

    let output: Vec<i32> = queue.copy_to_host(&z)?;
    ensure!(output == vec![2; N], "unexpected Z contents {output:?}");

    for ptr in [x, y, z] {
        ctx.free(ptr)?;
    }
    Ok(())
}

pub fn operations_outside_recording_are_not_captured(backend: Arc<dyn DeviceBackend>) -> Result<()> {
    let ctx = context(backend);
    let queue = Queue::new(&ctx);
    let graph = CommandGraph::new(&ctx);
    let a = ctx.malloc_device::<i32>(4)?;
    let b = ctx.malloc_device::<i32>(4)?;

    let before = queue.fill(&a, 1i32, 4)?;
    ensure!(before.status() == EventStatus::Complete);

    let session = graph.begin_recording(&queue)?;
    let first = session.submit(|cgh| cgh.fill(&a, 2i32, 4))?;
    let second = queue.fill(&b, 3i32, 4)?;
    ensure!(second.status() == EventStatus::Recorded);
    session.end()?;

    let after = queue.fill(&b, 4i32, 4)?;
    ensure!(after.status() == EventStatus::Complete);

    ensure!(graph.node_count() == 2, "expected 2 captured nodes");
    let exec = graph.finalize()?;
    ensure!(exec.contains(first));
    ensure!(exec.node_count() == 2);

    // The capture left memory untouched until the graph runs.
    ensure!(queue.copy_to_host::<i32>(&a)? == vec![1; 4]);
    ensure!(queue.copy_to_host::<i32>(&b)? == vec![4; 4]);

    queue.submit_graph(&exec)?.wait()?;
    ensure!(queue.copy_to_host::<i32>(&a)? == vec![2; 4]);
    ensure!(queue.copy_to_host::<i32>(&b)? == vec![3; 4]);

    ctx.free(a)?;
    ctx.free(b)?;
    Ok(())
}

pub fn replay_is_idempotent(backend: Arc<dyn DeviceBackend>) -> Result<()> {
    const N: usize = 16;
    let ctx = context(backend);
    let queue = Queue::new(&ctx);
    let graph = CommandGraph::new(&ctx);
    let x = ctx.malloc_device::<i32>(N)?;
    let y = ctx.malloc_device::<i32>(N)?;
    let z = ctx.malloc_device::<i32>(N)?;
    let bytes = (N * std::mem::size_of::<i32>()) as u64;
    let input: Vec<i32> = (0..N as i32).collect();
    queue.copy_from_host(&x, &input)?;

    let session = graph.begin_recording(&queue)?;
    session.submit(|cgh| cgh.memcpy(&y, &x, bytes))?;
    let triple = scale_kernel("triple_y", y, 3);
    session.submit(|cgh| {
        cgh.read_write(&y)?;
        cgh.parallel_for(N, &triple)
    })?;
    session.submit(|cgh| cgh.memcpy(&z, &y, bytes))?;
    session.end()?;
    let exec = graph.finalize()?;

    let expected: Vec<i32> = input.iter().map(|v| v * 3).collect();
    for run in 0..3 {
        queue.submit_graph(&exec)?.wait()?;
        let output: Vec<i32> = queue.copy_to_host(&z)?;
        ensure!(output == expected, "run {run} produced {output:?}");
    }

    // Back-to-back submissions touch the same memory and must serialize.
    let first = queue.submit_graph(&exec)?;
    let second = queue.submit_graph(&exec)?;
    first.wait()?;
    second.wait()?;
    queue.wait()?;
    ensure!(queue.copy_to_host::<i32>(&z)? == expected);

    for ptr in [x, y, z] {
        ctx.free(ptr)?;
    }
    Ok(())
}

/// Kernel flagging `overlapped` when another instance is running at the same time.
fn exclusive_kernel(
    name: &str,
    ptr: UsmPtr,
    running: Arc<AtomicUsize>,
    overlapped: Arc<AtomicBool>,
) -> Kernel {
    Kernel::new(name.to_string(), move |ctx, _| {
        if running.fetch_add(1, Ordering::SeqCst) != 0 {
            overlapped.store(true, Ordering::SeqCst);
        }
        let current: i32 = ctx.load(&ptr, 0)?;
        thread::sleep(Duration::from_millis(1));
        let stored = ctx.store(&ptr, 0, current + 1);
        running.fetch_sub(1, Ordering::SeqCst);
        stored
    })
}

/// Several threads share one queue. Graph runs and immediate submissions must never overlap on an
/// in-order queue, and conflicting runs must never overlap on an out-of-order one.
pub fn concurrent_submitters_keep_queue_order(backend: Arc<dyn DeviceBackend>) -> Result<()> {
    const THREADS: usize = 4;
    const ROUNDS: usize = 8;
    let ctx = context(backend);
    let running = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicBool::new(false));

    // Disjoint counters: only the in-order property keeps these runs apart.
    let counters: Vec<UsmPtr> = (0..THREADS)
        .map(|_| ctx.malloc_shared::<i32>(1))
        .collect::<Result<_, _>>()?;
    let ordered = Queue::in_order(&ctx);
    let mut graphs = Vec::new();
    for (index, counter) in counters.iter().enumerate() {
        ordered.copy_from_host(counter, &[0i32])?;
        let bump = exclusive_kernel(
            &format!("bump_{index}"),
            *counter,
            running.clone(),
            overlapped.clone(),
        );
        let graph = CommandGraph::new(&ctx);
        let session = graph.begin_recording(&ordered)?;
        session.submit(|cgh| {
            cgh.read_write(counter)?;
            cgh.single_task(&bump)
        })?;
        session.end()?;
        graphs.push((graph.finalize()?, bump, *counter));
    }

    thread::scope(|scope| -> Result<()> {
        let workers: Vec<_> = graphs
            .iter()
            .map(|(exec, bump, counter)| {
                let queue = ordered.clone();
                scope.spawn(move || -> Result<()> {
                    for round in 0..ROUNDS {
                        if round % 2 == 0 {
                            queue.submit_graph(exec)?;
                        } else {
                            queue.submit(|cgh| {
                                cgh.read_write(counter)?;
                                cgh.single_task(bump)
                            })?;
                        }
                    }
                    Ok(())
                })
            })
            .collect();
        for worker in workers {
            worker
                .join()
                .map_err(|_| anyhow::anyhow!("submitting thread panicked"))??;
        }
        Ok(())
    })?;
    ordered.wait()?;
    ensure!(
        !overlapped.load(Ordering::SeqCst),
        "in-order submissions from different threads overlapped"
    );
    for counter in &counters {
        ensure!(ordered.copy_to_host::<i32>(counter)? == vec![ROUNDS as i32]);
    }

    // One shared counter: conflicting runs on an out-of-order queue.
    let shared = ctx.malloc_shared::<i32>(1)?;
    let unordered = Queue::new(&ctx);
    unordered.copy_from_host(&shared, &[0i32])?;
    let bump = exclusive_kernel("bump_shared", shared, running.clone(), overlapped.clone());
    let graph = CommandGraph::new(&ctx);
    let session = graph.begin_recording(&unordered)?;
    session.submit(|cgh| {
        cgh.read_write(&shared)?;
        cgh.single_task(&bump)
    })?;
    session.end()?;
    let exec = graph.finalize()?;

    thread::scope(|scope| -> Result<()> {
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let queue = unordered.clone();
                let exec = &exec;
                scope.spawn(move || -> Result<()> {
                    for _ in 0..ROUNDS {
                        queue.submit_graph(exec)?;
                    }
                    Ok(())
                })
            })
            .collect();
        for worker in workers {
            worker
                .join()
                .map_err(|_| anyhow::anyhow!("submitting thread panicked"))??;
        }
        Ok(())
    })?;
    unordered.wait()?;
    ensure!(
        !overlapped.load(Ordering::SeqCst),
        "conflicting graph runs overlapped"
    );
    let total: Vec<i32> = unordered.copy_to_host(&shared)?;
    ensure!(total == vec![(THREADS * ROUNDS) as i32], "lost updates: {total:?}");

    for ptr in counters.into_iter().chain([shared]) {
        ctx.free(ptr)?;
    }
    Ok(())
}

pub fn independent_operations_share_one_wave(backend: Arc<dyn DeviceBackend>) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(7);
    let ctx = context(backend);
    let queue = Queue::new(&ctx);
    let graph = CommandGraph::new(&ctx);

    let count = rng.gen_range(4..12);
    let mut targets = Vec::with_capacity(count);
    let session = graph.begin_recording(&queue)?;
    for _ in 0..count {
        let len = rng.gen_range(1..32);
        let value: i32 = rng.gen();
        let ptr = ctx.malloc_device::<i32>(len)?;
        session.submit(|cgh| cgh.fill(&ptr, value, len))?;
        targets.push((ptr, len, value));
    }
    session.end()?;

    ensure!(graph.edges().is_empty(), "independent fills must not be ordered");
    let exec = graph.finalize()?;
    ensure!(exec.waves().len() == 1, "expected one wave, got {:?}", exec.waves());
    ensure!(exec.waves()[0].len() == count);

    queue.submit_graph(&exec)?.wait()?;
    for (ptr, len, value) in targets {
        let data: Vec<i32> = queue.copy_to_host(&ptr)?;
        ensure!(data == vec![value; len]);
        ctx.free(ptr)?;
    }
    Ok(())
}

pub fn conflicting_operations_are_ordered(backend: Arc<dyn DeviceBackend>) -> Result<()> {
    let device = Arc::new(RecordingDevice::new(backend));
    let ctx = context(device.clone());
    let queue = Queue::new(&ctx);
    let graph = CommandGraph::new(&ctx);
    let a = ctx.malloc_device::<i32>(8)?;
    let b = ctx.malloc_device::<i32>(8)?;

    let produce = set_kernel("produce", a, 5);
    let consume = Kernel::new("consume", move |ctx, item| {
        let v: i32 = ctx.load(&a, item.linear_id())?;
        ctx.store(&b, item.linear_id(), v + 1)
    });

    let session = graph.begin_recording(&queue)?;
    let clear_b = session.submit(|cgh| cgh.fill(&b, 0i32, 8))?;
    let write_a = session.submit(|cgh| {
        cgh.write(&a)?;
        cgh.parallel_for(8, &produce)
    })?;
    let read_a = session.submit(|cgh| {
        cgh.read(&a)?;
        cgh.write(&b)?;
        cgh.parallel_for(8, &consume)
    })?;
    session.end()?;

    let edges = graph.edges();
    for edge in [
        DependencyEdge {
            predecessor: clear_b,
            successor: read_a,
        },
        DependencyEdge {
            predecessor: write_a,
            successor: read_a,
        },
    ] {
        ensure!(edges.contains(&edge), "missing edge {edge:?} in {edges:?}");
    }

    let exec = graph.finalize()?;
    device.clear();
    queue.submit_graph(&exec)?.wait()?;
    let executed = device.executed();
    let position = |label: &str| executed.iter().position(|entry| entry == label);
    let produce_at = position("kernel:produce").context("produce did not run")?;
    let consume_at = position("kernel:consume").context("consume did not run")?;
    ensure!(produce_at < consume_at, "execution order {executed:?}");
    ensure!(queue.copy_to_host::<i32>(&b)? == vec![6; 8]);

    ctx.free(a)?;
    ctx.free(b)?;
    Ok(())
}

/// Copies a 3x4 block between pitched allocations through a recorded 2D copy.
pub fn buffer_copy_2d(backend: Arc<dyn DeviceBackend>) -> Result<()> {
    const SRC_PITCH: usize = 8;
    const DST_PITCH: usize = 6;
    const WIDTH: usize = 4;
    const HEIGHT: usize = 3;
    let ctx = context(backend);
    let queue = Queue::new(&ctx);
    let graph = CommandGraph::new(&ctx);

    let src = ctx.malloc_device::<u8>(SRC_PITCH * HEIGHT)?;
    let dst = ctx.malloc_device::<u8>(DST_PITCH * HEIGHT)?;
    let pattern: Vec<u8> = (0..(SRC_PITCH * HEIGHT) as u8).collect();
    queue.copy_from_host(&src, &pattern)?;
    queue.fill(&dst, 0xffu8, DST_PITCH * HEIGHT)?.wait()?;

    graph.begin_recording(&queue)?;
    queue.memcpy_2d(
        &dst,
        DST_PITCH as u64,
        &src,
        SRC_PITCH as u64,
        WIDTH as u64,
        HEIGHT as u64,
    )?;
    graph.end_recording()?;

    let exec = graph.finalize()?;
    queue.submit_graph(&exec)?.wait()?;

    let output: Vec<u8> = queue.copy_to_host(&dst)?;
    for row in 0..HEIGHT {
        for col in 0..DST_PITCH {
            let actual = output[row * DST_PITCH + col];
            let expected = if col < WIDTH {
                pattern[row * SRC_PITCH + col]
            } else {
                0xff
            };
            ensure!(
                actual == expected,
                "row {row} col {col}: expected {expected}, got {actual}"
            );
        }
    }

    ctx.free(src)?;
    ctx.free(dst)?;
    Ok(())
}

pub fn recording_usage_errors(backend: Arc<dyn DeviceBackend>) -> Result<()> {
    let ctx = context(backend);
    let queue = Queue::new(&ctx);
    let other_queue = Queue::new(&ctx);
    let graph = CommandGraph::new(&ctx);
    let rival = CommandGraph::new(&ctx);

    ensure!(graph.end_recording() == Err(GraphError::NotRecording));

    let _session = graph.begin_recording(&queue)?;
    ensure!(matches!(
        graph.begin_recording(&queue),
        Err(GraphError::AlreadyRecording { .. })
    ));
    ensure!(matches!(
        graph.begin_recording(&other_queue),
        Err(GraphError::AlreadyRecording { .. })
    ));
    ensure!(matches!(
        rival.begin_recording(&queue),
        Err(GraphError::QueueBusy { .. })
    ));
    ensure!(matches!(
        graph.end_recording_on(&other_queue),
        Err(GraphError::QueueMismatch { .. })
    ));
    ensure!(graph.is_recording(), "failed calls must leave the state unchanged");

    let exec = rival.finalize()?;
    let err = queue
        .submit_graph(&exec)
        .err()
        .context("submitting a graph to a recording queue must fail")?;
    ensure!(matches!(
        err.downcast_ref::<GraphError>(),
        Some(GraphError::SubmitWhileRecording { .. })
    ));

    graph.end_recording_on(&queue)?;
    ensure!(!queue.is_recording());
    rival.begin_recording(&queue)?;
    rival.end_recording()?;
    Ok(())
}

pub fn device_failure_surfaces_on_wait(backend: Arc<dyn DeviceBackend>) -> Result<()> {
    let ctx = context(backend);
    let queue = Queue::new(&ctx);
    let graph = CommandGraph::new(&ctx);
    let small = ctx.malloc_device::<i32>(4)?;

    // Eight work items over a four-element allocation.
    let overrun = set_kernel("overrun", small, 1);
    let session = graph.begin_recording(&queue)?;
    session.submit(|cgh| {
        cgh.write(&small)?;
        cgh.parallel_for(8, &overrun)
    })?;
    session.end()?;

    let exec = graph.finalize()?;
    let event = queue.submit_graph(&exec)?;
    let err = event
        .wait()
        .err()
        .context("out-of-bounds store must fail the run")?;
    ensure!(event.status() == EventStatus::Failed);
    ensure!(matches!(
        err.downcast_ref::<BackendError>(),
        Some(BackendError::OutOfBounds { .. })
    ));
    ensure!(queue.wait().is_err(), "the failed run is reported once by the queue");
    queue.wait()?;

    let immediate = queue.submit(|cgh| {
        cgh.write(&small)?;
        cgh.parallel_for(8, &overrun)
    })?;
    ensure!(immediate.wait().is_err());

    ctx.free(small)?;
    Ok(())
}
