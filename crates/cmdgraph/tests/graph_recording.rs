use std::sync::Arc;

use anyhow::Result;
use cmdgraph::graph::{CommandGraph, DependencyEdge, GraphError, RecorderState};
use cmdgraph::runtime::{Context, EventStatus, Queue};
use cmdgraph::{DeviceBackend, Kernel, RuntimeConfig};
use cmdgraph_backend_ref_cpu::CpuDevice;

fn context() -> Context {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend: Arc<dyn DeviceBackend> = Arc::new(CpuDevice::new());
    Context::with_config(backend, RuntimeConfig::default())
}

#[test]
fn recorder_moves_between_idle_and_recording() -> Result<()> {
    let ctx = context();
    let queue = Queue::new(&ctx);
    let graph = CommandGraph::new(&ctx);
    assert_eq!(graph.state(), RecorderState::Idle);
    assert!(!queue.is_recording());

    let session = graph.begin_recording(&queue)?;
    assert_eq!(graph.state(), RecorderState::Recording { queue: queue.id() });
    assert!(queue.is_recording());
    assert_eq!(session.queue().id(), queue.id());
    session.end()?;

    assert_eq!(graph.state(), RecorderState::Idle);
    assert!(!queue.is_recording());
    assert_eq!(graph.session_count(), 1);
    assert_eq!(graph.end_recording(), Err(GraphError::NotRecording));
    Ok(())
}

#[test]
fn in_order_queue_chains_unrelated_operations() -> Result<()> {
    let ctx = context();
    let a = ctx.malloc_device::<u32>(4)?;
    let b = ctx.malloc_device::<u32>(4)?;

    let ordered = Queue::in_order(&ctx);
    let chained = CommandGraph::new(&ctx);
    let session = chained.begin_recording(&ordered)?;
    let first = session.submit(|cgh| cgh.fill(&a, 1u32, 4))?;
    let second = session.submit(|cgh| cgh.fill(&b, 2u32, 4))?;
    session.end()?;
    assert_eq!(
        chained.edges(),
        vec![DependencyEdge {
            predecessor: first,
            successor: second
        }]
    );

    let unordered = Queue::new(&ctx);
    let free = CommandGraph::new(&ctx);
    let session = free.begin_recording(&unordered)?;
    session.submit(|cgh| cgh.fill(&a, 1u32, 4))?;
    session.submit(|cgh| cgh.fill(&b, 2u32, 4))?;
    session.end()?;
    assert!(free.edges().is_empty());
    Ok(())
}

#[test]
fn finalize_snapshots_the_current_nodes() -> Result<()> {
    let ctx = context();
    let queue = Queue::new(&ctx);
    let graph = CommandGraph::new(&ctx);
    let data = ctx.malloc_shared::<i32>(4)?;

    let _session = graph.begin_recording(&queue)?;
    queue.fill(&data, 1i32, 4)?;
    let early = graph.finalize()?;
    queue.fill(&data, 2i32, 4)?;
    graph.end_recording()?;
    let late = graph.finalize()?;

    assert_eq!(early.node_count(), 1);
    assert_eq!(late.node_count(), 2);
    assert_eq!(late.edges().len(), 1);

    queue.submit_graph(&early)?.wait()?;
    assert_eq!(queue.copy_to_host::<i32>(&data)?, vec![1; 4]);
    queue.submit_graph(&late)?.wait()?;
    assert_eq!(queue.copy_to_host::<i32>(&data)?, vec![2; 4]);
    Ok(())
}

#[test]
fn empty_graph_finalizes_and_runs() -> Result<()> {
    let ctx = context();
    let queue = Queue::new(&ctx);
    let graph = CommandGraph::new(&ctx);
    let exec = graph.finalize()?;
    assert_eq!(exec.node_count(), 0);
    assert_eq!(exec.wave_count(), 0);
    let event = queue.submit_graph(&exec)?;
    event.wait()?;
    assert_eq!(event.status(), EventStatus::Complete);
    Ok(())
}

#[test]
fn contexts_do_not_mix() -> Result<()> {
    let ctx = context();
    let other = context();
    let graph = CommandGraph::new(&ctx);
    let foreign_queue = Queue::new(&other);

    assert!(matches!(
        graph.begin_recording(&foreign_queue),
        Err(GraphError::ContextMismatch { .. })
    ));
    let exec = graph.finalize()?;
    assert!(foreign_queue.submit_graph(&exec).is_err());
    Ok(())
}

#[test]
fn command_groups_hold_exactly_one_command() -> Result<()> {
    let ctx = context();
    let queue = Queue::new(&ctx);
    let data = ctx.malloc_device::<u8>(16)?;

    assert!(queue.submit(|cgh| cgh.write(&data)).is_err());
    assert!(queue
        .submit(|cgh| {
            cgh.memset(&data, 0, 16)?;
            cgh.memset(&data, 1, 16)
        })
        .is_err());
    assert!(queue.memcpy_2d(&data, 4, &data, 4, 8, 2).is_err());
    Ok(())
}

#[test]
fn oversized_copy_and_fill_arguments_are_errors() -> Result<()> {
    let ctx = context();
    let queue = Queue::new(&ctx);
    let graph = CommandGraph::new(&ctx);
    let a = ctx.malloc_device::<u32>(4)?;
    let b = ctx.malloc_device::<u32>(4)?;

    assert!(queue.memcpy_2d(&a, u64::MAX / 2, &b, u64::MAX / 2, 4, 4).is_err());
    assert!(queue.memcpy_2d(&a, u64::MAX, &b, 4, 4, 2).is_err());
    assert!(queue.fill(&a, 0u32, usize::MAX).is_err());
    assert!(queue.submit(|cgh| cgh.memset(&a, 0, u64::MAX)).is_err());

    let session = graph.begin_recording(&queue)?;
    assert!(session
        .submit(|cgh| cgh.memcpy_2d(&a, u64::MAX / 2, &b, u64::MAX / 2, 4, 4))
        .is_err());
    assert!(session.submit(|cgh| cgh.fill(&b, 1u32, usize::MAX)).is_err());
    session.end()?;
    assert_eq!(graph.node_count(), 0);
    Ok(())
}

#[test]
fn failed_capture_leaves_the_graph_unchanged() -> Result<()> {
    let ctx = context();
    let queue = Queue::new(&ctx);
    let graph = CommandGraph::new(&ctx);
    let data = ctx.malloc_device::<u32>(4)?;

    let session = graph.begin_recording(&queue)?;
    let rejected = session.submit(|cgh| cgh.fill(&data, 0u32, 8));
    assert!(rejected.is_err());
    assert_eq!(graph.node_count(), 0);
    session.end()?;
    Ok(())
}

#[test]
fn summary_lists_nodes_waves_and_images() -> Result<()> {
    let ctx = context();
    let queue = Queue::new(&ctx);
    let graph = CommandGraph::new(&ctx);
    let data = ctx.malloc_device::<u32>(8)?;
    let touch = Kernel::new("touch", move |ctx, item| {
        ctx.store(&data, item.linear_id(), item.linear_id() as u32)
    });

    let session = graph.begin_recording(&queue)?;
    session.submit(|cgh| cgh.fill(&data, 0u32, 8))?;
    session.submit(|cgh| {
        cgh.write(&data)?;
        cgh.parallel_for(8, &touch)
    })?;
    session.end()?;

    let summary = graph.finalize()?.summary();
    assert_eq!(summary.nodes.len(), 2);
    assert_eq!(summary.waves.len(), 2);
    assert_eq!(summary.nodes[1].image.as_deref(), Some("touch.jit"));
    let json = serde_json::to_value(&summary)?;
    assert_eq!(json["nodes"].as_array().map(Vec::len), Some(2));
    Ok(())
}
