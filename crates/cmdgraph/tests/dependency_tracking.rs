use std::sync::Arc;

use anyhow::Result;
use cmdgraph::graph::{CommandGraph, DependencyEdge, OperationId};
use cmdgraph::runtime::{Context, Queue};
use cmdgraph::{DeviceBackend, RuntimeConfig, UsmPtr};
use cmdgraph_backend_ref_cpu::CpuDevice;

struct Fixture {
    ctx: Context,
    queue: Queue,
    graph: CommandGraph,
}

impl Fixture {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let backend: Arc<dyn DeviceBackend> = Arc::new(CpuDevice::new());
        let ctx = Context::with_config(backend, RuntimeConfig::default());
        let queue = Queue::new(&ctx);
        let graph = CommandGraph::new(&ctx);
        Self { ctx, queue, graph }
    }

    fn write(&self, ptr: &UsmPtr) -> Result<OperationId> {
        let count = ptr.element_count::<u32>();
        self.capture(|cgh| cgh.fill(ptr, 1u32, count))
    }

    /// Copies `src` into a scratch allocation, producing a pure read of `src`.
    fn read(&self, src: &UsmPtr) -> Result<OperationId> {
        let scratch = self.ctx.malloc_device::<u8>(src.byte_len() as usize)?;
        self.capture(|cgh| cgh.memcpy(&scratch, src, src.byte_len()))
    }

    fn capture(
        &self,
        cgf: impl FnOnce(&mut cmdgraph::CommandGroupHandler<'_>) -> Result<()>,
    ) -> Result<OperationId> {
        let session = self.graph.begin_recording(&self.queue)?;
        let id = session.submit(cgf)?;
        session.end()?;
        Ok(id)
    }

    fn predecessors(&self, id: OperationId) -> Vec<OperationId> {
        self.graph
            .edges()
            .into_iter()
            .filter(|edge| edge.successor == id)
            .map(|edge| edge.predecessor)
            .collect()
    }
}

#[test]
fn read_after_write_on_overlapping_windows() -> Result<()> {
    let fx = Fixture::new();
    let data = fx.ctx.malloc_device::<u32>(16)?;
    let w = fx.write(&data.elements::<u32>(0, 8)?)?;
    let r = fx.read(&data.elements::<u32>(4, 8)?)?;
    assert_eq!(fx.predecessors(r), vec![w]);
    Ok(())
}

#[test]
fn disjoint_windows_of_one_allocation_are_independent() -> Result<()> {
    let fx = Fixture::new();
    let data = fx.ctx.malloc_device::<u32>(16)?;
    fx.write(&data.elements::<u32>(0, 8)?)?;
    let r = fx.read(&data.elements::<u32>(8, 8)?)?;
    assert!(fx.predecessors(r).is_empty());
    Ok(())
}

#[test]
fn reads_never_order_each_other() -> Result<()> {
    let fx = Fixture::new();
    let data = fx.ctx.malloc_device::<u32>(8)?;
    let first = fx.read(&data)?;
    let second = fx.read(&data)?;
    assert!(fx.predecessors(first).is_empty());
    assert!(fx.predecessors(second).is_empty());
    Ok(())
}

#[test]
fn write_after_read_and_write_after_write() -> Result<()> {
    let fx = Fixture::new();
    let data = fx.ctx.malloc_device::<u32>(8)?;
    let w1 = fx.write(&data)?;
    let r = fx.read(&data)?;
    let w2 = fx.write(&data)?;
    assert_eq!(fx.predecessors(r), vec![w1]);
    let mut preds = fx.predecessors(w2);
    preds.sort();
    assert_eq!(preds, vec![w1, r]);
    Ok(())
}

#[test]
fn a_covering_write_hides_older_writers() -> Result<()> {
    let fx = Fixture::new();
    let data = fx.ctx.malloc_device::<u32>(8)?;
    let old = fx.write(&data)?;
    let newer = fx.write(&data)?;
    let r = fx.read(&data)?;
    assert_eq!(fx.predecessors(newer), vec![old]);
    assert_eq!(fx.predecessors(r), vec![newer]);
    Ok(())
}

#[test]
fn a_partial_write_leaves_older_writers_visible() -> Result<()> {
    let fx = Fixture::new();
    let data = fx.ctx.malloc_device::<u32>(16)?;
    let whole = fx.write(&data)?;
    let half = fx.write(&data.elements::<u32>(0, 8)?)?;
    let r = fx.read(&data)?;
    let mut preds = fx.predecessors(r);
    preds.sort();
    assert_eq!(preds, vec![whole, half]);
    Ok(())
}

#[test]
fn empty_copies_have_no_dependencies() -> Result<()> {
    let fx = Fixture::new();
    let src = fx.ctx.malloc_device::<u32>(4)?;
    let dst = fx.ctx.malloc_device::<u32>(4)?;
    fx.write(&src)?;
    let empty = fx.capture(|cgh| cgh.memcpy(&dst, &src, 0))?;
    assert!(fx.predecessors(empty).is_empty());
    let later = fx.write(&dst)?;
    assert!(fx.predecessors(later).is_empty());
    Ok(())
}

#[test]
fn sessions_share_one_history() -> Result<()> {
    let fx = Fixture::new();
    let data = fx.ctx.malloc_device::<u32>(4)?;
    let w = fx.write(&data)?;
    let r = fx.read(&data)?;
    assert_eq!(fx.graph.session_count(), 2);
    assert_eq!(
        fx.graph.edges(),
        vec![DependencyEdge {
            predecessor: w,
            successor: r
        }]
    );
    Ok(())
}
