use std::sync::Arc;

use anyhow::{ensure, Result};
use cmdgraph::backend::spec::DeviceBackend;
use cmdgraph::graph::CommandGraph;
use cmdgraph::kernel::{MatrixLayout, TileOrigin};
use cmdgraph::runtime::Queue;
use cmdgraph::{Kernel, NdRange, UsmPtr};
use half::bf16;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::graph_scenarios::context;

/// Tile and matrix extents of one `C += A * B` problem with `A: m x k` and `B: k x n`.
#[derive(Debug, Clone, Copy)]
struct MatmulShape {
    tm: usize,
    tn: usize,
    tk: usize,
    m: usize,
    n: usize,
    k: usize,
    a_layout: MatrixLayout,
    b_layout: MatrixLayout,
}

impl MatmulShape {
    /// Two tiles along every dimension.
    fn doubled(
        tm: usize,
        tn: usize,
        tk: usize,
        a_layout: MatrixLayout,
        b_layout: MatrixLayout,
    ) -> Self {
        Self {
            tm,
            tn,
            tk,
            m: tm * 2,
            n: tn * 2,
            k: tk * 2,
            a_layout,
            b_layout,
        }
    }

    fn a_stride(&self) -> usize {
        stride(self.a_layout, self.m, self.k)
    }

    fn b_stride(&self) -> usize {
        stride(self.b_layout, self.k, self.n)
    }
}

/// Leading dimension of a `rows x cols` matrix stored with `layout`.
fn stride(layout: MatrixLayout, rows: usize, cols: usize) -> usize {
    match layout {
        MatrixLayout::RowMajor => cols,
        MatrixLayout::ColMajor => rows,
        MatrixLayout::Packed => cols * 2,
    }
}

fn lay_out(
    rows: usize,
    cols: usize,
    layout: MatrixLayout,
    value: impl Fn(usize, usize) -> f32,
) -> Vec<bf16> {
    let stride = stride(layout, rows, cols);
    let mut stored = vec![bf16::ZERO; rows * cols];
    for row in 0..rows {
        for col in 0..cols {
            stored[layout.index(row, col, stride)] = bf16::from_f32(value(row, col));
        }
    }
    stored
}

fn host_matmul(shape: &MatmulShape, a: &[bf16], b: &[bf16], c: &mut [f32]) {
    for i in 0..shape.m {
        for j in 0..shape.n {
            let mut acc = c[i * shape.n + j];
            for k in 0..shape.k {
                let lhs = a[shape.a_layout.index(i, k, shape.a_stride())].to_f32();
                let rhs = b[shape.b_layout.index(k, j, shape.b_stride())].to_f32();
                acc += lhs * rhs;
            }
            c[i * shape.n + j] = acc;
        }
    }
}

/// One work item per output tile, walking the shared dimension one `tk` step at a time.
fn tiled_matmul(name: &str, shape: MatmulShape, a: UsmPtr, b: UsmPtr, c: UsmPtr) -> Kernel {
    Kernel::new(name.to_string(), move |ctx, item| {
        let row = item.id(0) * shape.tm;
        let col = item.id(1) * shape.tn;
        let c_origin = TileOrigin::new(row, col, shape.n, MatrixLayout::RowMajor);
        let mut acc = ctx.load_tile::<f32>(&c, shape.tm, shape.tn, c_origin)?;
        for step in 0..shape.k / shape.tk {
            let depth = step * shape.tk;
            let a_origin = TileOrigin::new(row, depth, shape.a_stride(), shape.a_layout);
            let b_origin = TileOrigin::new(depth, col, shape.b_stride(), shape.b_layout);
            let lhs = ctx.load_tile::<bf16>(&a, shape.tm, shape.tk, a_origin)?;
            let rhs = ctx.load_tile::<bf16>(&b, shape.tk, shape.tn, b_origin)?;
            acc.multiply_accumulate(&lhs, &rhs)?;
        }
        ctx.store_tile(&c, &acc, c_origin)
    })
}

fn launch_range(shape: &MatmulShape) -> NdRange {
    NdRange::d2(shape.m / shape.tm, shape.n / shape.tn)
}

/// 32x64 output tiles over a row-major `A` and a pair-packed `B`, recorded once and replayed.
pub fn bf16_matmul_32x64(backend: Arc<dyn DeviceBackend>) -> Result<()> {
    let shape = MatmulShape::doubled(32, 64, 16, MatrixLayout::RowMajor, MatrixLayout::Packed);
    let ctx = context(backend);
    let queue = Queue::new(&ctx);
    let graph = CommandGraph::new(&ctx);

    let a_host = lay_out(shape.m, shape.k, shape.a_layout, |i, j| (i + j) as f32);
    let b_host = lay_out(shape.k, shape.n, shape.b_layout, |i, j| (2 * i + 3 * j) as f32);
    let a = ctx.malloc_device::<bf16>(a_host.len())?;
    let b = ctx.malloc_device::<bf16>(b_host.len())?;
    let c = ctx.malloc_shared::<f32>(shape.m * shape.n)?;
    queue.copy_from_host(&a, &a_host)?;
    queue.copy_from_host(&b, &b_host)?;

    let matmul = tiled_matmul("matmul_32x64", shape, a, b, c);
    let session = graph.begin_recording(&queue)?;
    session.submit(|cgh| cgh.fill(&c, 1.0f32, shape.m * shape.n))?;
    session.submit(|cgh| {
        cgh.read(&a)?;
        cgh.read(&b)?;
        cgh.read_write(&c)?;
        cgh.parallel_for(launch_range(&shape), &matmul)
    })?;
    session.end()?;
    let exec = graph.finalize()?;
    ensure!(exec.wave_count() == 2, "the fill must precede the multiply");

    let mut expected = vec![1.0f32; shape.m * shape.n];
    host_matmul(&shape, &a_host, &b_host, &mut expected);
    for run in 0..2 {
        queue.submit_graph(&exec)?.wait()?;
        let output: Vec<f32> = queue.copy_to_host(&c)?;
        let mismatch = output.iter().zip(&expected).position(|(got, want)| got != want);
        ensure!(mismatch.is_none(), "run {run} differs at element {mismatch:?}");
    }

    for ptr in [a, b, c] {
        ctx.free(ptr)?;
    }
    Ok(())
}

/// Both operands stored column-major; the tiles are loaded transposed into row-major registers.
pub fn bf16_matmul_col_major_operands(backend: Arc<dyn DeviceBackend>) -> Result<()> {
    let shape = MatmulShape::doubled(8, 16, 16, MatrixLayout::ColMajor, MatrixLayout::ColMajor);
    let mut rng = StdRng::seed_from_u64(16);
    let ctx = context(backend);
    let queue = Queue::new(&ctx);

    // Small integers keep every product and partial sum exact in f32.
    let a_values: Vec<f32> = (0..shape.m * shape.k)
        .map(|_| rng.gen_range(-4i32..=4) as f32)
        .collect();
    let b_values: Vec<f32> = (0..shape.k * shape.n)
        .map(|_| rng.gen_range(-4i32..=4) as f32)
        .collect();
    let a_host = lay_out(shape.m, shape.k, shape.a_layout, |i, j| a_values[i * shape.k + j]);
    let b_host = lay_out(shape.k, shape.n, shape.b_layout, |i, j| b_values[i * shape.n + j]);
    let a = ctx.malloc_device::<bf16>(a_host.len())?;
    let b = ctx.malloc_device::<bf16>(b_host.len())?;
    let c = ctx.malloc_shared::<f32>(shape.m * shape.n)?;
    queue.copy_from_host(&a, &a_host)?;
    queue.copy_from_host(&b, &b_host)?;
    queue.fill(&c, 1.0f32, shape.m * shape.n)?.wait()?;

    let matmul = tiled_matmul("matmul_col_major", shape, a, b, c);
    queue
        .submit(|cgh| {
            cgh.read(&a)?;
            cgh.read(&b)?;
            cgh.read_write(&c)?;
            cgh.parallel_for(launch_range(&shape), &matmul)
        })?
        .wait()?;

    let mut expected = vec![1.0f32; shape.m * shape.n];
    host_matmul(&shape, &a_host, &b_host, &mut expected);
    let output: Vec<f32> = queue.copy_to_host(&c)?;
    ensure!(output == expected, "column-major product differs from the host reference");

    // Same values through row-major storage must give the same product.
    let row_major =
        MatmulShape::doubled(8, 16, 16, MatrixLayout::RowMajor, MatrixLayout::RowMajor);
    let mut reference = vec![1.0f32; shape.m * shape.n];
    host_matmul(
        &row_major,
        &lay_out(shape.m, shape.k, MatrixLayout::RowMajor, |i, j| a_values[i * shape.k + j]),
        &lay_out(shape.k, shape.n, MatrixLayout::RowMajor, |i, j| b_values[i * shape.n + j]),
        &mut reference,
    );
    ensure!(reference == expected, "storage layout changed the product");

    for ptr in [a, b, c] {
        ctx.free(ptr)?;
    }
    Ok(())
}

/// A packed tile starting on an odd row cannot be loaded.
pub fn packed_tile_misuse_fails(backend: Arc<dyn DeviceBackend>) -> Result<()> {
    let ctx = context(backend);
    let queue = Queue::new(&ctx);
    let b = ctx.malloc_device::<bf16>(16)?;
    let kernel = Kernel::new("misaligned_pack", move |ctx, _| {
        let origin = TileOrigin::new(1, 0, 8, MatrixLayout::Packed);
        ctx.load_tile::<bf16>(&b, 2, 2, origin).map(|_| ())
    });
    let event = queue.submit(|cgh| {
        cgh.read(&b)?;
        cgh.single_task(&kernel)
    })?;
    ensure!(event.wait().is_err());
    ctx.free(b)?;
    Ok(())
}
