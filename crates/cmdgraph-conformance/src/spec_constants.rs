use std::sync::Arc;

use anyhow::{ensure, Context as _, Result};
use cmdgraph::backend::spec::DeviceBackend;
use cmdgraph::graph::CommandGraph;
use cmdgraph::runtime::{Context, Queue};
use cmdgraph::specialization::{DeviceImageVariant, InMemoryImageStore, SelectionError};
use cmdgraph::{Kernel, RuntimeConfig, SpecializationId, UsmPtr};

const REPORTED: SpecializationId<i32> = SpecializationId::new(3, 3);
const EXPLICIT_VALUE: i32 = 5;

/// Writes `[value == default ? 0 : 1, value]` into `out`.
fn report_kernel(out: UsmPtr) -> Kernel {
    Kernel::with_constants("report_constant", [REPORTED.decl()], move |ctx, _| {
        let value = ctx.spec_constant(&REPORTED)?;
        let changed = i32::from(value != REPORTED.default_value());
        ctx.store(&out, 0, changed)?;
        ctx.store(&out, 1, value)
    })
}

fn traced_context(backend: Arc<dyn DeviceBackend>) -> (Context, Arc<InMemoryImageStore>) {
    let store = Arc::new(InMemoryImageStore::new());
    let ctx = Context::builder(backend)
        .config(
            RuntimeConfig::default()
                .with_api_trace(true)
                .with_jit_fallback(false),
        )
        .image_store(store.clone())
        .build();
    (ctx, store)
}

/// Fourth argument of every constant-buffer binding seen so far.
fn bound_buffers(ctx: &Context) -> Result<Vec<String>> {
    ctx.api_trace()
        .records_named("kernel_set_arg_mem_obj")
        .iter()
        .map(|record| {
            record
                .arg(3)
                .map(str::to_string)
                .context("kernel_set_arg_mem_obj recorded without a buffer argument")
        })
        .collect()
}

fn submit_report(queue: &Queue, kernel: &Kernel, out: &UsmPtr, explicit: bool) -> Result<()> {
    queue
        .submit(|cgh| {
            cgh.write(out)?;
            if explicit {
                cgh.set_specialization_constant(&REPORTED, EXPLICIT_VALUE)?;
            }
            cgh.single_task(kernel)
        })?
        .wait()
}

/// Default, explicit, default, explicit: the default submissions bind a null constant buffer
/// against the baked image, the explicit ones bind a real buffer against the configurable image.
pub fn alternating_submissions_select_images(backend: Arc<dyn DeviceBackend>) -> Result<()> {
    let (ctx, store) = traced_context(backend);
    let queue = Queue::new(&ctx);
    let out = ctx.malloc_shared::<i32>(2)?;
    let kernel = report_kernel(out);
    store.register(DeviceImageVariant::defaults_baked(&kernel));
    store.register(DeviceImageVariant::configurable(&kernel));

    for round in 0..4 {
        let explicit = round % 2 == 1;
        submit_report(&queue, &kernel, &out, explicit)?;
        let result: Vec<i32> = queue.copy_to_host(&out)?;
        let expected = if explicit {
            vec![1, EXPLICIT_VALUE]
        } else {
            vec![0, REPORTED.default_value()]
        };
        ensure!(result == expected, "round {round}: got {result:?}");
    }

    let bound = bound_buffers(&ctx)?;
    ensure!(bound.len() == 4, "expected four bindings, got {bound:?}");
    for (round, arg) in bound.iter().enumerate() {
        if round % 2 == 0 {
            ensure!(arg == "0", "round {round} should bind a null buffer, got {arg}");
        } else {
            ensure!(arg.starts_with("0x"), "round {round} should bind a buffer, got {arg}");
        }
    }

    let launches = ctx.api_trace().records_named("enqueue_kernel_launch");
    let images: Vec<&str> = launches.iter().filter_map(|record| record.arg(1)).collect();
    ensure!(
        images
            == [
                "report_constant.default",
                "report_constant.configurable",
                "report_constant.default",
                "report_constant.configurable",
            ],
        "unexpected images {images:?}"
    );
    ensure!(launches.iter().all(|record| record.succeeded()));

    ctx.free(out)?;
    ensure!(
        ctx.allocator().live_allocations().is_empty(),
        "constant buffers must not outlive their launch"
    );
    Ok(())
}

/// Without a baked image every submission goes through a real constant buffer.
pub fn alternating_without_baked_image(backend: Arc<dyn DeviceBackend>) -> Result<()> {
    let (ctx, store) = traced_context(backend);
    let queue = Queue::new(&ctx);
    let out = ctx.malloc_shared::<i32>(2)?;
    let kernel = report_kernel(out);
    store.register(DeviceImageVariant::configurable(&kernel));

    for round in 0..4 {
        let explicit = round % 2 == 1;
        submit_report(&queue, &kernel, &out, explicit)?;
        let result: Vec<i32> = queue.copy_to_host(&out)?;
        ensure!(result[0] == i32::from(explicit), "round {round}: got {result:?}");
    }

    let bound = bound_buffers(&ctx)?;
    ensure!(bound.len() == 4);
    ensure!(
        bound.iter().all(|arg| arg.starts_with("0x")),
        "every binding should carry a buffer: {bound:?}"
    );

    ctx.free(out)?;
    Ok(())
}

/// Selection happens at finalize time: a replayed graph binds the same way every run.
pub fn alternating_submissions_in_graph(backend: Arc<dyn DeviceBackend>) -> Result<()> {
    let (ctx, store) = traced_context(backend);
    let queue = Queue::in_order(&ctx);
    let graph = CommandGraph::new(&ctx);

    let outputs = (0..4)
        .map(|_| ctx.malloc_device::<i32>(2))
        .collect::<Result<Vec<_>>>()?;
    let session = graph.begin_recording(&queue)?;
    for (round, out) in outputs.iter().enumerate() {
        let kernel = report_kernel(*out);
        if round == 0 {
            store.register(DeviceImageVariant::defaults_baked(&kernel));
            store.register(DeviceImageVariant::configurable(&kernel));
        }
        session.submit(|cgh| {
            cgh.write(out)?;
            if round % 2 == 1 {
                cgh.set_specialization_constant(&REPORTED, EXPLICIT_VALUE)?;
            }
            cgh.single_task(&kernel)
        })?;
    }
    session.end()?;
    let exec = graph.finalize()?;

    for _ in 0..2 {
        ctx.api_trace().reset();
        queue.submit_graph(&exec)?.wait()?;
        let bound = bound_buffers(&ctx)?;
        ensure!(bound.len() == 4);
        ensure!(bound[0] == "0" && bound[2] == "0", "defaults bind null: {bound:?}");
        ensure!(bound[1].starts_with("0x") && bound[3].starts_with("0x"));
    }
    for (round, out) in outputs.iter().enumerate() {
        let flag: Vec<i32> = queue.copy_to_host(out)?;
        ensure!(flag[0] == i32::from(round % 2 == 1), "round {round}: got {flag:?}");
    }

    for out in outputs {
        ctx.free(out)?;
    }
    Ok(())
}

pub fn kernel_bundle_carries_constants(backend: Arc<dyn DeviceBackend>) -> Result<()> {
    let ctx = Context::with_config(backend, RuntimeConfig::default());
    let queue = Queue::new(&ctx);
    let out = ctx.malloc_shared::<i32>(2)?;
    let kernel = report_kernel(out);

    let defaults = ctx.kernel_bundle(&[&kernel]);
    queue
        .submit(|cgh| {
            cgh.write(&out)?;
            cgh.use_kernel_bundle(&defaults)?;
            cgh.single_task(&kernel)
        })?
        .wait()?;
    ensure!(queue.copy_to_host::<i32>(&out)? == vec![0, 3]);

    let mut configured = ctx.kernel_bundle(&[&kernel]);
    configured.set_specialization_constant(&REPORTED, EXPLICIT_VALUE);
    ensure!(configured.has_specialization_constant(REPORTED.id()));
    queue
        .submit(|cgh| {
            cgh.write(&out)?;
            cgh.use_kernel_bundle(&configured)?;
            cgh.single_task(&kernel)
        })?
        .wait()?;
    ensure!(queue.copy_to_host::<i32>(&out)? == vec![1, EXPLICIT_VALUE]);

    let mixed = queue.submit(|cgh| {
        cgh.use_kernel_bundle(&configured)?;
        cgh.set_specialization_constant(&REPORTED, 9)?;
        cgh.single_task(&kernel)
    });
    ensure!(mixed.is_err(), "handler constants cannot be mixed with a bundle");

    let stranger = Kernel::new("stranger", |_, _| Ok(()));
    let foreign = queue.submit(|cgh| {
        cgh.use_kernel_bundle(&defaults)?;
        cgh.single_task(&stranger)
    });
    ensure!(foreign.is_err(), "kernels outside the bundle must be rejected");

    ctx.free(out)?;
    Ok(())
}

pub fn explicit_constant_requires_configurable_image(backend: Arc<dyn DeviceBackend>) -> Result<()> {
    let (ctx, store) = traced_context(backend);
    let queue = Queue::new(&ctx);
    let out = ctx.malloc_shared::<i32>(2)?;
    let kernel = report_kernel(out);
    store.register(DeviceImageVariant::defaults_baked(&kernel));

    submit_report(&queue, &kernel, &out, false)?;
    let err = submit_report(&queue, &kernel, &out, true)
        .err()
        .context("explicit value without a configurable image must fail")?;
    ensure!(matches!(
        err.downcast_ref::<SelectionError>(),
        Some(SelectionError::NoConfigurableVariant { .. })
    ));

    ctx.free(out)?;
    Ok(())
}
