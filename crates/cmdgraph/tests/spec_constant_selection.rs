use std::sync::Arc;

use anyhow::Result;
use cmdgraph::graph::CommandGraph;
use cmdgraph::runtime::{Context, Queue};
use cmdgraph::specialization::{
    DeviceImageVariant, ImageKind, InMemoryImageStore, SelectionError,
};
use cmdgraph::{DeviceBackend, Kernel, RuntimeConfig, SpecializationId};
use cmdgraph_backend_ref_cpu::CpuDevice;

const SCALE: SpecializationId<f32> = SpecializationId::new(1, 2.0);
const ENABLED: SpecializationId<bool> = SpecializationId::new(2, true);

fn context(jit_fallback: bool) -> (Context, Arc<InMemoryImageStore>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend: Arc<dyn DeviceBackend> = Arc::new(CpuDevice::new());
    let store = Arc::new(InMemoryImageStore::new());
    let ctx = Context::builder(backend)
        .config(
            RuntimeConfig::default()
                .with_api_trace(true)
                .with_jit_fallback(jit_fallback),
        )
        .image_store(store.clone())
        .build();
    (ctx, store)
}

#[test]
fn missing_images_fail_at_finalize_without_fallback() -> Result<()> {
    let (ctx, _store) = context(false);
    let queue = Queue::new(&ctx);
    let graph = CommandGraph::new(&ctx);
    let orphan = Kernel::new("orphan", |_, _| Ok(()));

    let session = graph.begin_recording(&queue)?;
    session.submit(|cgh| cgh.single_task(&orphan))?;
    session.end()?;

    let err = match graph.finalize() {
        Ok(_) => panic!("finalize should fail without an image"),
        Err(err) => err,
    };
    assert!(matches!(
        err.downcast_ref::<SelectionError>(),
        Some(SelectionError::NoVariants { .. })
    ));
    Ok(())
}

#[test]
fn several_constants_read_back_through_one_buffer() -> Result<()> {
    let (ctx, store) = context(false);
    let queue = Queue::new(&ctx);
    let out = ctx.malloc_shared::<f32>(1)?;
    let kernel = Kernel::with_constants(
        "scaled",
        [SCALE.decl(), ENABLED.decl()],
        move |ctx, _| {
            let scale = ctx.spec_constant(&SCALE)?;
            let enabled = ctx.spec_constant(&ENABLED)?;
            ctx.store(&out, 0, if enabled { 10.0 * scale } else { -1.0 })
        },
    );
    store.register(DeviceImageVariant::defaults_baked(&kernel));
    store.register(DeviceImageVariant::configurable(&kernel));

    queue.submit(|cgh| cgh.single_task(&kernel))?.wait()?;
    assert_eq!(queue.copy_to_host::<f32>(&out)?, vec![20.0]);

    queue
        .submit(|cgh| {
            cgh.set_specialization_constant(&SCALE, 0.5)?;
            cgh.single_task(&kernel)
        })?
        .wait()?;
    assert_eq!(queue.copy_to_host::<f32>(&out)?, vec![5.0]);

    queue
        .submit(|cgh| {
            cgh.set_specialization_constant(&ENABLED, false)?;
            cgh.single_task(&kernel)
        })?
        .wait()?;
    assert_eq!(queue.copy_to_host::<f32>(&out)?, vec![-1.0]);

    let bindings = ctx.api_trace().records_named("kernel_set_arg_mem_obj");
    let sizes: Vec<&str> = bindings.iter().filter_map(|r| r.arg(2)).collect();
    assert_eq!(sizes, vec!["0", "16", "16"]);
    Ok(())
}

#[test]
fn kernels_without_constants_bind_nothing() -> Result<()> {
    let (ctx, store) = context(false);
    let queue = Queue::new(&ctx);
    let plain = Kernel::new("plain", |_, _| Ok(()));
    store.register(DeviceImageVariant::for_kernel(
        &plain,
        ImageKind::DefaultsBaked,
        vec![0xde, 0xad],
    ));

    queue.submit(|cgh| cgh.single_task(&plain))?.wait()?;
    assert!(ctx
        .api_trace()
        .records_named("kernel_set_arg_mem_obj")
        .is_empty());
    let launches = ctx.api_trace().records_named("enqueue_kernel_launch");
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].arg(1), Some("plain.default"));
    Ok(())
}

#[test]
fn rendered_trace_uses_the_checker_format() -> Result<()> {
    let (ctx, store) = context(false);
    let queue = Queue::new(&ctx);
    let out = ctx.malloc_shared::<f32>(1)?;
    let kernel = Kernel::with_constants("render_me", [SCALE.decl()], move |ctx, _| {
        ctx.store(&out, 0, ctx.spec_constant(&SCALE)?)
    });
    store.register(DeviceImageVariant::defaults_baked(&kernel));

    ctx.api_trace().reset();
    queue.submit(|cgh| cgh.single_task(&kernel))?.wait()?;
    let rendered = ctx.api_trace().take_rendered();
    assert!(rendered.starts_with("---> kernel_set_arg_mem_obj(\n\t<unknown> : render_me\n"));
    assert!(rendered.contains(") ---> \tresult : SUCCESS"));
    assert!(ctx.api_trace().take_trace_json().is_none());
    Ok(())
}

#[test]
fn replaced_images_are_picked_up_without_invalidation() -> Result<()> {
    let (ctx, store) = context(false);
    let queue = Queue::new(&ctx);
    let kernel = Kernel::with_constants("swappable", [SCALE.decl()], |_, _| Ok(()));
    store.register(DeviceImageVariant::defaults_baked(&kernel));
    queue.submit(|cgh| cgh.single_task(&kernel))?.wait()?;

    store.remove_kernel("swappable");
    store.register(DeviceImageVariant::configurable(&kernel));
    ctx.api_trace().reset();
    queue.submit(|cgh| cgh.single_task(&kernel))?.wait()?;
    let launches = ctx.api_trace().records_named("enqueue_kernel_launch");
    assert_eq!(launches[0].arg(1), Some("swappable.configurable"));
    Ok(())
}

#[test]
fn late_configurable_image_serves_explicit_constants() -> Result<()> {
    let (ctx, store) = context(false);
    let queue = Queue::new(&ctx);
    let out = ctx.malloc_shared::<f32>(1)?;
    let kernel = Kernel::with_constants("late", [SCALE.decl()], move |ctx, _| {
        ctx.store(&out, 0, 10.0 * ctx.spec_constant(&SCALE)?)
    });
    store.register(DeviceImageVariant::defaults_baked(&kernel));
    queue.submit(|cgh| cgh.single_task(&kernel))?.wait()?;
    assert_eq!(queue.copy_to_host::<f32>(&out)?, vec![20.0]);

    store.register(DeviceImageVariant::configurable(&kernel));
    queue
        .submit(|cgh| {
            cgh.set_specialization_constant(&SCALE, 4.0)?;
            cgh.single_task(&kernel)
        })?
        .wait()?;
    assert_eq!(queue.copy_to_host::<f32>(&out)?, vec![40.0]);
    Ok(())
}
