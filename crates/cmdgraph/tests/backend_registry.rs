use cmdgraph::backend::registry::{create_backend, has_backend, list_backends};
use cmdgraph::runtime::{Context, Queue};
use cmdgraph::RuntimeConfig;

#[test]
fn test_backend_registry() {
    // Ensure backends are registered (auto-registration via .init_array)
    cmdgraph_backend_ref_cpu::register_cpu_backend();

    let backends = list_backends();
    println!("Available backends: {:?}", backends);

    assert!(has_backend("cpu"), "cpu backend not registered");
    assert!(backends.contains(&"cpu-reference".to_string()));

    // Registered as "cpu" for convenience, reports its own name
    let cpu_backend = create_backend("cpu").expect("failed to create cpu backend");
    assert_eq!(cpu_backend.backend_name(), "cpu-reference");

    assert!(!has_backend("nonexistent"));
    assert!(create_backend("nonexistent").is_none());
}

#[test]
fn context_from_config_resolves_registered_backend() {
    cmdgraph_backend_ref_cpu::register_cpu_backend();

    let config = RuntimeConfig::from_json_str(r#"{"backend": "cpu", "api_trace": true}"#)
        .expect("config should parse");
    assert!(config.parallel_waves, "unspecified fields keep their defaults");

    let ctx = Context::from_config(config).expect("cpu backend should resolve");
    assert_eq!(ctx.backend().backend_name(), "cpu-reference");
    assert!(ctx.api_trace().is_enabled());

    let queue = Queue::new(&ctx);
    let data = ctx.malloc_shared::<u16>(3).unwrap();
    queue.fill(&data, 0xbeefu16, 3).unwrap().wait().unwrap();
    assert_eq!(queue.copy_to_host::<u16>(&data).unwrap(), vec![0xbeef; 3]);
    let fills = ctx.api_trace().records_named("enqueue_fill");
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].arg(2), Some("6"));
}

#[test]
fn context_from_config_rejects_unknown_backend() {
    let config = RuntimeConfig::default().with_backend("missing-device");
    let err = match Context::from_config(config) {
        Ok(_) => panic!("unknown backend must not resolve"),
        Err(err) => err,
    };
    assert!(err.to_string().contains("missing-device"));
}
