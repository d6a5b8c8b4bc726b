pub mod cpu;

pub use cpu::{CommandInterceptor, CpuDevice, GenericCpuDevice, NoopInterceptor};

/// Register the reference CPU device with the global backend registry.
///
/// This function is called automatically via a static initializer, but can also
/// be called manually to ensure the backend is registered.
/// The backend is registered under both "cpu" and "cpu-reference" names.
pub fn register_cpu_backend() {
    let constructor = CpuDevice::new;

    cmdgraph::backend::registry::register_backend("cpu", constructor);
    cmdgraph::backend::registry::register_backend("cpu-reference", constructor);
}

// Auto-register on library load
#[cfg(not(target_family = "wasm"))]
#[used]
#[link_section = ".init_array"]
static REGISTER_CPU_BACKEND: extern "C" fn() = {
    extern "C" fn register() {
        register_cpu_backend();
    }
    register
};
