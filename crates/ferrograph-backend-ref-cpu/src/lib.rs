pub mod cpu;

pub use cpu::{Buffer, CpuBackend, CpuTensor};

/// Backend names served by the host kernels, one per device type.
pub const BACKEND_NAMES: [&str; 4] = ["cpu", "ipu-model", "sim", "ipu"];

/// Register the CPU backend with the global backend registry.
///
/// This function is called automatically via a static initializer, but can also
/// be called manually to ensure the backend is registered. Every device type
/// executes on the host, each under its own backend name.
pub fn register_cpu_backend() {
    for name in BACKEND_NAMES {
        ferrograph::backend::register_execution_backend(name, move || CpuBackend::named(name));
    }
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
