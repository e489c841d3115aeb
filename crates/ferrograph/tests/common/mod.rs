#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ferrograph::{DeviceInfo, DeviceManager};

pub fn register() {
    ferrograph_backend_ref_cpu::register_cpu_backend();
}

pub fn cpu_device() -> Arc<DeviceInfo> {
    register();
    DeviceManager::global().create_cpu_device()
}

pub fn ipu_model_device(num_ipus: u32) -> Arc<DeviceInfo> {
    register();
    let mut options = BTreeMap::new();
    options.insert("numIPUs".to_string(), num_ipus.to_string());
    DeviceManager::global()
        .create_ipu_model_device(&options)
        .expect("ipu model device")
}

/// A fresh directory under the system temp dir, unique per call.
pub fn temp_dir(name: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!(
        "ferrograph-{name}-{}-{n}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

pub fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tol * (1.0 + e.abs()),
            "element {i}: {a} vs {e}"
        );
    }
}
