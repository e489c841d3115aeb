mod common;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use ferrograph::{
    AnchorReturnType, Builder, DataFlow, DeviceManager, DeviceType, ErrorKind, Session,
    SyncPattern, TensorInfo,
};

#[test]
fn enumeration_filters_by_size_and_sync_pattern() {
    let dm = DeviceManager::with_hardware(4, 1216);
    let pairs = dm
        .enumerate_devices(SyncPattern::Full, 1, 2, DeviceType::Ipu)
        .collect::<Vec<_>>();
    assert_eq!(pairs.len(), 2);
    assert_eq!(pairs[0].driver_ids(), &[0, 1]);

    assert_eq!(
        dm.enumerate_devices(SyncPattern::PingPong, 1, 1, DeviceType::Ipu)
            .count(),
        0
    );
    assert_eq!(
        dm.enumerate_devices(SyncPattern::PingPong, 2, 2, DeviceType::Ipu)
            .count(),
        1
    );
    assert_eq!(
        dm.enumerate_devices(SyncPattern::Full, 1, 1, DeviceType::IpuModel)
            .count(),
        0
    );
}

#[test]
fn groups_hold_their_member_ipus() {
    let dm = DeviceManager::with_hardware(4, 1216);
    let pair = dm
        .acquire_available_device(2, 0, SyncPattern::Full, 1)
        .expect("a free pair");
    assert_eq!(pair.driver_ids(), &[0, 1]);

    let err = dm.acquire_device_by_id(0).expect_err("member of the pair");
    assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
    assert!(err.is_recoverable());

    let single = dm
        .acquire_available_device(1, 1216, SyncPattern::Full, 1)
        .expect("a free single");
    assert_eq!(single.driver_ids(), &[2]);
    assert!(dm.acquire_available_device(4, 0, SyncPattern::Full, 1).is_none());
    assert!(dm.acquire_available_device(1, 64, SyncPattern::Full, 1).is_none());

    assert!(pair.detach());
    assert!(single.detach());
    let quad = dm
        .acquire_available_device(4, 0, SyncPattern::Full, 1)
        .expect("everything is free again");
    assert!(quad.is_attached());
    assert!(quad.detach());

    let err = dm.acquire_device_by_id(99).expect_err("no such device");
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn concurrent_acquires_have_exactly_one_winner() {
    let dm = Arc::new(DeviceManager::with_hardware(2, 1216));
    let winners = Arc::new(AtomicUsize::new(0));
    let handles = (0..8)
        .map(|_| {
            let dm = Arc::clone(&dm);
            let winners = Arc::clone(&winners);
            thread::spawn(move || {
                if dm.acquire_device_by_id(2).is_ok() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().expect("thread");
    }
    assert_eq!(winners.load(Ordering::SeqCst), 1);
}

#[test]
fn created_devices_are_attached_and_validate_options() {
    let dm = DeviceManager::global();
    let cpu = dm.create_cpu_device();
    assert!(cpu.is_attached());
    assert!(!cpu.supports_profiling());
    assert!(!cpu.supports_engine_caching());

    let mut options = BTreeMap::new();
    options.insert("numIPUs".to_string(), "2".to_string());
    options.insert("tilesPerIPU".to_string(), "64".to_string());
    let model = dm.create_ipu_model_device(&options).expect("model");
    assert_eq!(model.num_ipus(), 2);
    assert_eq!(model.tiles_per_ipu(), 64);
    assert!(model.supports_profiling());

    options.insert("bogus".to_string(), "1".to_string());
    let err = dm.create_sim_device(&options).expect_err("unknown key");
    assert_eq!(err.kind(), ErrorKind::Config);

    let mut bad = BTreeMap::new();
    bad.insert("numIPUs".to_string(), "many".to_string());
    assert!(dm.create_ipu_model_device(&bad).is_err());
}

fn relu_model() -> (Vec<u8>, DataFlow) {
    let mut builder = Builder::new();
    let x = builder.add_input_tensor(TensorInfo::float([2]));
    let y = builder.relu(&x).expect("relu");
    builder.add_output_tensor(&y).expect("output");
    let bytes = builder.get_model_proto().expect("proto");
    let dataflow = DataFlow::new(1, [(y.as_str(), AnchorReturnType::All)]).expect("df");
    (bytes, dataflow)
}

#[test]
fn dropping_a_session_releases_its_device() {
    common::register();
    let dm = DeviceManager::with_hardware(1, 1216);
    let device = dm.acquire_device_by_id(0).expect("device");
    let (bytes, dataflow) = relu_model();

    let session = Session::inference(&bytes, dataflow, Arc::clone(&device))
        .build()
        .expect("session");
    assert!(dm.acquire_device_by_id(0).is_err());
    drop(session);
    assert!(!device.is_attached());
    let again = dm.acquire_device_by_id(0).expect("released");
    assert!(again.detach());
}

#[test]
fn hardware_devices_serve_one_session_at_a_time() {
    common::register();
    let dm = DeviceManager::with_hardware(1, 1216);
    let device = dm.acquire_device_by_id(0).expect("device");
    let (bytes, dataflow) = relu_model();

    let first = Session::inference(&bytes, dataflow.clone(), Arc::clone(&device))
        .build()
        .expect("first session");
    let err = Session::inference(&bytes, dataflow.clone(), Arc::clone(&device))
        .build()
        .err()
        .expect("device is in use");
    assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);

    // The rejected session must not release the first one's device.
    assert!(device.is_attached());
    assert!(dm.acquire_device_by_id(0).is_err());
    assert!(!device.detach());
    assert!(dm.acquire_device_by_id(0).is_err());

    drop(first);
    let second = Session::inference(&bytes, dataflow, Arc::clone(&device))
        .build()
        .expect("free again");
    drop(second);
    assert!(!device.is_attached());
}

#[test]
fn model_devices_are_shared_between_sessions() {
    let device = common::ipu_model_device(1);
    let (bytes, dataflow) = relu_model();
    let first = Session::inference(&bytes, dataflow.clone(), Arc::clone(&device))
        .build()
        .expect("first");
    let second = Session::inference(&bytes, dataflow, Arc::clone(&device))
        .build()
        .expect("second");
    drop(first);
    assert!(device.is_attached());
    drop(second);
    assert!(device.is_attached());
}
