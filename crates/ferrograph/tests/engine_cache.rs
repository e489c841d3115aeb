mod common;

use std::path::Path;
use std::sync::Arc;

use ferrograph::logging::{Diagnostic, MemorySink};
use ferrograph::session::cache;
use ferrograph::{
    AnchorReturnType, ArrayStepIo, Builder, DataFlow, ErrorKind, HostTensor, Session,
    SessionOptions, TensorInfo,
};

struct Unary {
    bytes: Vec<u8>,
    x: String,
    y: String,
}

fn unary(op: &str) -> Unary {
    let mut builder = Builder::new();
    let x = builder.add_input_tensor(TensorInfo::float([2, 2]));
    let y = match op {
        "tanh" => builder.tanh(&x),
        "sigmoid" => builder.sigmoid(&x),
        _ => builder.exp(&x),
    }
    .expect("unary op");
    builder.add_output_tensor(&y).expect("output");
    Unary {
        bytes: builder.get_model_proto().expect("proto"),
        x,
        y,
    }
}

fn caching_options(dir: &Path) -> SessionOptions {
    let mut options = SessionOptions::new();
    options.set("enableEngineCaching", "true").expect("option");
    options
        .set("cachePath", dir.to_str().expect("utf-8 path"))
        .expect("option");
    options
}

fn run(session: &mut Session, model: &Unary) -> Vec<f32> {
    let x = HostTensor::from_f32([2, 2], vec![-1.0, -0.5, 0.5, 1.0]).expect("x");
    let mut anchors = session.init_anchor_arrays().expect("anchors");
    {
        let mut stepio = ArrayStepIo::new([(model.x.as_str(), &x)], &mut anchors);
        session.run(&mut stepio).expect("run");
    }
    anchors.get(&model.y).expect("anchor").to_f32_vec()
}

#[test]
fn second_session_reuses_the_stored_executable() {
    let model = unary("tanh");
    let dir = common::temp_dir("cache-hit");
    let dataflow = DataFlow::new(1, [(model.y.as_str(), AnchorReturnType::All)]).expect("df");

    let cold_sink = Arc::new(MemorySink::new());
    let mut cold = Session::inference(&model.bytes, dataflow.clone(), common::ipu_model_device(1))
        .options(caching_options(&dir))
        .sink(cold_sink.clone())
        .build()
        .expect("session");
    cold.prepare_device().expect("compile");
    assert!(!cold.engine_cache_hit());
    assert_eq!(cold_sink.count(|d| matches!(d, Diagnostic::CacheMiss { .. })), 1);
    assert_eq!(cold_sink.count(|d| matches!(d, Diagnostic::CacheStored { .. })), 1);
    assert!(cache::artifact_path(&dir, cold.engine_cache_key()).exists());
    let cold_values = run(&mut cold, &model);
    drop(cold);

    let warm_sink = Arc::new(MemorySink::new());
    let mut warm = Session::inference(&model.bytes, dataflow, common::ipu_model_device(1))
        .options(caching_options(&dir))
        .sink(warm_sink.clone())
        .build()
        .expect("session");
    warm.prepare_device().expect("load");
    assert!(warm.engine_cache_hit());
    assert_eq!(warm_sink.count(|d| matches!(d, Diagnostic::CacheHit { .. })), 1);
    assert_eq!(run(&mut warm, &model), cold_values);

    let expected = [-1.0f32, -0.5, 0.5, 1.0].map(f32::tanh);
    common::assert_close(&cold_values, &expected, 1e-6);
}

#[test]
fn artifacts_for_another_graph_are_rejected() {
    let dir = common::temp_dir("cache-integrity");
    let first = unary("sigmoid");
    let second = unary("exp");

    let dataflow = DataFlow::new(1, [(first.y.as_str(), AnchorReturnType::All)]).expect("df");
    let mut stored = Session::inference(&first.bytes, dataflow, common::ipu_model_device(1))
        .options(caching_options(&dir))
        .build()
        .expect("session");
    stored.prepare_device().expect("compile");
    let stored_path = cache::artifact_path(&dir, stored.engine_cache_key());

    let dataflow = DataFlow::new(1, [(second.y.as_str(), AnchorReturnType::All)]).expect("df");
    let mut tampered = Session::inference(&second.bytes, dataflow, common::ipu_model_device(1))
        .options(caching_options(&dir))
        .build()
        .expect("session");
    assert_ne!(tampered.engine_cache_key(), stored.engine_cache_key());
    std::fs::copy(
        &stored_path,
        cache::artifact_path(&dir, tampered.engine_cache_key()),
    )
    .expect("plant artifact");

    let err = tampered.prepare_device().expect_err("header names another key");
    assert_eq!(err.kind(), ErrorKind::CacheIntegrity);
    assert!(!err.is_recoverable());
}

#[test]
fn cpu_devices_never_write_artifacts() {
    let model = unary("exp");
    let dir = common::temp_dir("cache-cpu");
    let dataflow = DataFlow::new(1, [(model.y.as_str(), AnchorReturnType::All)]).expect("df");
    let mut session = Session::inference(&model.bytes, dataflow, common::cpu_device())
        .options(caching_options(&dir))
        .build()
        .expect("session");
    session.prepare_device().expect("compile");
    assert!(!session.engine_cache_hit());
    let entries = std::fs::read_dir(&dir).expect("dir").count();
    assert_eq!(entries, 0);
}

#[test]
fn cache_keys_follow_compile_relevant_options() {
    let model = unary("tanh");
    let dataflow = DataFlow::new(1, [(model.y.as_str(), AnchorReturnType::All)]).expect("df");
    let key_with = |options: SessionOptions| {
        Session::inference(&model.bytes, dataflow.clone(), common::ipu_model_device(1))
            .options(options)
            .build()
            .expect("session")
            .engine_cache_key()
    };

    let base = key_with(SessionOptions::new());
    let mut seeded = SessionOptions::new();
    seeded.set("randomSeed", "42").expect("option");
    assert_eq!(key_with(seeded), base);

    let mut engine = SessionOptions::new();
    engine.engine_option("debug.instrument", "true");
    assert_ne!(key_with(engine), base);
}
