mod common;

use ferrograph::{
    AnchorReturnType, Builder, DataFlow, ErrorKind, Session, SessionOptions, SyntheticDataMode,
    TensorInfo,
};

#[test]
fn typed_keys_parse_and_unknown_keys_fail() {
    let mut options = SessionOptions::new();
    options.set("randomSeed", "17").expect("seed");
    options.set("syntheticDataMode", "RandomNormal").expect("mode");
    options.set("patternMaxIterations", "3").expect("iterations");
    assert_eq!(options.random_seed, 17);
    assert_eq!(options.synthetic_data_mode, SyntheticDataMode::RandomNormal);
    assert_eq!(options.pattern_max_iterations, 3);

    let err = options.set("enableTurboMode", "true").expect_err("unknown key");
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(err.to_string().contains("Unrecognised option 'enableTurboMode'"), "{err}");

    let err = options.set("exportDot", "sometimes").expect_err("not a bool");
    assert!(err.to_string().contains("Invalid value 'sometimes'"), "{err}");

    assert!(DataFlow::new(0, Vec::<(&str, AnchorReturnType)>::new()).is_err());
    assert!(DataFlow::new(4, [("x", AnchorReturnType::EveryN(3))]).is_err());
}

#[test]
fn unknown_engine_options_fail_at_prepare() {
    let mut builder = Builder::new();
    let x = builder.add_input_tensor(TensorInfo::float([2]));
    let y = builder.sqrt(&x).expect("sqrt");
    builder.add_output_tensor(&y).expect("output");
    let bytes = builder.get_model_proto().expect("proto");

    let mut options = SessionOptions::new();
    options.engine_option("debug.instrument", "true");
    options.report_option("showVarStorage", "true");
    options.convolution_option("noSuchKnob", "1");
    let dataflow = DataFlow::new(1, [(y.as_str(), AnchorReturnType::All)]).expect("df");
    let mut session = Session::inference(&bytes, dataflow, common::cpu_device())
        .options(options)
        .build()
        .expect("options are opaque until prepare");
    let err = session.prepare_device().expect_err("unknown convolution option");
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(err.to_string().contains("noSuchKnob"), "{err}");
}
