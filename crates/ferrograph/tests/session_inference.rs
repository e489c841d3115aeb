mod common;

use ferrograph::{
    AnchorReturnType, ArrayStepIo, Builder, CallbackStepIo, DataFlow, ErrorKind, HostTensor,
    L1Loss, Loss, ReductionType, Session, SessionOptions, SessionState, TensorData, TensorInfo,
};

struct FourWay {
    bytes: Vec<u8>,
    x: String,
    scaled: String,
    negated: String,
    absolute: String,
    squared: String,
}

fn four_way() -> FourWay {
    let mut builder = Builder::new();
    let x = builder.add_input_tensor(TensorInfo::float([2]));
    let scaled = builder.scale(&x, 2.0).expect("scale");
    let negated = builder.neg(&x).expect("neg");
    let absolute = builder.abs(&x).expect("abs");
    let squared = builder.square(&x).expect("square");
    for id in [&scaled, &negated, &absolute, &squared] {
        builder.add_output_tensor(id).expect("output");
    }
    FourWay {
        bytes: builder.get_model_proto().expect("proto"),
        x,
        scaled,
        negated,
        absolute,
        squared,
    }
}

/// Batch `k` of the step holds `[k + 1, 10 * (k + 1)]`.
fn batches() -> HostTensor {
    let values = (1..=4)
        .flat_map(|k| [k as f32, 10.0 * k as f32])
        .collect();
    HostTensor::from_f32([4, 2], values).expect("inputs")
}

#[test]
fn anchor_return_types_shape_and_fill_buffers() {
    let model = four_way();
    let dataflow = DataFlow::new(
        4,
        [
            (model.scaled.as_str(), AnchorReturnType::All),
            (model.negated.as_str(), AnchorReturnType::Final),
            (model.absolute.as_str(), AnchorReturnType::EveryN(2)),
            (model.squared.as_str(), AnchorReturnType::Sum),
        ],
    )
    .expect("df");
    let mut session = Session::inference(&model.bytes, dataflow, common::cpu_device())
        .build()
        .expect("session");
    assert_eq!(session.state(), SessionState::Constructed);
    session.prepare_device().expect("prepare");
    assert_eq!(session.state(), SessionState::Prepared);

    let x = batches();
    let mut anchors = session.init_anchor_arrays().expect("anchors");
    assert_eq!(anchors.get(&model.scaled).expect("all").shape(), &[4, 2]);
    assert_eq!(anchors.get(&model.negated).expect("final").shape(), &[2]);
    assert_eq!(anchors.get(&model.absolute).expect("everyn").shape(), &[2, 2]);
    assert_eq!(anchors.get(&model.squared).expect("sum").shape(), &[2]);

    {
        let mut stepio = ArrayStepIo::new([(model.x.as_str(), &x)], &mut anchors);
        session.run(&mut stepio).expect("first step");
        // Cursors wrap, so a second step overwrites the same buffers.
        session.run(&mut stepio).expect("second step");
    }
    assert_eq!(session.steps_run(), 2);
    assert_eq!(session.state(), SessionState::Running);

    let all = anchors.get(&model.scaled).expect("all").to_f32_vec();
    assert_eq!(all, vec![2.0, 20.0, 4.0, 40.0, 6.0, 60.0, 8.0, 80.0]);
    let last = anchors.get(&model.negated).expect("final").to_f32_vec();
    assert_eq!(last, vec![-4.0, -40.0]);
    let every_second = anchors.get(&model.absolute).expect("everyn").to_f32_vec();
    assert_eq!(every_second, vec![2.0, 20.0, 4.0, 40.0]);
    let summed = anchors.get(&model.squared).expect("sum").to_f32_vec();
    assert_eq!(summed, vec![30.0, 3000.0]);
}

#[test]
fn callback_stepio_streams_batches_through_closures() {
    let model = four_way();
    let dataflow =
        DataFlow::new(3, [(model.scaled.as_str(), AnchorReturnType::All)]).expect("df");
    let mut session = Session::inference(&model.bytes, dataflow, common::cpu_device())
        .build()
        .expect("session");
    session.prepare_device().expect("prepare");

    let mut served = 0usize;
    let mut received = Vec::new();
    {
        let mut stepio = CallbackStepIo::new(
            |_id: &str, info: &TensorInfo| {
                served += 1;
                Ok(TensorData::from_f32(info.dtype, vec![served as f32; info.nelms()]))
            },
            |id: &str, data: &TensorData| {
                received.push((id.to_string(), data.to_f32_vec()));
                Ok(())
            },
        );
        session.run(&mut stepio).expect("run");
    }
    assert_eq!(served, 3);
    let values = received.iter().map(|(_, v)| v.clone()).collect::<Vec<_>>();
    assert_eq!(values, vec![vec![2.0, 2.0], vec![4.0, 4.0], vec![6.0, 6.0]]);
    assert!(received.iter().all(|(id, _)| *id == model.scaled));
}

#[test]
fn callback_failures_keep_their_cause() {
    let model = four_way();
    let dataflow = DataFlow::new(1, [(model.scaled.as_str(), AnchorReturnType::All)]).expect("df");
    let mut session = Session::inference(&model.bytes, dataflow, common::cpu_device())
        .build()
        .expect("session");
    session.prepare_device().expect("prepare");

    let mut stepio = CallbackStepIo::new(
        |_id: &str, _info: &TensorInfo| -> anyhow::Result<TensorData> {
            Err(anyhow::anyhow!("sensor offline"))
        },
        |_id: &str, _data: &TensorData| Ok(()),
    );
    let err = session.run(&mut stepio).expect_err("input callback fails");
    assert_eq!(err.kind(), ErrorKind::Callback);
    assert!(err.to_string().contains("sensor offline"), "{err}");
}

#[test]
fn stepio_buffers_are_checked_before_the_step() {
    let model = four_way();
    let dataflow = DataFlow::new(4, [(model.scaled.as_str(), AnchorReturnType::All)]).expect("df");
    let mut session = Session::inference(&model.bytes, dataflow, common::cpu_device())
        .build()
        .expect("session");
    session.prepare_device().expect("prepare");
    let mut anchors = session.init_anchor_arrays().expect("anchors");

    let short = HostTensor::from_f32([2, 2], vec![1.0; 4]).expect("short");
    let err = {
        let mut stepio = ArrayStepIo::new([(model.x.as_str(), &short)], &mut anchors);
        session.run(&mut stepio).expect_err("half the batches")
    };
    assert_eq!(err.kind(), ErrorKind::StepIo);
    assert!(err.to_string().contains("Unexpected number of input elements"), "{err}");

    let err = {
        let mut stepio = ArrayStepIo::new(Vec::<(&str, &HostTensor)>::new(), &mut anchors);
        session.run(&mut stepio).expect_err("no inputs")
    };
    assert_eq!(err.kind(), ErrorKind::StepIo);
    assert!(err.to_string().contains(&format!("No tensor {}", model.x)), "{err}");
}

#[test]
fn lifecycle_errors_are_state_errors() {
    let mut builder = Builder::new();
    let x = builder.add_input_tensor(TensorInfo::float([2]));
    let w = builder.add_initialized_input_tensor(
        HostTensor::from_f32([2], vec![1.0, -1.0]).expect("w"),
    );
    let y = builder.mul(&x, &w).expect("mul");
    builder.add_output_tensor(&y).expect("output");
    let bytes = builder.get_model_proto().expect("proto");
    let dataflow = DataFlow::new(1, [(y.as_str(), AnchorReturnType::All)]).expect("df");
    let mut session = Session::inference(&bytes, dataflow, common::cpu_device())
        .build()
        .expect("session");

    let input = HostTensor::from_f32([2], vec![3.0, 4.0]).expect("x");
    let mut anchors = session.init_anchor_arrays().expect("anchors");
    let mut stepio = ArrayStepIo::new([(x.as_str(), &input)], &mut anchors);

    let err = session.run(&mut stepio).expect_err("not prepared");
    assert_eq!(err.kind(), ErrorKind::State);
    assert!(err.to_string().contains("Must call prepareDevice"), "{err}");

    session.prepare_device().expect("prepare");
    assert_eq!(
        session.prepare_device().expect_err("twice").kind(),
        ErrorKind::State
    );

    let err = session.run(&mut stepio).expect_err("weights not uploaded");
    assert!(err.to_string().contains("weightsFromHost"), "{err}");
    assert_eq!(session.train(&mut stepio).expect_err("inference").kind(), ErrorKind::State);
    assert_eq!(session.evaluate(&mut stepio).expect_err("no loss").kind(), ErrorKind::State);
    assert_eq!(session.optimizer_from_host().expect_err("no optimizer").kind(), ErrorKind::State);

    session.weights_from_host().expect("weights");
    assert_eq!(session.state(), SessionState::Ready);
    session.run(&mut stepio).expect("run");
    drop(stepio);
    assert_eq!(anchors.get(&y).expect("y").to_f32_vec(), vec![3.0, -4.0]);
}

#[test]
fn evaluate_computes_losses_that_infer_does_not() {
    let mut builder = Builder::new();
    let x = builder.add_input_tensor(TensorInfo::float([2, 3]));
    let y = builder.relu(&x).expect("relu");
    builder.add_output_tensor(&y).expect("output");
    let bytes = builder.get_model_proto().expect("proto");

    let losses: Vec<Box<dyn Loss>> =
        vec![Box::new(L1Loss::new(y.as_str(), "l1", 0.5, ReductionType::Mean))];
    let dataflow = DataFlow::new(1, [("l1", AnchorReturnType::Final)]).expect("df");
    let mut session = Session::inference(&bytes, dataflow, common::cpu_device())
        .losses(losses)
        .build()
        .expect("session");
    session.prepare_device().expect("prepare");

    let input = HostTensor::from_f32([2, 3], vec![1.0, -2.0, 3.0, 4.0, -5.0, 6.0]).expect("x");
    let mut anchors = session.init_anchor_arrays().expect("anchors");
    {
        let mut stepio = ArrayStepIo::new([(x.as_str(), &input)], &mut anchors);
        session.evaluate(&mut stepio).expect("evaluate");
        let err = session.infer(&mut stepio).expect_err("loss is not computed");
        assert_eq!(err.kind(), ErrorKind::Config);
    }
    // relu keeps 1 + 3 + 4 + 6 = 14; half of it over a batch of two.
    common::assert_close(&anchors.get("l1").expect("l1").to_f32_vec(), &[3.5], 1e-6);
}

#[test]
fn synthetic_data_skips_host_streams() {
    let model = four_way();
    let dataflow = DataFlow::new(2, [(model.scaled.as_str(), AnchorReturnType::All)]).expect("df");
    let mut options = SessionOptions::new();
    options.set("syntheticDataMode", "Zeros").expect("option");
    let mut session = Session::inference(&model.bytes, dataflow, common::cpu_device())
        .options(options)
        .build()
        .expect("session");
    session.prepare_device().expect("prepare");

    let mut anchors = session.init_anchor_arrays().expect("anchors");
    {
        let mut stepio = ArrayStepIo::new(Vec::<(&str, &HostTensor)>::new(), &mut anchors);
        session.run(&mut stepio).expect("no host data needed");
    }
    assert!(anchors
        .get(&model.scaled)
        .expect("anchor")
        .to_f32_vec()
        .iter()
        .all(|v| *v == 0.0));
}

#[test]
fn anchors_must_exist_in_the_graph() {
    let model = four_way();
    let dataflow = DataFlow::new(1, [("nowhere", AnchorReturnType::All)]).expect("df");
    let Err(err) = Session::inference(&model.bytes, dataflow, common::cpu_device()).build() else {
        panic!("unknown anchor");
    };
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn disabled_engine_compilation_refuses_to_run() {
    let model = four_way();
    let dataflow = DataFlow::new(1, [(model.scaled.as_str(), AnchorReturnType::All)]).expect("df");
    let mut options = SessionOptions::new();
    options.set("compileEngine", "false").expect("option");
    let mut session = Session::inference(&model.bytes, dataflow, common::cpu_device())
        .options(options)
        .build()
        .expect("session");
    session.prepare_device().expect("prepare without an engine");
    assert!(session.executable().is_none());

    let x = batches();
    let mut anchors = session.init_anchor_arrays().expect("anchors");
    let mut stepio = ArrayStepIo::new([(model.x.as_str(), &x)], &mut anchors);
    let err = session.run(&mut stepio).expect_err("no engine");
    assert_eq!(err.kind(), ErrorKind::State);
    assert!(err.to_string().contains("compileEngine"), "{err}");
}

#[test]
fn exported_dot_lists_every_op() {
    let model = four_way();
    let dir = common::temp_dir("dot");
    let dataflow = DataFlow::new(1, [(model.scaled.as_str(), AnchorReturnType::All)]).expect("df");
    let mut options = SessionOptions::new();
    options.set("exportDot", "true").expect("option");
    options
        .set("logDir", dir.to_str().expect("utf-8 path"))
        .expect("option");
    let mut session = Session::inference(&model.bytes, dataflow, common::cpu_device())
        .options(options)
        .build()
        .expect("session");
    session.prepare_device().expect("prepare");

    let dot = std::fs::read_to_string(dir.join("ferrograph.dot")).expect("dot file");
    assert!(dot.starts_with("digraph"));
    for id in [&model.scaled, &model.negated, &model.absolute, &model.squared] {
        assert!(dot.contains(id.as_str()), "{id} missing from\n{dot}");
    }
}
