mod common;

use ferrograph::proto::ModelProto;
use ferrograph::{
    AnchorReturnType, ArrayStepIo, Builder, DataFlow, DataType, ErrorKind, HostTensor, L1Loss,
    Loss, NllLoss, ReductionType, Session, Sgd, TensorInfo, WeightsIo,
};

struct Linear {
    bytes: Vec<u8>,
    x: String,
    w: String,
    y: String,
}

/// `x[2, 2] @ w[2, 2]` with `w` initialised to ones.
fn linear() -> Linear {
    let mut builder = Builder::new();
    let x = builder.add_input_tensor(TensorInfo::float([2, 2]));
    let w = builder.add_initialized_input_tensor(
        HostTensor::from_f32([2, 2], vec![1.0; 4]).expect("w"),
    );
    let y = builder.matmul(&x, &w).expect("matmul");
    builder.add_output_tensor(&y).expect("output");
    Linear {
        bytes: builder.get_model_proto().expect("proto"),
        x,
        w,
        y,
    }
}

fn l1_mean(input: &str) -> Vec<Box<dyn Loss>> {
    vec![Box::new(L1Loss::new(input, "loss", 1.0, ReductionType::Mean))]
}

fn input() -> HostTensor {
    HostTensor::from_f32([2, 2], vec![1.0, 2.0, 3.0, 4.0]).expect("x")
}

fn read_weight(session: &Session, id: &str, info: TensorInfo) -> Vec<f32> {
    let mut weights = WeightsIo::new();
    weights.insert(id, HostTensor::zeros(info));
    session.read_weights(&mut weights).expect("read weights");
    weights.get(id).expect("weight").to_f32_vec()
}

fn train_steps(session: &mut Session, x_id: &str, x: &HostTensor, steps: usize) -> Vec<f32> {
    let mut losses = Vec::with_capacity(steps);
    for _ in 0..steps {
        let mut anchors = session.init_anchor_arrays().expect("anchors");
        {
            let mut stepio = ArrayStepIo::new([(x_id, x)], &mut anchors);
            session.train(&mut stepio).expect("train");
        }
        losses.push(anchors.get("loss").expect("loss").to_f32_vec()[0]);
    }
    losses
}

#[test]
fn sgd_step_updates_weights_and_lowers_l1_loss() {
    let model = linear();
    let dataflow = DataFlow::new(1, [("loss", AnchorReturnType::Final)]).expect("df");
    let mut session = Session::training(
        &model.bytes,
        dataflow,
        l1_mean(&model.y),
        Sgd::constant(0.05),
        common::cpu_device(),
    )
    .build()
    .expect("session");
    assert!(session.is_training());
    session.prepare_device().expect("prepare");

    let x = input();
    let err = {
        let mut anchors = session.init_anchor_arrays().expect("anchors");
        let mut stepio = ArrayStepIo::new([(model.x.as_str(), &x)], &mut anchors);
        session.train(&mut stepio).expect_err("weights not uploaded")
    };
    assert_eq!(err.kind(), ErrorKind::State);
    session.weights_from_host().expect("weights");

    let first = train_steps(&mut session, &model.x, &x, 1);
    // sum(|x @ ones|) / 2 = (3 + 3 + 7 + 7) / 2
    common::assert_close(&first, &[10.0], 1e-6);

    // dL/dw = x^T @ (1/2) = column sums of x halved.
    let w = read_weight(&session, &model.w, TensorInfo::float([2, 2]));
    common::assert_close(&w, &[0.9, 0.9, 0.85, 0.85], 1e-6);

    let later = train_steps(&mut session, &model.x, &x, 4);
    let mut previous = first[0];
    for loss in later {
        assert!(loss < previous, "{loss} did not drop below {previous}");
        previous = loss;
    }
    assert_eq!(session.steps_run(), 5);
}

#[test]
fn nll_training_lowers_cross_entropy() {
    let mut builder = Builder::new();
    let x = builder.add_input_tensor(TensorInfo::float([2, 3]));
    let labels = builder.add_input_tensor(TensorInfo::new(DataType::Int32, [2]));
    let w = builder.add_initialized_input_tensor(
        HostTensor::from_f32([3, 3], vec![0.1, -0.2, 0.0, 0.3, 0.1, -0.1, 0.0, 0.2, 0.1])
            .expect("w"),
    );
    let logits = builder.matmul(&x, &w).expect("matmul");
    let probs = builder.softmax(&logits, 1).expect("softmax");
    builder.add_output_tensor(&probs).expect("output");
    // Labels are only read by the loss.
    builder.add_output_tensor(&labels).expect("labels");
    let bytes = builder.get_model_proto().expect("proto");

    let losses: Vec<Box<dyn Loss>> = vec![Box::new(NllLoss::new(
        probs.as_str(),
        labels.as_str(),
        "loss",
        ReductionType::Mean,
    ))];
    let dataflow = DataFlow::new(1, [("loss", AnchorReturnType::Final)]).expect("df");
    let mut session =
        Session::training(&bytes, dataflow, losses, Sgd::constant(0.5), common::cpu_device())
            .build()
            .expect("session");
    session.prepare_device().expect("prepare");
    session.weights_from_host().expect("weights");

    let x_values = HostTensor::from_f32([2, 3], vec![1.0, 0.0, 0.5, 0.0, 1.0, -0.5]).expect("x");
    let label_values = HostTensor::from_i32([2], vec![2, 0]).expect("labels");
    let mut history = Vec::new();
    for _ in 0..5 {
        let mut anchors = session.init_anchor_arrays().expect("anchors");
        {
            let mut stepio = ArrayStepIo::new(
                [(x.as_str(), &x_values), (labels.as_str(), &label_values)],
                &mut anchors,
            );
            session.train(&mut stepio).expect("train");
        }
        history.push(anchors.get("loss").expect("loss").to_f32_vec()[0]);
    }
    assert!(history[0] > 0.0);
    assert!(
        history.windows(2).all(|pair| pair[1] < pair[0]),
        "loss history {history:?}"
    );
}

#[test]
fn model_to_host_is_unchanged_without_trainable_weights() {
    let mut builder = Builder::new();
    let x = builder.add_input_tensor(TensorInfo::float([3]));
    let y = builder.relu(&x).expect("relu");
    builder.add_output_tensor(&y).expect("output");
    let bytes = builder.get_model_proto().expect("proto");

    let dataflow = DataFlow::new(1, [("loss", AnchorReturnType::Final)]).expect("df");
    let mut session =
        Session::training(&bytes, dataflow, l1_mean(&y), Sgd::constant(0.1), common::cpu_device())
            .build()
            .expect("session");
    session.prepare_device().expect("prepare");

    let input = HostTensor::from_f32([3], vec![-1.0, 2.0, 3.0]).expect("x");
    let mut anchors = session.init_anchor_arrays().expect("anchors");
    {
        let mut stepio = ArrayStepIo::new([(x.as_str(), &input)], &mut anchors);
        session.train(&mut stepio).expect("train");
    }
    assert_eq!(session.model_to_host_bytes().expect("model"), bytes);
}

#[test]
fn model_to_host_carries_trained_weights_and_can_be_reset() {
    let model = linear();
    let dataflow = DataFlow::new(1, [("loss", AnchorReturnType::Final)]).expect("df");
    let mut session = Session::training(
        &model.bytes,
        dataflow,
        l1_mean(&model.y),
        Sgd::constant(0.05),
        common::cpu_device(),
    )
    .build()
    .expect("session");
    assert_eq!(
        session.model_to_host_bytes().expect_err("not prepared").kind(),
        ErrorKind::State
    );
    session.prepare_device().expect("prepare");
    session.weights_from_host().expect("weights");
    train_steps(&mut session, &model.x, &input(), 2);

    let dir = common::temp_dir("model-to-host");
    let path = dir.join("trained.fgmodel");
    session.model_to_host(&path).expect("write model");
    let trained = ModelProto::load(&path).expect("load model");
    let original = ModelProto::from_bytes(&model.bytes).expect("decode");
    assert_eq!(trained.graph.nodes, original.graph.nodes);
    assert_ne!(trained.graph.initializers, original.graph.initializers);

    session.reset_host_weights(&model.bytes).expect("reset");
    session.weights_from_host().expect("upload originals");
    let w = read_weight(&session, &model.w, TensorInfo::float([2, 2]));
    assert_eq!(w, vec![1.0; 4]);
}

#[test]
fn streamed_optimizer_values_must_be_uploaded() {
    let model = linear();
    let dataflow = DataFlow::new(1, [("loss", AnchorReturnType::Final)]).expect("df");
    let mut session = Session::training(
        &model.bytes,
        dataflow,
        l1_mean(&model.y),
        Sgd::streamed(0.05, 0.0),
        common::cpu_device(),
    )
    .build()
    .expect("session");
    session.prepare_device().expect("prepare");
    session.weights_from_host().expect("weights");

    let x = input();
    let mut anchors = session.init_anchor_arrays().expect("anchors");
    let err = {
        let mut stepio = ArrayStepIo::new([(model.x.as_str(), &x)], &mut anchors);
        session.train(&mut stepio).expect_err("optimizer not uploaded")
    };
    assert_eq!(err.kind(), ErrorKind::State);
    assert!(err.to_string().contains("optimizerFromHost"), "{err}");

    session.optimizer_from_host().expect("optimizer");
    train_steps(&mut session, &model.x, &x, 1);
    let before = read_weight(&session, &model.w, TensorInfo::float([2, 2]));

    let err = session
        .update_optimizer(Sgd::constant(0.05))
        .expect_err("const values cannot replace streamed ones");
    assert_eq!(err.kind(), ErrorKind::Config);

    // A zero learning rate freezes the weights once it reaches the device.
    session.update_optimizer(Sgd::streamed(0.0, 0.0)).expect("replace");
    let err = {
        let mut stepio = ArrayStepIo::new([(model.x.as_str(), &x)], &mut anchors);
        session.train(&mut stepio).expect_err("new values not uploaded")
    };
    assert_eq!(err.kind(), ErrorKind::State);
    session.optimizer_from_host().expect("optimizer");
    train_steps(&mut session, &model.x, &x, 1);
    assert_eq!(read_weight(&session, &model.w, TensorInfo::float([2, 2])), before);
}

#[test]
fn written_weights_reach_the_device() {
    let model = linear();
    let dataflow = DataFlow::new(1, [(model.y.as_str(), AnchorReturnType::All)]).expect("df");
    let mut session = Session::inference(&model.bytes, dataflow, common::cpu_device())
        .build()
        .expect("session");
    session.prepare_device().expect("prepare");
    session.weights_from_host().expect("weights");

    let mut weights = WeightsIo::new();
    weights.insert(
        model.w.as_str(),
        HostTensor::from_f32([2, 2], vec![1.0, 0.0, 0.0, 1.0]).expect("identity"),
    );
    session.write_weights(&weights).expect("write");

    let x = input();
    let mut anchors = session.init_anchor_arrays().expect("anchors");
    {
        let mut stepio = ArrayStepIo::new([(model.x.as_str(), &x)], &mut anchors);
        session.run(&mut stepio).expect("run");
    }
    assert_eq!(
        anchors.get(&model.y).expect("y").to_f32_vec(),
        vec![1.0, 2.0, 3.0, 4.0]
    );

    let mut wrong = WeightsIo::new();
    wrong.insert(model.w.as_str(), HostTensor::zeros(TensorInfo::float([4])));
    assert_eq!(session.write_weights(&wrong).expect_err("shape").kind(), ErrorKind::StepIo);
    assert_eq!(session.read_weights(&mut wrong).expect_err("shape").kind(), ErrorKind::StepIo);
}
