mod common;

use std::sync::Arc;

use ferrograph::autodiff::{has_grad_builder, register_grad_builder, GradCx};
use ferrograph::ir::{OpKind, OpType, TensorId};
use ferrograph::logging::{Diagnostic, MemorySink};
use ferrograph::{
    grad_id, AnchorReturnType, ArrayStepIo, Builder, DataFlow, ErrorKind, HostTensor, L1Loss,
    Loss, Patterns, PatternsLevel, ReductionType, Session, Sgd,
};

fn no_inputs<'a>() -> Vec<(&'a str, &'a HostTensor)> {
    Vec::new()
}

fn l1(input: &str) -> Vec<Box<dyn Loss>> {
    vec![Box::new(L1Loss::new(input, "loss", 1.0, ReductionType::Sum))]
}

#[test]
fn ops_without_grad_builders_fail_training_construction() {
    for rounding in ["ceil", "floor"] {
        let mut builder = Builder::new();
        let w = builder.add_initialized_input_tensor(
            HostTensor::from_f32([3], vec![0.5, 1.5, 2.5]).expect("w"),
        );
        let y = match rounding {
            "ceil" => builder.ceil(&w),
            _ => builder.floor(&w),
        }
        .expect("rounding op");
        builder.add_output_tensor(&y).expect("output");
        let bytes = builder.get_model_proto().expect("proto");

        let dataflow = DataFlow::new(1, [("loss", AnchorReturnType::Final)]).expect("df");
        let Err(err) = Session::training(&bytes, dataflow, l1(&y), Sgd::constant(0.1), common::cpu_device())
            .build()
        else {
            panic!("{rounding} has no gradient");
        };
        assert_eq!(err.kind(), ErrorKind::GradientUnavailable);
        assert!(err.to_string().contains("does not have a valid grad op"), "{err}");
        assert!(!err.is_recoverable());
    }
}

/// Passes the incoming gradient through unchanged.
fn straight_through(
    cx: &mut GradCx<'_>,
    g: &TensorId,
) -> ferrograph::Result<Vec<Option<TensorId>>> {
    if !cx.needs(0) {
        return Ok(vec![None]);
    }
    Ok(vec![Some(cx.grad_op(OpKind::Identity, vec![g.clone()])?)])
}

#[test]
fn registered_grad_builders_make_ops_trainable() {
    assert!(!has_grad_builder(OpType::Sign));
    register_grad_builder(OpType::Sign, straight_through);
    assert!(has_grad_builder(OpType::Sign));

    let mut builder = Builder::new();
    let w = builder.add_initialized_input_tensor(
        HostTensor::from_f32([3], vec![-0.5, 1.5, 2.0]).expect("w"),
    );
    let y = builder.sign(&w).expect("sign");
    builder.add_output_tensor(&y).expect("output");
    let bytes = builder.get_model_proto().expect("proto");

    let dataflow = DataFlow::new(1, [(grad_id(&w), AnchorReturnType::All)]).expect("df");
    let mut session =
        Session::training(&bytes, dataflow, l1(&y), Sgd::constant(0.0), common::cpu_device())
            .build()
            .expect("sign is trainable once it has a builder");
    session.prepare_device().expect("prepare");
    session.weights_from_host().expect("weights");
    let mut anchors = session.init_anchor_arrays().expect("anchors");
    {
        let mut stepio = ArrayStepIo::new(no_inputs(), &mut anchors);
        session.train(&mut stepio).expect("train");
    }
    // d|sign(w)| / d sign(w), passed straight through.
    common::assert_close(
        &anchors.get(&grad_id(&w)).expect("d w").to_f32_vec(),
        &[-1.0, 1.0, 1.0],
        1e-6,
    );
}

/// Gradients of `sum(|a / b|)` for positive `a: [4, 1, 4]` and `b: [3, 1]`.
fn div_reference(a: &[f32], b: &[f32]) -> (Vec<f32>, Vec<f32>) {
    let inv_sum: f32 = b.iter().map(|v| 1.0 / v).sum();
    let da = vec![inv_sum; a.len()];
    let a_sum: f32 = a.iter().sum();
    let db = b.iter().map(|v| -a_sum / (v * v)).collect();
    (da, db)
}

#[test]
fn broadcast_div_gradients_reduce_to_operand_shapes() {
    let a_values = (1..=16).map(|v| v as f32 * 0.25).collect::<Vec<_>>();
    let b_values = vec![0.5f32, 1.0, 2.0];
    let (expected_da, expected_db) = div_reference(&a_values, &b_values);

    let mut builder = Builder::new();
    let a = builder.add_initialized_input_tensor(
        HostTensor::from_f32([4, 1, 4], a_values.clone()).expect("a"),
    );
    let b = builder.add_initialized_input_tensor(
        HostTensor::from_f32([3, 1], b_values.clone()).expect("b"),
    );
    let y = builder.div(&a, &b).expect("div");
    assert_eq!(builder.tensor_shape(&y).expect("shape"), vec![4, 3, 4]);
    builder.add_output_tensor(&y).expect("output");
    let bytes = builder.get_model_proto().expect("proto");

    // Once with the fused grad kernels, once lowered to primitive ops.
    for level in [PatternsLevel::None, PatternsLevel::Default] {
        let dataflow = DataFlow::new(
            1,
            [
                (grad_id(&a), AnchorReturnType::All),
                (grad_id(&b), AnchorReturnType::All),
            ],
        )
        .expect("df");
        let mut session =
            Session::training(&bytes, dataflow, l1(&y), Sgd::constant(0.0), common::cpu_device())
                .patterns(Patterns::new(level))
                .build()
                .expect("session");
        session.prepare_device().expect("prepare");
        session.weights_from_host().expect("weights");
        let mut anchors = session.init_anchor_arrays().expect("anchors");
        {
            let mut stepio = ArrayStepIo::new(no_inputs(), &mut anchors);
            session.train(&mut stepio).expect("train");
        }
        let da = anchors.get(&grad_id(&a)).expect("d a");
        let db = anchors.get(&grad_id(&b)).expect("d b");
        assert_eq!(da.shape(), &[4, 1, 4]);
        assert_eq!(db.shape(), &[3, 1]);
        common::assert_close(&da.to_f32_vec(), &expected_da, 1e-5);
        common::assert_close(&db.to_f32_vec(), &expected_db, 1e-5);
    }
}

#[test]
fn partials_from_several_consumers_are_summed() {
    let w_values = vec![0.5f32, 1.0, 3.0];
    let mut builder = Builder::new();
    let w = builder.add_initialized_input_tensor(
        HostTensor::from_f32([3], w_values.clone()).expect("w"),
    );
    let y = builder.mul(&w, &w).expect("square by mul");
    builder.add_output_tensor(&y).expect("output");
    let bytes = builder.get_model_proto().expect("proto");

    let sink = Arc::new(MemorySink::new());
    let dataflow = DataFlow::new(1, [(grad_id(&w), AnchorReturnType::All)]).expect("df");
    let mut session =
        Session::training(&bytes, dataflow, l1(&y), Sgd::constant(0.0), common::cpu_device())
            .sink(sink.clone())
            .build()
            .expect("session");
    assert_eq!(
        sink.count(|d| matches!(d, Diagnostic::GradientsSynthesized { var_updates: 1, .. })),
        1
    );
    assert!(session.graph().contains_tensor(&ferrograph::updated_var_id(&w)));

    session.prepare_device().expect("prepare");
    session.weights_from_host().expect("weights");
    let mut anchors = session.init_anchor_arrays().expect("anchors");
    {
        let mut stepio = ArrayStepIo::new(no_inputs(), &mut anchors);
        session.train(&mut stepio).expect("train");
    }
    let expected = w_values.iter().map(|v| 2.0 * v).collect::<Vec<_>>();
    common::assert_close(
        &anchors.get(&grad_id(&w)).expect("d w").to_f32_vec(),
        &expected,
        1e-6,
    );
}

#[test]
fn training_requires_a_loss() {
    let mut builder = Builder::new();
    let w = builder.add_initialized_input_tensor(HostTensor::scalar_f32(1.0));
    let y = builder.exp(&w).expect("exp");
    builder.add_output_tensor(&y).expect("output");
    let bytes = builder.get_model_proto().expect("proto");

    let dataflow = DataFlow::new(1, [(y.as_str(), AnchorReturnType::All)]).expect("df");
    let Err(err) = Session::training(&bytes, dataflow, Vec::new(), Sgd::constant(0.1), common::cpu_device())
        .build()
    else {
        panic!("no losses");
    };
    assert_eq!(err.kind(), ErrorKind::Config);
}
