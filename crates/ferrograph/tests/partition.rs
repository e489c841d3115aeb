mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use ferrograph::ir::Phase;
use ferrograph::logging::{Diagnostic, MemorySink};
use ferrograph::{
    AnchorReturnType, ArrayStepIo, Builder, DataFlow, ErrorKind, HostTensor, L1Loss, Loss,
    ReductionType, Session, SessionOptions, Sgd, TensorInfo,
};

struct Chain {
    bytes: Vec<u8>,
    input: String,
    output: String,
}

/// `(x @ w1) @ w2` on `[4, 4]` operands.
fn matmul_chain() -> Chain {
    let mut builder = Builder::new();
    let x = builder.add_input_tensor(TensorInfo::float([4, 4]));
    let w1 = builder.add_initialized_input_tensor(
        HostTensor::from_f32([4, 4], (0..16).map(|v| v as f32 * 0.1).collect()).expect("w1"),
    );
    let w2 = builder.add_initialized_input_tensor(
        HostTensor::from_f32([4, 4], (0..16).map(|v| 1.0 - v as f32 * 0.05).collect()).expect("w2"),
    );
    let h = builder.matmul(&x, &w1).expect("first matmul");
    let y = builder.matmul(&h, &w2).expect("second matmul");
    builder.add_output_tensor(&y).expect("output");
    Chain {
        bytes: builder.get_model_proto().expect("proto"),
        input: x,
        output: y,
    }
}

fn auto_options(count: usize) -> SessionOptions {
    let mut options = SessionOptions::new();
    options.set("enableVirtualGraphs", "true").expect("option");
    options.set("autoVirtualGraph", "true").expect("option");
    options
        .set("minimumVirtualGraphCount", &count.to_string())
        .expect("option");
    options
}

#[test]
fn too_few_split_points_is_reported() {
    let chain = matmul_chain();
    let dataflow = DataFlow::new(1, [(chain.output.as_str(), AnchorReturnType::All)]).expect("df");
    let mut session = Session::inference(&chain.bytes, dataflow, common::ipu_model_device(4))
        .options(auto_options(4))
        .build()
        .expect("session");
    let err = session.prepare_device().expect_err("two ops cannot fill four graphs");
    assert_eq!(err.kind(), ErrorKind::Partition);
    let message = err.to_string();
    assert!(message.starts_with("[AutoVirtualGraph] "), "{message}");
    assert!(message.contains("Couldn't find enough splits"), "{message}");
}

#[test]
fn requesting_more_graphs_than_ipus_is_a_config_error() {
    let chain = matmul_chain();
    let dataflow = DataFlow::new(1, [(chain.output.as_str(), AnchorReturnType::All)]).expect("df");
    let mut session = Session::inference(&chain.bytes, dataflow, common::ipu_model_device(1))
        .options(auto_options(2))
        .build()
        .expect("session");
    let err = session.prepare_device().expect_err("one IPU");
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn two_way_split_gives_ordered_disjoint_partitions() {
    let chain = matmul_chain();
    let dataflow = DataFlow::new(1, [(chain.output.as_str(), AnchorReturnType::All)]).expect("df");
    let sink = Arc::new(MemorySink::new());
    let mut session = Session::inference(&chain.bytes, dataflow, common::ipu_model_device(2))
        .options(auto_options(2))
        .sink(sink.clone())
        .build()
        .expect("session");
    session.prepare_device().expect("prepare");

    assert_eq!(
        sink.count(|d| matches!(d, Diagnostic::Partitioned { virtual_graphs: 2, .. })),
        1
    );
    let graph = session.graph();
    let order = graph.topo_order().expect("topo order");
    let assigned = order
        .iter()
        .filter_map(|id| graph.op(*id))
        .map(|op| op.virtual_graph.expect("every op is placed"))
        .collect::<Vec<_>>();
    assert_eq!(assigned, vec![0, 1]);
    assert_eq!(session.executable().expect("compiled").num_virtual_graphs, 2);

    session.weights_from_host().expect("weights");
    let x = HostTensor::from_f32([4, 4], vec![1.0; 16]).expect("x");
    let mut anchors = session.init_anchor_arrays().expect("anchors");
    {
        let mut stepio = ArrayStepIo::new([(chain.input.as_str(), &x)], &mut anchors);
        session.run(&mut stepio).expect("run");
    }
    assert_eq!(anchors.get(&chain.output).expect("anchor").data.len(), 16);
}

#[test]
fn backward_ops_follow_their_forward_partition() {
    let chain = matmul_chain();
    let dataflow = DataFlow::new(1, [("loss", AnchorReturnType::Final)]).expect("df");
    let losses: Vec<Box<dyn Loss>> = vec![Box::new(L1Loss::new(
        chain.output.as_str(),
        "loss",
        0.1,
        ReductionType::Mean,
    ))];
    let mut session = Session::training(
        &chain.bytes,
        dataflow,
        losses,
        Sgd::constant(0.01),
        common::ipu_model_device(2),
    )
    .options(auto_options(2))
    .build()
    .expect("session");
    session.prepare_device().expect("prepare");

    let graph = session.graph();
    let forward = graph
        .ops()
        .filter(|op| op.phase == Phase::Forward)
        .map(|op| op.virtual_graph.expect("placed"))
        .collect::<BTreeSet<_>>();
    assert_eq!(forward, BTreeSet::from([0, 1]));
    for op in graph.ops() {
        let vg = op.virtual_graph.expect("every op is placed");
        assert!((0..2).contains(&vg), "{} on {vg}", op.name);
    }
}
