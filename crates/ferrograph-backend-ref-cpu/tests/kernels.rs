use ferrograph::backend::{create_backend, BackendResult, ExecutionBackend};
use ferrograph::ir::{OpKind, ReductionType};
use ferrograph::tensor::{HostTensor, TensorInfo};
use ferrograph_backend_ref_cpu::{Buffer, CpuBackend, CpuTensor, BACKEND_NAMES};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn run(kind: OpKind, inputs: &[HostTensor]) -> anyhow::Result<HostTensor> {
    let backend = CpuBackend::new();
    let infos = inputs.iter().map(|t| &t.info).collect::<Vec<_>>();
    let outputs = kind.infer_outputs(&infos)?;
    let handles = inputs
        .iter()
        .map(|t| backend.upload(t))
        .collect::<BackendResult<Vec<_>>>()?;
    let mut results = backend.execute(&kind, &handles, &outputs)?;
    Ok(backend.download(&results.remove(0))?)
}

fn f32s(shape: &[i64], values: &[f32]) -> HostTensor {
    HostTensor::from_f32(shape.to_vec(), values.to_vec()).expect("host tensor")
}

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-4, "{actual:?} vs {expected:?}");
    }
}

#[test]
fn every_device_backend_name_is_registered() {
    ferrograph_backend_ref_cpu::register_cpu_backend();
    for name in BACKEND_NAMES {
        let backend = create_backend(name).expect("backend registered");
        assert_eq!(backend.backend_name(), name);
    }
}

#[test]
fn add_broadcasts_rows() -> anyhow::Result<()> {
    let a = f32s(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let b = f32s(&[3], &[10.0, 20.0, 30.0]);
    let out = run(OpKind::Add, &[a, b])?;
    assert_eq!(out.shape(), &[2, 3]);
    assert_close(&out.to_f32_vec(), &[11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    Ok(())
}

#[test]
fn integer_arithmetic_stays_integral() -> anyhow::Result<()> {
    let a = HostTensor::from_i32(vec![3], vec![1, 2, 3])?;
    let b = HostTensor::from_i32(vec![3], vec![4, 5, 6])?;
    let out = run(OpKind::Mul, &[a, b])?;
    assert_eq!(out.to_i64_vec(), vec![4, 10, 18]);
    Ok(())
}

#[test]
fn matmul_matches_naive_product() -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(7);
    let (m, k, n) = (3usize, 4usize, 2usize);
    let a = (0..m * k).map(|_| rng.gen_range(-1.0..1.0)).collect::<Vec<f32>>();
    let b = (0..k * n).map(|_| rng.gen_range(-1.0..1.0)).collect::<Vec<f32>>();
    let mut expected = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            expected[i * n + j] = (0..k).map(|p| a[i * k + p] * b[p * n + j]).sum();
        }
    }
    let out = run(
        OpKind::MatMul,
        &[f32s(&[3, 4], &a), f32s(&[4, 2], &b)],
    )?;
    assert_close(&out.to_f32_vec(), &expected);
    Ok(())
}

#[test]
fn softmax_rows_sum_to_one() -> anyhow::Result<()> {
    let x = f32s(&[2, 3], &[1.0, 2.0, 3.0, -1.0, 0.0, 1000.0]);
    let out = run(OpKind::Softmax { axis: -1 }, &[x])?.to_f32_vec();
    assert!((out[..3].iter().sum::<f32>() - 1.0).abs() < 1e-5);
    assert!((out[5] - 1.0).abs() < 1e-5);
    Ok(())
}

#[test]
fn softmax_grad_matches_finite_differences() -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(11);
    let x = (0..4).map(|_| rng.gen_range(-2.0..2.0)).collect::<Vec<f32>>();
    let g = (0..4).map(|_| rng.gen_range(-1.0..1.0)).collect::<Vec<f32>>();
    let probs = run(OpKind::Softmax { axis: 0 }, &[f32s(&[4], &x)])?;
    let analytic = run(
        OpKind::SoftmaxGrad { axis: 0 },
        &[f32s(&[4], &g), probs],
    )?
    .to_f32_vec();

    let objective = |x: &[f32]| -> anyhow::Result<f32> {
        let p = run(OpKind::Softmax { axis: 0 }, &[f32s(&[4], x)])?.to_f32_vec();
        Ok(p.iter().zip(&g).map(|(p, g)| p * g).sum())
    };
    let eps = 1e-3;
    for i in 0..4 {
        let mut up = x.clone();
        up[i] += eps;
        let mut down = x.clone();
        down[i] -= eps;
        let numeric = (objective(&up)? - objective(&down)?) / (2.0 * eps);
        assert!((numeric - analytic[i]).abs() < 1e-2, "{numeric} vs {}", analytic[i]);
    }
    Ok(())
}

#[test]
fn reduce_sum_and_its_grad_round_trip_shapes() -> anyhow::Result<()> {
    let x = f32s(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let summed = run(
        OpKind::ReduceSum {
            axes: Some(vec![1]),
            keepdims: false,
        },
        &[x],
    )?;
    assert_close(&summed.to_f32_vec(), &[6.0, 15.0]);

    let grad = run(
        OpKind::ReduceSumGrad {
            shape: vec![2, 3],
            axes: vec![1],
        },
        &[f32s(&[2], &[1.0, 2.0])],
    )?;
    assert_close(&grad.to_f32_vec(), &[1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
    Ok(())
}

#[test]
fn transpose_slice_and_pad_move_elements() -> anyhow::Result<()> {
    let x = f32s(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let t = run(OpKind::Transpose { perm: vec![1, 0] }, &[x.clone()])?;
    assert_eq!(t.shape(), &[3, 2]);
    assert_close(&t.to_f32_vec(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);

    let s = run(
        OpKind::Slice {
            starts: vec![1],
            ends: vec![100],
            axes: vec![1],
        },
        &[x.clone()],
    )?;
    assert_close(&s.to_f32_vec(), &[2.0, 3.0, 5.0, 6.0]);

    let p = run(
        OpKind::Pad {
            pads: vec![0, 1, 0, 0],
            value: -1.0,
        },
        &[x],
    )?;
    assert_eq!(p.shape(), &[2, 4]);
    assert_close(
        &p.to_f32_vec(),
        &[-1.0, 1.0, 2.0, 3.0, -1.0, 4.0, 5.0, 6.0],
    );
    Ok(())
}

#[test]
fn empty_tensors_move_no_elements() -> anyhow::Result<()> {
    let empty = f32s(&[0, 3], &[]);
    let t = run(OpKind::Transpose { perm: vec![1, 0] }, &[empty.clone()])?;
    assert_eq!(t.shape(), &[3, 0]);
    assert!(t.to_f32_vec().is_empty());

    let x = f32s(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let s = run(
        OpKind::Slice {
            starts: vec![2],
            ends: vec![1],
            axes: vec![1],
        },
        &[x],
    )?;
    assert_eq!(s.shape(), &[2, 0]);
    assert!(s.to_f32_vec().is_empty());

    let sum = run(OpKind::Add, &[empty, f32s(&[3], &[1.0, 2.0, 3.0])])?;
    assert_eq!(sum.shape(), &[0, 3]);
    Ok(())
}

#[test]
fn concat_joins_along_axis() -> anyhow::Result<()> {
    let a = f32s(&[2, 1], &[1.0, 2.0]);
    let b = f32s(&[2, 2], &[3.0, 4.0, 5.0, 6.0]);
    let out = run(OpKind::Concat { axis: 1 }, &[a, b])?;
    assert_close(&out.to_f32_vec(), &[1.0, 3.0, 4.0, 2.0, 5.0, 6.0]);
    Ok(())
}

#[test]
fn gather_and_gather_grad_are_adjoint() -> anyhow::Result<()> {
    let data = f32s(&[3, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let indices = HostTensor::from_i32(vec![3], vec![2, 0, 2])?;
    let gathered = run(OpKind::Gather { axis: 0 }, &[data, indices.clone()])?;
    assert_close(&gathered.to_f32_vec(), &[5.0, 6.0, 1.0, 2.0, 5.0, 6.0]);

    let grad = run(
        OpKind::GatherGrad {
            axis: 0,
            shape: vec![3, 2],
        },
        &[f32s(&[3, 2], &[1.0; 6]), indices],
    )?;
    assert_close(&grad.to_f32_vec(), &[1.0, 1.0, 0.0, 0.0, 2.0, 2.0]);
    Ok(())
}

#[test]
fn gather_rejects_out_of_range_indices() {
    let data = f32s(&[2], &[1.0, 2.0]);
    let indices = HostTensor::from_i32(vec![1], vec![5]).expect("indices");
    let err = run(OpKind::Gather { axis: 0 }, &[data, indices]).expect_err("out of range");
    assert!(err.to_string().contains("out of range"), "{err}");
}

#[test]
fn scatter_overwrites_selected_positions() -> anyhow::Result<()> {
    let data = f32s(&[2, 2], &[0.0; 4]);
    let indices = HostTensor::from_i32(vec![1, 2], vec![1, 0])?;
    let updates = f32s(&[1, 2], &[7.0, 8.0]);
    let out = run(OpKind::Scatter { axis: 0 }, &[data, indices.clone(), updates])?;
    assert_close(&out.to_f32_vec(), &[0.0, 8.0, 7.0, 0.0]);

    let g = f32s(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
    let data_grad = run(OpKind::ScatterDataGrad { axis: 0 }, &[g.clone(), indices.clone()])?;
    assert_close(&data_grad.to_f32_vec(), &[1.0, 0.0, 0.0, 4.0]);
    let update_grad = run(OpKind::ScatterUpdatesGrad { axis: 0 }, &[g, indices])?;
    assert_close(&update_grad.to_f32_vec(), &[3.0, 2.0]);
    Ok(())
}

#[test]
fn nll_mean_and_grad() -> anyhow::Result<()> {
    let probs = f32s(&[2, 2], &[0.5, 0.5, 0.25, 0.75]);
    let labels = HostTensor::from_i32(vec![2], vec![0, 1])?;
    let kind = OpKind::Nll {
        reduction: ReductionType::Mean,
        ignore_index: None,
    };
    let loss = run(kind, &[probs.clone(), labels.clone()])?.to_f32_vec();
    let expected = (-(0.5f32.ln()) - 0.75f32.ln()) / 2.0;
    assert_close(&loss, &[expected]);

    let grad = run(
        OpKind::NllGrad {
            reduction: ReductionType::Mean,
            ignore_index: Some(1),
        },
        &[probs, labels, HostTensor::scalar_f32(1.0)],
    )?;
    assert_close(&grad.to_f32_vec(), &[-1.0, 0.0, 0.0, 0.0]);
    Ok(())
}

#[test]
fn l1_scales_by_lambda() -> anyhow::Result<()> {
    let x = f32s(&[2, 2], &[1.0, -2.0, 0.0, 3.0]);
    let loss = run(
        OpKind::L1 {
            lambda: 0.5,
            reduction: ReductionType::Sum,
        },
        &[x.clone()],
    )?;
    assert_close(&loss.to_f32_vec(), &[3.0]);
    let grad = run(
        OpKind::L1Grad {
            lambda: 0.5,
            reduction: ReductionType::Mean,
        },
        &[x, HostTensor::scalar_f32(1.0)],
    )?;
    assert_close(&grad.to_f32_vec(), &[0.25, -0.25, 0.0, 0.25]);
    Ok(())
}

#[test]
fn sgd_update_applies_decay_and_loss_scaling() -> anyhow::Result<()> {
    let w = f32s(&[2], &[1.0, 2.0]);
    let g = f32s(&[2], &[4.0, 8.0]);
    let out = run(
        OpKind::SgdVarUpdate,
        &[
            w,
            g,
            HostTensor::scalar_f32(0.1),
            HostTensor::scalar_f32(0.5),
            HostTensor::scalar_f32(4.0),
        ],
    )?;
    // w - 0.1 * (g / 4 + 0.5 * w)
    assert_close(&out.to_f32_vec(), &[0.85, 1.7]);
    Ok(())
}

fn f32_storage(tensor: &CpuTensor) -> *const f32 {
    match &tensor.data {
        Buffer::F32(values) => values.as_ptr(),
        other => panic!("expected f32 storage, got {other:?}"),
    }
}

#[test]
fn inplace_kernels_reuse_unshared_storage() -> anyhow::Result<()> {
    let backend = CpuBackend::new();
    let info = TensorInfo::float(vec![2, 2]);
    let x = backend.upload(&f32s(&[2, 2], &[1.0, -2.0, 3.0, -4.0]))?;
    let storage = f32_storage(&x);

    let relu = backend.execute_inplace(&OpKind::Relu, x, &[], &info)?;
    assert_eq!(f32_storage(&relu), storage);
    assert_eq!(backend.download(&relu)?.to_f32_vec(), vec![1.0, 0.0, 3.0, 0.0]);

    let row = backend.upload(&f32s(&[2], &[10.0, 20.0]))?;
    let sum = backend.execute_inplace(&OpKind::Add, relu, &[row], &info)?;
    assert_eq!(f32_storage(&sum), storage);
    assert_eq!(backend.download(&sum)?.to_f32_vec(), vec![11.0, 20.0, 13.0, 20.0]);
    Ok(())
}

#[test]
fn inplace_kernels_leave_shared_storage_alone() -> anyhow::Result<()> {
    let backend = CpuBackend::new();
    let info = TensorInfo::float(vec![3]);
    let x = backend.upload(&f32s(&[3], &[1.0, -2.0, 3.0]))?;
    let alias = x.clone();

    let neg = backend.execute_inplace(&OpKind::Neg, x, &[], &info)?;
    assert_ne!(f32_storage(&neg), f32_storage(&alias));
    assert_eq!(backend.download(&neg)?.to_f32_vec(), vec![-1.0, 2.0, -3.0]);
    assert_eq!(backend.download(&alias)?.to_f32_vec(), vec![1.0, -2.0, 3.0]);

    // Ops without an elementwise kernel fall back to a fresh result.
    let t = backend.execute_inplace(
        &OpKind::Transpose { perm: vec![0] },
        alias,
        &[],
        &info,
    )?;
    assert_eq!(backend.download(&t)?.to_f32_vec(), vec![1.0, -2.0, 3.0]);
    Ok(())
}
