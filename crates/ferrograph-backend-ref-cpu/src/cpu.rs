use std::sync::Arc;

use ferrograph::backend::{BackendError, BackendResult, ExecutionBackend};
use ferrograph::ir::shape::{resolve_axes, resolve_slice};
use ferrograph::ir::{OpKind, ReductionType};
use ferrograph::tensor::{np_broadcast, DataType, HostTensor, TensorData, TensorInfo};
use smallvec::{smallvec, SmallVec};

type Dims = SmallVec<[usize; 6]>;

/// Shared element storage of a [`CpuTensor`].
#[derive(Clone, Debug, PartialEq)]
pub enum Buffer {
    F32(Arc<[f32]>),
    I32(Arc<[i32]>),
    I64(Arc<[i64]>),
}

impl Buffer {
    pub fn len(&self) -> usize {
        match self {
            Buffer::F32(v) => v.len(),
            Buffer::I32(v) => v.len(),
            Buffer::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_f64(&self) -> Vec<f64> {
        match self {
            Buffer::F32(v) => v.iter().map(|&x| f64::from(x)).collect(),
            Buffer::I32(v) => v.iter().map(|&x| f64::from(x)).collect(),
            Buffer::I64(v) => v.iter().map(|&x| x as f64).collect(),
        }
    }

    fn from_f64(dtype: DataType, values: Vec<f64>) -> Self {
        match dtype {
            DataType::Int64 => Buffer::I64(values.into_iter().map(|v| v as i64).collect()),
            d if d.is_float() => Buffer::F32(values.into_iter().map(|v| v as f32).collect()),
            _ => Buffer::I32(values.into_iter().map(|v| v as i32).collect()),
        }
    }

    /// Element `i` of the result is `self[sources[i]]`, or `fill` where the
    /// source is `None`.
    fn take(&self, sources: &[Option<usize>], fill: f64) -> BackendResult<Buffer> {
        fn pick<T: Copy>(
            data: &[T],
            sources: &[Option<usize>],
            fill: T,
        ) -> BackendResult<Arc<[T]>> {
            sources
                .iter()
                .map(|source| match source {
                    Some(i) => data.get(*i).copied().ok_or_else(|| {
                        BackendError::execution(format!(
                            "source index {i} out of bounds for {} elements",
                            data.len()
                        ))
                    }),
                    None => Ok(fill),
                })
                .collect()
        }
        Ok(match self {
            Buffer::F32(v) => Buffer::F32(pick(v, sources, fill as f32)?),
            Buffer::I32(v) => Buffer::I32(pick(v, sources, fill as i32)?),
            Buffer::I64(v) => Buffer::I64(pick(v, sources, fill as i64)?),
        })
    }

    fn concat(parts: &[&Buffer]) -> BackendResult<Buffer> {
        let mismatch = || BackendError::execution("concatenated buffers differ in element type");
        match parts.first() {
            Some(Buffer::F32(_)) => {
                let mut out = Vec::new();
                for part in parts {
                    match part {
                        Buffer::F32(v) => out.extend_from_slice(v),
                        _ => return Err(mismatch()),
                    }
                }
                Ok(Buffer::F32(out.into()))
            }
            Some(Buffer::I32(_)) => {
                let mut out = Vec::new();
                for part in parts {
                    match part {
                        Buffer::I32(v) => out.extend_from_slice(v),
                        _ => return Err(mismatch()),
                    }
                }
                Ok(Buffer::I32(out.into()))
            }
            Some(Buffer::I64(_)) => {
                let mut out = Vec::new();
                for part in parts {
                    match part {
                        Buffer::I64(v) => out.extend_from_slice(v),
                        _ => return Err(mismatch()),
                    }
                }
                Ok(Buffer::I64(out.into()))
            }
            None => Err(BackendError::execution("nothing to concatenate")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CpuTensor {
    pub info: TensorInfo,
    pub data: Buffer,
}

impl CpuTensor {
    pub fn from_host(tensor: &HostTensor) -> Self {
        let data = match &tensor.data {
            TensorData::F32(v) => Buffer::F32(v.as_slice().into()),
            TensorData::I32(v) => Buffer::I32(v.as_slice().into()),
            TensorData::I64(v) => Buffer::I64(v.as_slice().into()),
        };
        Self {
            info: tensor.info.clone(),
            data,
        }
    }

    pub fn to_host(&self) -> BackendResult<HostTensor> {
        let data = match &self.data {
            Buffer::F32(v) => TensorData::F32(v.to_vec()),
            Buffer::I32(v) => TensorData::I32(v.to_vec()),
            Buffer::I64(v) => TensorData::I64(v.to_vec()),
        };
        HostTensor::new(self.info.clone(), data)
            .map_err(|err| BackendError::execution(err.to_string()))
    }

    fn dims(&self) -> Dims {
        dims_of(&self.info)
    }

    fn values(&self) -> Vec<f64> {
        self.data.to_f64()
    }

    fn relabel(&self, info: &TensorInfo) -> BackendResult<CpuTensor> {
        if info.nelms() != self.data.len() {
            return Err(BackendError::execution(format!(
                "cannot view {} elements as {info}",
                self.data.len()
            )));
        }
        Ok(CpuTensor {
            info: info.clone(),
            data: self.data.clone(),
        })
    }
}

/// Host interpreter serving every device backend name.
#[derive(Clone, Debug)]
pub struct CpuBackend {
    name: String,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::named("cpu")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionBackend for CpuBackend {
    type Handle = CpuTensor;

    fn backend_name(&self) -> &str {
        &self.name
    }

    fn upload(&self, tensor: &HostTensor) -> BackendResult<CpuTensor> {
        Ok(CpuTensor::from_host(tensor))
    }

    fn download(&self, handle: &CpuTensor) -> BackendResult<HostTensor> {
        handle.to_host()
    }

    fn execute(
        &self,
        kind: &OpKind,
        inputs: &[CpuTensor],
        outputs: &[TensorInfo],
    ) -> BackendResult<Vec<CpuTensor>> {
        let output = match outputs {
            [output] => output,
            _ => {
                return Err(BackendError::execution(format!(
                    "{kind} expects a single output, got {}",
                    outputs.len()
                )))
            }
        };
        tracing::trace!(
            target: "ferrograph::cpu",
            backend = %self.name,
            op = %kind.op_type(),
            output = %output,
            "execute"
        );
        let result = execute_op(kind, inputs, output)?;
        if result.data.len() != output.nelms() {
            return Err(BackendError::execution(format!(
                "{kind} produced {} elements for {output}",
                result.data.len()
            )));
        }
        Ok(vec![result])
    }

    fn execute_inplace(
        &self,
        kind: &OpKind,
        mut target: CpuTensor,
        rest: &[CpuTensor],
        output: &TensorInfo,
    ) -> BackendResult<CpuTensor> {
        if target.info == *output {
            if let Some(kernel) = elementwise_kernel(kind) {
                if overwrite(&mut target, rest, &kernel)? {
                    tracing::trace!(
                        target: "ferrograph::cpu",
                        backend = %self.name,
                        op = %kind.op_type(),
                        output = %output,
                        "execute in place"
                    );
                    return Ok(target);
                }
            }
        }
        let mut inputs = Vec::with_capacity(rest.len() + 1);
        inputs.push(target);
        inputs.extend_from_slice(rest);
        self.execute(kind, &inputs, std::slice::from_ref(output))?
            .pop()
            .ok_or_else(|| BackendError::execution(format!("{kind} produced no output")))
    }
}

/// Elementwise kernels. These are the ops that may run in place on their
/// first operand.
enum Elementwise {
    Unary(Box<dyn Fn(f64) -> f64>),
    Binary(fn(f64, f64) -> f64),
}

fn elementwise_kernel(kind: &OpKind) -> Option<Elementwise> {
    let unary: Box<dyn Fn(f64) -> f64> = match kind {
        OpKind::Neg => Box::new(|x| -x),
        OpKind::Reciprocal => Box::new(|x| 1.0 / x),
        OpKind::Sqrt => Box::new(f64::sqrt),
        OpKind::Square => Box::new(|x| x * x),
        OpKind::Exp => Box::new(f64::exp),
        OpKind::Log => Box::new(f64::ln),
        OpKind::Abs => Box::new(f64::abs),
        OpKind::Sign => Box::new(sign),
        OpKind::Ceil => Box::new(f64::ceil),
        OpKind::Floor => Box::new(f64::floor),
        OpKind::Relu => Box::new(|x| x.max(0.0)),
        OpKind::Sigmoid => Box::new(|x| 1.0 / (1.0 + (-x).exp())),
        OpKind::Tanh => Box::new(f64::tanh),
        OpKind::Scale { factor } => {
            let factor = f64::from(*factor);
            Box::new(move |x| x * factor)
        }
        OpKind::Clip { min, max } => {
            let (min, max) = (f64::from(*min), f64::from(*max));
            Box::new(move |x| x.max(min).min(max))
        }
        OpKind::Add => return Some(Elementwise::Binary(|a, b| a + b)),
        OpKind::Sub => return Some(Elementwise::Binary(|a, b| a - b)),
        OpKind::Mul => return Some(Elementwise::Binary(|a, b| a * b)),
        OpKind::Div => return Some(Elementwise::Binary(|a, b| a / b)),
        _ => return None,
    };
    Some(Elementwise::Unary(unary))
}

/// Writes `kernel` applied to `target` and `rest` into the storage of
/// `target`. Returns false, leaving `target` untouched, when that storage is
/// shared with another tensor.
fn overwrite(
    target: &mut CpuTensor,
    rest: &[CpuTensor],
    kernel: &Elementwise,
) -> BackendResult<bool> {
    let operand = match (kernel, rest) {
        (Elementwise::Unary(_), []) => None,
        (Elementwise::Binary(_), [other]) => {
            let values = other.values();
            let operand = broadcast_sources(&other.dims(), &target.dims())?
                .into_iter()
                .map(|i| {
                    values.get(i).copied().ok_or_else(|| {
                        BackendError::execution(format!(
                            "source index {i} out of bounds for {} elements",
                            values.len()
                        ))
                    })
                })
                .collect::<BackendResult<Vec<_>>>()?;
            Some(operand)
        }
        _ => {
            return Err(BackendError::execution(format!(
                "in-place kernel got {} extra operands",
                rest.len()
            )))
        }
    };
    let apply = |i: usize, x: f64| match kernel {
        Elementwise::Unary(f) => f(x),
        Elementwise::Binary(f) => f(x, operand.as_ref().map_or(0.0, |o| o[i])),
    };
    match &mut target.data {
        Buffer::F32(data) => {
            let Some(values) = Arc::get_mut(data) else {
                return Ok(false);
            };
            for (i, v) in values.iter_mut().enumerate() {
                *v = apply(i, f64::from(*v)) as f32;
            }
        }
        Buffer::I32(data) => {
            let Some(values) = Arc::get_mut(data) else {
                return Ok(false);
            };
            for (i, v) in values.iter_mut().enumerate() {
                *v = apply(i, f64::from(*v)) as i32;
            }
        }
        Buffer::I64(data) => {
            let Some(values) = Arc::get_mut(data) else {
                return Ok(false);
            };
            for (i, v) in values.iter_mut().enumerate() {
                *v = apply(i, *v as f64) as i64;
            }
        }
    }
    Ok(true)
}

fn execute_op(kind: &OpKind, inputs: &[CpuTensor], output: &TensorInfo) -> BackendResult<CpuTensor> {
    match kind {
        OpKind::Identity | OpKind::Reshape { .. } => expect_single(inputs)?.relabel(output),
        OpKind::Neg
        | OpKind::Reciprocal
        | OpKind::Sqrt
        | OpKind::Square
        | OpKind::Exp
        | OpKind::Log
        | OpKind::Abs
        | OpKind::Sign
        | OpKind::Ceil
        | OpKind::Floor
        | OpKind::Relu
        | OpKind::Sigmoid
        | OpKind::Tanh
        | OpKind::Scale { .. }
        | OpKind::Clip { .. }
        | OpKind::Add
        | OpKind::Sub
        | OpKind::Mul
        | OpKind::Div => match elementwise_kernel(kind) {
            Some(Elementwise::Unary(f)) => op_unary(inputs, output, f),
            Some(Elementwise::Binary(f)) => {
                op_elementwise(expect_arity(inputs, 2)?, output, |v| f(v[0], v[1]))
            }
            None => Err(BackendError::unimplemented(
                kind.to_string(),
                "no elementwise kernel",
            )),
        },
        OpKind::Softmax { axis } => op_softmax(inputs, output, *axis),
        OpKind::Sum => op_elementwise(inputs, output, |v| v.iter().sum()),
        OpKind::MatMul => op_matmul(inputs, output),
        OpKind::ReduceSum { axes, .. } => op_reduce_sum(inputs, output, axes.as_deref()),
        OpKind::Transpose { perm } => op_transpose(inputs, output, perm),
        OpKind::Slice { starts, ends, axes } => op_slice(inputs, output, starts, ends, axes),
        OpKind::Pad { pads, value } => op_pad(inputs, output, pads, *value),
        OpKind::Concat { axis } => op_concat(inputs, output, *axis),
        OpKind::Gather { axis } => op_gather(inputs, output, *axis),
        OpKind::Scatter { axis } => op_scatter(inputs, output, *axis),
        OpKind::ReduceToShape { .. } => {
            let input = expect_single(inputs)?;
            let values = reduce_to(&input.values(), &input.dims(), &dims_of(output))?;
            finish(output, values)
        }

        OpKind::SqrtGrad => op_elementwise(expect_arity(inputs, 2)?, output, |v| {
            v[0] / (2.0 * v[1])
        }),
        OpKind::ReciprocalGrad => op_elementwise(expect_arity(inputs, 2)?, output, |v| {
            -v[0] / (v[1] * v[1])
        }),
        OpKind::ExpGrad => op_elementwise(expect_arity(inputs, 2)?, output, |v| v[0] * v[1]),
        OpKind::ReluGrad => op_elementwise(expect_arity(inputs, 2)?, output, |v| {
            if v[1] > 0.0 {
                v[0]
            } else {
                0.0
            }
        }),
        OpKind::SigmoidGrad => op_elementwise(expect_arity(inputs, 2)?, output, |v| {
            v[0] * v[1] * (1.0 - v[1])
        }),
        OpKind::TanhGrad => op_elementwise(expect_arity(inputs, 2)?, output, |v| {
            v[0] * (1.0 - v[1] * v[1])
        }),
        OpKind::SoftmaxGrad { axis } => op_softmax_grad(inputs, output, *axis),
        OpKind::ClipGrad { min, max } => {
            let (min, max) = (f64::from(*min), f64::from(*max));
            op_elementwise(expect_arity(inputs, 2)?, output, move |v| {
                if v[1] >= min && v[1] <= max {
                    v[0]
                } else {
                    0.0
                }
            })
        }
        OpKind::SubtractArg1Grad { .. } => op_reduce_grad(expect_arity(inputs, 1)?, output, |v| -v[0]),
        OpKind::MulArgGrad { .. } => op_reduce_grad(expect_arity(inputs, 2)?, output, |v| v[0] * v[1]),
        OpKind::DivArg0Grad { .. } => op_reduce_grad(expect_arity(inputs, 2)?, output, |v| v[0] / v[1]),
        OpKind::DivArg1Grad { .. } => op_reduce_grad(expect_arity(inputs, 3)?, output, |v| {
            -v[0] * v[1] / (v[2] * v[2])
        }),
        OpKind::ReduceSumGrad { axes, .. } => op_reduce_sum_grad(inputs, output, axes),
        OpKind::GatherGrad { axis, .. } => op_gather_grad(inputs, output, *axis),
        OpKind::ScatterDataGrad { axis } => op_scatter_data_grad(inputs, output, *axis),
        OpKind::ScatterUpdatesGrad { axis } => op_scatter_updates_grad(inputs, output, *axis),

        OpKind::Nll {
            reduction,
            ignore_index,
        } => op_nll(inputs, output, *reduction, *ignore_index),
        OpKind::NllGrad {
            reduction,
            ignore_index,
        } => op_nll_grad(inputs, output, *reduction, *ignore_index),
        OpKind::L1 { lambda, reduction } => op_l1(inputs, output, *lambda, *reduction),
        OpKind::L1Grad { lambda, reduction } => op_l1_grad(inputs, output, *lambda, *reduction),
        OpKind::SgdVarUpdate => op_sgd_var_update(inputs, output),
    }
}

fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn finish(output: &TensorInfo, values: Vec<f64>) -> BackendResult<CpuTensor> {
    if values.len() != output.nelms() {
        return Err(BackendError::execution(format!(
            "kernel produced {} values for {output}",
            values.len()
        )));
    }
    Ok(CpuTensor {
        info: output.clone(),
        data: Buffer::from_f64(output.dtype, values),
    })
}

fn op_unary(
    inputs: &[CpuTensor],
    output: &TensorInfo,
    f: impl Fn(f64) -> f64,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    finish(output, input.values().into_iter().map(f).collect())
}

/// Applies `f` to the broadcast operands at every position of `out_dims`.
fn broadcast_values(
    inputs: &[CpuTensor],
    out_dims: &[usize],
    f: impl Fn(&[f64]) -> f64,
) -> BackendResult<Vec<f64>> {
    let sources = inputs
        .iter()
        .map(|input| broadcast_sources(&input.dims(), out_dims))
        .collect::<BackendResult<Vec<_>>>()?;
    let values = inputs.iter().map(CpuTensor::values).collect::<Vec<_>>();
    let len = out_dims.iter().product::<usize>();
    let mut args: SmallVec<[f64; 4]> = smallvec![0.0; inputs.len()];
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        for (k, (src, vals)) in sources.iter().zip(&values).enumerate() {
            args[k] = vals[src[i]];
        }
        out.push(f(&args));
    }
    Ok(out)
}

fn op_elementwise(
    inputs: &[CpuTensor],
    output: &TensorInfo,
    f: impl Fn(&[f64]) -> f64,
) -> BackendResult<CpuTensor> {
    if inputs.is_empty() {
        return Err(BackendError::execution("elementwise op without operands"));
    }
    finish(output, broadcast_values(inputs, &dims_of(output), f)?)
}

/// Evaluates `f` over the full broadcast shape of `inputs`, then sums the
/// result down to the output shape.
fn op_reduce_grad(
    inputs: &[CpuTensor],
    output: &TensorInfo,
    f: impl Fn(&[f64]) -> f64,
) -> BackendResult<CpuTensor> {
    let mut full = Vec::new();
    for input in inputs {
        full = np_broadcast(&full, &input.info.shape)
            .map_err(|err| BackendError::execution(err.to_string()))?;
    }
    let full = full.iter().map(|&d| d.max(0) as usize).collect::<Dims>();
    let values = broadcast_values(inputs, &full, f)?;
    finish(output, reduce_to(&values, &full, &dims_of(output))?)
}

fn reduce_to(values: &[f64], from: &[usize], to: &[usize]) -> BackendResult<Vec<f64>> {
    let targets = broadcast_sources(to, from)?;
    let mut out = vec![0.0; to.iter().product()];
    for (value, target) in values.iter().zip(targets) {
        out[target] += value;
    }
    Ok(out)
}

/// Axis split into `(outer, extent, inner)` so that element `(o, k, i)` sits
/// at `(o * extent + k) * inner + i`.
fn lanes(dims: &[usize], axis: usize) -> (usize, usize, usize) {
    let outer = dims[..axis].iter().product();
    let inner = dims[axis + 1..].iter().product();
    (outer, dims[axis], inner)
}

fn normalize_axis(axis: i64, rank: usize) -> BackendResult<usize> {
    let resolved = if axis < 0 { axis + rank as i64 } else { axis };
    if resolved < 0 || resolved >= rank as i64 {
        return Err(BackendError::execution(format!(
            "axis {axis} out of range for rank {rank}"
        )));
    }
    Ok(resolved as usize)
}

fn op_softmax(inputs: &[CpuTensor], output: &TensorInfo, axis: i64) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let dims = input.dims();
    let (outer, extent, inner) = lanes(&dims, normalize_axis(axis, dims.len())?);
    let x = input.values();
    let mut out = vec![0.0; x.len()];
    for o in 0..outer {
        for i in 0..inner {
            let at = |k: usize| (o * extent + k) * inner + i;
            let max = (0..extent)
                .map(|k| x[at(k)])
                .fold(f64::NEG_INFINITY, f64::max);
            let mut sum = 0.0;
            for k in 0..extent {
                let e = (x[at(k)] - max).exp();
                out[at(k)] = e;
                sum += e;
            }
            for k in 0..extent {
                out[at(k)] /= sum;
            }
        }
    }
    finish(output, out)
}

fn op_softmax_grad(
    inputs: &[CpuTensor],
    output: &TensorInfo,
    axis: i64,
) -> BackendResult<CpuTensor> {
    let [grad, probs] = expect_arity(inputs, 2)? else {
        return Err(BackendError::execution("SoftmaxGrad expects two inputs"));
    };
    let dims = probs.dims();
    let (outer, extent, inner) = lanes(&dims, normalize_axis(axis, dims.len())?);
    let (g, p) = (grad.values(), probs.values());
    let mut out = vec![0.0; p.len()];
    for o in 0..outer {
        for i in 0..inner {
            let at = |k: usize| (o * extent + k) * inner + i;
            let dot: f64 = (0..extent).map(|k| g[at(k)] * p[at(k)]).sum();
            for k in 0..extent {
                out[at(k)] = p[at(k)] * (g[at(k)] - dot);
            }
        }
    }
    finish(output, out)
}

fn op_matmul(inputs: &[CpuTensor], output: &TensorInfo) -> BackendResult<CpuTensor> {
    let [lhs, rhs] = expect_arity(inputs, 2)? else {
        return Err(BackendError::execution("MatMul expects two inputs"));
    };
    let (a_dims, b_dims) = (lhs.dims(), rhs.dims());
    if a_dims.len() != 2 || b_dims.len() != 2 || a_dims[1] != b_dims[0] {
        return Err(BackendError::execution(format!(
            "MatMul operands {} and {} are incompatible",
            lhs.info, rhs.info
        )));
    }
    let (m, k, n) = (a_dims[0], a_dims[1], b_dims[1]);
    let (a, b) = (lhs.values(), rhs.values());
    let mut out = vec![0.0; m * n];
    for row in 0..m {
        for inner in 0..k {
            let scale = a[row * k + inner];
            if scale == 0.0 {
                continue;
            }
            for col in 0..n {
                out[row * n + col] += scale * b[inner * n + col];
            }
        }
    }
    finish(output, out)
}

fn op_reduce_sum(
    inputs: &[CpuTensor],
    output: &TensorInfo,
    axes: Option<&[i64]>,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let axes =
        resolve_axes(&input.info, axes).map_err(|err| BackendError::execution(err.to_string()))?;
    let dims = input.dims();
    let kept = dims
        .iter()
        .enumerate()
        .map(|(i, &d)| if axes.contains(&i) { 1 } else { d })
        .collect::<Dims>();
    finish(output, reduce_to(&input.values(), &dims, &kept)?)
}

fn op_reduce_sum_grad(
    inputs: &[CpuTensor],
    output: &TensorInfo,
    axes: &[i64],
) -> BackendResult<CpuTensor> {
    let grad = expect_single(inputs)?;
    let target = dims_of(output);
    let grad_dims = grad.dims();
    let expanded = if grad_dims.len() == target.len() || axes.is_empty() {
        grad_dims
    } else {
        let axes = axes
            .iter()
            .map(|&a| normalize_axis(a, target.len()))
            .collect::<BackendResult<Vec<_>>>()?;
        let mut kept = grad_dims.iter();
        (0..target.len())
            .map(|i| {
                if axes.contains(&i) {
                    1
                } else {
                    kept.next().copied().unwrap_or(1)
                }
            })
            .collect()
    };
    let sources = broadcast_sources(&expanded, &target)?;
    let sources = sources.into_iter().map(Some).collect::<Vec<_>>();
    Ok(CpuTensor {
        info: output.clone(),
        data: grad.data.take(&sources, 0.0)?,
    })
}

fn op_transpose(
    inputs: &[CpuTensor],
    output: &TensorInfo,
    perm: &[i64],
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let dims = input.dims();
    let strides = compute_strides(&dims);
    let perm = perm
        .iter()
        .map(|&p| normalize_axis(p, dims.len()))
        .collect::<BackendResult<Vec<_>>>()?;
    let sources = MultiIndex::new(&dims_of(output))
        .map(|coords| {
            Some(
                coords
                    .iter()
                    .zip(&perm)
                    .map(|(&c, &p)| c * strides[p])
                    .sum::<usize>(),
            )
        })
        .collect::<Vec<_>>();
    Ok(CpuTensor {
        info: output.clone(),
        data: input.data.take(&sources, 0.0)?,
    })
}

fn op_slice(
    inputs: &[CpuTensor],
    output: &TensorInfo,
    starts: &[i64],
    ends: &[i64],
    axes: &[i64],
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let dims = input.dims();
    let strides = compute_strides(&dims);
    let mut offsets: Dims = smallvec![0; dims.len()];
    for range in resolve_slice(&input.info.shape, starts, ends, axes)
        .map_err(|err| BackendError::execution(err.to_string()))?
    {
        offsets[range.axis] = range.start;
    }
    let sources = MultiIndex::new(&dims_of(output))
        .map(|coords| {
            Some(
                coords
                    .iter()
                    .enumerate()
                    .map(|(a, &c)| (c + offsets[a]) * strides[a])
                    .sum::<usize>(),
            )
        })
        .collect::<Vec<_>>();
    Ok(CpuTensor {
        info: output.clone(),
        data: input.data.take(&sources, 0.0)?,
    })
}

fn op_pad(
    inputs: &[CpuTensor],
    output: &TensorInfo,
    pads: &[i64],
    value: f32,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let dims = input.dims();
    if pads.len() != 2 * dims.len() {
        return Err(BackendError::execution(format!(
            "Pad expects {} pads, got {}",
            2 * dims.len(),
            pads.len()
        )));
    }
    let strides = compute_strides(&dims);
    let sources = MultiIndex::new(&dims_of(output))
        .map(|coords| {
            let mut index = 0;
            for (a, &c) in coords.iter().enumerate() {
                let src = c as i64 - pads[a];
                if src < 0 || src >= dims[a] as i64 {
                    return None;
                }
                index += src as usize * strides[a];
            }
            Some(index)
        })
        .collect::<Vec<_>>();
    Ok(CpuTensor {
        info: output.clone(),
        data: input.data.take(&sources, f64::from(value))?,
    })
}

fn op_concat(inputs: &[CpuTensor], output: &TensorInfo, axis: i64) -> BackendResult<CpuTensor> {
    let first = inputs
        .first()
        .ok_or_else(|| BackendError::execution("Concat expects at least one input"))?;
    let axis = normalize_axis(axis, first.info.rank())?;
    let mut bases = Vec::with_capacity(inputs.len());
    let mut base = 0;
    for input in inputs {
        bases.push(base);
        base += input.data.len();
    }
    let parts = inputs.iter().map(|t| &t.data).collect::<Vec<_>>();
    let combined = Buffer::concat(&parts)?;
    let part_dims = inputs.iter().map(CpuTensor::dims).collect::<Vec<_>>();
    let part_strides = part_dims
        .iter()
        .map(|d| compute_strides(d))
        .collect::<Vec<_>>();
    let sources = MultiIndex::new(&dims_of(output))
        .map(|coords| {
            let mut along = coords[axis];
            for (part, dims) in part_dims.iter().enumerate() {
                if along < dims[axis] {
                    let strides = &part_strides[part];
                    let local = coords
                        .iter()
                        .enumerate()
                        .map(|(a, &c)| (if a == axis { along } else { c }) * strides[a])
                        .sum::<usize>();
                    return Some(bases[part] + local);
                }
                along -= dims[axis];
            }
            None
        })
        .collect::<Vec<_>>();
    if sources.iter().any(Option::is_none) {
        return Err(BackendError::execution(format!(
            "Concat inputs do not cover {output}"
        )));
    }
    Ok(CpuTensor {
        info: output.clone(),
        data: combined.take(&sources, 0.0)?,
    })
}

/// Reads integer indices, wrapping negative values into `[0, extent)`.
fn resolve_indices(indices: &CpuTensor, extent: usize) -> BackendResult<Vec<usize>> {
    if indices.info.dtype.is_float() {
        return Err(BackendError::execution(format!(
            "indices must be integers, got {}",
            indices.info
        )));
    }
    indices
        .values()
        .into_iter()
        .map(|raw| {
            let raw = raw as i64;
            let index = if raw < 0 { raw + extent as i64 } else { raw };
            if index < 0 || index >= extent as i64 {
                Err(BackendError::execution(format!(
                    "index {raw} out of range for extent {extent}"
                )))
            } else {
                Ok(index as usize)
            }
        })
        .collect()
}

fn op_gather(inputs: &[CpuTensor], output: &TensorInfo, axis: i64) -> BackendResult<CpuTensor> {
    let [data, indices] = expect_arity(inputs, 2)? else {
        return Err(BackendError::execution("Gather expects two inputs"));
    };
    let dims = data.dims();
    let (outer, extent, inner) = lanes(&dims, normalize_axis(axis, dims.len())?);
    let picked = resolve_indices(indices, extent)?;
    let mut sources = Vec::with_capacity(outer * picked.len() * inner);
    for o in 0..outer {
        for &k in &picked {
            for i in 0..inner {
                sources.push(Some((o * extent + k) * inner + i));
            }
        }
    }
    Ok(CpuTensor {
        info: output.clone(),
        data: data.data.take(&sources, 0.0)?,
    })
}

fn op_gather_grad(
    inputs: &[CpuTensor],
    output: &TensorInfo,
    axis: i64,
) -> BackendResult<CpuTensor> {
    let [grad, indices] = expect_arity(inputs, 2)? else {
        return Err(BackendError::execution("GatherGrad expects two inputs"));
    };
    let dims = dims_of(output);
    let (outer, extent, inner) = lanes(&dims, normalize_axis(axis, dims.len())?);
    let picked = resolve_indices(indices, extent)?;
    let g = grad.values();
    if g.len() != outer * picked.len() * inner {
        return Err(BackendError::execution(format!(
            "GatherGrad gradient {} does not match indices {}",
            grad.info, indices.info
        )));
    }
    let mut out = vec![0.0; output.nelms()];
    let mut src = 0;
    for o in 0..outer {
        for &k in &picked {
            for i in 0..inner {
                out[(o * extent + k) * inner + i] += g[src];
                src += 1;
            }
        }
    }
    finish(output, out)
}

/// Flat position in a tensor of `data_dims` written by every element of
/// `indices` when scattering along `axis`.
fn scatter_targets(
    data_dims: &[usize],
    indices: &CpuTensor,
    axis: i64,
) -> BackendResult<Vec<usize>> {
    let axis = normalize_axis(axis, data_dims.len())?;
    let index_dims = indices.dims();
    if index_dims.len() != data_dims.len() {
        return Err(BackendError::execution(format!(
            "scatter indices {} must have rank {}",
            indices.info,
            data_dims.len()
        )));
    }
    let picked = resolve_indices(indices, data_dims[axis])?;
    let strides = compute_strides(data_dims);
    MultiIndex::new(&index_dims)
        .zip(picked)
        .map(|(coords, k)| {
            let mut index = 0;
            for (a, &c) in coords.iter().enumerate() {
                let c = if a == axis { k } else { c };
                if c >= data_dims[a] {
                    return Err(BackendError::execution(format!(
                        "scatter position {c} out of range on axis {a}"
                    )));
                }
                index += c * strides[a];
            }
            Ok(index)
        })
        .collect()
}

fn op_scatter(inputs: &[CpuTensor], output: &TensorInfo, axis: i64) -> BackendResult<CpuTensor> {
    let [data, indices, updates] = expect_arity(inputs, 3)? else {
        return Err(BackendError::execution("Scatter expects three inputs"));
    };
    let targets = scatter_targets(&data.dims(), indices, axis)?;
    let base = data.data.len();
    let mut sources = (0..base).map(Some).collect::<Vec<_>>();
    for (p, target) in targets.into_iter().enumerate() {
        sources[target] = Some(base + p);
    }
    let combined = Buffer::concat(&[&data.data, &updates.data])?;
    Ok(CpuTensor {
        info: output.clone(),
        data: combined.take(&sources, 0.0)?,
    })
}

fn op_scatter_data_grad(
    inputs: &[CpuTensor],
    output: &TensorInfo,
    axis: i64,
) -> BackendResult<CpuTensor> {
    let [grad, indices] = expect_arity(inputs, 2)? else {
        return Err(BackendError::execution("ScatterDataGrad expects two inputs"));
    };
    let mut out = grad.values();
    for target in scatter_targets(&grad.dims(), indices, axis)? {
        out[target] = 0.0;
    }
    finish(output, out)
}

fn op_scatter_updates_grad(
    inputs: &[CpuTensor],
    output: &TensorInfo,
    axis: i64,
) -> BackendResult<CpuTensor> {
    let [grad, indices] = expect_arity(inputs, 2)? else {
        return Err(BackendError::execution("ScatterUpdatesGrad expects two inputs"));
    };
    let g = grad.values();
    let out = scatter_targets(&grad.dims(), indices, axis)?
        .into_iter()
        .map(|target| g[target])
        .collect();
    finish(output, out)
}

/// Splits `probs [N, C]` and `labels [N]` into rows, skipping ignored labels.
fn nll_rows(
    probs: &CpuTensor,
    labels: &CpuTensor,
    ignore_index: Option<i64>,
) -> BackendResult<(usize, usize, Vec<Option<usize>>)> {
    let dims = probs.dims();
    if dims.len() != 2 || labels.data.len() != dims[0] {
        return Err(BackendError::execution(format!(
            "Nll expects probs [N, C] and labels [N], got {} and {}",
            probs.info, labels.info
        )));
    }
    let (rows, classes) = (dims[0], dims[1]);
    let picks = labels
        .values()
        .into_iter()
        .map(|raw| {
            let label = raw as i64;
            if ignore_index == Some(label) {
                return Ok(None);
            }
            if label < 0 || label >= classes as i64 {
                return Err(BackendError::execution(format!(
                    "label {label} out of range for {classes} classes"
                )));
            }
            Ok(Some(label as usize))
        })
        .collect::<BackendResult<Vec<_>>>()?;
    Ok((rows, classes, picks))
}

fn reduction_scale(reduction: ReductionType, count: usize) -> f64 {
    match reduction {
        ReductionType::Sum => 1.0,
        ReductionType::Mean => 1.0 / count.max(1) as f64,
    }
}

fn op_nll(
    inputs: &[CpuTensor],
    output: &TensorInfo,
    reduction: ReductionType,
    ignore_index: Option<i64>,
) -> BackendResult<CpuTensor> {
    let [probs, labels] = expect_arity(inputs, 2)? else {
        return Err(BackendError::execution("Nll expects two inputs"));
    };
    let (rows, classes, picks) = nll_rows(probs, labels, ignore_index)?;
    let p = probs.values();
    let total: f64 = picks
        .iter()
        .enumerate()
        .filter_map(|(row, pick)| pick.map(|label| -p[row * classes + label].ln()))
        .sum();
    finish(output, vec![total * reduction_scale(reduction, rows)])
}

fn op_nll_grad(
    inputs: &[CpuTensor],
    output: &TensorInfo,
    reduction: ReductionType,
    ignore_index: Option<i64>,
) -> BackendResult<CpuTensor> {
    let [probs, labels, seed] = expect_arity(inputs, 3)? else {
        return Err(BackendError::execution("NllGrad expects three inputs"));
    };
    let (rows, classes, picks) = nll_rows(probs, labels, ignore_index)?;
    let scale = first_value(seed)? * reduction_scale(reduction, rows);
    let p = probs.values();
    let mut out = vec![0.0; p.len()];
    for (row, pick) in picks.into_iter().enumerate() {
        if let Some(label) = pick {
            let at = row * classes + label;
            out[at] = -scale / p[at];
        }
    }
    finish(output, out)
}

fn l1_count(input: &CpuTensor) -> usize {
    input.info.shape.first().map_or(1, |&d| d.max(1) as usize)
}

fn op_l1(
    inputs: &[CpuTensor],
    output: &TensorInfo,
    lambda: f32,
    reduction: ReductionType,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let total: f64 = input.values().iter().map(|x| x.abs()).sum();
    let scale = f64::from(lambda) * reduction_scale(reduction, l1_count(input));
    finish(output, vec![total * scale])
}

fn op_l1_grad(
    inputs: &[CpuTensor],
    output: &TensorInfo,
    lambda: f32,
    reduction: ReductionType,
) -> BackendResult<CpuTensor> {
    let [input, seed] = expect_arity(inputs, 2)? else {
        return Err(BackendError::execution("L1Grad expects two inputs"));
    };
    let scale =
        f64::from(lambda) * first_value(seed)? * reduction_scale(reduction, l1_count(input));
    finish(
        output,
        input.values().into_iter().map(|x| sign(x) * scale).collect(),
    )
}

fn op_sgd_var_update(inputs: &[CpuTensor], output: &TensorInfo) -> BackendResult<CpuTensor> {
    let [weight, grad, lr, wd, ls] = expect_arity(inputs, 5)? else {
        return Err(BackendError::execution("SgdVarUpdate expects five inputs"));
    };
    let (lr, wd, ls) = (first_value(lr)?, first_value(wd)?, first_value(ls)?);
    let w = weight.values();
    let g = grad.values();
    if w.len() != g.len() {
        return Err(BackendError::execution(format!(
            "weight {} and gradient {} differ",
            weight.info, grad.info
        )));
    }
    let out = w
        .iter()
        .zip(&g)
        .map(|(&w, &g)| w - lr * (g / ls + wd * w))
        .collect();
    finish(output, out)
}

fn first_value(tensor: &CpuTensor) -> BackendResult<f64> {
    tensor.values().first().copied().ok_or_else(|| {
        BackendError::execution(format!("expected a scalar value, got {}", tensor.info))
    })
}

fn expect_single(inputs: &[CpuTensor]) -> BackendResult<&CpuTensor> {
    if inputs.len() != 1 {
        Err(BackendError::execution("operation expects single input"))
    } else {
        Ok(&inputs[0])
    }
}

fn expect_arity(inputs: &[CpuTensor], arity: usize) -> BackendResult<&[CpuTensor]> {
    if inputs.len() != arity {
        Err(BackendError::execution(format!(
            "operation expects {arity} inputs, got {}",
            inputs.len()
        )))
    } else {
        Ok(inputs)
    }
}

fn dims_of(info: &TensorInfo) -> Dims {
    info.shape.iter().map(|&d| d.max(0) as usize).collect()
}

fn compute_strides(dims: &[usize]) -> Dims {
    let mut strides: Dims = smallvec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

/// For every position of `out_dims`, the flat index of the element of a
/// tensor of `in_dims` that numpy broadcasting reads there.
fn broadcast_sources(in_dims: &[usize], out_dims: &[usize]) -> BackendResult<Vec<usize>> {
    if in_dims.len() > out_dims.len() {
        return Err(BackendError::execution(format!(
            "cannot broadcast {in_dims:?} to {out_dims:?}"
        )));
    }
    let offset = out_dims.len() - in_dims.len();
    let in_strides = compute_strides(in_dims);
    let mut strides: Dims = smallvec![0; out_dims.len()];
    for (j, &dim) in in_dims.iter().enumerate() {
        let target = out_dims[j + offset];
        if dim == target {
            strides[j + offset] = in_strides[j];
        } else if dim != 1 {
            return Err(BackendError::execution(format!(
                "cannot broadcast {in_dims:?} to {out_dims:?}"
            )));
        }
    }
    Ok(MultiIndex::new(out_dims)
        .map(|coords| coords.iter().zip(&strides).map(|(c, s)| c * s).sum::<usize>())
        .collect())
}

/// Row-major walk over every coordinate of a shape.
struct MultiIndex {
    shape: Dims,
    current: Dims,
    started: bool,
    exhausted: bool,
}

impl MultiIndex {
    fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.iter().copied().collect(),
            current: smallvec![0; shape.len()],
            started: false,
            // Empty tensors have no coordinates at all.
            exhausted: shape.contains(&0),
        }
    }
}

impl Iterator for MultiIndex {
    type Item = Dims;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        if !self.started {
            self.started = true;
            return Some(self.current.clone());
        }
        for i in (0..self.current.len()).rev() {
            self.current[i] += 1;
            if self.current[i] < self.shape[i] {
                return Some(self.current.clone());
            }
            self.current[i] = 0;
        }
        self.exhausted = true;
        None
    }
}
