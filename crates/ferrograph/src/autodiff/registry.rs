//! Grad builders keyed by forward op type.
//!
//! A builder receives the gradient of the forward op's output and returns one
//! optional partial gradient per forward input. Ceil, Floor and Sign have no
//! builder; reaching them on a path to a loss is an error.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use once_cell::sync::Lazy;

use crate::error::{Error, Result};
use crate::ir::shape::{resolve_axes, resolve_slice};
use crate::ir::{OpKind, OpType, TensorId};

use super::GradCx;

pub type GradBuilder = fn(&mut GradCx<'_>, &TensorId) -> Result<Vec<Option<TensorId>>>;

static GRAD_REGISTRY: Lazy<RwLock<BTreeMap<OpType, GradBuilder>>> =
    Lazy::new(|| RwLock::new(default_builders()));

/// Installs or replaces the builder for `op_type`.
pub fn register_grad_builder(op_type: OpType, builder: GradBuilder) {
    GRAD_REGISTRY
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(op_type, builder);
}

pub fn grad_builder(op_type: OpType) -> Option<GradBuilder> {
    GRAD_REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&op_type)
        .copied()
}

pub fn has_grad_builder(op_type: OpType) -> bool {
    grad_builder(op_type).is_some()
}

fn default_builders() -> BTreeMap<OpType, GradBuilder> {
    let mut map: BTreeMap<OpType, GradBuilder> = BTreeMap::new();
    map.insert(OpType::Identity, identity_grad);
    map.insert(OpType::Neg, neg_grad);
    map.insert(OpType::Reciprocal, reciprocal_grad);
    map.insert(OpType::Sqrt, sqrt_grad);
    map.insert(OpType::Square, square_grad);
    map.insert(OpType::Exp, exp_grad);
    map.insert(OpType::Log, log_grad);
    map.insert(OpType::Abs, abs_grad);
    map.insert(OpType::Relu, relu_grad);
    map.insert(OpType::Sigmoid, sigmoid_grad);
    map.insert(OpType::Tanh, tanh_grad);
    map.insert(OpType::Scale, scale_grad);
    map.insert(OpType::Clip, clip_grad);
    map.insert(OpType::Softmax, softmax_grad);
    map.insert(OpType::Add, add_grad);
    map.insert(OpType::Sub, sub_grad);
    map.insert(OpType::Mul, mul_grad);
    map.insert(OpType::Div, div_grad);
    map.insert(OpType::MatMul, matmul_grad);
    map.insert(OpType::Sum, sum_grad);
    map.insert(OpType::ReduceSum, reduce_sum_grad);
    map.insert(OpType::Reshape, reshape_grad);
    map.insert(OpType::Transpose, transpose_grad);
    map.insert(OpType::Slice, slice_grad);
    map.insert(OpType::Pad, pad_grad);
    map.insert(OpType::Concat, concat_grad);
    map.insert(OpType::Gather, gather_grad);
    map.insert(OpType::Scatter, scatter_grad);
    map
}

fn unary(
    cx: &mut GradCx<'_>,
    kind: OpKind,
    inputs: Vec<TensorId>,
) -> Result<Vec<Option<TensorId>>> {
    if !cx.needs(0) {
        return Ok(vec![None]);
    }
    Ok(vec![Some(cx.grad_op(kind, inputs)?)])
}

fn reduce_to(cx: &mut GradCx<'_>, i: usize, grad: &TensorId) -> Result<Option<TensorId>> {
    if !cx.needs(i) {
        return Ok(None);
    }
    let shape = cx.input_info(i)?.shape;
    Ok(Some(cx.grad_op(OpKind::ReduceToShape { shape }, vec![grad.clone()])?))
}

fn identity_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    unary(cx, OpKind::Identity, vec![g.clone()])
}

fn neg_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    unary(cx, OpKind::Neg, vec![g.clone()])
}

fn reciprocal_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    let x = cx.input(0);
    unary(cx, OpKind::ReciprocalGrad, vec![g.clone(), x])
}

fn sqrt_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    let out = cx.output();
    unary(cx, OpKind::SqrtGrad, vec![g.clone(), out])
}

fn square_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    if !cx.needs(0) {
        return Ok(vec![None]);
    }
    let x = cx.input(0);
    let gx = cx.grad_op(OpKind::Mul, vec![g.clone(), x])?;
    Ok(vec![Some(cx.grad_op(OpKind::Scale { factor: 2.0 }, vec![gx])?)])
}

fn exp_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    let out = cx.output();
    unary(cx, OpKind::ExpGrad, vec![g.clone(), out])
}

fn log_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    let x = cx.input(0);
    unary(cx, OpKind::Div, vec![g.clone(), x])
}

fn abs_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    if !cx.needs(0) {
        return Ok(vec![None]);
    }
    let x = cx.input(0);
    let sign = cx.grad_op(OpKind::Sign, vec![x])?;
    Ok(vec![Some(cx.grad_op(OpKind::Mul, vec![g.clone(), sign])?)])
}

fn relu_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    let out = cx.output();
    unary(cx, OpKind::ReluGrad, vec![g.clone(), out])
}

fn sigmoid_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    let out = cx.output();
    unary(cx, OpKind::SigmoidGrad, vec![g.clone(), out])
}

fn tanh_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    let out = cx.output();
    unary(cx, OpKind::TanhGrad, vec![g.clone(), out])
}

fn scale_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    let OpKind::Scale { factor } = cx.fwd().kind else {
        return Err(cx.unexpected_kind());
    };
    unary(cx, OpKind::Scale { factor }, vec![g.clone()])
}

fn clip_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    let OpKind::Clip { min, max } = cx.fwd().kind else {
        return Err(cx.unexpected_kind());
    };
    let x = cx.input(0);
    unary(cx, OpKind::ClipGrad { min, max }, vec![g.clone(), x])
}

fn softmax_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    let OpKind::Softmax { axis } = cx.fwd().kind else {
        return Err(cx.unexpected_kind());
    };
    let out = cx.output();
    unary(cx, OpKind::SoftmaxGrad { axis }, vec![g.clone(), out])
}

fn add_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    Ok(vec![reduce_to(cx, 0, g)?, reduce_to(cx, 1, g)?])
}

fn sub_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    let lhs = reduce_to(cx, 0, g)?;
    let rhs = if cx.needs(1) {
        let shape = cx.input_info(1)?.shape;
        Some(cx.grad_op(OpKind::SubtractArg1Grad { shape }, vec![g.clone()])?)
    } else {
        None
    };
    Ok(vec![lhs, rhs])
}

fn mul_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    let mut grads = Vec::with_capacity(2);
    for (i, other) in [(0, 1), (1, 0)] {
        if cx.needs(i) {
            let shape = cx.input_info(i)?.shape;
            let other = cx.input(other);
            grads.push(Some(cx.grad_op(OpKind::MulArgGrad { shape }, vec![g.clone(), other])?));
        } else {
            grads.push(None);
        }
    }
    Ok(grads)
}

fn div_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    let (a, b) = (cx.input(0), cx.input(1));
    let da = if cx.needs(0) {
        let shape = cx.input_info(0)?.shape;
        Some(cx.grad_op(OpKind::DivArg0Grad { shape }, vec![g.clone(), b.clone()])?)
    } else {
        None
    };
    let db = if cx.needs(1) {
        let shape = cx.input_info(1)?.shape;
        Some(cx.grad_op(OpKind::DivArg1Grad { shape }, vec![g.clone(), a, b])?)
    } else {
        None
    };
    Ok(vec![da, db])
}

fn matmul_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    let (a, b) = (cx.input(0), cx.input(1));
    let swap = OpKind::Transpose { perm: vec![1, 0] };
    let da = if cx.needs(0) {
        let bt = cx.grad_op(swap.clone(), vec![b])?;
        Some(cx.grad_op(OpKind::MatMul, vec![g.clone(), bt])?)
    } else {
        None
    };
    let db = if cx.needs(1) {
        let at = cx.grad_op(swap, vec![a])?;
        Some(cx.grad_op(OpKind::MatMul, vec![at, g.clone()])?)
    } else {
        None
    };
    Ok(vec![da, db])
}

fn sum_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    (0..cx.fwd().inputs.len())
        .map(|i| reduce_to(cx, i, g))
        .collect()
}

fn reduce_sum_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    let OpKind::ReduceSum { axes, keepdims } = cx.fwd().kind.clone() else {
        return Err(cx.unexpected_kind());
    };
    let info = cx.input_info(0)?;
    let axes = if keepdims {
        Vec::new()
    } else {
        resolve_axes(&info, axes.as_deref())?
            .into_iter()
            .map(|a| a as i64)
            .collect()
    };
    unary(
        cx,
        OpKind::ReduceSumGrad {
            shape: info.shape,
            axes,
        },
        vec![g.clone()],
    )
}

fn reshape_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    let shape = cx.input_info(0)?.shape;
    unary(cx, OpKind::Reshape { shape }, vec![g.clone()])
}

fn transpose_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    let OpKind::Transpose { perm } = cx.fwd().kind.clone() else {
        return Err(cx.unexpected_kind());
    };
    let rank = perm.len() as i64;
    let mut inverse = vec![0i64; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        let p = if p < 0 { p + rank } else { p };
        inverse[p as usize] = i as i64;
    }
    unary(cx, OpKind::Transpose { perm: inverse }, vec![g.clone()])
}

fn slice_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    let OpKind::Slice { starts, ends, axes } = cx.fwd().kind.clone() else {
        return Err(cx.unexpected_kind());
    };
    let shape = cx.input_info(0)?.shape;
    let rank = shape.len();
    let mut pads = vec![0i64; 2 * rank];
    for range in resolve_slice(&shape, &starts, &ends, &axes)? {
        pads[range.axis] = range.start as i64;
        pads[range.axis + rank] = shape[range.axis] - range.end as i64;
    }
    unary(cx, OpKind::Pad { pads, value: 0.0 }, vec![g.clone()])
}

fn pad_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    let OpKind::Pad { pads, .. } = cx.fwd().kind.clone() else {
        return Err(cx.unexpected_kind());
    };
    let shape = cx.input_info(0)?.shape;
    let starts = pads[..shape.len()].to_vec();
    let ends = starts.iter().zip(&shape).map(|(s, d)| s + d).collect();
    let axes = (0..shape.len() as i64).collect();
    unary(cx, OpKind::Slice { starts, ends, axes }, vec![g.clone()])
}

fn concat_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    let OpKind::Concat { axis } = cx.fwd().kind else {
        return Err(cx.unexpected_kind());
    };
    let axis = cx.input_info(0)?.axis(axis)? as i64;
    let mut offset = 0;
    let mut grads = Vec::with_capacity(cx.fwd().inputs.len());
    for i in 0..cx.fwd().inputs.len() {
        let extent = cx.input_info(i)?.shape[axis as usize];
        if cx.needs(i) {
            let kind = OpKind::Slice {
                starts: vec![offset],
                ends: vec![offset + extent],
                axes: vec![axis],
            };
            grads.push(Some(cx.grad_op(kind, vec![g.clone()])?));
        } else {
            grads.push(None);
        }
        offset += extent;
    }
    Ok(grads)
}

fn gather_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    let OpKind::Gather { axis } = cx.fwd().kind else {
        return Err(cx.unexpected_kind());
    };
    let shape = cx.input_info(0)?.shape;
    let indices = cx.input(1);
    let data = if cx.needs(0) {
        Some(cx.grad_op(OpKind::GatherGrad { axis, shape }, vec![g.clone(), indices])?)
    } else {
        None
    };
    Ok(vec![data, None])
}

fn scatter_grad(cx: &mut GradCx<'_>, g: &TensorId) -> Result<Vec<Option<TensorId>>> {
    let OpKind::Scatter { axis } = cx.fwd().kind else {
        return Err(cx.unexpected_kind());
    };
    let indices = cx.input(1);
    let data = if cx.needs(0) {
        Some(cx.grad_op(OpKind::ScatterDataGrad { axis }, vec![g.clone(), indices.clone()])?)
    } else {
        None
    };
    let updates = if cx.needs(2) {
        Some(cx.grad_op(OpKind::ScatterUpdatesGrad { axis }, vec![g.clone(), indices])?)
    } else {
        None
    };
    Ok(vec![data, None, updates])
}

impl GradCx<'_> {
    fn unexpected_kind(&self) -> Error {
        Error::invalid_graph(format!(
            "grad builder for {} called on '{}'",
            self.fwd().op_type(),
            self.fwd().name
        ))
    }
}
