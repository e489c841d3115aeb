//! Output shape inference for every [`OpKind`].

use crate::error::{Error, Result};
use crate::tensor::{np_broadcast, TensorInfo};

use super::op::OpKind;

/// A resolved slice along one axis: `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceRange {
    pub axis: usize,
    pub start: usize,
    pub end: usize,
}

/// Resolves ONNX-style slice bounds against `shape`, clamping out of range
/// values and wrapping negative ones.
pub fn resolve_slice(
    shape: &[i64],
    starts: &[i64],
    ends: &[i64],
    axes: &[i64],
) -> Result<Vec<SliceRange>> {
    if starts.len() != ends.len() || starts.len() != axes.len() {
        return Err(Error::shape(format!(
            "slice starts ({}), ends ({}) and axes ({}) must have the same length",
            starts.len(),
            ends.len(),
            axes.len()
        )));
    }
    let rank = shape.len() as i64;
    let mut ranges = Vec::with_capacity(axes.len());
    for ((&start, &end), &axis) in starts.iter().zip(ends).zip(axes) {
        let axis = if axis < 0 { axis + rank } else { axis };
        if axis < 0 || axis >= rank {
            return Err(Error::shape(format!(
                "slice axis {axis} out of range for rank {rank}"
            )));
        }
        let dim = shape[axis as usize];
        let clamp = |v: i64| -> usize {
            let v = if v < 0 { v + dim } else { v };
            v.clamp(0, dim) as usize
        };
        let start = clamp(start);
        let end = clamp(end).max(start);
        ranges.push(SliceRange {
            axis: axis as usize,
            start,
            end,
        });
    }
    Ok(ranges)
}

/// Normalizes reduction axes; `None` reduces over every axis.
pub fn resolve_axes(info: &TensorInfo, axes: Option<&[i64]>) -> Result<Vec<usize>> {
    let mut out = match axes {
        None => (0..info.rank()).collect::<Vec<_>>(),
        Some(axes) => axes
            .iter()
            .map(|&a| info.axis(a))
            .collect::<Result<Vec<_>>>()?,
    };
    out.sort_unstable();
    out.dedup();
    Ok(out)
}

pub fn reduced_shape(shape: &[i64], axes: &[usize], keepdims: bool) -> Vec<i64> {
    let mut out = Vec::with_capacity(shape.len());
    for (i, &d) in shape.iter().enumerate() {
        if axes.contains(&i) {
            if keepdims {
                out.push(1);
            }
        } else {
            out.push(d);
        }
    }
    out
}

fn arity(kind: &OpKind, inputs: &[&TensorInfo], expected: usize) -> Result<()> {
    if inputs.len() != expected {
        return Err(Error::shape(format!(
            "{kind} expects {expected} inputs, got {}",
            inputs.len()
        )));
    }
    Ok(())
}

fn require_int(kind: &OpKind, info: &TensorInfo, what: &str) -> Result<()> {
    if info.dtype.is_float() {
        return Err(Error::shape(format!(
            "{kind} {what} must be an integer tensor, got {}",
            info.dtype
        )));
    }
    Ok(())
}

fn require_broadcastable_to(kind: &OpKind, grad: &TensorInfo, shape: &[i64]) -> Result<()> {
    let merged = np_broadcast(shape, &grad.shape)?;
    if merged != grad.shape {
        return Err(Error::shape(format!(
            "{kind} cannot reduce {:?} to {shape:?}",
            grad.shape
        )));
    }
    Ok(())
}

impl OpKind {
    /// Infers output infos from input infos.
    pub fn infer_outputs(&self, inputs: &[&TensorInfo]) -> Result<Vec<TensorInfo>> {
        let out = match self {
            OpKind::Identity
            | OpKind::Neg
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
            | OpKind::Clip { .. } => {
                arity(self, inputs, 1)?;
                inputs[0].clone()
            }
            OpKind::Softmax { axis } => {
                arity(self, inputs, 1)?;
                inputs[0].axis(*axis)?;
                inputs[0].clone()
            }
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => {
                arity(self, inputs, 2)?;
                if inputs[0].dtype != inputs[1].dtype {
                    return Err(Error::shape(format!(
                        "{self} inputs have different types {} and {}",
                        inputs[0].dtype, inputs[1].dtype
                    )));
                }
                inputs[0].with_shape(np_broadcast(&inputs[0].shape, &inputs[1].shape)?)
            }
            OpKind::Sum => {
                if inputs.is_empty() {
                    return Err(Error::shape("Sum expects at least one input"));
                }
                let mut shape = inputs[0].shape.clone();
                for info in &inputs[1..] {
                    shape = np_broadcast(&shape, &info.shape)?;
                }
                inputs[0].with_shape(shape)
            }
            OpKind::MatMul => {
                arity(self, inputs, 2)?;
                let (a, b) = (inputs[0], inputs[1]);
                if a.rank() != 2 || b.rank() != 2 {
                    return Err(Error::shape(format!(
                        "MatMul supports rank 2 operands, got {:?} and {:?}",
                        a.shape, b.shape
                    )));
                }
                if a.shape[1] != b.shape[0] {
                    return Err(Error::shape(format!(
                        "MatMul inner dimensions differ: {:?} x {:?}",
                        a.shape, b.shape
                    )));
                }
                a.with_shape([a.shape[0], b.shape[1]])
            }
            OpKind::ReduceSum { axes, keepdims } => {
                arity(self, inputs, 1)?;
                let axes = resolve_axes(inputs[0], axes.as_deref())?;
                inputs[0].with_shape(reduced_shape(&inputs[0].shape, &axes, *keepdims))
            }
            OpKind::Reshape { shape } => {
                arity(self, inputs, 1)?;
                let out = inputs[0].with_shape(shape.clone());
                if shape.iter().any(|&d| d < 0) || out.nelms() != inputs[0].nelms() {
                    return Err(Error::shape(format!(
                        "cannot reshape {:?} to {shape:?}",
                        inputs[0].shape
                    )));
                }
                out
            }
            OpKind::Transpose { perm } => {
                arity(self, inputs, 1)?;
                let rank = inputs[0].rank();
                let mut seen = vec![false; rank];
                let mut shape = Vec::with_capacity(rank);
                if perm.len() != rank {
                    return Err(Error::shape(format!(
                        "Transpose perm {perm:?} does not match rank {rank}"
                    )));
                }
                for &p in perm {
                    let p = inputs[0].axis(p)?;
                    if seen[p] {
                        return Err(Error::shape(format!(
                            "Transpose perm {perm:?} repeats axis {p}"
                        )));
                    }
                    seen[p] = true;
                    shape.push(inputs[0].shape[p]);
                }
                inputs[0].with_shape(shape)
            }
            OpKind::Slice { starts, ends, axes } => {
                arity(self, inputs, 1)?;
                let mut shape = inputs[0].shape.clone();
                for range in resolve_slice(&inputs[0].shape, starts, ends, axes)? {
                    shape[range.axis] = (range.end - range.start) as i64;
                }
                inputs[0].with_shape(shape)
            }
            OpKind::Pad { pads, .. } => {
                arity(self, inputs, 1)?;
                let rank = inputs[0].rank();
                if pads.len() != 2 * rank || pads.iter().any(|&p| p < 0) {
                    return Err(Error::shape(format!(
                        "Pad expects {} non-negative pads for rank {rank}, got {pads:?}",
                        2 * rank
                    )));
                }
                let shape = (0..rank)
                    .map(|i| inputs[0].shape[i] + pads[i] + pads[i + rank])
                    .collect::<Vec<_>>();
                inputs[0].with_shape(shape)
            }
            OpKind::Concat { axis } => {
                if inputs.is_empty() {
                    return Err(Error::shape("Concat expects at least one input"));
                }
                let first = inputs[0];
                let axis = first.axis(*axis)?;
                let mut shape = first.shape.clone();
                for info in &inputs[1..] {
                    let compatible = info.rank() == first.rank()
                        && info.dtype == first.dtype
                        && (0..first.rank()).all(|i| i == axis || info.shape[i] == first.shape[i]);
                    if !compatible {
                        return Err(Error::shape(format!(
                            "Concat inputs {} and {info} are incompatible along axis {axis}",
                            first
                        )));
                    }
                    shape[axis] += info.shape[axis];
                }
                first.with_shape(shape)
            }
            OpKind::Gather { axis } => {
                arity(self, inputs, 2)?;
                let (data, indices) = (inputs[0], inputs[1]);
                require_int(self, indices, "indices")?;
                let axis = data.axis(*axis)?;
                let mut shape = data.shape[..axis].to_vec();
                shape.extend_from_slice(&indices.shape);
                shape.extend_from_slice(&data.shape[axis + 1..]);
                data.with_shape(shape)
            }
            OpKind::Scatter { axis } => {
                arity(self, inputs, 3)?;
                let (data, indices, updates) = (inputs[0], inputs[1], inputs[2]);
                require_int(self, indices, "indices")?;
                data.axis(*axis)?;
                if indices.shape != updates.shape || indices.rank() != data.rank() {
                    return Err(Error::shape(format!(
                        "Scatter indices {:?} and updates {:?} must match and have the rank of data {:?}",
                        indices.shape, updates.shape, data.shape
                    )));
                }
                data.clone()
            }
            OpKind::ReduceToShape { shape } => {
                arity(self, inputs, 1)?;
                require_broadcastable_to(self, inputs[0], shape)?;
                inputs[0].with_shape(shape.clone())
            }
            OpKind::SqrtGrad
            | OpKind::ReciprocalGrad
            | OpKind::ExpGrad
            | OpKind::ReluGrad
            | OpKind::SigmoidGrad
            | OpKind::TanhGrad
            | OpKind::SoftmaxGrad { .. }
            | OpKind::ClipGrad { .. } => {
                arity(self, inputs, 2)?;
                inputs[0].clone()
            }
            OpKind::SubtractArg1Grad { shape } => {
                arity(self, inputs, 1)?;
                require_broadcastable_to(self, inputs[0], shape)?;
                inputs[0].with_shape(shape.clone())
            }
            OpKind::MulArgGrad { shape } | OpKind::DivArg0Grad { shape } => {
                arity(self, inputs, 2)?;
                let full = np_broadcast(&inputs[0].shape, &inputs[1].shape)?;
                require_broadcastable_to(self, &inputs[0].with_shape(full), shape)?;
                inputs[0].with_shape(shape.clone())
            }
            OpKind::DivArg1Grad { shape } => {
                arity(self, inputs, 3)?;
                let full = np_broadcast(&inputs[0].shape, &inputs[1].shape)?;
                let full = np_broadcast(&full, &inputs[2].shape)?;
                require_broadcastable_to(self, &inputs[0].with_shape(full), shape)?;
                inputs[0].with_shape(shape.clone())
            }
            OpKind::ReduceSumGrad { shape, .. } => {
                arity(self, inputs, 1)?;
                inputs[0].with_shape(shape.clone())
            }
            OpKind::GatherGrad { shape, .. } => {
                arity(self, inputs, 2)?;
                require_int(self, inputs[1], "indices")?;
                inputs[0].with_shape(shape.clone())
            }
            OpKind::ScatterDataGrad { .. } => {
                arity(self, inputs, 2)?;
                require_int(self, inputs[1], "indices")?;
                inputs[0].clone()
            }
            OpKind::ScatterUpdatesGrad { .. } => {
                arity(self, inputs, 2)?;
                require_int(self, inputs[1], "indices")?;
                inputs[0].with_shape(inputs[1].shape.clone())
            }
            OpKind::Nll { .. } => {
                arity(self, inputs, 2)?;
                let (probs, labels) = (inputs[0], inputs[1]);
                require_int(self, labels, "labels")?;
                if probs.rank() != 2 || labels.rank() != 1 || labels.shape[0] != probs.shape[0] {
                    return Err(Error::shape(format!(
                        "NllLoss expects probs [N, C] and labels [N], got {:?} and {:?}",
                        probs.shape, labels.shape
                    )));
                }
                TensorInfo::scalar(probs.dtype)
            }
            OpKind::L1 { .. } => {
                arity(self, inputs, 1)?;
                TensorInfo::scalar(inputs[0].dtype)
            }
            OpKind::NllGrad { .. } => {
                arity(self, inputs, 3)?;
                inputs[0].clone()
            }
            OpKind::L1Grad { .. } => {
                arity(self, inputs, 2)?;
                inputs[0].clone()
            }
            OpKind::SgdVarUpdate => {
                arity(self, inputs, 5)?;
                if inputs[0].shape != inputs[1].shape {
                    return Err(Error::shape(format!(
                        "weight {:?} and gradient {:?} differ",
                        inputs[0].shape, inputs[1].shape
                    )));
                }
                inputs[0].clone()
            }
        };
        Ok(vec![out])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(shape: &[i64]) -> TensorInfo {
        TensorInfo::float(shape.to_vec())
    }

    #[test]
    fn slice_clamps_and_wraps() {
        let ranges = resolve_slice(&[4, 6], &[-3, 1], &[100, -1], &[0, 1]).expect("slice");
        assert_eq!(
            ranges,
            vec![
                SliceRange {
                    axis: 0,
                    start: 1,
                    end: 4
                },
                SliceRange {
                    axis: 1,
                    start: 1,
                    end: 5
                },
            ]
        );
    }

    #[test]
    fn div_grad_shapes_reduce_to_operands() {
        let g = info(&[4, 3, 4]);
        let a = info(&[4, 1, 4]);
        let b = info(&[3, 1]);
        let da = OpKind::DivArg0Grad { shape: vec![4, 1, 4] }
            .infer_outputs(&[&g, &b])
            .expect("arg0");
        assert_eq!(da[0].shape, vec![4, 1, 4]);
        let db = OpKind::DivArg1Grad { shape: vec![3, 1] }
            .infer_outputs(&[&g, &a, &b])
            .expect("arg1");
        assert_eq!(db[0].shape, vec![3, 1]);
    }

    #[test]
    fn reduce_sum_respects_keepdims() {
        let x = info(&[2, 3, 4]);
        let kept = OpKind::ReduceSum {
            axes: Some(vec![-1]),
            keepdims: true,
        }
        .infer_outputs(&[&x])
        .expect("reduce");
        assert_eq!(kept[0].shape, vec![2, 3, 1]);
        let all = OpKind::ReduceSum {
            axes: None,
            keepdims: false,
        }
        .infer_outputs(&[&x])
        .expect("reduce");
        assert!(all[0].shape.is_empty());
    }

    #[test]
    fn matmul_rejects_mismatched_inner_dims() {
        assert!(OpKind::MatMul
            .infer_outputs(&[&info(&[2, 3]), &info(&[4, 2])])
            .is_err());
    }
}
