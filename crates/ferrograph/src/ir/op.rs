use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::proto::{AttributeValue, NodeProto};

use super::TensorId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId(pub usize);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which program fragment an op belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    Forward,
    Loss,
    Backward,
    WeightUpdate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReductionType {
    #[default]
    Sum,
    Mean,
}

/// Closed set of operations with their typed attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    Identity,
    Neg,
    Reciprocal,
    Sqrt,
    Square,
    Exp,
    Log,
    Abs,
    Sign,
    Ceil,
    Floor,
    Relu,
    Sigmoid,
    Tanh,
    Scale { factor: f32 },
    Clip { min: f32, max: f32 },
    Softmax { axis: i64 },
    Add,
    Sub,
    Mul,
    Div,
    MatMul,
    Sum,
    ReduceSum { axes: Option<Vec<i64>>, keepdims: bool },
    Reshape { shape: Vec<i64> },
    Transpose { perm: Vec<i64> },
    Slice { starts: Vec<i64>, ends: Vec<i64>, axes: Vec<i64> },
    Pad { pads: Vec<i64>, value: f32 },
    Concat { axis: i64 },
    Gather { axis: i64 },
    Scatter { axis: i64 },

    /// Sums a broadcast gradient back down to `shape`.
    ReduceToShape { shape: Vec<i64> },
    SqrtGrad,
    ReciprocalGrad,
    ExpGrad,
    ReluGrad,
    SigmoidGrad,
    TanhGrad,
    SoftmaxGrad { axis: i64 },
    ClipGrad { min: f32, max: f32 },
    DivArg0Grad { shape: Vec<i64> },
    DivArg1Grad { shape: Vec<i64> },
    MulArgGrad { shape: Vec<i64> },
    SubtractArg1Grad { shape: Vec<i64> },
    ReduceSumGrad { shape: Vec<i64>, axes: Vec<i64> },
    GatherGrad { axis: i64, shape: Vec<i64> },
    ScatterDataGrad { axis: i64 },
    ScatterUpdatesGrad { axis: i64 },

    Nll { reduction: ReductionType, ignore_index: Option<i64> },
    L1 { lambda: f32, reduction: ReductionType },
    NllGrad { reduction: ReductionType, ignore_index: Option<i64> },
    L1Grad { lambda: f32, reduction: ReductionType },

    /// `w - lr * (g / ls + wd * w)` over inputs `(w, g, lr, wd, ls)`.
    SgdVarUpdate,
}

/// Fieldless tag of an [`OpKind`], used as registry key and in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OpType {
    Identity,
    Neg,
    Reciprocal,
    Sqrt,
    Square,
    Exp,
    Log,
    Abs,
    Sign,
    Ceil,
    Floor,
    Relu,
    Sigmoid,
    Tanh,
    Scale,
    Clip,
    Softmax,
    Add,
    Sub,
    Mul,
    Div,
    MatMul,
    Sum,
    ReduceSum,
    Reshape,
    Transpose,
    Slice,
    Pad,
    Concat,
    Gather,
    Scatter,
    ReduceToShape,
    SqrtGrad,
    ReciprocalGrad,
    ExpGrad,
    ReluGrad,
    SigmoidGrad,
    TanhGrad,
    SoftmaxGrad,
    ClipGrad,
    DivArg0Grad,
    DivArg1Grad,
    MulArgGrad,
    SubtractArg1Grad,
    ReduceSumGrad,
    GatherGrad,
    ScatterDataGrad,
    ScatterUpdatesGrad,
    Nll,
    L1,
    NllGrad,
    L1Grad,
    SgdVarUpdate,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Identity => "Identity",
            OpType::Neg => "Neg",
            OpType::Reciprocal => "Reciprocal",
            OpType::Sqrt => "Sqrt",
            OpType::Square => "Square",
            OpType::Exp => "Exp",
            OpType::Log => "Log",
            OpType::Abs => "Abs",
            OpType::Sign => "Sign",
            OpType::Ceil => "Ceil",
            OpType::Floor => "Floor",
            OpType::Relu => "Relu",
            OpType::Sigmoid => "Sigmoid",
            OpType::Tanh => "Tanh",
            OpType::Scale => "Scale",
            OpType::Clip => "Clip",
            OpType::Softmax => "Softmax",
            OpType::Add => "Add",
            OpType::Sub => "Sub",
            OpType::Mul => "Mul",
            OpType::Div => "Div",
            OpType::MatMul => "MatMul",
            OpType::Sum => "Sum",
            OpType::ReduceSum => "ReduceSum",
            OpType::Reshape => "Reshape",
            OpType::Transpose => "Transpose",
            OpType::Slice => "Slice",
            OpType::Pad => "Pad",
            OpType::Concat => "Concat",
            OpType::Gather => "Gather",
            OpType::Scatter => "Scatter",
            OpType::ReduceToShape => "ReduceToShape",
            OpType::SqrtGrad => "SqrtGrad",
            OpType::ReciprocalGrad => "ReciprocalGrad",
            OpType::ExpGrad => "ExpGrad",
            OpType::ReluGrad => "ReluGrad",
            OpType::SigmoidGrad => "SigmoidGrad",
            OpType::TanhGrad => "TanhGrad",
            OpType::SoftmaxGrad => "SoftmaxGrad",
            OpType::ClipGrad => "ClipGrad",
            OpType::DivArg0Grad => "DivArg0Grad",
            OpType::DivArg1Grad => "DivArg1Grad",
            OpType::MulArgGrad => "MulArgGrad",
            OpType::SubtractArg1Grad => "SubtractArg1Grad",
            OpType::ReduceSumGrad => "ReduceSumGrad",
            OpType::GatherGrad => "GatherGrad",
            OpType::ScatterDataGrad => "ScatterDataGrad",
            OpType::ScatterUpdatesGrad => "ScatterUpdatesGrad",
            OpType::Nll => "Nll",
            OpType::L1 => "L1",
            OpType::NllGrad => "NllGrad",
            OpType::L1Grad => "L1Grad",
            OpType::SgdVarUpdate => "SGDVarUpdate",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl OpKind {
    pub fn op_type(&self) -> OpType {
        match self {
            OpKind::Identity => OpType::Identity,
            OpKind::Neg => OpType::Neg,
            OpKind::Reciprocal => OpType::Reciprocal,
            OpKind::Sqrt => OpType::Sqrt,
            OpKind::Square => OpType::Square,
            OpKind::Exp => OpType::Exp,
            OpKind::Log => OpType::Log,
            OpKind::Abs => OpType::Abs,
            OpKind::Sign => OpType::Sign,
            OpKind::Ceil => OpType::Ceil,
            OpKind::Floor => OpType::Floor,
            OpKind::Relu => OpType::Relu,
            OpKind::Sigmoid => OpType::Sigmoid,
            OpKind::Tanh => OpType::Tanh,
            OpKind::Scale { .. } => OpType::Scale,
            OpKind::Clip { .. } => OpType::Clip,
            OpKind::Softmax { .. } => OpType::Softmax,
            OpKind::Add => OpType::Add,
            OpKind::Sub => OpType::Sub,
            OpKind::Mul => OpType::Mul,
            OpKind::Div => OpType::Div,
            OpKind::MatMul => OpType::MatMul,
            OpKind::Sum => OpType::Sum,
            OpKind::ReduceSum { .. } => OpType::ReduceSum,
            OpKind::Reshape { .. } => OpType::Reshape,
            OpKind::Transpose { .. } => OpType::Transpose,
            OpKind::Slice { .. } => OpType::Slice,
            OpKind::Pad { .. } => OpType::Pad,
            OpKind::Concat { .. } => OpType::Concat,
            OpKind::Gather { .. } => OpType::Gather,
            OpKind::Scatter { .. } => OpType::Scatter,
            OpKind::ReduceToShape { .. } => OpType::ReduceToShape,
            OpKind::SqrtGrad => OpType::SqrtGrad,
            OpKind::ReciprocalGrad => OpType::ReciprocalGrad,
            OpKind::ExpGrad => OpType::ExpGrad,
            OpKind::ReluGrad => OpType::ReluGrad,
            OpKind::SigmoidGrad => OpType::SigmoidGrad,
            OpKind::TanhGrad => OpType::TanhGrad,
            OpKind::SoftmaxGrad { .. } => OpType::SoftmaxGrad,
            OpKind::ClipGrad { .. } => OpType::ClipGrad,
            OpKind::DivArg0Grad { .. } => OpType::DivArg0Grad,
            OpKind::DivArg1Grad { .. } => OpType::DivArg1Grad,
            OpKind::MulArgGrad { .. } => OpType::MulArgGrad,
            OpKind::SubtractArg1Grad { .. } => OpType::SubtractArg1Grad,
            OpKind::ReduceSumGrad { .. } => OpType::ReduceSumGrad,
            OpKind::GatherGrad { .. } => OpType::GatherGrad,
            OpKind::ScatterDataGrad { .. } => OpType::ScatterDataGrad,
            OpKind::ScatterUpdatesGrad { .. } => OpType::ScatterUpdatesGrad,
            OpKind::Nll { .. } => OpType::Nll,
            OpKind::L1 { .. } => OpType::L1,
            OpKind::NllGrad { .. } => OpType::NllGrad,
            OpKind::L1Grad { .. } => OpType::L1Grad,
            OpKind::SgdVarUpdate => OpType::SgdVarUpdate,
        }
    }

    /// Ops that may write their result into the buffer of their first input.
    pub fn supports_inplace(&self) -> bool {
        matches!(
            self,
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
                | OpKind::Div
        )
    }

    pub fn is_loss(&self) -> bool {
        matches!(self, OpKind::Nll { .. } | OpKind::L1 { .. })
    }

    /// Decodes a forward op from a model node.
    pub fn from_node(node: &NodeProto) -> Result<OpKind> {
        let axis = |default: i64| node.attr_int("axis").unwrap_or(default);
        let ints = |name: &str| -> Result<Vec<i64>> {
            node.attr_ints(name).map(<[i64]>::to_vec).ok_or_else(|| {
                Error::invalid_graph(format!(
                    "{} node '{}' is missing attribute '{name}'",
                    node.op_type, node.name
                ))
            })
        };
        let kind = match node.op_type.as_str() {
            "Identity" => OpKind::Identity,
            "Neg" => OpKind::Neg,
            "Reciprocal" => OpKind::Reciprocal,
            "Sqrt" => OpKind::Sqrt,
            "Square" => OpKind::Square,
            "Exp" => OpKind::Exp,
            "Log" => OpKind::Log,
            "Abs" => OpKind::Abs,
            "Sign" => OpKind::Sign,
            "Ceil" => OpKind::Ceil,
            "Floor" => OpKind::Floor,
            "Relu" => OpKind::Relu,
            "Sigmoid" => OpKind::Sigmoid,
            "Tanh" => OpKind::Tanh,
            "Scale" => OpKind::Scale {
                factor: node.attr_float("scale").unwrap_or(1.0),
            },
            "Clip" => OpKind::Clip {
                min: node.attr_float("min").unwrap_or(f32::MIN),
                max: node.attr_float("max").unwrap_or(f32::MAX),
            },
            "Softmax" => OpKind::Softmax { axis: axis(1) },
            "Add" => OpKind::Add,
            "Sub" => OpKind::Sub,
            "Mul" => OpKind::Mul,
            "Div" => OpKind::Div,
            "MatMul" => OpKind::MatMul,
            "Sum" => OpKind::Sum,
            "ReduceSum" => OpKind::ReduceSum {
                axes: node.attr_ints("axes").map(<[i64]>::to_vec),
                keepdims: node.attr_int("keepdims").unwrap_or(1) != 0,
            },
            "Reshape" => OpKind::Reshape {
                shape: ints("shape")?,
            },
            "Transpose" => OpKind::Transpose {
                perm: ints("perm")?,
            },
            "Slice" => OpKind::Slice {
                starts: ints("starts")?,
                ends: ints("ends")?,
                axes: ints("axes")?,
            },
            "Pad" => OpKind::Pad {
                pads: ints("pads")?,
                value: node.attr_float("value").unwrap_or(0.0),
            },
            "Concat" => OpKind::Concat { axis: axis(0) },
            "Gather" => OpKind::Gather { axis: axis(0) },
            "Scatter" => OpKind::Scatter { axis: axis(0) },
            other => {
                return Err(Error::invalid_graph(format!(
                    "op type '{other}' of node '{}' is not supported",
                    node.name
                )))
            }
        };
        Ok(kind)
    }

    /// Encodes the attributes of a forward op for a model node.
    pub fn to_attributes(&self) -> BTreeMap<String, AttributeValue> {
        let mut attrs = BTreeMap::new();
        let mut put = |name: &str, value: AttributeValue| {
            attrs.insert(name.to_string(), value);
        };
        match self {
            OpKind::Scale { factor } => put("scale", AttributeValue::Float(*factor)),
            OpKind::Clip { min, max } => {
                put("min", AttributeValue::Float(*min));
                put("max", AttributeValue::Float(*max));
            }
            OpKind::Softmax { axis }
            | OpKind::Concat { axis }
            | OpKind::Gather { axis }
            | OpKind::Scatter { axis } => put("axis", AttributeValue::Int(*axis)),
            OpKind::ReduceSum { axes, keepdims } => {
                if let Some(axes) = axes {
                    put("axes", AttributeValue::Ints(axes.clone()));
                }
                put("keepdims", AttributeValue::Int(i64::from(*keepdims)));
            }
            OpKind::Reshape { shape } => put("shape", AttributeValue::Ints(shape.clone())),
            OpKind::Transpose { perm } => put("perm", AttributeValue::Ints(perm.clone())),
            OpKind::Slice { starts, ends, axes } => {
                put("starts", AttributeValue::Ints(starts.clone()));
                put("ends", AttributeValue::Ints(ends.clone()));
                put("axes", AttributeValue::Ints(axes.clone()));
            }
            OpKind::Pad { pads, value } => {
                put("pads", AttributeValue::Ints(pads.clone()));
                put("value", AttributeValue::Float(*value));
            }
            _ => {}
        }
        attrs
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.op_type().as_str())
    }
}

/// A node of the IR graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Op {
    pub id: OpId,
    pub kind: OpKind,
    pub name: String,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub phase: Phase,
    pub virtual_graph: Option<i64>,
    pub inplace: bool,
    pub excluded_patterns: BTreeSet<String>,
    /// For ops created by autodiff, the forward op they differentiate.
    pub fwd_op: Option<OpId>,
}

impl Op {
    pub fn op_type(&self) -> OpType {
        self.kind.op_type()
    }

    /// Type name as it appears in reports, with an `Inplace` suffix when the
    /// op reuses its first input's buffer.
    pub fn display_type(&self) -> String {
        if self.inplace {
            format!("{}Inplace", self.op_type())
        } else {
            self.op_type().to_string()
        }
    }

    pub fn output(&self) -> &TensorId {
        &self.outputs[0]
    }

    pub fn is_pattern_excluded(&self, pattern: &str) -> bool {
        self.excluded_patterns.contains(pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_survive_node_encoding() {
        let kinds = [
            OpKind::Slice {
                starts: vec![0, 1],
                ends: vec![2, 3],
                axes: vec![0, 1],
            },
            OpKind::ReduceSum {
                axes: Some(vec![1]),
                keepdims: false,
            },
            OpKind::ReduceSum {
                axes: None,
                keepdims: true,
            },
            OpKind::Clip { min: -1.0, max: 2.0 },
            OpKind::Pad {
                pads: vec![1, 0, 1, 0],
                value: 0.5,
            },
        ];
        for kind in kinds {
            let node = NodeProto {
                name: "n".into(),
                op_type: kind.op_type().as_str().to_string(),
                domain: String::new(),
                inputs: vec![],
                outputs: vec![],
                attributes: kind.to_attributes(),
            };
            assert_eq!(OpKind::from_node(&node).expect("decode"), kind);
        }
    }

    #[test]
    fn unknown_node_type_is_rejected() {
        let node = NodeProto {
            name: "n".into(),
            op_type: "Conv".into(),
            domain: String::new(),
            inputs: vec![],
            outputs: vec![],
            attributes: BTreeMap::new(),
        };
        assert!(matches!(
            OpKind::from_node(&node),
            Err(Error::InvalidGraph(_))
        ));
    }
}
