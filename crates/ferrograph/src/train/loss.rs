use std::fmt;

use crate::ir::{OpKind, ReductionType, TensorId};

/// A scalar objective computed from graph tensors.
///
/// Every loss becomes one op in the loss fragment, writing `output_id`, and
/// one grad op seeding the backward pass.
pub trait Loss: fmt::Debug + Send + Sync {
    fn input_ids(&self) -> Vec<TensorId>;

    fn output_id(&self) -> &str;

    fn reduction(&self) -> ReductionType;

    fn op_kind(&self) -> OpKind;

    /// Kind of the op producing the gradient for `input_ids()[0]`. Its inputs
    /// are the loss inputs followed by the seed.
    fn grad_kind(&self) -> OpKind;

    fn clone_box(&self) -> Box<dyn Loss>;
}

impl Clone for Box<dyn Loss> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Negative log likelihood over probabilities `[N, C]` and labels `[N]`.
#[derive(Debug, Clone, PartialEq)]
pub struct NllLoss {
    probs: TensorId,
    labels: TensorId,
    output: TensorId,
    reduction: ReductionType,
    ignore_index: Option<i64>,
}

impl NllLoss {
    pub fn new(
        probs: impl Into<TensorId>,
        labels: impl Into<TensorId>,
        output: impl Into<TensorId>,
        reduction: ReductionType,
    ) -> Self {
        Self {
            probs: probs.into(),
            labels: labels.into(),
            output: output.into(),
            reduction,
            ignore_index: None,
        }
    }

    /// Samples whose label equals `index` contribute nothing.
    pub fn with_ignore_index(mut self, index: i64) -> Self {
        self.ignore_index = Some(index);
        self
    }
}

impl Loss for NllLoss {
    fn input_ids(&self) -> Vec<TensorId> {
        vec![self.probs.clone(), self.labels.clone()]
    }

    fn output_id(&self) -> &str {
        &self.output
    }

    fn reduction(&self) -> ReductionType {
        self.reduction
    }

    fn op_kind(&self) -> OpKind {
        OpKind::Nll {
            reduction: self.reduction,
            ignore_index: self.ignore_index,
        }
    }

    fn grad_kind(&self) -> OpKind {
        OpKind::NllGrad {
            reduction: self.reduction,
            ignore_index: self.ignore_index,
        }
    }

    fn clone_box(&self) -> Box<dyn Loss> {
        Box::new(self.clone())
    }
}

/// `lambda * sum(|x|)`, divided by the batch size under `Mean`.
#[derive(Debug, Clone, PartialEq)]
pub struct L1Loss {
    input: TensorId,
    output: TensorId,
    lambda: f32,
    reduction: ReductionType,
}

impl L1Loss {
    pub fn new(
        input: impl Into<TensorId>,
        output: impl Into<TensorId>,
        lambda: f32,
        reduction: ReductionType,
    ) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            lambda,
            reduction,
        }
    }
}

impl Loss for L1Loss {
    fn input_ids(&self) -> Vec<TensorId> {
        vec![self.input.clone()]
    }

    fn output_id(&self) -> &str {
        &self.output
    }

    fn reduction(&self) -> ReductionType {
        self.reduction
    }

    fn op_kind(&self) -> OpKind {
        OpKind::L1 {
            lambda: self.lambda,
            reduction: self.reduction,
        }
    }

    fn grad_kind(&self) -> OpKind {
        OpKind::L1Grad {
            lambda: self.lambda,
            reduction: self.reduction,
        }
    }

    fn clone_box(&self) -> Box<dyn Loss> {
        Box::new(self.clone())
    }
}
