use serde::{Deserialize, Serialize};

use crate::tensor::HostTensor;

pub const LEARNING_RATE_ID: &str = "learningRate_FLOAT";
pub const WEIGHT_DECAY_ID: &str = "weightDecay_FLOAT";
pub const LOSS_SCALING_ID: &str = "lossScaling_FLOAT";

/// A hyper-parameter that is either baked into the executable or streamed
/// from the host by `optimizerFromHost`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerValue {
    pub val: f32,
    pub is_const: bool,
}

impl OptimizerValue {
    pub fn constant(val: f32) -> Self {
        Self { val, is_const: true }
    }

    pub fn variable(val: f32) -> Self {
        Self {
            val,
            is_const: false,
        }
    }

    pub fn as_host_tensor(&self) -> HostTensor {
        HostTensor::scalar_f32(self.val)
    }

    /// Const values must stay identical; streamed values may change.
    fn can_be_replaced_by(&self, other: &OptimizerValue) -> bool {
        self.is_const == other.is_const && (!self.is_const || self.val == other.val)
    }
}

/// Stochastic gradient descent: `w -= lr * (g / ls + wd * w)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sgd {
    pub learning_rate: OptimizerValue,
    pub weight_decay: OptimizerValue,
    pub loss_scaling: OptimizerValue,
}

impl Sgd {
    pub fn new(
        learning_rate: OptimizerValue,
        weight_decay: OptimizerValue,
        loss_scaling: OptimizerValue,
    ) -> Self {
        Self {
            learning_rate,
            weight_decay,
            loss_scaling,
        }
    }

    /// Every value compiled in, no weight decay and no loss scaling.
    pub fn constant(learning_rate: f32) -> Self {
        Self::new(
            OptimizerValue::constant(learning_rate),
            OptimizerValue::constant(0.0),
            OptimizerValue::constant(1.0),
        )
    }

    /// Learning rate and weight decay streamed from the host.
    pub fn streamed(learning_rate: f32, weight_decay: f32) -> Self {
        Self::new(
            OptimizerValue::variable(learning_rate),
            OptimizerValue::variable(weight_decay),
            OptimizerValue::constant(1.0),
        )
    }

    pub fn is_const(&self) -> bool {
        self.values().iter().all(|(_, v)| v.is_const)
    }

    /// The hyper-parameter tensors with their names.
    pub fn values(&self) -> [(&'static str, OptimizerValue); 3] {
        [
            (LEARNING_RATE_ID, self.learning_rate),
            (WEIGHT_DECAY_ID, self.weight_decay),
            (LOSS_SCALING_ID, self.loss_scaling),
        ]
    }

    /// Whether `other` can be swapped in without recompiling.
    pub fn valid_replacement(&self, other: &Sgd) -> bool {
        self.values()
            .iter()
            .zip(other.values())
            .all(|((_, mine), (_, theirs))| mine.can_be_replaced_by(&theirs))
    }
}
