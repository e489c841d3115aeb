//! Losses and optimizers attached to a training session.

mod loss;
mod optim;

pub use crate::ir::ReductionType;
pub use loss::{L1Loss, Loss, NllLoss};
pub use optim::{
    OptimizerValue, Sgd, LEARNING_RATE_ID, LOSS_SCALING_ID, WEIGHT_DECAY_ID,
};
