//! Graph construction, differentiation and execution sessions.
//!
//! A model is assembled with [`builder::Builder`], serialized into a
//! [`proto::ModelProto`], and handed to a [`session::Session`] which imports
//! it into the mutable [`ir::Graph`], attaches losses, synthesizes the backward
//! pass, applies the pattern pipeline, partitions the result over virtual
//! graphs and finally compiles it for a device.

pub mod autodiff;
pub mod backend;
pub mod builder;
pub mod device;
mod env;
pub mod error;
pub mod hashing;
pub mod ir;
pub mod logging;
pub mod partition;
pub mod proto;
pub mod session;
pub mod tensor;
pub mod train;
pub mod transform;

pub use builder::Builder;
pub use device::{DeviceInfo, DeviceLease, DeviceManager, DeviceType, SyncPattern};
pub use error::{Error, ErrorKind, Result};
pub use session::{
    AnchorReturnType, Anchors, ArrayStepIo, CallbackStepIo, DataFlow, Session, SessionOptions,
    SessionState, StepIo, SyntheticDataMode, WeightsIo,
};
pub use tensor::{DataType, HostTensor, InputShapeInfo, TensorData, TensorInfo};
pub use train::{L1Loss, Loss, NllLoss, OptimizerValue, ReductionType, Sgd};
pub use transform::{register_pattern, PatternType, Patterns, PatternsLevel};

/// Prefix carried by every gradient tensor synthesized by autodiff.
pub const RESERVED_GRADIENT_PREFIX: &str = "d__";

/// Prefix carried by the output of every variable update op.
pub const RESERVED_UPDATED_VAR_PREFIX: &str = "updatedVar__";

/// Returns the gradient tensor name for `id`.
pub fn grad_id(id: &str) -> String {
    format!("{RESERVED_GRADIENT_PREFIX}{id}")
}

/// Returns the updated variable tensor name for `id`.
pub fn updated_var_id(id: &str) -> String {
    format!("{RESERVED_UPDATED_VAR_PREFIX}{id}")
}
