//! Execution seam between the session and a device backend.
//!
//! A backend owns device buffers behind an opaque handle type and executes one
//! op at a time. Sessions only ever talk to the type-erased
//! [`registry::ErasedBackend`], selected by the device's backend name.

pub mod registry;

use thiserror::Error;

use crate::ir::OpKind;
use crate::tensor::{HostTensor, TensorInfo};

pub use registry::{
    create_backend, list_backends, register_execution_backend, BackendHandle, ErasedBackend,
};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{op} is not implemented: {reason}")]
    Unimplemented { op: String, reason: String },

    #[error("backend execution failure: {message}")]
    Execution { message: String },

    #[error("no backend registered under '{name}' (registered: {registered:?})")]
    UnknownBackend {
        name: String,
        registered: Vec<String>,
    },
}

impl BackendError {
    pub fn unimplemented(op: impl Into<String>, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op: op.into(),
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// A device that can hold tensors and run single ops on them.
pub trait ExecutionBackend: Send + Sync {
    type Handle: Clone + Send + Sync + 'static;

    fn backend_name(&self) -> &str;

    /// Copies a host value into a fresh device buffer.
    fn upload(&self, tensor: &HostTensor) -> BackendResult<Self::Handle>;

    /// Reads a device buffer back to the host.
    fn download(&self, handle: &Self::Handle) -> BackendResult<HostTensor>;

    /// Runs `kind` on `inputs`. `outputs` carries the inferred output infos.
    fn execute(
        &self,
        kind: &OpKind,
        inputs: &[Self::Handle],
        outputs: &[TensorInfo],
    ) -> BackendResult<Vec<Self::Handle>>;

    /// Runs a single-output op whose first operand is `target`, which the
    /// caller gives up. Backends may write the result into its storage.
    fn execute_inplace(
        &self,
        kind: &OpKind,
        target: Self::Handle,
        rest: &[Self::Handle],
        output: &TensorInfo,
    ) -> BackendResult<Self::Handle> {
        let mut inputs = Vec::with_capacity(rest.len() + 1);
        inputs.push(target);
        inputs.extend_from_slice(rest);
        self.execute(kind, &inputs, std::slice::from_ref(output))?
            .pop()
            .ok_or_else(|| BackendError::execution(format!("{kind} produced no output")))
    }
}

/// Runs one op on host values through `backend`.
pub fn evaluate_on_host(
    backend: &dyn ErasedBackend,
    kind: &OpKind,
    inputs: &[&HostTensor],
    outputs: &[TensorInfo],
) -> BackendResult<Vec<HostTensor>> {
    let handles = inputs
        .iter()
        .map(|t| backend.upload(t))
        .collect::<BackendResult<Vec<_>>>()?;
    let refs = handles.iter().collect::<Vec<_>>();
    let results = backend.execute(kind, &refs, outputs)?;
    results.iter().map(|h| backend.download(h)).collect()
}
