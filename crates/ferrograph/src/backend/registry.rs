//! Runtime backend registry.
//!
//! Backends register a constructor under a name (a device backend name such as
//! `cpu` or `ipu-model`). Sessions create backends by the name their device
//! reports, so the core crate never depends on a concrete backend.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::ir::OpKind;
use crate::tensor::{HostTensor, TensorInfo};

use super::{BackendError, BackendResult, ExecutionBackend};

/// Type-erased device buffer, downcast by the backend that produced it.
pub type BackendHandle = Box<dyn Any + Send + Sync>;

pub type BackendConstructor = Box<dyn Fn() -> Box<dyn ErasedBackend> + Send + Sync>;

/// [`ExecutionBackend`] without the associated handle type.
pub trait ErasedBackend: Send + Sync {
    fn backend_name(&self) -> &str;

    fn upload(&self, tensor: &HostTensor) -> BackendResult<BackendHandle>;

    fn download(&self, handle: &BackendHandle) -> BackendResult<HostTensor>;

    fn execute(
        &self,
        kind: &OpKind,
        inputs: &[&BackendHandle],
        outputs: &[TensorInfo],
    ) -> BackendResult<Vec<BackendHandle>>;

    fn execute_inplace(
        &self,
        kind: &OpKind,
        target: BackendHandle,
        rest: &[&BackendHandle],
        output: &TensorInfo,
    ) -> BackendResult<BackendHandle>;

    fn clone_backend(&self) -> Box<dyn ErasedBackend>;
}

struct BackendWrapper<B: ExecutionBackend> {
    inner: Arc<B>,
}

impl<B: ExecutionBackend> BackendWrapper<B> {
    fn new(backend: B) -> Self {
        Self {
            inner: Arc::new(backend),
        }
    }

    fn typed<'h>(&self, handle: &'h BackendHandle) -> BackendResult<&'h B::Handle> {
        handle.downcast_ref::<B::Handle>().ok_or_else(|| {
            BackendError::execution(format!(
                "handle type mismatch for backend {}",
                self.inner.backend_name()
            ))
        })
    }
}

impl<B: ExecutionBackend + 'static> ErasedBackend for BackendWrapper<B> {
    fn backend_name(&self) -> &str {
        self.inner.backend_name()
    }

    fn upload(&self, tensor: &HostTensor) -> BackendResult<BackendHandle> {
        let handle = self.inner.upload(tensor)?;
        Ok(Box::new(handle) as BackendHandle)
    }

    fn download(&self, handle: &BackendHandle) -> BackendResult<HostTensor> {
        self.inner.download(self.typed(handle)?)
    }

    fn execute(
        &self,
        kind: &OpKind,
        inputs: &[&BackendHandle],
        outputs: &[TensorInfo],
    ) -> BackendResult<Vec<BackendHandle>> {
        let typed_inputs = inputs
            .iter()
            .map(|h| self.typed(h).cloned())
            .collect::<BackendResult<Vec<_>>>()?;
        let results = self.inner.execute(kind, &typed_inputs, outputs)?;
        Ok(results
            .into_iter()
            .map(|h| Box::new(h) as BackendHandle)
            .collect())
    }

    fn execute_inplace(
        &self,
        kind: &OpKind,
        target: BackendHandle,
        rest: &[&BackendHandle],
        output: &TensorInfo,
    ) -> BackendResult<BackendHandle> {
        let target = target.downcast::<B::Handle>().map_err(|_| {
            BackendError::execution(format!(
                "handle type mismatch for backend {}",
                self.inner.backend_name()
            ))
        })?;
        let rest = rest
            .iter()
            .map(|h| self.typed(h).cloned())
            .collect::<BackendResult<Vec<_>>>()?;
        let result = self.inner.execute_inplace(kind, *target, &rest, output)?;
        Ok(Box::new(result) as BackendHandle)
    }

    fn clone_backend(&self) -> Box<dyn ErasedBackend> {
        Box::new(BackendWrapper {
            inner: Arc::clone(&self.inner),
        })
    }
}

type Registry = RwLock<BTreeMap<String, BackendConstructor>>;

static BACKENDS: OnceLock<Registry> = OnceLock::new();

fn backends() -> &'static Registry {
    BACKENDS.get_or_init(|| RwLock::new(BTreeMap::new()))
}

/// Registers a concrete [`ExecutionBackend`] under a device backend name,
/// replacing any earlier registration.
pub fn register_execution_backend<B, F>(name: impl Into<String>, constructor: F)
where
    B: ExecutionBackend + 'static,
    F: Fn() -> B + Send + Sync + 'static,
{
    let name = name.into();
    tracing::debug!(target: "ferrograph::device", "registered backend {name}");
    let constructor: BackendConstructor =
        Box::new(move || Box::new(BackendWrapper::new(constructor())));
    backends()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(name, constructor);
}

pub fn create_backend(name: &str) -> Option<Box<dyn ErasedBackend>> {
    let registry = backends().read().unwrap_or_else(PoisonError::into_inner);
    registry.get(name).map(|constructor| constructor())
}

/// Registered names in sorted order.
pub fn list_backends() -> Vec<String> {
    backends()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .keys()
        .cloned()
        .collect()
}
