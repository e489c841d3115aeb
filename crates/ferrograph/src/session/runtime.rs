use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{BackendHandle, ErasedBackend};
use crate::error::{Error, Result};
use crate::ir::{Phase, TensorId};
use crate::tensor::HostTensor;

use super::executable::{CompiledOp, Executable, RunMode};

/// Counters kept for execution reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionCounters {
    pub steps: u64,
    pub micro_batches: u64,
    pub op_executions: u64,
    pub inplace_executions: u64,
    pub fragment_runs: HashMap<Phase, u64>,
}

/// An executable bound to a backend, holding the device value of every
/// tensor computed so far.
pub struct Runtime {
    backend: Box<dyn ErasedBackend>,
    executable: Arc<Executable>,
    values: HashMap<TensorId, Arc<BackendHandle>>,
    pub(crate) counters: ExecutionCounters,
}

impl Runtime {
    /// Binds `executable` and uploads its constants.
    pub fn load(backend: Box<dyn ErasedBackend>, executable: Arc<Executable>) -> Result<Self> {
        let mut runtime = Self {
            backend,
            executable,
            values: HashMap::new(),
            counters: ExecutionCounters::default(),
        };
        let constants = runtime.executable.constants.clone();
        for (id, value) in &constants {
            runtime.upload(id, value)?;
        }
        Ok(runtime)
    }

    pub fn executable(&self) -> &Arc<Executable> {
        &self.executable
    }

    pub fn backend_name(&self) -> &str {
        self.backend.backend_name()
    }

    pub fn upload(&mut self, id: &str, value: &HostTensor) -> Result<()> {
        let handle = self.backend.upload(value)?;
        self.values.insert(id.to_string(), Arc::new(handle));
        Ok(())
    }

    pub fn download(&self, id: &str) -> Result<HostTensor> {
        let handle = self
            .values
            .get(id)
            .ok_or_else(|| Error::state(format!("tensor '{id}' has no device value")))?;
        Ok(self.backend.download(handle)?)
    }

    pub fn has_value(&self, id: &str) -> bool {
        self.values.contains_key(id)
    }

    /// Runs the fragments of `mode` for one micro-batch and commits weight
    /// updates when training.
    pub fn run_batch(&mut self, mode: RunMode) -> Result<()> {
        let executable = Arc::clone(&self.executable);
        for phase in mode.phases() {
            let ops = executable.fragment(*phase);
            for op in ops {
                self.execute(op)?;
            }
            *self.counters.fragment_runs.entry(*phase).or_insert(0) += 1;
        }
        if mode == RunMode::Train {
            for (updated, var) in &executable.weight_updates {
                let handle = self.values.get(updated).cloned().ok_or_else(|| {
                    Error::state(format!("update '{updated}' was not computed"))
                })?;
                self.values.insert(var.clone(), handle);
            }
        }
        self.counters.micro_batches += 1;
        Ok(())
    }

    fn execute(&mut self, op: &CompiledOp) -> Result<()> {
        if op.inplace {
            return self.execute_inplace(op);
        }
        let inputs = op
            .inputs
            .iter()
            .map(|id| {
                self.values.get(id).ok_or_else(|| {
                    Error::state(format!("op '{}' reads '{id}', which has no value", op.name))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let refs = inputs.iter().map(|h| Arc::as_ref(h)).collect::<Vec<_>>();
        let results = self.backend.execute(&op.kind, &refs, &op.output_infos)?;
        if results.len() != op.outputs.len() {
            return Err(Error::state(format!(
                "backend {} returned {} values for op '{}' with {} outputs",
                self.backend.backend_name(),
                results.len(),
                op.name,
                op.outputs.len()
            )));
        }
        for (id, handle) in op.outputs.iter().zip(results) {
            self.values.insert(id.clone(), Arc::new(handle));
        }
        self.counters.op_executions += 1;
        Ok(())
    }

    /// Gives the first input's buffer to the backend, which may overwrite it
    /// with the result. The input has no device value of its own afterwards.
    fn execute_inplace(&mut self, op: &CompiledOp) -> Result<()> {
        let (Some((target_id, rest_ids)), [output], [output_info]) = (
            op.inputs.split_first(),
            op.outputs.as_slice(),
            op.output_infos.as_slice(),
        ) else {
            return Err(Error::invalid_graph(format!(
                "in-place op '{}' needs an input and a single output",
                op.name
            )));
        };
        let target = self.values.remove(target_id).ok_or_else(|| {
            Error::state(format!("op '{}' reads '{target_id}', which has no value", op.name))
        })?;
        let rest = rest_ids
            .iter()
            .map(|id| {
                self.values.get(id).map(Arc::as_ref).ok_or_else(|| {
                    Error::state(format!("op '{}' reads '{id}', which has no value", op.name))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let result = match Arc::try_unwrap(target) {
            Ok(target) => {
                self.counters.inplace_executions += 1;
                self.backend
                    .execute_inplace(&op.kind, target, &rest, output_info)?
            }
            // Still shared with another tensor: compute into fresh storage.
            Err(shared) => {
                let mut inputs = Vec::with_capacity(op.inputs.len());
                inputs.push(shared.as_ref());
                inputs.extend(rest);
                self.backend
                    .execute(&op.kind, &inputs, &op.output_infos)?
                    .pop()
                    .ok_or_else(|| {
                        Error::state(format!("op '{}' produced no value", op.name))
                    })?
            }
        };
        self.values.insert(output.clone(), Arc::new(result));
        self.counters.op_executions += 1;
        Ok(())
    }
}
