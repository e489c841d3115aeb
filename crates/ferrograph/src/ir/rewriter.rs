use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::tensor::TensorInfo;

use super::{Graph, Op, OpId, OpKind, TensorId};

/// Graph editor used by patterns. Tracks a per-op version that changes every
/// time an op or one of its operands is touched, so the driver can skip
/// re-matching ops that have not changed since a failed attempt.
pub struct GraphRewriter<'a> {
    pub graph: &'a mut Graph,
    versions: HashMap<OpId, u32>,
}

impl<'a> GraphRewriter<'a> {
    pub fn new(graph: &'a mut Graph) -> Self {
        Self {
            graph,
            versions: HashMap::new(),
        }
    }

    pub fn graph(&self) -> &Graph {
        self.graph
    }

    pub fn op(&self, id: OpId) -> Option<&Op> {
        self.graph.op(id)
    }

    pub fn contains(&self, id: OpId) -> bool {
        self.graph.contains_op(id)
    }

    pub fn version(&self, id: OpId) -> u32 {
        self.versions.get(&id).copied().unwrap_or(0)
    }

    pub fn ops_in_order(&self) -> Result<Vec<OpId>> {
        self.graph.topo_order()
    }

    pub fn info(&self, id: &str) -> Result<TensorInfo> {
        self.graph.info(id).cloned()
    }

    pub fn users_of(&self, tensor: &str) -> Vec<OpId> {
        self.graph.consumers(tensor)
    }

    pub fn is_protected(&self, tensor: &str) -> bool {
        self.graph.is_protected(tensor)
    }

    /// Removes `id` but keeps its outputs so replacement ops can produce them.
    pub fn detach_op(&mut self, id: OpId) -> Result<Op> {
        let op = self.graph.detach_op(id)?;
        self.bump_users(&op.outputs);
        self.versions.remove(&id);
        Ok(op)
    }

    /// Removes `id` along with its outputs.
    pub fn erase_op(&mut self, id: OpId) -> Result<Op> {
        let op = self.graph.erase_op(id)?;
        self.bump_producers(&op.inputs);
        self.versions.remove(&id);
        Ok(op)
    }

    /// Inserts an op inheriting placement, phase and exclusions from
    /// `template`. With `output == None` a temporary tensor is allocated.
    pub fn insert_like(
        &mut self,
        template: &Op,
        kind: OpKind,
        inputs: Vec<TensorId>,
        output: Option<TensorId>,
    ) -> Result<TensorId> {
        let output = match output {
            Some(output) => output,
            None => self.graph.temp_id(template.output()),
        };
        let id = self
            .graph
            .add_op(kind, inputs.clone(), vec![output.clone()], template.phase)?;
        let op = self
            .graph
            .op_mut(id)
            .ok_or_else(|| Error::invalid_graph(format!("inserted op {id} vanished")))?;
        op.virtual_graph = template.virtual_graph;
        op.fwd_op = template.fwd_op;
        op.excluded_patterns = template.excluded_patterns.clone();
        self.bump_producers(&inputs);
        self.bump_users(std::slice::from_ref(&output));
        Ok(output)
    }

    /// Rewires all users of `old` to `new`.
    pub fn replace_all_uses(&mut self, old: &str, new: &str) -> Result<()> {
        let users = self.users_of(old);
        self.graph.replace_all_uses(old, new)?;
        for user in users {
            self.bump_version(user);
        }
        Ok(())
    }

    pub fn bump_version(&mut self, id: OpId) {
        *self.versions.entry(id).or_insert(0) += 1;
    }

    fn bump_users(&mut self, tensors: &[TensorId]) {
        for tensor in tensors {
            for user in self.graph.consumers(tensor) {
                self.bump_version(user);
            }
        }
    }

    fn bump_producers(&mut self, tensors: &[TensorId]) {
        for tensor in tensors {
            if let Some(producer) = self.graph.producer(tensor) {
                self.bump_version(producer);
            }
        }
    }
}
