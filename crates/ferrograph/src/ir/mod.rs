//! Mutable graph IR used by every compile-time component.
//!
//! Ops and tensors are kept in ordered maps so that iteration, topological
//! order and therefore every rewrite are deterministic.

mod op;
pub mod rewriter;
pub mod shape;

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hashing::Fingerprint;
use crate::proto::{AttributeValue, ModelProto};
use crate::tensor::{HostTensor, TensorInfo};

pub use op::{Op, OpId, OpKind, OpType, Phase, ReductionType};
pub use rewriter::GraphRewriter;

pub type TensorId = String;

/// Node attribute carrying a builder-assigned virtual graph.
pub const VIRTUAL_GRAPH_ATTRIBUTE: &str = "__virtualGraph";
/// Node attribute listing patterns that must not touch the node.
pub const EXCLUDE_PATTERNS_ATTRIBUTE: &str = "__excludePatterns";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TensorType {
    /// Fed from the host every micro-batch.
    Stream,
    /// Weight; uploaded by `weightsFromHost` and possibly updated.
    Variable,
    /// Compile-time constant with known data.
    Const,
    /// Activation or gradient computed on the device.
    ActGrad,
    /// Non-constant optimizer hyper-parameter, uploaded by `optimizerFromHost`.
    OptimizerStream,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub id: TensorId,
    pub info: TensorInfo,
    pub tensor_type: TensorType,
    pub data: Option<HostTensor>,
    producer: Option<OpId>,
    consumers: BTreeSet<OpId>,
}

impl Tensor {
    pub fn producer(&self) -> Option<OpId> {
        self.producer
    }

    /// Consumer ops in ascending id order.
    pub fn consumers(&self) -> impl Iterator<Item = OpId> + '_ {
        self.consumers.iter().copied()
    }

    pub fn num_consumers(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_const(&self) -> bool {
        self.tensor_type == TensorType::Const && self.data.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    ops: BTreeMap<OpId, Op>,
    tensors: BTreeMap<TensorId, Tensor>,
    streams: Vec<TensorId>,
    outputs: Vec<TensorId>,
    protected: BTreeSet<TensorId>,
    next_op: usize,
    next_tmp: usize,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Imports a model. `stream_infos` overrides declared input infos.
    pub fn from_model(
        model: &ModelProto,
        stream_infos: &BTreeMap<TensorId, TensorInfo>,
    ) -> Result<Self> {
        let mut graph = Graph::new();
        let proto = &model.graph;

        for init in &proto.initializers {
            let data = HostTensor::new(init.info.clone(), init.data.clone())?;
            graph.add_tensor(
                init.name.clone(),
                init.info.clone(),
                TensorType::Variable,
                Some(data),
            )?;
        }
        for input in &proto.inputs {
            if graph.contains_tensor(&input.name) {
                continue;
            }
            let info = stream_infos
                .get(&input.name)
                .cloned()
                .unwrap_or_else(|| input.info.clone());
            graph.add_tensor(input.name.clone(), info, TensorType::Stream, None)?;
        }

        for node in &proto.nodes {
            if node.op_type == "Constant" {
                let Some(AttributeValue::Tensor(value)) = node.attr("value") else {
                    return Err(Error::invalid_graph(format!(
                        "Constant node '{}' has no tensor value",
                        node.name
                    )));
                };
                let output = node.outputs.first().ok_or_else(|| {
                    Error::invalid_graph(format!("Constant node '{}' has no output", node.name))
                })?;
                let data = HostTensor::new(value.info.clone(), value.data.clone())?;
                graph.add_tensor(output.clone(), value.info.clone(), TensorType::Const, Some(data))?;
                continue;
            }
            let kind = OpKind::from_node(node)?;
            for input in &node.inputs {
                if !graph.contains_tensor(input) {
                    return Err(Error::invalid_graph(format!(
                        "node '{}' consumes unknown tensor '{input}'",
                        node.name
                    )));
                }
            }
            let id = graph.add_op(
                kind,
                node.inputs.clone(),
                node.outputs.clone(),
                Phase::Forward,
            )?;
            if let Some(op) = graph.op_mut(id) {
                if !node.name.is_empty() {
                    op.name = node.name.clone();
                }
                op.virtual_graph = node.attr_int(VIRTUAL_GRAPH_ATTRIBUTE);
                if let Some(excluded) = node.attr_strings(EXCLUDE_PATTERNS_ATTRIBUTE) {
                    op.excluded_patterns = excluded.iter().cloned().collect();
                }
            }
        }

        for output in &proto.outputs {
            if !graph.contains_tensor(&output.name) {
                return Err(Error::invalid_graph(format!(
                    "model output '{}' is not produced by the graph",
                    output.name
                )));
            }
            graph.outputs.push(output.name.clone());
            graph.protect(&output.name);
        }
        Ok(graph)
    }

    pub fn add_tensor(
        &mut self,
        id: impl Into<TensorId>,
        info: TensorInfo,
        tensor_type: TensorType,
        data: Option<HostTensor>,
    ) -> Result<()> {
        let id = id.into();
        if self.tensors.contains_key(&id) {
            return Err(Error::invalid_graph(format!(
                "tensor '{id}' is already in the graph"
            )));
        }
        if tensor_type == TensorType::Stream {
            self.streams.push(id.clone());
        }
        self.tensors.insert(
            id.clone(),
            Tensor {
                id,
                info,
                tensor_type,
                data,
                producer: None,
                consumers: BTreeSet::new(),
            },
        );
        Ok(())
    }

    pub fn add_const(&mut self, id: impl Into<TensorId>, value: HostTensor) -> Result<()> {
        let info = value.info.clone();
        self.add_tensor(id, info, TensorType::Const, Some(value))
    }

    /// Adds an op, inferring and registering its output tensors. Outputs may
    /// name existing tensors that currently have no producer.
    pub fn add_op(
        &mut self,
        kind: OpKind,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
        phase: Phase,
    ) -> Result<OpId> {
        let infos = {
            let input_infos = inputs
                .iter()
                .map(|id| self.info(id))
                .collect::<Result<Vec<_>>>()?;
            kind.infer_outputs(&input_infos)?
        };
        if infos.len() != outputs.len() {
            return Err(Error::invalid_graph(format!(
                "{kind} produces {} outputs but {} were named",
                infos.len(),
                outputs.len()
            )));
        }
        for output in &outputs {
            if let Some(existing) = self.tensors.get(output) {
                if existing.producer.is_some() || existing.tensor_type != TensorType::ActGrad {
                    return Err(Error::invalid_graph(format!(
                        "tensor '{output}' already has a producer"
                    )));
                }
            }
        }

        let id = OpId(self.next_op);
        self.next_op += 1;
        for input in &inputs {
            if let Some(tensor) = self.tensors.get_mut(input) {
                tensor.consumers.insert(id);
            }
        }
        for (output, info) in outputs.iter().zip(infos) {
            let tensor = self.tensors.entry(output.clone()).or_insert_with(|| Tensor {
                id: output.clone(),
                info: info.clone(),
                tensor_type: TensorType::ActGrad,
                data: None,
                producer: None,
                consumers: BTreeSet::new(),
            });
            tensor.info = info;
            tensor.producer = Some(id);
        }
        let name = outputs.first().cloned().unwrap_or_default();
        self.ops.insert(
            id,
            Op {
                id,
                kind,
                name,
                inputs,
                outputs,
                phase,
                virtual_graph: None,
                inplace: false,
                excluded_patterns: BTreeSet::new(),
                fwd_op: None,
            },
        );
        Ok(id)
    }

    pub fn op(&self, id: OpId) -> Option<&Op> {
        self.ops.get(&id)
    }

    pub fn op_mut(&mut self, id: OpId) -> Option<&mut Op> {
        self.ops.get_mut(&id)
    }

    pub fn ops(&self) -> impl Iterator<Item = &Op> {
        self.ops.values()
    }

    pub fn op_ids(&self) -> Vec<OpId> {
        self.ops.keys().copied().collect()
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn contains_op(&self, id: OpId) -> bool {
        self.ops.contains_key(&id)
    }

    pub fn tensor(&self, id: &str) -> Option<&Tensor> {
        self.tensors.get(id)
    }

    pub fn tensors(&self) -> impl Iterator<Item = &Tensor> {
        self.tensors.values()
    }

    pub fn contains_tensor(&self, id: &str) -> bool {
        self.tensors.contains_key(id)
    }

    pub fn info(&self, id: &str) -> Result<&TensorInfo> {
        self.tensors
            .get(id)
            .map(|t| &t.info)
            .ok_or_else(|| Error::invalid_graph(format!("no tensor '{id}' in the graph")))
    }

    pub fn producer(&self, id: &str) -> Option<OpId> {
        self.tensors.get(id).and_then(|t| t.producer)
    }

    pub fn consumers(&self, id: &str) -> Vec<OpId> {
        self.tensors
            .get(id)
            .map(|t| t.consumers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Stream tensors in declaration order.
    pub fn stream_ids(&self) -> &[TensorId] {
        &self.streams
    }

    pub fn ids_of_type(&self, tensor_type: TensorType) -> Vec<TensorId> {
        self.tensors
            .values()
            .filter(|t| t.tensor_type == tensor_type)
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn variable_ids(&self) -> Vec<TensorId> {
        self.ids_of_type(TensorType::Variable)
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    /// Marks a tensor whose name must survive every rewrite.
    pub fn protect(&mut self, id: &str) {
        self.protected.insert(id.to_string());
    }

    pub fn is_protected(&self, id: &str) -> bool {
        self.protected.contains(id)
    }

    pub fn protected(&self) -> &BTreeSet<TensorId> {
        &self.protected
    }

    /// Returns a fresh temporary tensor name derived from `base`.
    pub fn temp_id(&mut self, base: &str) -> TensorId {
        loop {
            let id = format!("t{}__{base}", self.next_tmp);
            self.next_tmp += 1;
            if !self.tensors.contains_key(&id) {
                return id;
            }
        }
    }

    /// Removes an op but keeps its output tensors, which lose their producer.
    pub fn detach_op(&mut self, id: OpId) -> Result<Op> {
        let op = self
            .ops
            .remove(&id)
            .ok_or_else(|| Error::invalid_graph(format!("no op {id} in the graph")))?;
        for input in &op.inputs {
            if let Some(tensor) = self.tensors.get_mut(input) {
                tensor.consumers.remove(&id);
            }
        }
        for output in &op.outputs {
            if let Some(tensor) = self.tensors.get_mut(output) {
                tensor.producer = None;
            }
        }
        Ok(op)
    }

    /// Removes an op together with its outputs, which must be unused.
    pub fn erase_op(&mut self, id: OpId) -> Result<Op> {
        if let Some(op) = self.ops.get(&id) {
            for output in &op.outputs {
                if self.consumers(output).iter().any(|&c| c != id) {
                    return Err(Error::invalid_graph(format!(
                        "cannot erase op {id}: output '{output}' is still consumed"
                    )));
                }
            }
        }
        let op = self.detach_op(id)?;
        for output in &op.outputs {
            self.tensors.remove(output);
        }
        Ok(op)
    }

    /// Drops a tensor that nothing produces or consumes.
    pub fn remove_tensor(&mut self, id: &str) -> Result<Tensor> {
        match self.tensors.get(id) {
            Some(t) if t.producer.is_none() && t.consumers.is_empty() => {}
            Some(_) => {
                return Err(Error::invalid_graph(format!(
                    "tensor '{id}' is still connected"
                )))
            }
            None => return Err(Error::invalid_graph(format!("no tensor '{id}'"))),
        }
        self.streams.retain(|s| s != id);
        self.tensors
            .remove(id)
            .ok_or_else(|| Error::invalid_graph(format!("no tensor '{id}'")))
    }

    /// Rewires every consumer of `old` to read `new` instead.
    pub fn replace_all_uses(&mut self, old: &str, new: &str) -> Result<()> {
        if !self.contains_tensor(new) {
            return Err(Error::invalid_graph(format!("no tensor '{new}'")));
        }
        for consumer in self.consumers(old) {
            self.replace_input(consumer, old, new)?;
        }
        Ok(())
    }

    /// Replaces every occurrence of `old` in the inputs of `op`.
    pub fn replace_input(&mut self, op: OpId, old: &str, new: &str) -> Result<()> {
        let op_ref = self
            .ops
            .get_mut(&op)
            .ok_or_else(|| Error::invalid_graph(format!("no op {op}")))?;
        for input in op_ref.inputs.iter_mut().filter(|i| *i == old) {
            *input = new.to_string();
        }
        if let Some(tensor) = self.tensors.get_mut(old) {
            tensor.consumers.remove(&op);
        }
        if let Some(tensor) = self.tensors.get_mut(new) {
            tensor.consumers.insert(op);
        }
        Ok(())
    }

    /// Renames a tensor everywhere it is referenced.
    pub fn rename_tensor(&mut self, old: &str, new: &str) -> Result<()> {
        if self.tensors.contains_key(new) {
            return Err(Error::invalid_graph(format!(
                "cannot rename '{old}': '{new}' already exists"
            )));
        }
        let mut tensor = self
            .tensors
            .remove(old)
            .ok_or_else(|| Error::invalid_graph(format!("no tensor '{old}'")))?;
        tensor.id = new.to_string();
        if let Some(producer) = tensor.producer {
            if let Some(op) = self.ops.get_mut(&producer) {
                for output in op.outputs.iter_mut().filter(|o| *o == old) {
                    *output = new.to_string();
                }
                if op.name == old {
                    op.name = new.to_string();
                }
            }
        }
        for consumer in &tensor.consumers {
            if let Some(op) = self.ops.get_mut(consumer) {
                for input in op.inputs.iter_mut().filter(|i| *i == old) {
                    *input = new.to_string();
                }
            }
        }
        for id in self.streams.iter_mut().chain(self.outputs.iter_mut()) {
            if id == old {
                *id = new.to_string();
            }
        }
        if self.protected.remove(old) {
            self.protected.insert(new.to_string());
        }
        self.tensors.insert(new.to_string(), tensor);
        Ok(())
    }

    /// Turns a producer-less tensor into a constant holding `value`.
    pub fn make_const(&mut self, id: &str, value: HostTensor) -> Result<()> {
        let tensor = self
            .tensors
            .get_mut(id)
            .ok_or_else(|| Error::invalid_graph(format!("no tensor '{id}'")))?;
        if tensor.producer.is_some() {
            return Err(Error::invalid_graph(format!(
                "tensor '{id}' still has a producer"
            )));
        }
        if tensor.info != value.info {
            return Err(Error::shape(format!(
                "constant for '{id}' has info {} but the tensor is {}",
                value.info, tensor.info
            )));
        }
        tensor.tensor_type = TensorType::Const;
        tensor.data = Some(value);
        Ok(())
    }

    /// Kahn's algorithm, breaking ties by the smallest op id.
    pub fn topo_order(&self) -> Result<Vec<OpId>> {
        let mut indegree: BTreeMap<OpId, usize> = BTreeMap::new();
        for op in self.ops.values() {
            let deps = self.op_dependencies(op);
            indegree.insert(op.id, deps.len());
        }
        let mut ready: BinaryHeap<Reverse<OpId>> = indegree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&id, _)| Reverse(id))
            .collect();
        let mut order = Vec::with_capacity(self.ops.len());
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            let Some(op) = self.ops.get(&id) else {
                continue;
            };
            let mut successors = BTreeSet::new();
            for output in &op.outputs {
                successors.extend(self.consumers(output));
            }
            for succ in successors {
                if let Some(d) = indegree.get_mut(&succ) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(Reverse(succ));
                    }
                }
            }
        }
        if order.len() != self.ops.len() {
            return Err(Error::invalid_graph("the graph contains a cycle"));
        }
        Ok(order)
    }

    /// Distinct producer ops of the inputs of `op`.
    pub fn op_dependencies(&self, op: &Op) -> BTreeSet<OpId> {
        op.inputs
            .iter()
            .filter_map(|input| self.producer(input))
            .filter(|&p| p != op.id)
            .collect()
    }

    /// Deterministic hash of everything that affects compilation.
    pub fn fingerprint(&self) -> Result<u64> {
        let mut fp = Fingerprint::new();
        for id in self.topo_order()? {
            let Some(op) = self.ops.get(&id) else {
                continue;
            };
            fp.write_serialized(&op.kind)?;
            fp.write_serialized(&(&op.inputs, &op.outputs, op.phase))?;
            fp.write_serialized(&(op.virtual_graph, op.inplace))?;
        }
        for tensor in self.tensors.values() {
            fp.write_str(&tensor.id);
            fp.write_serialized(&(&tensor.info, tensor.tensor_type))?;
            if tensor.tensor_type == TensorType::Const {
                fp.write_serialized(&tensor.data)?;
            }
        }
        Ok(fp.finish())
    }
}
