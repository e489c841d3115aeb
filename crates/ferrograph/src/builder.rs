//! Append-only model construction.
//!
//! Every op method registers one node, allocates a fresh output name and
//! infers the output info immediately, so shape errors surface at the call
//! that caused them rather than at compile time.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::ir::{OpKind, TensorId, EXCLUDE_PATTERNS_ATTRIBUTE, VIRTUAL_GRAPH_ATTRIBUTE};
use crate::proto::{AttributeValue, GraphProto, ModelProto, NodeProto, TensorProto, ValueInfoProto};
use crate::tensor::{HostTensor, TensorInfo};

const DEFAULT_GRAPH_NAME: &str = "BuilderGraph";

#[derive(Debug, Clone)]
pub struct Builder {
    graph_name: String,
    nodes: Vec<NodeProto>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    initializers: Vec<TensorProto>,
    infos: BTreeMap<TensorId, TensorInfo>,
    const_values: BTreeMap<TensorId, HostTensor>,
    producers: BTreeMap<TensorId, usize>,
    consumed: BTreeSet<TensorId>,
    name_scopes: Vec<String>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self::with_name(DEFAULT_GRAPH_NAME)
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            graph_name: name.into(),
            nodes: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            initializers: Vec::new(),
            infos: BTreeMap::new(),
            const_values: BTreeMap::new(),
            producers: BTreeMap::new(),
            consumed: BTreeSet::new(),
            name_scopes: Vec::new(),
        }
    }

    /// Registers a streamed input.
    pub fn add_input_tensor(&mut self, info: TensorInfo) -> TensorId {
        let id = self.unique_id(&self.scoped("input"));
        self.infos.insert(id.clone(), info);
        self.inputs.push(id.clone());
        id
    }

    /// Registers a weight whose values are embedded in the model.
    pub fn add_initialized_input_tensor(&mut self, value: HostTensor) -> TensorId {
        let id = self.unique_id(&self.scoped("init_input"));
        self.infos.insert(id.clone(), value.info.clone());
        self.initializers.push(TensorProto {
            name: id.clone(),
            info: value.info,
            data: value.data,
        });
        id
    }

    /// Marks a tensor as a graph output.
    pub fn add_output_tensor(&mut self, id: &str) -> Result<()> {
        if !self.infos.contains_key(id) {
            return Err(Error::invalid_graph(format!(
                "cannot add output '{id}': no such tensor"
            )));
        }
        if !self.outputs.iter().any(|o| o == id) {
            self.outputs.push(id.to_string());
        }
        Ok(())
    }

    pub fn push_name_scope(&mut self, scope: impl Into<String>) {
        self.name_scopes.push(scope.into());
    }

    pub fn pop_name_scope(&mut self) -> Option<String> {
        self.name_scopes.pop()
    }

    pub fn tensor_info(&self, id: &str) -> Result<TensorInfo> {
        self.infos
            .get(id)
            .cloned()
            .ok_or_else(|| Error::invalid_graph(format!("no tensor '{id}' in the builder")))
    }

    pub fn tensor_shape(&self, id: &str) -> Result<Vec<i64>> {
        Ok(self.tensor_info(id)?.shape)
    }

    pub fn input_tensor_ids(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn output_tensor_ids(&self) -> &[TensorId] {
        &self.outputs
    }

    /// Places the node producing `id` on virtual graph `virtual_graph`.
    pub fn virtual_graph(&mut self, id: &str, virtual_graph: i64) -> Result<()> {
        let node = self.producer_node_mut(id)?;
        node.attributes.insert(
            VIRTUAL_GRAPH_ATTRIBUTE.to_string(),
            AttributeValue::Int(virtual_graph),
        );
        Ok(())
    }

    /// Prevents the named patterns from rewriting the node producing `id`.
    pub fn exclude_patterns(&mut self, id: &str, patterns: &[&str]) -> Result<()> {
        let node = self.producer_node_mut(id)?;
        node.attributes.insert(
            EXCLUDE_PATTERNS_ATTRIBUTE.to_string(),
            AttributeValue::Strings(patterns.iter().map(|p| p.to_string()).collect()),
        );
        Ok(())
    }

    pub fn constant(&mut self, value: HostTensor) -> TensorId {
        let id = self.unique_id(&self.scoped("Constant:0"));
        let mut attributes = BTreeMap::new();
        attributes.insert(
            "value".to_string(),
            AttributeValue::Tensor(TensorProto {
                name: id.clone(),
                info: value.info.clone(),
                data: value.data.clone(),
            }),
        );
        self.producers.insert(id.clone(), self.nodes.len());
        self.nodes.push(NodeProto {
            name: id.clone(),
            op_type: "Constant".to_string(),
            domain: String::new(),
            inputs: Vec::new(),
            outputs: vec![id.clone()],
            attributes,
        });
        self.infos.insert(id.clone(), value.info.clone());
        self.const_values.insert(id.clone(), value);
        id
    }

    pub fn identity(&mut self, x: &str) -> Result<TensorId> {
        self.add_node(OpKind::Identity, &[x])
    }

    pub fn neg(&mut self, x: &str) -> Result<TensorId> {
        self.add_node(OpKind::Neg, &[x])
    }

    pub fn reciprocal(&mut self, x: &str) -> Result<TensorId> {
        self.add_node(OpKind::Reciprocal, &[x])
    }

    pub fn sqrt(&mut self, x: &str) -> Result<TensorId> {
        self.add_node(OpKind::Sqrt, &[x])
    }

    pub fn square(&mut self, x: &str) -> Result<TensorId> {
        self.add_node(OpKind::Square, &[x])
    }

    pub fn exp(&mut self, x: &str) -> Result<TensorId> {
        self.add_node(OpKind::Exp, &[x])
    }

    pub fn log(&mut self, x: &str) -> Result<TensorId> {
        self.add_node(OpKind::Log, &[x])
    }

    pub fn abs(&mut self, x: &str) -> Result<TensorId> {
        self.add_node(OpKind::Abs, &[x])
    }

    pub fn sign(&mut self, x: &str) -> Result<TensorId> {
        self.add_node(OpKind::Sign, &[x])
    }

    pub fn ceil(&mut self, x: &str) -> Result<TensorId> {
        self.add_node(OpKind::Ceil, &[x])
    }

    pub fn floor(&mut self, x: &str) -> Result<TensorId> {
        self.add_node(OpKind::Floor, &[x])
    }

    pub fn relu(&mut self, x: &str) -> Result<TensorId> {
        self.add_node(OpKind::Relu, &[x])
    }

    pub fn sigmoid(&mut self, x: &str) -> Result<TensorId> {
        self.add_node(OpKind::Sigmoid, &[x])
    }

    pub fn tanh(&mut self, x: &str) -> Result<TensorId> {
        self.add_node(OpKind::Tanh, &[x])
    }

    pub fn scale(&mut self, x: &str, factor: f32) -> Result<TensorId> {
        self.add_node(OpKind::Scale { factor }, &[x])
    }

    pub fn clip(&mut self, x: &str, min: f32, max: f32) -> Result<TensorId> {
        if min > max {
            return Err(Error::shape(format!(
                "Clip min {min} is greater than max {max}"
            )));
        }
        self.add_node(OpKind::Clip { min, max }, &[x])
    }

    pub fn softmax(&mut self, x: &str, axis: i64) -> Result<TensorId> {
        self.add_node(OpKind::Softmax { axis }, &[x])
    }

    pub fn add(&mut self, a: &str, b: &str) -> Result<TensorId> {
        self.add_node(OpKind::Add, &[a, b])
    }

    pub fn sub(&mut self, a: &str, b: &str) -> Result<TensorId> {
        self.add_node(OpKind::Sub, &[a, b])
    }

    pub fn mul(&mut self, a: &str, b: &str) -> Result<TensorId> {
        self.add_node(OpKind::Mul, &[a, b])
    }

    pub fn div(&mut self, a: &str, b: &str) -> Result<TensorId> {
        self.add_node(OpKind::Div, &[a, b])
    }

    pub fn matmul(&mut self, a: &str, b: &str) -> Result<TensorId> {
        self.add_node(OpKind::MatMul, &[a, b])
    }

    pub fn sum(&mut self, inputs: &[&str]) -> Result<TensorId> {
        self.add_node(OpKind::Sum, inputs)
    }

    pub fn reduce_sum(&mut self, x: &str, axes: Option<&[i64]>, keepdims: bool) -> Result<TensorId> {
        let kind = OpKind::ReduceSum {
            axes: axes.map(<[i64]>::to_vec),
            keepdims,
        };
        self.add_node(kind, &[x])
    }

    /// ONNX reshape: `shape` names a tensor whose value must be known when
    /// the node is added. `0` copies the input dimension, `-1` is inferred.
    pub fn reshape(&mut self, x: &str, shape: &str) -> Result<TensorId> {
        let spec = self.const_input("Reshape:5", "shape", shape)?;
        self.mark_consumed(shape);
        self.reshape_const(x, &spec)
    }

    pub fn reshape_const(&mut self, x: &str, shape: &[i64]) -> Result<TensorId> {
        let input = self.tensor_info(x)?;
        let resolved = resolve_reshape(&input, shape)?;
        self.add_node(OpKind::Reshape { shape: resolved }, &[x])
    }

    /// An empty `perm` reverses the axes.
    pub fn transpose(&mut self, x: &str, perm: &[i64]) -> Result<TensorId> {
        let perm = if perm.is_empty() {
            let rank = self.tensor_info(x)?.rank() as i64;
            (0..rank).rev().collect()
        } else {
            perm.to_vec()
        };
        self.add_node(OpKind::Transpose { perm }, &[x])
    }

    /// ONNX slice with `starts`, `ends` and optional `axes` given as tensors
    /// whose values must be known when the node is added.
    pub fn slice(
        &mut self,
        data: &str,
        starts: &str,
        ends: &str,
        axes: Option<&str>,
    ) -> Result<TensorId> {
        let starts_v = self.const_input("Slice:10", "starts", starts)?;
        let ends_v = self.const_input("Slice:10", "ends", ends)?;
        let axes_v = match axes {
            Some(axes) => Some(self.const_input("Slice:10", "axes", axes)?),
            None => None,
        };
        for id in [Some(starts), Some(ends), axes].into_iter().flatten() {
            self.mark_consumed(id);
        }
        self.slice_const(data, &starts_v, &ends_v, axes_v.as_deref())
    }

    pub fn slice_const(
        &mut self,
        data: &str,
        starts: &[i64],
        ends: &[i64],
        axes: Option<&[i64]>,
    ) -> Result<TensorId> {
        let axes = match axes {
            Some(axes) => axes.to_vec(),
            None => (0..starts.len() as i64).collect(),
        };
        self.add_node(
            OpKind::Slice {
                starts: starts.to_vec(),
                ends: ends.to_vec(),
                axes,
            },
            &[data],
        )
    }

    /// `pads` lists all leading pads followed by all trailing pads.
    pub fn pad(&mut self, x: &str, pads: &[i64], value: f32) -> Result<TensorId> {
        self.add_node(
            OpKind::Pad {
                pads: pads.to_vec(),
                value,
            },
            &[x],
        )
    }

    pub fn concat(&mut self, inputs: &[&str], axis: i64) -> Result<TensorId> {
        self.add_node(OpKind::Concat { axis }, inputs)
    }

    pub fn gather(&mut self, data: &str, indices: &str, axis: i64) -> Result<TensorId> {
        self.add_node(OpKind::Gather { axis }, &[data, indices])
    }

    pub fn scatter(&mut self, data: &str, indices: &str, updates: &str, axis: i64) -> Result<TensorId> {
        self.add_node(OpKind::Scatter { axis }, &[data, indices, updates])
    }

    /// Validates the graph and serializes it. Calls on unchanged state return
    /// identical bytes.
    pub fn get_model_proto(&self) -> Result<Vec<u8>> {
        Ok(self.model()?.to_bytes()?)
    }

    pub fn model(&self) -> Result<ModelProto> {
        if self.outputs.is_empty() {
            return Err(Error::invalid_graph("the model has no outputs"));
        }
        for output in &self.outputs {
            if !self.infos.contains_key(output) {
                return Err(Error::invalid_graph(format!(
                    "output '{output}' does not exist"
                )));
            }
        }
        for input in &self.inputs {
            if !self.consumed.contains(input) && !self.outputs.contains(input) {
                return Err(Error::invalid_graph(format!(
                    "input '{input}' is not consumed by any op"
                )));
            }
        }

        let value_info = |id: &TensorId| -> Result<ValueInfoProto> {
            Ok(ValueInfoProto {
                name: id.clone(),
                info: self.tensor_info(id)?,
            })
        };
        let inputs = self.inputs.iter().map(value_info).collect::<Result<Vec<_>>>()?;
        let outputs = self
            .outputs
            .iter()
            .map(value_info)
            .collect::<Result<Vec<_>>>()?;
        let value_infos = self
            .nodes
            .iter()
            .filter(|node| node.op_type != "Constant")
            .flat_map(|node| node.outputs.iter())
            .map(value_info)
            .collect::<Result<Vec<_>>>()?;

        Ok(ModelProto::new(GraphProto {
            name: self.graph_name.clone(),
            nodes: self.nodes.clone(),
            inputs,
            outputs,
            initializers: self.initializers.clone(),
            value_info: value_infos,
        }))
    }

    fn add_node(&mut self, kind: OpKind, inputs: &[&str]) -> Result<TensorId> {
        let infos = inputs
            .iter()
            .map(|id| self.tensor_info(id))
            .collect::<Result<Vec<_>>>()?;
        let refs = infos.iter().collect::<Vec<_>>();
        let outputs = kind.infer_outputs(&refs)?;
        let op_type = kind.op_type();
        let mut ids = Vec::with_capacity(outputs.len());
        for (index, info) in outputs.into_iter().enumerate() {
            let id = self.unique_id(&self.scoped(&format!("{op_type}:{index}")));
            self.infos.insert(id.clone(), info);
            self.producers.insert(id.clone(), self.nodes.len());
            ids.push(id);
        }
        for input in inputs {
            self.mark_consumed(input);
        }
        self.nodes.push(NodeProto {
            name: ids[0].clone(),
            op_type: op_type.as_str().to_string(),
            domain: String::new(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: ids.clone(),
            attributes: kind.to_attributes(),
        });
        tracing::trace!(target: "ferrograph::builder", "added {op_type} -> {}", ids[0]);
        Ok(ids.swap_remove(0))
    }

    fn const_input(&self, op: &str, input: &str, id: &str) -> Result<Vec<i64>> {
        self.tensor_info(id)?;
        match self.const_values.get(id) {
            Some(value) => Ok(value.to_i64_vec()),
            None => Err(Error::shape(format!(
                "Need the value of the ai.onnx.{op} input '{input}' to determine the output shape, but was unable because the tensor '{id}' does not have data"
            ))),
        }
    }

    fn mark_consumed(&mut self, id: &str) {
        self.consumed.insert(id.to_string());
    }

    fn producer_node_mut(&mut self, id: &str) -> Result<&mut NodeProto> {
        let index = *self.producers.get(id).ok_or_else(|| {
            Error::invalid_graph(format!("tensor '{id}' is not produced by a node"))
        })?;
        self.nodes
            .get_mut(index)
            .ok_or_else(|| Error::invalid_graph(format!("node for '{id}' is missing")))
    }

    fn scoped(&self, base: &str) -> String {
        if self.name_scopes.is_empty() {
            base.to_string()
        } else {
            format!("{}/{base}", self.name_scopes.join("/"))
        }
    }

    fn unique_id(&self, base: &str) -> TensorId {
        if !self.infos.contains_key(base) {
            return base.to_string();
        }
        let mut n = 1;
        loop {
            let candidate = format!("{base}/{n}");
            if !self.infos.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

fn resolve_reshape(input: &TensorInfo, spec: &[i64]) -> Result<Vec<i64>> {
    let mut shape = Vec::with_capacity(spec.len());
    let mut infer_at = None;
    for (i, &d) in spec.iter().enumerate() {
        match d {
            0 => {
                let dim = input.shape.get(i).copied().ok_or_else(|| {
                    Error::shape(format!(
                        "Reshape dimension {i} copies a dimension the input {:?} does not have",
                        input.shape
                    ))
                })?;
                shape.push(dim);
            }
            -1 if infer_at.is_none() => {
                infer_at = Some(i);
                shape.push(1);
            }
            d if d > 0 => shape.push(d),
            _ => {
                return Err(Error::shape(format!("invalid Reshape target {spec:?}")));
            }
        }
    }
    if let Some(i) = infer_at {
        let known: i64 = shape.iter().product();
        let total = input.nelms() as i64;
        if known == 0 || total % known != 0 {
            return Err(Error::shape(format!(
                "cannot infer Reshape {spec:?} from {:?}",
                input.shape
            )));
        }
        shape[i] = total / known;
    }
    Ok(shape)
}
