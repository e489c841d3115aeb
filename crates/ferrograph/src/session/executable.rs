use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ir::{Graph, OpKind, Phase, TensorId, TensorType};
use crate::tensor::{HostTensor, TensorInfo};

/// One op as scheduled in a program fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledOp {
    pub name: String,
    pub kind: OpKind,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub output_infos: Vec<TensorInfo>,
    pub phase: Phase,
    pub virtual_graph: i64,
    pub inplace: bool,
}

impl CompiledOp {
    pub fn display_type(&self) -> String {
        if self.inplace {
            format!("{}Inplace", self.kind.op_type())
        } else {
            self.kind.op_type().to_string()
        }
    }
}

/// Which fragments a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Infer,
    Evaluate,
    Train,
}

impl RunMode {
    pub fn name(&self) -> &'static str {
        match self {
            RunMode::Infer => "infer",
            RunMode::Evaluate => "evaluate",
            RunMode::Train => "train",
        }
    }

    pub fn phases(&self) -> &'static [Phase] {
        match self {
            RunMode::Infer => &[Phase::Forward],
            RunMode::Evaluate => &[Phase::Forward, Phase::Loss],
            RunMode::Train => &[
                Phase::Forward,
                Phase::Loss,
                Phase::Backward,
                Phase::WeightUpdate,
            ],
        }
    }
}

/// A compiled, device independent program: fragments in execution order plus
/// everything needed to bind host data to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Executable {
    pub graph_hash: u64,
    pub num_virtual_graphs: usize,
    pub fragments: BTreeMap<Phase, Vec<CompiledOp>>,
    pub streams: Vec<(TensorId, TensorInfo)>,
    pub variables: Vec<(TensorId, TensorInfo)>,
    pub optimizer_streams: Vec<(TensorId, TensorInfo)>,
    pub constants: Vec<(TensorId, HostTensor)>,
    /// `(updated tensor, variable)` pairs committed after the update fragment.
    pub weight_updates: Vec<(TensorId, TensorId)>,
    pub tensor_infos: BTreeMap<TensorId, TensorInfo>,
}

impl Executable {
    pub fn compile(graph: &Graph, num_virtual_graphs: usize, graph_hash: u64) -> Result<Self> {
        let mut fragments: BTreeMap<Phase, Vec<CompiledOp>> = BTreeMap::new();
        let mut weight_updates = Vec::new();
        for id in graph.topo_order()? {
            let Some(op) = graph.op(id) else {
                continue;
            };
            let output_infos = op
                .outputs
                .iter()
                .map(|o| graph.info(o).cloned())
                .collect::<Result<Vec<_>>>()?;
            if op.kind == OpKind::SgdVarUpdate {
                let var = op.inputs.first().ok_or_else(|| {
                    Error::invalid_graph(format!("update op '{}' has no weight input", op.name))
                })?;
                weight_updates.push((op.output().clone(), var.clone()));
            }
            fragments.entry(op.phase).or_default().push(CompiledOp {
                name: op.name.clone(),
                kind: op.kind.clone(),
                inputs: op.inputs.clone(),
                outputs: op.outputs.clone(),
                output_infos,
                phase: op.phase,
                virtual_graph: op.virtual_graph.unwrap_or(0),
                inplace: op.inplace,
            });
        }

        let typed = |t: TensorType| -> Result<Vec<(TensorId, TensorInfo)>> {
            graph
                .ids_of_type(t)
                .into_iter()
                .map(|id| graph.info(&id).cloned().map(|info| (id, info)))
                .collect()
        };
        let streams = graph
            .stream_ids()
            .iter()
            .filter(|id| graph.contains_tensor(id))
            .map(|id| graph.info(id).cloned().map(|info| (id.clone(), info)))
            .collect::<Result<Vec<_>>>()?;
        let constants = graph
            .tensors()
            .filter(|t| t.tensor_type == TensorType::Const)
            .map(|t| {
                t.data.clone().map(|d| (t.id.clone(), d)).ok_or_else(|| {
                    Error::invalid_graph(format!("constant '{}' has no value", t.id))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            graph_hash,
            num_virtual_graphs,
            fragments,
            streams,
            variables: typed(TensorType::Variable)?,
            optimizer_streams: typed(TensorType::OptimizerStream)?,
            constants,
            weight_updates,
            tensor_infos: graph
                .tensors()
                .map(|t| (t.id.clone(), t.info.clone()))
                .collect(),
        })
    }

    pub fn fragment(&self, phase: Phase) -> &[CompiledOp] {
        self.fragments.get(&phase).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every op in execution order.
    pub fn ops(&self) -> impl Iterator<Item = &CompiledOp> {
        self.fragments.values().flatten()
    }

    pub fn num_ops(&self) -> usize {
        self.fragments.values().map(Vec::len).sum()
    }

    pub fn stream_names(&self) -> Vec<TensorId> {
        self.streams.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Tensors that hold a value after running `mode`.
    pub fn available_after(&self, mode: RunMode) -> Vec<&TensorId> {
        let mut ids: Vec<&TensorId> = self
            .streams
            .iter()
            .chain(&self.variables)
            .chain(&self.optimizer_streams)
            .map(|(id, _)| id)
            .chain(self.constants.iter().map(|(id, _)| id))
            .collect();
        for phase in mode.phases() {
            ids.extend(self.fragment(*phase).iter().flat_map(|op| &op.outputs));
        }
        ids
    }

    /// Streams read by the fragments of `mode`.
    pub fn streams_for(&self, mode: RunMode) -> Vec<&(TensorId, TensorInfo)> {
        self.streams
            .iter()
            .filter(|(id, _)| {
                mode.phases()
                    .iter()
                    .any(|p| self.fragment(*p).iter().any(|op| op.inputs.contains(id)))
            })
            .collect()
    }

    /// Virtual graph a tensor lives on: its producer's, else its first
    /// consumer's.
    pub fn virtual_graph_of(&self, id: &str) -> i64 {
        let produced = self
            .ops()
            .find(|op| op.outputs.iter().any(|o| o == id))
            .map(|op| op.virtual_graph);
        produced
            .or_else(|| {
                self.ops()
                    .find(|op| op.inputs.iter().any(|i| i == id))
                    .map(|op| op.virtual_graph)
            })
            .unwrap_or(0)
    }
}
