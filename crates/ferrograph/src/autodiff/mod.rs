//! Backward graph synthesis.
//!
//! Losses are attached as ops of the loss fragment, each seeded by a loss-grad
//! op. Ops lying on a path from a variable to a loss are then visited in
//! reverse topological order; each contributes partial gradients for its
//! inputs through the builder registered for its op type. Partials of a tensor
//! are combined in ascending consumer order before the tensor's own producer
//! is visited, and the result is named `d__<tensor>`.

mod registry;

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::grad_id;
use crate::ir::{Graph, Op, OpId, OpKind, Phase, TensorId, TensorType};
use crate::logging::{Diagnostic, DiagnosticSink};
use crate::tensor::{DataType, TensorInfo};
use crate::train::{Loss, Sgd, LEARNING_RATE_ID, LOSS_SCALING_ID, WEIGHT_DECAY_ID};
use crate::updated_var_id;

pub use registry::{grad_builder, has_grad_builder, register_grad_builder, GradBuilder};

/// What [`synthesize_gradients`] added to the graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GradSummary {
    pub grad_ops: usize,
    /// Variables that received an update, in name order.
    pub updated_variables: Vec<TensorId>,
}

/// Context handed to grad builders for one forward op.
pub struct GradCx<'a> {
    graph: &'a mut Graph,
    fwd: Op,
    needs: Vec<bool>,
    created: usize,
}

impl<'a> GradCx<'a> {
    pub fn fwd(&self) -> &Op {
        &self.fwd
    }

    pub fn input(&self, i: usize) -> TensorId {
        self.fwd.inputs[i].clone()
    }

    pub fn output(&self) -> TensorId {
        self.fwd.output().clone()
    }

    pub fn input_info(&self, i: usize) -> Result<TensorInfo> {
        self.graph.info(&self.fwd.inputs[i]).cloned()
    }

    /// Whether input `i` lies on a path from a variable.
    pub fn needs(&self, i: usize) -> bool {
        self.needs.get(i).copied().unwrap_or(false)
    }

    /// Adds a backward op tied to the forward op and returns its output.
    pub fn grad_op(&mut self, kind: OpKind, inputs: Vec<TensorId>) -> Result<TensorId> {
        let output = self.graph.temp_id(&grad_id(self.fwd.output()));
        let id = self
            .graph
            .add_op(kind, inputs, vec![output.clone()], Phase::Backward)?;
        tie_to_forward(self.graph, id, &self.fwd);
        self.created += 1;
        Ok(output)
    }
}

fn tie_to_forward(graph: &mut Graph, id: OpId, fwd: &Op) {
    if let Some(op) = graph.op_mut(id) {
        op.fwd_op = Some(fwd.id);
        op.virtual_graph = fwd.virtual_graph;
    }
}

/// Adds the loss ops to the loss fragment and protects their outputs.
pub fn attach_losses(graph: &mut Graph, losses: &[Box<dyn Loss>]) -> Result<Vec<OpId>> {
    let mut ids = Vec::with_capacity(losses.len());
    for loss in losses {
        for input in loss.input_ids() {
            if !graph.contains_tensor(&input) {
                return Err(Error::config(format!(
                    "loss '{}' reads '{input}', which is not in the graph",
                    loss.output_id()
                )));
            }
        }
        let inputs = loss.input_ids();
        let id = graph.add_op(
            loss.op_kind(),
            inputs.clone(),
            vec![loss.output_id().to_string()],
            Phase::Loss,
        )?;
        let virtual_graph = inputs
            .first()
            .and_then(|i| graph.producer(i))
            .and_then(|p| graph.op(p))
            .and_then(|p| p.virtual_graph);
        if let Some(op) = graph.op_mut(id) {
            op.virtual_graph = virtual_graph;
        }
        graph.protect(loss.output_id());
        ids.push(id);
    }
    Ok(ids)
}

/// Registers the optimizer hyper-parameters: constants for const values,
/// optimizer streams for the rest.
pub fn add_optimizer_tensors(graph: &mut Graph, optimizer: &Sgd) -> Result<()> {
    for (id, value) in optimizer.values() {
        if value.is_const {
            graph.add_const(id, value.as_host_tensor())?;
        } else {
            graph.add_tensor(
                id,
                TensorInfo::scalar(DataType::Float),
                TensorType::OptimizerStream,
                Some(value.as_host_tensor()),
            )?;
        }
        graph.protect(id);
    }
    Ok(())
}

/// Builds the backward and weight-update fragments for `losses`, which must
/// already be attached.
pub fn synthesize_gradients(
    graph: &mut Graph,
    losses: &[Box<dyn Loss>],
    sink: &dyn DiagnosticSink,
) -> Result<GradSummary> {
    if losses.is_empty() {
        return Err(Error::config("training requires at least one loss"));
    }
    for id in [LEARNING_RATE_ID, WEIGHT_DECAY_ID, LOSS_SCALING_ID] {
        if !graph.contains_tensor(id) {
            return Err(Error::invalid_graph(format!(
                "optimizer tensor '{id}' has not been added"
            )));
        }
    }

    let relevant = relevant_ops(graph, losses)?;

    let mut partials: BTreeMap<TensorId, Vec<((OpId, usize), TensorId)>> = BTreeMap::new();
    let mut summary = GradSummary::default();

    for loss in losses {
        let loss_op_id = graph.producer(loss.output_id()).ok_or_else(|| {
            Error::invalid_graph(format!("loss '{}' has no producer", loss.output_id()))
        })?;
        let loss_op = graph
            .op(loss_op_id)
            .cloned()
            .ok_or_else(|| Error::invalid_graph(format!("no op {loss_op_id}")))?;
        let target = loss_op.inputs[0].clone();
        if !needs_grad(graph, &relevant, &target) {
            continue;
        }
        let mut inputs = loss_op.inputs.clone();
        inputs.push(LOSS_SCALING_ID.to_string());
        let output = graph.temp_id(&grad_id(&target));
        let id = graph.add_op(loss.grad_kind(), inputs, vec![output.clone()], Phase::Backward)?;
        tie_to_forward(graph, id, &loss_op);
        summary.grad_ops += 1;
        partials
            .entry(target)
            .or_default()
            .push(((loss_op_id, 0), output));
    }

    let order = graph.topo_order()?;
    for id in order.into_iter().rev() {
        if !relevant.contains(&id) {
            continue;
        }
        let Some(fwd) = graph.op(id).cloned() else {
            continue;
        };
        let output = fwd.output().clone();
        let Some(grad) = finalize(graph, &mut partials, &output, &fwd, &mut summary)? else {
            continue;
        };
        let builder =
            registry::grad_builder(fwd.op_type()).ok_or_else(|| Error::GradientUnavailable {
                op_type: fwd.op_type().to_string(),
                op: fwd.name.clone(),
            })?;
        let needs = fwd.inputs.iter().map(|i| needs_grad(graph, &relevant, i)).collect();
        let mut cx = GradCx {
            graph: &mut *graph,
            fwd: fwd.clone(),
            needs,
            created: 0,
        };
        let input_grads = builder(&mut cx, &grad)?;
        summary.grad_ops += cx.created;
        for (index, (input, partial)) in fwd.inputs.iter().zip(input_grads).enumerate() {
            if let Some(partial) = partial {
                partials
                    .entry(input.clone())
                    .or_default()
                    .push(((id, index), partial));
            }
        }
    }

    for variable in graph.variable_ids() {
        let Some(entries) = partials.get(&variable) else {
            continue;
        };
        let Some(first) = entries.first() else {
            continue;
        };
        let template = graph
            .op(first.0 .0)
            .cloned()
            .ok_or_else(|| Error::invalid_graph(format!("no op {}", first.0 .0)))?;
        let Some(grad) = finalize(graph, &mut partials, &variable, &template, &mut summary)?
        else {
            continue;
        };
        let update = graph.add_op(
            OpKind::SgdVarUpdate,
            vec![
                variable.clone(),
                grad,
                LEARNING_RATE_ID.to_string(),
                WEIGHT_DECAY_ID.to_string(),
                LOSS_SCALING_ID.to_string(),
            ],
            vec![updated_var_id(&variable)],
            Phase::WeightUpdate,
        )?;
        if let Some(op) = graph.op_mut(update) {
            op.virtual_graph = template.virtual_graph;
        }
        summary.updated_variables.push(variable);
    }

    sink.emit(Diagnostic::GradientsSynthesized {
        grad_ops: summary.grad_ops,
        var_updates: summary.updated_variables.len(),
    });
    Ok(summary)
}

/// Combines the partials of `tensor` into `d__<tensor>`: a single partial is
/// renamed, several are summed in consumer order.
fn finalize(
    graph: &mut Graph,
    partials: &mut BTreeMap<TensorId, Vec<((OpId, usize), TensorId)>>,
    tensor: &str,
    owner: &Op,
    summary: &mut GradSummary,
) -> Result<Option<TensorId>> {
    let Some(mut entries) = partials.remove(tensor) else {
        return Ok(None);
    };
    entries.sort_by_key(|(key, _)| *key);
    let name = grad_id(tensor);
    match entries.as_slice() {
        [] => return Ok(None),
        [(_, only)] => graph.rename_tensor(only, &name)?,
        many => {
            let inputs = many.iter().map(|(_, t)| t.clone()).collect();
            let id = graph.add_op(OpKind::Sum, inputs, vec![name.clone()], Phase::Backward)?;
            tie_to_forward(graph, id, owner);
            summary.grad_ops += 1;
        }
    }
    Ok(Some(name))
}

fn needs_grad(graph: &Graph, relevant: &BTreeSet<OpId>, id: &str) -> bool {
    match graph.tensor(id) {
        Some(t) if t.tensor_type == TensorType::Variable => true,
        Some(t) => t.producer().is_some_and(|p| relevant.contains(&p)),
        None => false,
    }
}

/// Forward ops reachable from a variable that also reach a loss input.
fn relevant_ops(graph: &Graph, losses: &[Box<dyn Loss>]) -> Result<BTreeSet<OpId>> {
    let mut from_variables = BTreeSet::new();
    let mut frontier: Vec<TensorId> = graph.variable_ids();
    let mut seen_tensors = BTreeSet::new();
    while let Some(tensor) = frontier.pop() {
        if !seen_tensors.insert(tensor.clone()) {
            continue;
        }
        for consumer in graph.consumers(&tensor) {
            let Some(op) = graph.op(consumer) else {
                continue;
            };
            if op.phase != Phase::Forward {
                continue;
            }
            if from_variables.insert(consumer) {
                frontier.extend(op.outputs.iter().cloned());
            }
        }
    }

    let mut to_losses = BTreeSet::new();
    let mut frontier: Vec<TensorId> = losses.iter().flat_map(|l| l.input_ids()).collect();
    let mut seen_tensors = BTreeSet::new();
    while let Some(tensor) = frontier.pop() {
        if !seen_tensors.insert(tensor.clone()) {
            continue;
        }
        let Some(producer) = graph.producer(&tensor) else {
            continue;
        };
        if to_losses.insert(producer) {
            if let Some(op) = graph.op(producer) {
                frontier.extend(op.inputs.iter().cloned());
            }
        }
    }

    Ok(from_variables.intersection(&to_losses).copied().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;
    use crate::tensor::HostTensor;
    use crate::train::L1Loss;
    use crate::ReductionType;

    fn weighted(kind: OpKind) -> Graph {
        let mut g = Graph::new();
        let w = HostTensor::from_f32([2], vec![1.5, 2.5]).expect("w");
        g.add_tensor("w", w.info.clone(), TensorType::Variable, Some(w))
            .expect("w");
        g.add_op(kind, vec!["w".into()], vec!["y".into()], Phase::Forward)
            .expect("op");
        g
    }

    fn l1() -> Vec<Box<dyn Loss>> {
        vec![Box::new(L1Loss::new("y", "l1", 1.0, ReductionType::Sum))]
    }

    #[test]
    fn ceil_has_no_grad_builder() {
        let mut g = weighted(OpKind::Ceil);
        attach_losses(&mut g, &l1()).expect("loss");
        add_optimizer_tensors(&mut g, &Sgd::constant(0.1)).expect("optimizer");
        let err = synthesize_gradients(&mut g, &l1(), &MemorySink::new()).unwrap_err();
        assert!(err.to_string().starts_with("does not have a valid grad op"));
    }

    #[test]
    fn multi_consumer_partials_are_summed() {
        let mut g = weighted(OpKind::Relu);
        g.add_op(
            OpKind::Add,
            vec!["y".into(), "w".into()],
            vec!["z".into()],
            Phase::Forward,
        )
        .expect("add");
        let losses: Vec<Box<dyn Loss>> =
            vec![Box::new(L1Loss::new("z", "l1", 1.0, ReductionType::Sum))];
        attach_losses(&mut g, &losses).expect("loss");
        add_optimizer_tensors(&mut g, &Sgd::constant(0.1)).expect("optimizer");
        let sink = MemorySink::new();
        let summary = synthesize_gradients(&mut g, &losses, &sink).expect("grads");
        assert_eq!(summary.updated_variables, vec!["w".to_string()]);
        let sum = g.producer("d__w").and_then(|id| g.op(id)).expect("d__w");
        assert_eq!(sum.kind, OpKind::Sum);
        assert_eq!(sum.inputs.len(), 2);
        assert!(g.contains_tensor("updatedVar__w"));
        assert_eq!(
            sink.count(|d| matches!(d, Diagnostic::GradientsSynthesized { .. })),
            1
        );
    }
}
