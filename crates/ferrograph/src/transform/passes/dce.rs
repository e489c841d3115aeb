use std::collections::BTreeSet;

use crate::error::Result;
use crate::ir::{Graph, OpKind, TensorId, TensorType};
use crate::transform::{GraphPass, PassContext, PassResult};

#[derive(Default)]
pub struct DeadCodeEliminationPass;

impl DeadCodeEliminationPass {
    const NAME: &'static str = "dce";
}

impl GraphPass for DeadCodeEliminationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, _cx: &mut PassContext<'_>) -> Result<PassResult> {
        let removed = eliminate_dead_ops(graph)?;
        Ok(PassResult {
            changed: removed > 0,
            erased_ops: removed,
            ..PassResult::default()
        })
    }
}

/// Erases ops that contribute neither to a protected tensor nor to a weight
/// update, then drops constants and activations left without any user.
pub fn eliminate_dead_ops(graph: &mut Graph) -> Result<usize> {
    let mut worklist: Vec<TensorId> = graph.protected().iter().cloned().collect();
    for op in graph.ops() {
        if is_side_effecting(&op.kind) {
            worklist.extend(op.outputs.iter().cloned());
        }
    }

    let mut live_tensors = BTreeSet::new();
    let mut live_ops = BTreeSet::new();
    while let Some(tensor) = worklist.pop() {
        if !live_tensors.insert(tensor.clone()) {
            continue;
        }
        let Some(producer) = graph.producer(&tensor) else {
            continue;
        };
        if !live_ops.insert(producer) {
            continue;
        }
        if let Some(op) = graph.op(producer) {
            worklist.extend(op.inputs.iter().cloned());
        }
    }

    let mut removed = 0;
    for id in graph.topo_order()?.into_iter().rev() {
        if !live_ops.contains(&id) {
            graph.erase_op(id)?;
            removed += 1;
        }
    }

    let orphans = graph
        .tensors()
        .filter(|t| matches!(t.tensor_type, TensorType::Const | TensorType::ActGrad))
        .filter(|t| t.producer().is_none() && t.num_consumers() == 0)
        .filter(|t| !graph.is_protected(&t.id))
        .map(|t| t.id.clone())
        .collect::<Vec<_>>();
    for id in orphans {
        graph.remove_tensor(&id)?;
    }
    Ok(removed)
}

fn is_side_effecting(kind: &OpKind) -> bool {
    matches!(kind, OpKind::SgdVarUpdate)
}
