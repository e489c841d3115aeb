use crate::error::Result;
use crate::ir::{Graph, GraphRewriter, Op, OpId, OpKind};
use crate::transform::pattern::{filters, Pattern};
use crate::transform::PatternType;

/// Replaces ops that provably copy their first input by an Identity.
pub struct OpToIdentity;

impl OpToIdentity {
    fn is_degenerate(op: &Op, graph: &Graph) -> bool {
        let (Ok(input), Ok(output)) = (graph.info(&op.inputs[0]), graph.info(op.output())) else {
            return false;
        };
        if input != output {
            return false;
        }
        match &op.kind {
            OpKind::Sum | OpKind::Concat { .. } => op.inputs.len() == 1,
            OpKind::Pad { pads, .. } => pads.iter().all(|&p| p == 0),
            OpKind::Scale { factor } => *factor == 1.0,
            OpKind::Transpose { perm } => perm.iter().enumerate().all(|(i, &p)| p == i as i64),
            OpKind::ReduceSum { .. }
            | OpKind::Reshape { .. }
            | OpKind::Slice { .. }
            | OpKind::ReduceToShape { .. } => true,
            _ => false,
        }
    }
}

impl Pattern for OpToIdentity {
    fn name(&self) -> &'static str {
        PatternType::OpToIdentity.name()
    }

    fn matches_op(&self, op: &Op) -> bool {
        filters::degenerate_candidate(op) && !op.inputs.is_empty()
    }

    fn match_and_rewrite(&self, root: OpId, rewriter: &mut GraphRewriter<'_>) -> Result<bool> {
        let Some(op) = rewriter.op(root) else {
            return Ok(false);
        };
        if !Self::is_degenerate(op, rewriter.graph()) {
            return Ok(false);
        }
        let op = rewriter.detach_op(root)?;
        let output = Some(op.output().clone());
        rewriter.insert_like(&op, OpKind::Identity, vec![op.inputs[0].clone()], output)?;
        Ok(true)
    }
}
