use crate::backend::{evaluate_on_host, ErasedBackend};
use crate::error::Result;
use crate::ir::{GraphRewriter, Op, OpId, OpKind};
use crate::tensor::HostTensor;
use crate::transform::pattern::Pattern;
use crate::transform::PatternType;

/// Evaluates ops whose inputs are all constants and turns their outputs into
/// constants of the same name.
pub struct ConstExprFold {
    backend: Box<dyn ErasedBackend>,
}

impl ConstExprFold {
    pub fn new(backend: Box<dyn ErasedBackend>) -> Self {
        Self { backend }
    }
}

impl Pattern for ConstExprFold {
    fn name(&self) -> &'static str {
        PatternType::ConstExprFold.name()
    }

    fn matches_op(&self, op: &Op) -> bool {
        !op.inputs.is_empty() && !matches!(op.kind, OpKind::SgdVarUpdate)
    }

    fn benefit(&self) -> u16 {
        3
    }

    fn match_and_rewrite(&self, root: OpId, rewriter: &mut GraphRewriter<'_>) -> Result<bool> {
        let Some(op) = rewriter.op(root).cloned() else {
            return Ok(false);
        };
        let mut values: Vec<HostTensor> = Vec::with_capacity(op.inputs.len());
        for input in &op.inputs {
            match rewriter.graph.tensor(input) {
                Some(tensor) if tensor.is_const() => match &tensor.data {
                    Some(data) => values.push(data.clone()),
                    None => return Ok(false),
                },
                _ => return Ok(false),
            }
        }
        let infos = op
            .outputs
            .iter()
            .map(|output| rewriter.info(output))
            .collect::<Result<Vec<_>>>()?;
        let refs = values.iter().collect::<Vec<_>>();
        let folded = evaluate_on_host(self.backend.as_ref(), &op.kind, &refs, &infos)?;

        rewriter.detach_op(root)?;
        for (output, value) in op.outputs.iter().zip(folded) {
            rewriter.graph.make_const(output, value)?;
        }
        tracing::debug!(target: "ferrograph::patterns", "folded {} into a constant", op.name);
        Ok(true)
    }
}
