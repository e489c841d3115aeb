use crate::error::Result;
use crate::ir::{Graph, TensorType};
use crate::transform::{GraphPass, PassContext, PassResult, PatternType};

/// Marks ops that may overwrite their first input.
///
/// The input must be an activation with this op as its only consumer, must not
/// be protected and must have the same info as the output.
#[derive(Default)]
pub struct InPlacePass;

impl InPlacePass {
    const NAME: &'static str = "inplace";
}

impl GraphPass for InPlacePass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, _cx: &mut PassContext<'_>) -> Result<PassResult> {
        let mut candidates = Vec::new();
        for id in graph.topo_order()? {
            let Some(op) = graph.op(id) else {
                continue;
            };
            if op.inplace
                || !op.kind.supports_inplace()
                || op.is_pattern_excluded(PatternType::InPlace.name())
            {
                continue;
            }
            let Some(input) = op.inputs.first().and_then(|i| graph.tensor(i)) else {
                continue;
            };
            let eligible = input.tensor_type == TensorType::ActGrad
                && input.producer().is_some()
                && input.num_consumers() == 1
                && !op.inputs[1..].contains(&input.id)
                && !graph.is_protected(&input.id)
                && graph.info(op.output()).map_or(false, |out| *out == input.info);
            if eligible {
                candidates.push(id);
            }
        }
        for id in &candidates {
            if let Some(op) = graph.op_mut(*id) {
                op.inplace = true;
            }
        }
        Ok(PassResult {
            changed: !candidates.is_empty(),
            rewrites_applied: candidates.len(),
            ..PassResult::default()
        })
    }
}
