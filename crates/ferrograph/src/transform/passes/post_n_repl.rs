use crate::error::Result;
use crate::ir::{GraphRewriter, Op, OpId};
use crate::transform::pattern::{filters, Pattern};
use crate::transform::PatternType;

/// Removes Identity ops whose output name is not externally visible.
pub struct PostNRepl;

impl Pattern for PostNRepl {
    fn name(&self) -> &'static str {
        PatternType::PostNRepl.name()
    }

    fn matches_op(&self, op: &Op) -> bool {
        filters::identity(op)
    }

    fn match_and_rewrite(&self, root: OpId, rewriter: &mut GraphRewriter<'_>) -> Result<bool> {
        let Some(op) = rewriter.op(root) else {
            return Ok(false);
        };
        let (input, output) = (op.inputs[0].clone(), op.output().clone());
        if rewriter.is_protected(&output) {
            return Ok(false);
        }
        rewriter.replace_all_uses(&output, &input)?;
        rewriter.erase_op(root)?;
        Ok(true)
    }
}
