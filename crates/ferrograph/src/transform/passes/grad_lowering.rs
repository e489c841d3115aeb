//! Lowering of composite gradient ops into primitive arithmetic.
//!
//! Each pattern detaches the grad op and rebuilds its output under the same
//! name from ops the backend already executes.

use crate::error::Result;
use crate::ir::{GraphRewriter, Op, OpId, OpKind};
use crate::transform::pattern::Pattern;
use crate::transform::PatternType;

fn detach_if(
    rewriter: &mut GraphRewriter<'_>,
    root: OpId,
    matches: fn(&OpKind) -> bool,
) -> Result<Option<Op>> {
    match rewriter.op(root) {
        Some(op) if matches(&op.kind) => Ok(Some(rewriter.detach_op(root)?)),
        _ => Ok(None),
    }
}

fn output_of(op: &Op) -> Option<String> {
    Some(op.output().clone())
}

/// `g / (2 * sqrt(x))`, reusing the forward output.
pub struct SqrtGradOp;

impl Pattern for SqrtGradOp {
    fn name(&self) -> &'static str {
        PatternType::SqrtGradOp.name()
    }

    fn matches_op(&self, op: &Op) -> bool {
        matches!(op.kind, OpKind::SqrtGrad)
    }

    fn benefit(&self) -> u16 {
        2
    }

    fn match_and_rewrite(&self, root: OpId, rewriter: &mut GraphRewriter<'_>) -> Result<bool> {
        let Some(op) = detach_if(rewriter, root, |k| matches!(k, OpKind::SqrtGrad))? else {
            return Ok(false);
        };
        let (grad, fwd_out) = (op.inputs[0].clone(), op.inputs[1].clone());
        let doubled = rewriter.insert_like(&op, OpKind::Scale { factor: 2.0 }, vec![fwd_out], None)?;
        rewriter.insert_like(&op, OpKind::Div, vec![grad, doubled], output_of(&op))?;
        Ok(true)
    }
}

/// `-g / x^2`.
pub struct ReciprocalGradOp;

impl Pattern for ReciprocalGradOp {
    fn name(&self) -> &'static str {
        PatternType::ReciprocalGradOp.name()
    }

    fn matches_op(&self, op: &Op) -> bool {
        matches!(op.kind, OpKind::ReciprocalGrad)
    }

    fn benefit(&self) -> u16 {
        2
    }

    fn match_and_rewrite(&self, root: OpId, rewriter: &mut GraphRewriter<'_>) -> Result<bool> {
        let Some(op) = detach_if(rewriter, root, |k| matches!(k, OpKind::ReciprocalGrad))? else {
            return Ok(false);
        };
        let (grad, x) = (op.inputs[0].clone(), op.inputs[1].clone());
        let squared = rewriter.insert_like(&op, OpKind::Square, vec![x], None)?;
        let ratio = rewriter.insert_like(&op, OpKind::Div, vec![grad, squared], None)?;
        rewriter.insert_like(&op, OpKind::Neg, vec![ratio], output_of(&op))?;
        Ok(true)
    }
}

/// `reduce(g / b)` for the numerator of a division.
pub struct DivArg0GradOp;

impl Pattern for DivArg0GradOp {
    fn name(&self) -> &'static str {
        PatternType::DivArg0GradOp.name()
    }

    fn matches_op(&self, op: &Op) -> bool {
        matches!(op.kind, OpKind::DivArg0Grad { .. })
    }

    fn benefit(&self) -> u16 {
        2
    }

    fn match_and_rewrite(&self, root: OpId, rewriter: &mut GraphRewriter<'_>) -> Result<bool> {
        let Some(op) = detach_if(rewriter, root, |k| matches!(k, OpKind::DivArg0Grad { .. }))?
        else {
            return Ok(false);
        };
        let OpKind::DivArg0Grad { shape } = op.kind.clone() else {
            return Ok(false);
        };
        let (grad, b) = (op.inputs[0].clone(), op.inputs[1].clone());
        let ratio = rewriter.insert_like(&op, OpKind::Div, vec![grad, b], None)?;
        rewriter.insert_like(&op, OpKind::ReduceToShape { shape }, vec![ratio], output_of(&op))?;
        Ok(true)
    }
}

/// `reduce(-g * a / b^2)` for the denominator of a division.
pub struct DivArg1GradOp;

impl Pattern for DivArg1GradOp {
    fn name(&self) -> &'static str {
        PatternType::DivArg1GradOp.name()
    }

    fn matches_op(&self, op: &Op) -> bool {
        matches!(op.kind, OpKind::DivArg1Grad { .. })
    }

    fn benefit(&self) -> u16 {
        2
    }

    fn match_and_rewrite(&self, root: OpId, rewriter: &mut GraphRewriter<'_>) -> Result<bool> {
        let Some(op) = detach_if(rewriter, root, |k| matches!(k, OpKind::DivArg1Grad { .. }))?
        else {
            return Ok(false);
        };
        let OpKind::DivArg1Grad { shape } = op.kind.clone() else {
            return Ok(false);
        };
        let (grad, a, b) = (
            op.inputs[0].clone(),
            op.inputs[1].clone(),
            op.inputs[2].clone(),
        );
        let scaled = rewriter.insert_like(&op, OpKind::Mul, vec![grad, a], None)?;
        let squared = rewriter.insert_like(&op, OpKind::Square, vec![b], None)?;
        let ratio = rewriter.insert_like(&op, OpKind::Div, vec![scaled, squared], None)?;
        let negated = rewriter.insert_like(&op, OpKind::Neg, vec![ratio], None)?;
        rewriter.insert_like(&op, OpKind::ReduceToShape { shape }, vec![negated], output_of(&op))?;
        Ok(true)
    }
}

/// `reduce(g * other)` for either operand of a product.
pub struct MulArgGradOp;

impl Pattern for MulArgGradOp {
    fn name(&self) -> &'static str {
        PatternType::MulArgGradOp.name()
    }

    fn matches_op(&self, op: &Op) -> bool {
        matches!(op.kind, OpKind::MulArgGrad { .. })
    }

    fn benefit(&self) -> u16 {
        2
    }

    fn match_and_rewrite(&self, root: OpId, rewriter: &mut GraphRewriter<'_>) -> Result<bool> {
        let Some(op) = detach_if(rewriter, root, |k| matches!(k, OpKind::MulArgGrad { .. }))?
        else {
            return Ok(false);
        };
        let OpKind::MulArgGrad { shape } = op.kind.clone() else {
            return Ok(false);
        };
        let product = rewriter.insert_like(&op, OpKind::Mul, op.inputs.clone(), None)?;
        rewriter.insert_like(&op, OpKind::ReduceToShape { shape }, vec![product], output_of(&op))?;
        Ok(true)
    }
}

/// `reduce(-g)` for the subtrahend.
pub struct SubtractArg1GradOp;

impl Pattern for SubtractArg1GradOp {
    fn name(&self) -> &'static str {
        PatternType::SubtractArg1GradOp.name()
    }

    fn matches_op(&self, op: &Op) -> bool {
        matches!(op.kind, OpKind::SubtractArg1Grad { .. })
    }

    fn benefit(&self) -> u16 {
        2
    }

    fn match_and_rewrite(&self, root: OpId, rewriter: &mut GraphRewriter<'_>) -> Result<bool> {
        let Some(op) =
            detach_if(rewriter, root, |k| matches!(k, OpKind::SubtractArg1Grad { .. }))?
        else {
            return Ok(false);
        };
        let OpKind::SubtractArg1Grad { shape } = op.kind.clone() else {
            return Ok(false);
        };
        let negated = rewriter.insert_like(&op, OpKind::Neg, vec![op.inputs[0].clone()], None)?;
        rewriter.insert_like(&op, OpKind::ReduceToShape { shape }, vec![negated], output_of(&op))?;
        Ok(true)
    }
}

/// `g * exp(x)`, reusing the forward output.
pub struct ExpGradOp;

impl Pattern for ExpGradOp {
    fn name(&self) -> &'static str {
        PatternType::ExpGradOp.name()
    }

    fn matches_op(&self, op: &Op) -> bool {
        matches!(op.kind, OpKind::ExpGrad)
    }

    fn benefit(&self) -> u16 {
        2
    }

    fn match_and_rewrite(&self, root: OpId, rewriter: &mut GraphRewriter<'_>) -> Result<bool> {
        let Some(op) = detach_if(rewriter, root, |k| matches!(k, OpKind::ExpGrad))? else {
            return Ok(false);
        };
        rewriter.insert_like(&op, OpKind::Mul, op.inputs.clone(), output_of(&op))?;
        Ok(true)
    }
}
