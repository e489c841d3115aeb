//! Concrete passes and the patterns they drive.

pub mod const_expr;
pub mod dce;
pub mod grad_lowering;
pub mod inplace;
pub mod op_to_identity;
pub mod post_n_repl;

use crate::error::Result;
use crate::ir::Graph;

use super::driver::{apply_patterns_greedily, GreedyConfig};
use super::pattern::FrozenPatternSet;
use super::{GraphPass, PassContext, PassResult};

pub use const_expr::ConstExprFold;
pub use dce::DeadCodeEliminationPass;
pub use grad_lowering::{
    DivArg0GradOp, DivArg1GradOp, ExpGradOp, MulArgGradOp, ReciprocalGradOp, SqrtGradOp,
    SubtractArg1GradOp,
};
pub use inplace::InPlacePass;
pub use op_to_identity::OpToIdentity;
pub use post_n_repl::PostNRepl;

/// Runs a frozen pattern set through the greedy driver.
pub struct RewritePatternsPass {
    patterns: FrozenPatternSet,
    cfg: GreedyConfig,
}

impl RewritePatternsPass {
    const NAME: &'static str = "rewrite-patterns";

    pub fn new(patterns: FrozenPatternSet) -> Self {
        Self {
            patterns,
            cfg: GreedyConfig {
                enable_dce: false,
                ..GreedyConfig::default()
            },
        }
    }

    pub fn pattern_names(&self) -> Vec<&'static str> {
        self.patterns.names()
    }
}

impl GraphPass for RewritePatternsPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, cx: &mut PassContext<'_>) -> Result<PassResult> {
        let stats = apply_patterns_greedily(graph, &self.patterns, &self.cfg, cx.sink)?;
        Ok(PassResult {
            changed: stats.applied > 0 || stats.dce_removed > 0,
            iterations: stats.iterations,
            rewrites_applied: stats.applied,
            erased_ops: stats.dce_removed,
        })
    }
}
