use std::sync::Arc;

use crate::backend::ErasedBackend;
use crate::error::Result;
use crate::ir::Graph;
use crate::logging::Diagnostic;

use super::passes::{
    ConstExprFold, DeadCodeEliminationPass, DivArg0GradOp, DivArg1GradOp, ExpGradOp,
    InPlacePass, MulArgGradOp, OpToIdentity, PostNRepl, ReciprocalGradOp, RewritePatternsPass,
    SqrtGradOp, SubtractArg1GradOp,
};
use super::pattern::PatternSet;
use super::patterns::create_registered;
use super::{GraphPass, PassContext, PassResult, PatternType, Patterns};

pub enum Step {
    Pass(Arc<dyn GraphPass>),
    FixedPoint { max_iters: usize, steps: Vec<Step> },
}

#[derive(Default)]
pub struct PipelineBuilder {
    steps: Vec<Step>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pass(&mut self, pass: Arc<dyn GraphPass>) {
        self.steps.push(Step::Pass(pass));
    }

    /// Repeats the steps built by `build` until nothing changes, at most
    /// `max_iters` times.
    pub fn fixed_point<F>(&mut self, max_iters: usize, build: F)
    where
        F: FnOnce(&mut PipelineBuilder),
    {
        let mut inner = PipelineBuilder::new();
        build(&mut inner);
        self.steps.push(Step::FixedPoint {
            max_iters: max_iters.max(1),
            steps: inner.steps,
        });
    }

    pub fn finish(self) -> Vec<Step> {
        self.steps
    }
}

/// The pass sequence selected by a [`Patterns`] value.
///
/// Rewrite patterns and dead-code elimination run in a bounded fixed point;
/// in-place marking runs once afterwards since it only sets flags.
pub struct PatternPipeline {
    steps: Vec<Step>,
    log_stats: bool,
}

impl PatternPipeline {
    /// `backend` is needed for constant folding; without one the pattern is
    /// left out even when enabled.
    pub fn new(
        patterns: &Patterns,
        backend: Option<Box<dyn ErasedBackend>>,
        max_iters: usize,
    ) -> Self {
        let mut set = PatternSet::new();
        if let Some(backend) = backend {
            if patterns.is_enabled(PatternType::ConstExprFold) {
                set.add(ConstExprFold::new(backend));
            }
        }
        for pattern in patterns.enabled() {
            match pattern {
                PatternType::SqrtGradOp => {
                    set.add(SqrtGradOp);
                }
                PatternType::ReciprocalGradOp => {
                    set.add(ReciprocalGradOp);
                }
                PatternType::DivArg0GradOp => {
                    set.add(DivArg0GradOp);
                }
                PatternType::DivArg1GradOp => {
                    set.add(DivArg1GradOp);
                }
                PatternType::MulArgGradOp => {
                    set.add(MulArgGradOp);
                }
                PatternType::SubtractArg1GradOp => {
                    set.add(SubtractArg1GradOp);
                }
                PatternType::ExpGradOp => {
                    set.add(ExpGradOp);
                }
                PatternType::OpToIdentity => {
                    set.add(OpToIdentity);
                }
                PatternType::PostNRepl => {
                    set.add(PostNRepl);
                }
                PatternType::ConstExprFold | PatternType::InPlace => {}
            }
        }
        for pattern in patterns.registered_enabled().filter_map(create_registered) {
            set.add_boxed(pattern);
        }

        let mut builder = PipelineBuilder::new();
        let rewrites = (!set.is_empty()).then(|| Arc::new(RewritePatternsPass::new(set.freeze())));
        builder.fixed_point(max_iters, |p| {
            if let Some(rewrites) = rewrites {
                p.pass(rewrites);
            }
            p.pass(Arc::new(DeadCodeEliminationPass));
        });
        if patterns.is_in_place_enabled() {
            builder.pass(Arc::new(InPlacePass));
        }

        Self {
            steps: builder.finish(),
            log_stats: crate::env::pass_stats_enabled(),
        }
    }

    pub fn run(&self, graph: &mut Graph, cx: &mut PassContext<'_>) -> Result<PassResult> {
        let mut totals = PassResult::default();
        run_steps(&self.steps, graph, cx, &mut totals, self.log_stats)?;
        Ok(totals)
    }
}

fn run_steps(
    steps: &[Step],
    graph: &mut Graph,
    cx: &mut PassContext<'_>,
    totals: &mut PassResult,
    log_stats: bool,
) -> Result<bool> {
    let mut changed_any = false;
    for step in steps {
        match step {
            Step::Pass(pass) => {
                let stats = pass.run(graph, cx)?;
                changed_any |= stats.changed;
                *totals = totals.merge(stats);
                cx.sink.emit(Diagnostic::PassStats {
                    pass: pass.name().to_string(),
                    changed: stats.changed,
                    iterations: stats.iterations,
                    rewrites_applied: stats.rewrites_applied,
                    erased_ops: stats.erased_ops,
                });
                if log_stats {
                    tracing::info!(
                        target: "ferrograph::patterns",
                        pass = pass.name(),
                        ops = graph.num_ops(),
                        rewrites = stats.rewrites_applied,
                        erased = stats.erased_ops,
                        "pass stats"
                    );
                }
            }
            Step::FixedPoint { max_iters, steps } => {
                for _ in 0..*max_iters {
                    let mut local = PassResult::default();
                    let changed = run_steps(steps, graph, cx, &mut local, log_stats)?;
                    *totals = totals.merge(local);
                    changed_any |= changed;
                    if !changed {
                        break;
                    }
                }
            }
        }
    }
    Ok(changed_any)
}
