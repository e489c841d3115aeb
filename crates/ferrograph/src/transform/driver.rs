use std::collections::{HashMap, VecDeque};

use crate::error::Result;
use crate::ir::{Graph, GraphRewriter, OpId};
use crate::logging::{Diagnostic, DiagnosticSink};

use super::passes::dce::eliminate_dead_ops;
use super::pattern::FrozenPatternSet;

#[derive(Debug, Clone)]
pub struct GreedyConfig {
    /// Upper bound on successful rewrites in one call.
    pub max_iterations: usize,
    pub enable_dce: bool,
}

impl Default for GreedyConfig {
    fn default() -> Self {
        Self {
            max_iterations: usize::MAX,
            enable_dce: true,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GreedyRewriteStats {
    pub iterations: usize,
    pub applied: usize,
    pub dce_removed: usize,
}

/// Applies `patterns` until none match or the iteration bound is hit.
///
/// After every successful rewrite the worklist is reseeded in topological
/// order. A pattern that failed on an op is not retried until that op's
/// version changes.
pub fn apply_patterns_greedily(
    graph: &mut Graph,
    patterns: &FrozenPatternSet,
    cfg: &GreedyConfig,
    sink: &dyn DiagnosticSink,
) -> Result<GreedyRewriteStats> {
    let mut stats = GreedyRewriteStats::default();
    if patterns.is_empty() {
        return Ok(stats);
    }

    let mut rewriter = GraphRewriter::new(graph);
    let mut worklist = VecDeque::new();
    seed_worklist(&rewriter, &mut worklist)?;
    let mut failure_cache: HashMap<(usize, OpId), u32> = HashMap::new();

    'outer: while let Some(id) = worklist.pop_front() {
        if stats.iterations >= cfg.max_iterations {
            break;
        }
        let Some(op) = rewriter.op(id).cloned() else {
            continue;
        };
        let version = rewriter.version(id);

        for (idx, pattern) in patterns.matching(&op) {
            if failure_cache.get(&(idx, id)).copied() == Some(version) {
                continue;
            }
            if pattern.match_and_rewrite(id, &mut rewriter)? {
                stats.applied += 1;
                stats.iterations += 1;
                sink.emit(Diagnostic::PatternApplied {
                    pattern: pattern.name().to_string(),
                    op: op.name.clone(),
                });
                failure_cache.retain(|(_, cached), _| *cached != id);
                seed_worklist(&rewriter, &mut worklist)?;
                continue 'outer;
            }
            failure_cache.insert((idx, id), version);
        }
    }

    if cfg.enable_dce {
        stats.dce_removed = eliminate_dead_ops(rewriter.graph)?;
    }
    Ok(stats)
}

fn seed_worklist(rewriter: &GraphRewriter<'_>, worklist: &mut VecDeque<OpId>) -> Result<()> {
    worklist.clear();
    worklist.extend(rewriter.ops_in_order()?);
    Ok(())
}
