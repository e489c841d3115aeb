use crate::error::Result;
use crate::ir::{GraphRewriter, Op, OpId};

/// A named local rewrite rooted at one op.
pub trait Pattern: Send + Sync {
    /// Name used for per-op exclusion and diagnostics.
    fn name(&self) -> &'static str;

    fn matches_op(&self, op: &Op) -> bool {
        let _ = op;
        true
    }

    fn benefit(&self) -> u16 {
        1
    }

    /// Returns `Ok(false)` when the pattern does not apply. Errors abort the
    /// whole pipeline.
    fn match_and_rewrite(&self, root: OpId, rewriter: &mut GraphRewriter<'_>) -> Result<bool>;
}

/// Mutable set that collects patterns prior to freezing.
#[derive(Default)]
pub struct PatternSet {
    patterns: Vec<Box<dyn Pattern>>,
}

impl PatternSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<P>(&mut self, pattern: P) -> &mut Self
    where
        P: Pattern + 'static,
    {
        self.patterns.push(Box::new(pattern));
        self
    }

    pub fn add_boxed(&mut self, pattern: Box<dyn Pattern>) -> &mut Self {
        self.patterns.push(pattern);
        self
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Orders patterns by descending benefit. Equal benefits keep insertion order.
    pub fn freeze(mut self) -> FrozenPatternSet {
        self.patterns
            .sort_by_key(|pattern| std::cmp::Reverse(pattern.benefit()));
        FrozenPatternSet {
            patterns: self.patterns,
        }
    }
}

/// Immutable collection of patterns ready for the driver.
pub struct FrozenPatternSet {
    patterns: Vec<Box<dyn Pattern>>,
}

impl FrozenPatternSet {
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.patterns.iter().map(|p| p.name()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &dyn Pattern)> {
        self.patterns.iter().enumerate().map(|(idx, p)| (idx, &**p))
    }

    /// Patterns that may apply to `op`, skipping ones the op excludes.
    pub fn matching<'a>(&'a self, op: &'a Op) -> impl Iterator<Item = (usize, &'a dyn Pattern)> + 'a {
        self.patterns
            .iter()
            .enumerate()
            .filter(move |(_, pattern)| {
                !op.is_pattern_excluded(pattern.name()) && pattern.matches_op(op)
            })
            .map(|(idx, pattern)| (idx, &**pattern))
    }
}

/// Common op matchers.
pub mod filters {
    use crate::ir::{Op, OpKind};

    pub fn identity(op: &Op) -> bool {
        matches!(op.kind, OpKind::Identity)
    }

    pub fn degenerate_candidate(op: &Op) -> bool {
        matches!(
            op.kind,
            OpKind::ReduceSum { .. }
                | OpKind::Sum
                | OpKind::Concat { .. }
                | OpKind::Pad { .. }
                | OpKind::Reshape { .. }
                | OpKind::Transpose { .. }
                | OpKind::Slice { .. }
                | OpKind::Scale { .. }
                | OpKind::ReduceToShape { .. }
        )
    }
}
