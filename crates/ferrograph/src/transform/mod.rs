//! Named graph rewrites and the pipeline that applies them.
//!
//! Rewrites are expressed as [`pattern::Pattern`]s driven greedily over the
//! graph, wrapped into [`GraphPass`]es and composed by
//! [`pipeline::PipelineBuilder`] into bounded fixed-point groups.

pub mod driver;
pub mod passes;
pub mod pattern;
mod patterns;
pub mod pipeline;

use crate::error::Result;
use crate::ir::Graph;
use crate::logging::DiagnosticSink;

pub use patterns::{register_pattern, registered_patterns, PatternType, Patterns, PatternsLevel};
pub use pipeline::PatternPipeline;

/// Outcome of running a [`GraphPass`] once.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    pub changed: bool,
    /// Rewrite attempts that succeeded or were cut off by the iteration bound.
    pub iterations: usize,
    pub rewrites_applied: usize,
    pub erased_ops: usize,
}

impl PassResult {
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            iterations: self.iterations + other.iterations,
            rewrites_applied: self.rewrites_applied + other.rewrites_applied,
            erased_ops: self.erased_ops + other.erased_ops,
        }
    }
}

pub struct PassContext<'a> {
    pub sink: &'a dyn DiagnosticSink,
}

impl<'a> PassContext<'a> {
    pub fn new(sink: &'a dyn DiagnosticSink) -> Self {
        Self { sink }
    }
}

pub trait GraphPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, graph: &mut Graph, cx: &mut PassContext<'_>) -> Result<PassResult>;
}
