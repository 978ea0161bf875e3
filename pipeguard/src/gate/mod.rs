//! Completeness gate: is upstream data sufficient to run a downstream stage?

mod completeness;
mod source;

pub use completeness::{
    completeness_pct, CompletenessGate, CompletenessVerdict, GateDecision, WindowVerdict,
};
pub use source::{CompletenessSource, InMemoryCompletenessSource, UpstreamSnapshot};
#[cfg(test)]
pub use source::MockCompletenessSource;
